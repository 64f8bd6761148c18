//! End-to-end engine tests against an in-process aggregator

use async_trait::async_trait;
use parking_lot::Mutex;
use quotamesh::ThrottleScope;
use quotamesh_agent::{
    AgentConfig, AggregatorClient, AggregatorConnector, EndpointConfig, Result, ScopeQuota,
    ThrottleEngine, ThrottleEvent, ThrottleRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

type Sink = Arc<Mutex<Vec<ThrottleEvent>>>;

struct MemoryClient {
    sink: Sink,
}

#[async_trait]
impl AggregatorClient for MemoryClient {
    async fn login(&self, _username: &str, _password: &str) -> Result<String> {
        Ok("session-1".to_string())
    }

    async fn publish(&self, _session_id: &str, events: &[ThrottleEvent]) -> Result<()> {
        self.sink.lock().extend(events.iter().cloned());
        Ok(())
    }

    async fn logout(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn probe(&self) -> bool {
        true
    }
}

struct MemoryConnector {
    sink: Sink,
}

#[async_trait]
impl AggregatorConnector for MemoryConnector {
    async fn connect(&self, _config: &EndpointConfig) -> Result<Box<dyn AggregatorClient>> {
        Ok(Box::new(MemoryClient {
            sink: Arc::clone(&self.sink),
        }))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_engine() -> (Arc<ThrottleEngine>, Sink) {
    init_tracing();
    let sink: Sink = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(MemoryConnector {
        sink: Arc::clone(&sink),
    });
    let config = AgentConfig {
        batch_size: 1,
        reconnection_interval_secs: 3_600,
        ..Default::default()
    };
    let endpoints = vec![EndpointConfig {
        receiver_url: "tcp://tm1.local:9611".to_string(),
        auth_url: "tcp://tm1.local:9711".to_string(),
        username: "admin".to_string(),
        password: "admin".to_string(),
        trust_store_path: None,
    }];
    let engine = ThrottleEngine::start(config, endpoints, connector).unwrap();
    (engine, sink)
}

fn request(timestamp: i64) -> ThrottleRequest {
    ThrottleRequest {
        resource: ScopeQuota {
            key: "/orders:GET".to_string(),
            limit: 10,
            unit_count: 1,
            time_unit: "min".to_string(),
            stop_on_quota: true,
        },
        application: ScopeQuota {
            key: "app:shop".to_string(),
            limit: 1_000,
            unit_count: 1,
            time_unit: "hour".to_string(),
            stop_on_quota: true,
        },
        subscription: ScopeQuota {
            key: "sub:gold".to_string(),
            limit: 0,
            unit_count: 1,
            time_unit: "day".to_string(),
            stop_on_quota: false,
        },
        timestamp,
    }
}

async fn wait_for_count(engine: &ThrottleEngine, key: &str, count: i64) {
    for _ in 0..500 {
        let current = engine
            .store()
            .snapshot(key, ThrottleScope::Resource)
            .map(|s| s.count)
            .unwrap_or(0);
        if current >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("resource count for {key} never reached {count}");
}

#[tokio::test]
async fn test_throttles_after_limit_and_recovers_next_window() -> anyhow::Result<()> {
    let (engine, _sink) = start_engine();

    for n in 0..10 {
        let decision = engine.check_and_consume(request(n * 100)).await?;
        assert!(!decision.throttled, "request {n} should have been admitted");
    }
    wait_for_count(&engine, "/orders:GET", 10).await;

    // The window is at its limit: the next request is rejected and does
    // not consume quota
    let decision = engine.check_and_consume(request(2_000)).await?;
    assert!(decision.throttled);
    assert!(decision.resource_throttled);
    assert!(!decision.application_throttled);
    let snap = engine
        .store()
        .snapshot("/orders:GET", ThrottleScope::Resource)
        .unwrap();
    assert_eq!(snap.count, 10);

    // A timestamp past the window boundary reads as unthrottled again
    let decision = engine.check_and_consume(request(70_000)).await?;
    assert!(!decision.throttled);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_soft_limit_counts_but_admits() {
    let (engine, _sink) = start_engine();

    // The subscription quota is unlimited and soft; only the resource
    // scope can reject, and it is nowhere near its limit
    let decision = tokio_test::assert_ok!(engine.check_and_consume(request(0)).await);
    assert!(!decision.throttled);
    assert!(!decision.subscription_throttled);

    wait_for_count(&engine, "/orders:GET", 1).await;
    let snap = engine
        .store()
        .snapshot("sub:gold", ThrottleScope::Subscription)
        .unwrap();
    assert_eq!(snap.count, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_soft_resource_limit_counts_but_never_rejects() {
    let (engine, _sink) = start_engine();
    let soft = |ts: i64| {
        let mut r = request(ts);
        r.resource.limit = 2;
        r.resource.stop_on_quota = false;
        r
    };

    for n in 0..3 {
        let decision = engine.check_and_consume(soft(n)).await.unwrap();
        assert!(!decision.throttled);
    }
    wait_for_count(&engine, "/orders:GET", 3).await;

    // The resource window is over its limit, but its counted policy is
    // soft, so the breach is reported without rejecting
    let decision = engine.check_and_consume(soft(100)).await.unwrap();
    assert!(decision.resource_throttled);
    assert!(!decision.throttled);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_events_reach_the_aggregator() {
    let (engine, sink) = start_engine();

    for n in 0..5 {
        engine.check_and_consume(request(n)).await.unwrap();
    }
    wait_for_count(&engine, "/orders:GET", 5).await;
    for _ in 0..500 {
        if sink.lock().len() >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    engine.shutdown().await;

    let events = sink.lock();
    assert_eq!(events.len(), 5);
    assert!(events.iter().all(|e| e.resource_key == "/orders:GET"));
    let max_count = events.iter().map(|e| e.resource_count).max().unwrap();
    assert_eq!(max_count, 5);
}

#[tokio::test]
async fn test_invalid_time_unit_is_an_error() {
    let (engine, _sink) = start_engine();

    let mut bad = request(0);
    bad.application.time_unit = "fortnight".to_string();
    assert!(engine.check_and_consume(bad).await.is_err());

    // Nothing was counted for any scope of the failed request
    assert!(engine
        .store()
        .snapshot("/orders:GET", ThrottleScope::Resource)
        .is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_rejects_new_requests() {
    let (engine, _sink) = start_engine();
    engine.shutdown().await;
    engine.shutdown().await;
    assert!(engine.check_and_consume(request(0)).await.is_err());
}
