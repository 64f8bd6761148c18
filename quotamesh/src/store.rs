//! The three-scope window counter store
//!
//! [`WindowStore`] owns one key→state map per [`ThrottleScope`]. Lookups on
//! the request hot path take a read lock on the scope map plus the per-key
//! mutex; the map's write lock is only taken for a key's first update and
//! by the sweeper.

use crate::window::{ThrottleScope, WindowSnapshot, WindowState};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::sync::Arc;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

type ScopeMap = RwLock<HashMap<String, Arc<WindowState>>>;

/// In-memory fixed-window counter store
///
/// All state lives in memory and is rebuilt from zero on restart; quota
/// windows restart empty by design.
///
/// # Example
///
/// ```
/// use quotamesh::{ThrottleScope, WindowStore};
///
/// let store = WindowStore::new();
/// store.update("app:shop", ThrottleScope::Application, 100, 60_000, true, 0);
/// assert!(!store.is_throttled("app:shop", ThrottleScope::Application, 1_000));
/// ```
#[derive(Debug, Default)]
pub struct WindowStore {
    resource: ScopeMap,
    application: ScopeMap,
    subscription: ScopeMap,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, scope: ThrottleScope) -> &ScopeMap {
        match scope {
            ThrottleScope::Resource => &self.resource,
            ThrottleScope::Application => &self.application,
            ThrottleScope::Subscription => &self.subscription,
        }
    }

    /// Apply one accepted request to `key` in `scope`
    ///
    /// Creates the window state on a key's first update. Two updates racing
    /// to create the same key converge on exactly one state: the loser of
    /// the insert race re-applies its increment against the winner's state,
    /// so no increment is ever lost.
    pub fn update(
        &self,
        key: &str,
        scope: ThrottleScope,
        limit: i64,
        unit_time_millis: i64,
        stop_on_quota: bool,
        timestamp: i64,
    ) {
        let map = self.map(scope);
        {
            let guard = map.read();
            if let Some(state) = guard.get(key) {
                let state = Arc::clone(state);
                drop(guard);
                state.update(limit, stop_on_quota, timestamp);
                return;
            }
        }

        let mut guard = map.write();
        match guard.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                // Lost the create race: count this update against the winner
                let state = Arc::clone(occupied.get());
                drop(guard);
                state.update(limit, stop_on_quota, timestamp);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(WindowState::new(
                    scope,
                    limit,
                    unit_time_millis,
                    stop_on_quota,
                    timestamp,
                )));
            }
        }
    }

    /// Whether `key` is throttled in `scope` at `now`
    ///
    /// A key with no state, or whose window has expired, is not throttled.
    pub fn is_throttled(&self, key: &str, scope: ThrottleScope, now: i64) -> bool {
        match self.map(scope).read().get(key) {
            Some(state) => state.is_throttled(now),
            None => false,
        }
    }

    /// Whether exceeding the quota on this key causes rejection
    ///
    /// Keys without state default to rejecting, matching the policy
    /// engine's hard-limit default.
    pub fn stop_on_quota(&self, key: &str, scope: ThrottleScope) -> bool {
        match self.map(scope).read().get(key) {
            Some(state) => state.stop_on_quota(),
            None => true,
        }
    }

    /// Point-in-time counters for `key`, if it has state
    pub fn snapshot(&self, key: &str, scope: ThrottleScope) -> Option<WindowSnapshot> {
        self.map(scope).read().get(key).map(|s| s.snapshot())
    }

    /// Drop every state whose window has fully elapsed at `now`
    ///
    /// Scans all three scope maps. Driven periodically by the embedding
    /// process; safe to call concurrently with updates.
    pub fn sweep(&self, now: i64) {
        for scope in ThrottleScope::ALL {
            self.map(scope)
                .write()
                .retain(|_, state| !state.is_expired(now));
        }
    }

    #[cfg(test)]
    pub fn len(&self, scope: ThrottleScope) -> usize {
        self.map(scope).read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WINDOW: i64 = 60_000;

    #[test]
    fn test_unknown_key_not_throttled() {
        let store = WindowStore::new();
        assert!(!store.is_throttled("missing", ThrottleScope::Resource, 0));
    }

    #[test]
    fn test_throttles_on_nth_update() {
        let store = WindowStore::new();
        for i in 0..9 {
            store.update("res", ThrottleScope::Resource, 10, WINDOW, true, i * 100);
            assert!(!store.is_throttled("res", ThrottleScope::Resource, i * 100));
        }
        store.update("res", ThrottleScope::Resource, 10, WINDOW, true, 1_000);
        assert!(store.is_throttled("res", ThrottleScope::Resource, 1_000));
    }

    #[test]
    fn test_scope_independence() {
        let store = WindowStore::new();
        // Same key string, three scopes: throttling one leaves the others alone
        for ts in 0..5 {
            store.update("shared", ThrottleScope::Resource, 2, WINDOW, true, ts);
        }
        store.update("shared", ThrottleScope::Application, 100, WINDOW, true, 0);
        store.update("shared", ThrottleScope::Subscription, 100, WINDOW, true, 0);

        assert!(store.is_throttled("shared", ThrottleScope::Resource, 100));
        assert!(!store.is_throttled("shared", ThrottleScope::Application, 100));
        assert!(!store.is_throttled("shared", ThrottleScope::Subscription, 100));
    }

    #[test]
    fn test_no_lost_increments_on_concurrent_create() {
        let store = Arc::new(WindowStore::new());
        let threads: i64 = 8;
        let per_thread: i64 = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        store.update("hot", ThrottleScope::Application, 0, WINDOW, false, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = store.snapshot("hot", ThrottleScope::Application).unwrap();
        assert_eq!(snap.count, threads * per_thread);
    }

    #[test]
    fn test_sweep_removes_only_elapsed_windows() {
        let store = WindowStore::new();
        store.update("old", ThrottleScope::Resource, 10, WINDOW, true, 0);
        store.update("fresh", ThrottleScope::Resource, 10, WINDOW, true, 120_000);

        // Mid-window: nothing is eligible yet
        store.sweep(30_000);
        assert_eq!(store.len(ThrottleScope::Resource), 2);

        // "old"'s window [0, 60_000) has fully elapsed, "fresh"'s has not
        store.sweep(130_000);
        assert_eq!(store.len(ThrottleScope::Resource), 1);
        assert!(store.snapshot("old", ThrottleScope::Resource).is_none());
        assert!(store.snapshot("fresh", ThrottleScope::Resource).is_some());
    }

    #[test]
    fn test_sweep_targets_all_scopes() {
        let store = WindowStore::new();
        store.update("k", ThrottleScope::Resource, 1, WINDOW, true, 0);
        store.update("k", ThrottleScope::Application, 1, WINDOW, true, 0);
        store.update("k", ThrottleScope::Subscription, 1, WINDOW, true, 0);

        store.sweep(70_000);
        assert_eq!(store.len(ThrottleScope::Resource), 0);
        assert_eq!(store.len(ThrottleScope::Application), 0);
        assert_eq!(store.len(ThrottleScope::Subscription), 0);
    }

    #[test]
    fn test_stop_on_quota_defaults_to_reject() {
        let store = WindowStore::new();
        assert!(store.stop_on_quota("missing", ThrottleScope::Resource));
    }

    #[test]
    fn test_stop_on_quota_tracks_last_update() {
        let store = WindowStore::new();
        store.update("soft", ThrottleScope::Application, 5, WINDOW, false, 0);
        assert!(!store.stop_on_quota("soft", ThrottleScope::Application));
        store.update("soft", ThrottleScope::Application, 5, WINDOW, true, 1);
        assert!(store.stop_on_quota("soft", ThrottleScope::Application));
    }

    #[test]
    fn test_unlimited_policy() {
        let store = WindowStore::new();
        for ts in 0..1_000 {
            store.update("free", ThrottleScope::Subscription, 0, WINDOW, false, ts);
        }
        assert!(!store.is_throttled("free", ThrottleScope::Subscription, 1_000));
    }
}
