use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event queue is full")]
    QueueFull,

    #[error("no active endpoint available")]
    NoEndpoint,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection worker already initialized")]
    AlreadyInitialized,

    #[error("connection worker not initialized")]
    NotInitialized,

    #[error("session expired")]
    SessionExpired,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("agent is shut down")]
    Shutdown,

    #[error("quota error: {0}")]
    Quota(#[from] quotamesh::QuotaError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
