use thiserror::Error;

/// Main error type for the ChainPulse system
#[derive(Error, Debug)]
pub enum CpError {
    #[error("Resilience error: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the cache/retry/circuit-breaker call pipeline.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// The circuit for this dependency is open; no call was attempted.
    #[error("dependency {dependency} unavailable: circuit open, retry in {retry_in_ms} ms")]
    DependencyUnavailable { dependency: String, retry_in_ms: u64 },

    /// The call was attempted and every retry failed.
    #[error("dependency {dependency} failed after {attempts} attempts: {message}")]
    DependencyFailed {
        dependency: String,
        attempts: u32,
        message: String,
    },
}

impl ResilienceError {
    /// Name of the dependency the call was routed to.
    pub fn dependency(&self) -> &str {
        match self {
            ResilienceError::DependencyUnavailable { dependency, .. } => dependency,
            ResilienceError::DependencyFailed { dependency, .. } => dependency,
        }
    }
}

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage connection failed: {message}")]
    Connection { message: String },

    #[error("storage pool is closed")]
    PoolClosed,

    #[error("insert into {table} failed: {message}")]
    InsertFailed { table: String, message: String },

    #[error("query failed: {message}")]
    QueryFailed { message: String },
}

/// Subscriber transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send to subscriber {subscriber} failed: {message}")]
    SendFailed {
        subscriber: String,
        message: String,
    },

    #[error("subscriber connection closed")]
    Closed,
}

/// Alert delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("delivery via {channel} failed: {message}")]
    DeliveryFailed { channel: String, message: String },
}

/// Result type alias for ChainPulse operations
pub type CpResult<T> = Result<T, CpError>;

/// Result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
