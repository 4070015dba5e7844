use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("operation {operation_id} exhausted after {attempts} attempts: {source}")]
    Exhausted {
        operation_id: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("retry state for operation {operation_id} was reset")]
    Cancelled { operation_id: String },
}

impl RetryError {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Exhausted { operation_id, .. } | Self::Cancelled { operation_id } => operation_id,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("no acknowledgement for {event} within {timeout_ms}ms")]
    Timeout { event: String, timeout_ms: u64 },
    #[error("server rejected {event}: {reason}")]
    Rejected { event: String, reason: String },
    #[error("transport closed before acknowledgement")]
    Closed,
    #[error("transport i/o failure: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection abandoned after {attempts} reconnect attempts")]
    Abandoned { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum BulkSendError {
    #[error("bulk batch size must be at least 1")]
    InvalidBatchSize,
    #[error("message delivery unavailable: {0}")]
    Unavailable(String),
}
