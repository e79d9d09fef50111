use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Timeouts, connection failures, 5xx and 429 responses, and interrupted
    /// or reset I/O are transient. Everything else is permanent for the
    /// request that produced it.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Timeout(_) | BridgeError::Connection(_) => true,
            BridgeError::Status { status, .. } => *status >= 500 || *status == 429,
            BridgeError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            BridgeError::NotAvailable(_) | BridgeError::OperationFailed(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
