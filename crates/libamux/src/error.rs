use amux_protocol::{ErrorCode, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmuxError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("invalid working directory: {0}")]
    InvalidWorkingDirectory(String),

    #[error("operation not supported by {backend} backend: {op}")]
    BackendUnsupported { backend: &'static str, op: &'static str },

    #[error("session already exited: {0}")]
    SessionExited(SessionId),

    #[error("pty error: {0}")]
    PtyError(String),

    #[error("spawn failed: {0}")]
    SpawnError(String),

    #[error("invalid buffer capacity: {0}")]
    InvalidCapacity(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmuxError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            AmuxError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            AmuxError::InvalidWorkingDirectory(_) => {
                (ErrorCode::InvalidWorkingDirectory, self.to_string())
            }
            AmuxError::BackendUnsupported { .. } => {
                (ErrorCode::BackendUnsupported, self.to_string())
            }
            AmuxError::SessionExited(_) => (ErrorCode::SessionExited, self.to_string()),
            AmuxError::PtyError(_) | AmuxError::SpawnError(_) => {
                (ErrorCode::ServerError, self.to_string())
            }
            AmuxError::InvalidCapacity(_) => (ErrorCode::InvalidRequest, self.to_string()),
            AmuxError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
