use crate::protocol::ErrorCode;
use thiserror::Error;

/// Failures on the file protocol paths, on both the serving and the
/// consuming side.
///
/// Classified variants map onto a wire [`ErrorCode`]; transport failures and
/// shutdown do not, because there is no channel left to report on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("too many connections")]
    TooManyConnections,

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),

    #[error("transport error: {0}")]
    Transport(std::io::Error),

    #[error("service is shutting down")]
    Closed,

    #[error("server replied with error: {0}")]
    Remote(ErrorCode),

    #[error("content hash mismatch for {0}")]
    HashMismatch(String),
}

impl ProtocolError {
    /// Wire code to report to the peer, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ProtocolError::Malformed(_) | ProtocolError::HashMismatch(_) => {
                Some(ErrorCode::MalformedMessage)
            }
            ProtocolError::FileNotFound(_) => Some(ErrorCode::FileNotFound),
            ProtocolError::TooManyConnections => Some(ErrorCode::TooManyConnections),
            ProtocolError::Internal(_) => Some(ErrorCode::InternalServerError),
            ProtocolError::Remote(code) => Some(*code),
            ProtocolError::Transport(_) | ProtocolError::Closed => None,
        }
    }

    pub fn truncated(what: &str, expected: usize, got: usize) -> Self {
        ProtocolError::Malformed(format!(
            "peer closed while reading {}: got {} of {} bytes",
            what, got, expected
        ))
    }
}

impl From<crate::locking::LockError> for ProtocolError {
    fn from(_: crate::locking::LockError) -> Self {
        ProtocolError::Closed
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
