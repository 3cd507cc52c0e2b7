use privd_protocol::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrivdError {
    #[error("caller (uid {uid}, pid {pid}) is not an attached client")]
    NotAttached { uid: u32, pid: i32 },

    #[error("caller (uid {uid}, pid {pid}) has no permission")]
    PermissionDenied { uid: u32, pid: i32 },

    #[error("{0} is restricted to the manager application")]
    ManagerOnly(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to launch user service: {0}")]
    Launch(String),

    #[error("user service session not found: {0}")]
    SessionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrivdError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            PrivdError::NotAttached { .. } => (ErrorCode::NotAttached, self.to_string()),
            PrivdError::PermissionDenied { .. } => (ErrorCode::PermissionDenied, self.to_string()),
            PrivdError::ManagerOnly(_) => (ErrorCode::ManagerOnly, self.to_string()),
            PrivdError::Storage(_) => (ErrorCode::ServerError, "internal storage error".to_string()),
            PrivdError::Launch(_) => (ErrorCode::ServerError, self.to_string()),
            PrivdError::SessionNotFound(_) => (ErrorCode::NotAttached, self.to_string()),
            PrivdError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
