use thiserror::Error;

/// Why a connect attempt failed.
///
/// `InvalidDescriptor` is a configuration error and is never retried; every other
/// variant is transient and may succeed on a later attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid source descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("source {target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("failed to open stream {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("stream {target} produced no frame after {attempts} attempts")]
    NoFrames { target: String, attempts: u32 },

    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    pub fn invalid(descriptor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            descriptor: descriptor.into(),
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectError::InvalidDescriptor { .. } | ConnectError::Cancelled
        )
    }
}
