use thiserror::Error;

/// Construction-time failures and cooperative cancellation.
///
/// Everything else (I/O, HTTP, decoding) travels as `anyhow::Error` with context attached
/// at the call site.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid timeframe '{0}'")]
    InvalidTimeframe(String),

    #[error("Unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("Missing required parameter `{key}` for {owner}")]
    MissingParameter { owner: String, key: String },

    #[error("Invalid parameter `{key}`: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn missing(owner: &str, key: &str) -> Self {
        EngineError::MissingParameter {
            owner: owner.to_string(),
            key: key.to_string(),
        }
    }

    pub fn invalid<R: Into<String>>(key: &str, reason: R) -> Self {
        EngineError::InvalidParameter {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// True when the error chain carries a cancellation rather than a genuine failure.
pub fn is_cancellation(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<EngineError>(), Some(EngineError::Cancelled)))
}
