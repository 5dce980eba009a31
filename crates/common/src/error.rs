use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Redis(_) | AppError::Network(_) | AppError::Feed(_) | AppError::Delivery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_category_words() {
        // The error classifier matches on these prefixes.
        assert!(AppError::Network("x".into()).to_string().starts_with("Network"));
        assert!(AppError::Permission("x".into()).to_string().contains("Permission denied"));
        assert!(AppError::Storage("x".into()).to_string().starts_with("Storage"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(AppError::Network("down".into()).is_transient());
        assert!(!AppError::Config("bad".into()).is_transient());
        assert!(!AppError::Permission("no".into()).is_transient());
    }
}
