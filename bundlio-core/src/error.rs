use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundlioError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store operation failed: {0}")]
    StoreOperation(String),

    #[error("Queue send failed: {0}")]
    QueueSend(String),

    #[error("Content resolver error: {0}")]
    ContentResolver(String),

    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Marketplace error: {0}")]
    Marketplace(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl BundlioError {
    /// Fatal errors never succeed on redelivery; everything else is left to the
    /// host to retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BundlioError::Parse(_)
                | BundlioError::InvalidRequest(_)
                | BundlioError::InvalidTransition { .. }
                | BundlioError::Codec(_)
                | BundlioError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BundlioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!BundlioError::Parse("bad url".to_string()).is_retryable());
        assert!(!BundlioError::Codec("truncated".to_string()).is_retryable());
        assert!(BundlioError::StoreOperation("timeout".to_string()).is_retryable());
        assert!(BundlioError::QueueSend("timeout".to_string()).is_retryable());
        assert!(BundlioError::Reconciliation("404".to_string()).is_retryable());
    }
}
