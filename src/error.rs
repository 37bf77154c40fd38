use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SyncError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connection(_) => true,
            SyncError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            ),
            SyncError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Collapse an exhausted transient failure into a connection error.
    pub fn into_connection_error(self, context: &str) -> Self {
        match self {
            SyncError::Connection(msg) => SyncError::Connection(format!("{}: {}", context, msg)),
            other if other.is_retryable() => {
                SyncError::Connection(format!("{}: {}", context, other))
            }
            other => other,
        }
    }
}

impl From<polars::prelude::PolarsError> for SyncError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        SyncError::Polars(e.to_string())
    }
}

impl From<csv::Error> for SyncError {
    fn from(e: csv::Error) -> Self {
        SyncError::Validation(format!("CSV error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Connection("reset".into()).is_retryable());
        assert!(!SyncError::Configuration("missing host".into()).is_retryable());
        assert!(!SyncError::NotFound("table".into()).is_retryable());
        assert!(!SyncError::Validation("empty".into()).is_retryable());
        assert!(!SyncError::stage("ingestion", "boom").is_retryable());
    }

    #[test]
    fn test_exhausted_error_becomes_connection_error() {
        let err = SyncError::Connection("refused".into()).into_connection_error("get_data");
        assert!(matches!(err, SyncError::Connection(ref m) if m.contains("get_data")));

        let err = SyncError::Validation("bad".into()).into_connection_error("get_data");
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
