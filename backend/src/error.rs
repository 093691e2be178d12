use thiserror::Error;

/// Errors raised anywhere in the intake → enrich → rank → admit pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("Transient upstream error from {service}: {message}")]
    TransientUpstream { service: &'static str, message: String },
    #[error("Upstream error from {service}: {message}")]
    Upstream { service: &'static str, message: String },
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Queue error: {0}")]
    Queue(String),
}

impl PipelineError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientUpstream { .. } | PipelineError::CacheUnavailable(_)
        )
    }

    /// Classifies a reqwest failure: connect errors, timeouts and 5xx/429
    /// are transient, everything else is not.
    pub fn from_http(service: &'static str, err: reqwest::Error) -> Self {
        let transient = err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || err
                .status()
                .map(|s| s.is_server_error() || s.as_u16() == 429)
                .unwrap_or(false);
        if transient {
            PipelineError::TransientUpstream { service, message: err.to_string() }
        } else {
            PipelineError::Upstream { service, message: err.to_string() }
        }
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::CacheUnavailable(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
