//! Failures talking to the inference endpoints.

use marketbrief_shared::MarketBriefError;

/// A single failed embedding or chat call.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Connection, timeout, or body transfer failure.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status.
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The response did not match the expected contract.
    #[error("malformed response from {endpoint}: {message}")]
    Shape { endpoint: String, message: String },

    /// The client could not be constructed.
    #[error("inference client setup failed: {0}")]
    Setup(String),
}

impl InferenceError {
    pub(crate) fn shape(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Shape {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Rate limits, server errors, transport failures and shape violations
    /// are retried; other 4xx responses and setup errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Shape { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Setup(_) => false,
        }
    }
}

impl From<InferenceError> for MarketBriefError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Transport { .. } => MarketBriefError::Network(err.to_string()),
            other => MarketBriefError::Inference(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> InferenceError {
        InferenceError::Status {
            endpoint: "http://localhost/v1/embeddings".into(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn retry_classification() {
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(InferenceError::shape("x", "2 vectors for 3 inputs").is_retryable());
        assert!(!InferenceError::Setup("bad header".into()).is_retryable());
    }

    #[test]
    fn converts_into_shared_error() {
        let err: MarketBriefError = status(502).into();
        assert!(err.to_string().starts_with("inference error:"));
        assert!(err.to_string().contains("HTTP 502"));
    }
}
