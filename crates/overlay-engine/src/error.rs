//! Error types for overlay computation.

use fgb_source::{FetchError, SourceError};
use thiserror::Error;

/// Errors that can occur while computing a geography overlay.
#[derive(Error, Debug, Clone)]
pub enum OverlayError {
    /// A byte range of a source could not be retrieved.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A source is not a readable, indexed FlatGeobuf file.
    #[error("format error: {0}")]
    Format(String),

    /// Invalid geography, filter, source format or option.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid input geometry or a failed boolean operation.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// Metric values that cannot be combined or summarised.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// The caller cancelled the computation.
    #[error("overlay computation cancelled")]
    Cancelled,
}

impl OverlayError {
    /// Create a Configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a Geometry error.
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    /// Create a Metrics error.
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Whether retrying the same job could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Cancelled)
    }

    /// Short machine readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Format(_) => "format",
            Self::Configuration(_) => "configuration",
            Self::Geometry(_) => "geometry",
            Self::Metrics(_) => "metrics",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<SourceError> for OverlayError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Fetch(e) => Self::Fetch(e),
            e @ SourceError::Format { .. } => Self::Format(e.to_string()),
            SourceError::Config(msg) => Self::Configuration(msg),
            SourceError::Io(msg) => Self::Format(format!("io error: {}", msg)),
        }
    }
}

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use fgb_source::ByteRange;

    #[test]
    fn test_source_error_mapping() {
        let fetch = FetchError::new("mem://a", ByteRange::new(0, 9), "boom".into());
        let err: OverlayError = SourceError::Fetch(fetch).into();
        assert!(matches!(err, OverlayError::Fetch(_)));
        assert!(err.is_retryable());

        let err: OverlayError = SourceError::format("mem://a", "bad magic").into();
        assert!(matches!(err, OverlayError::Format(_)));
        assert!(err.to_string().contains("bad magic"));
        assert!(!err.is_retryable());

        let err: OverlayError = SourceError::config("page_size must be > 0").into();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_cancelled_is_retryable() {
        assert!(OverlayError::Cancelled.is_retryable());
        assert!(!OverlayError::geometry("nan").is_retryable());
    }
}
