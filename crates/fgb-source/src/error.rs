//! Error types for FlatGeobuf sources.

use std::sync::Arc;

use thiserror::Error;

use crate::types::ByteRange;

/// Boxed error returned by [`RangeFetcher`](crate::fetch::RangeFetcher) implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A byte-range fetch that failed.
///
/// Carries the URL and range so a failure deep inside a query can still be
/// traced back to the request that caused it. Cloneable so that one failed
/// in-flight fetch can be reported to every caller waiting on it.
#[derive(Error, Debug, Clone)]
#[error("failed to fetch bytes {range} from {url}: {source}")]
pub struct FetchError {
    pub url: String,
    pub range: ByteRange,
    #[source]
    pub source: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl FetchError {
    /// Wrap a fetcher failure with the request it belongs to.
    pub fn new(url: impl Into<String>, range: ByteRange, source: BoxError) -> Self {
        Self {
            url: url.into(),
            range,
            source: Arc::from(source),
        }
    }
}

/// Errors that can occur while opening or reading a source.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Network or storage failure retrieving a byte range.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Malformed or unsupported FlatGeobuf header, index or feature data.
    #[error("invalid FlatGeobuf data in {url}: {message}")]
    Format { url: String, message: String },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local filesystem error (writer output).
    #[error("io error: {0}")]
    Io(String),
}

impl SourceError {
    /// Create a Format error.
    pub fn format(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Format {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;
