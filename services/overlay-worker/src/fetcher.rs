//! Range fetcher that picks a transport from the URL scheme.

use async_trait::async_trait;
use bytes::Bytes;
use fgb_source::{BoxError, ByteRange, FileRangeFetcher, HttpRangeFetcher, RangeFetcher};

/// Serves `http://` and `https://` URLs over HTTP and everything else from
/// the local filesystem.
pub struct SchemeFetcher {
    http: HttpRangeFetcher,
    file: FileRangeFetcher,
}

impl SchemeFetcher {
    pub fn new(http: HttpRangeFetcher, file: FileRangeFetcher) -> Self {
        Self { http, file }
    }
}

pub fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[async_trait]
impl RangeFetcher for SchemeFetcher {
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, BoxError> {
        if is_http(url) {
            self.http.fetch_range(url, range).await
        } else {
            self.file.fetch_range(url, range).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_http() {
        assert!(is_http("https://example.com/eez.fgb"));
        assert!(is_http("http://localhost:8080/land.fgb"));
        assert!(!is_http("file:///data/land.fgb"));
        assert!(!is_http("data/land.fgb"));
    }
}
