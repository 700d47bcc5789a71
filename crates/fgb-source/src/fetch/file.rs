//! Local filesystem range fetcher.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::RangeFetcher;
use crate::error::BoxError;
use crate::types::ByteRange;

/// Reads byte ranges from local files. Accepts plain paths and `file://`
/// URLs. Relative paths resolve against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileRangeFetcher {
    root: Option<PathBuf>,
}

impl FileRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl RangeFetcher for FileRangeFetcher {
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, BoxError> {
        let mut file = File::open(self.resolve(url)).await?;
        let file_len = file.metadata().await?.len();

        let start = range.start.min(file_len);
        let end = match range.end {
            Some(end) => end.saturating_add(1).min(file_len),
            None => file_len,
        };
        if start >= end {
            return Ok(Bytes::new());
        }

        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_file_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello flatgeobuf").unwrap();

        let fetcher = FileRangeFetcher::new();
        let url = format!("file://{}", path.display());
        let bytes = fetcher.fetch_range(&url, ByteRange::new(6, 9)).await.unwrap();
        assert_eq!(&bytes[..], b"flat");

        let rest = fetcher
            .fetch_range(path.to_str().unwrap(), ByteRange::from_offset(10))
            .await
            .unwrap();
        assert_eq!(&rest[..], b"geobuf");
    }

    #[tokio::test]
    async fn test_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.fgb"), b"abc").unwrap();

        let fetcher = FileRangeFetcher::with_root(dir.path());
        let bytes = fetcher.fetch_range("a.fgb", ByteRange::new(0, 10)).await.unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let fetcher = FileRangeFetcher::new();
        let result = fetcher
            .fetch_range("/definitely/not/here.fgb", ByteRange::new(0, 1))
            .await;
        assert!(result.is_err());
    }
}
