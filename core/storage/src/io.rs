//! Byte sources and sinks handed to adapters by callers.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use cloudtree_common::{Error, Result};

/// Readable byte stream produced by a [`DataSource`].
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Destination of a download.
pub type DataSink = dyn AsyncWrite + Send + Unpin;

/// Stream of byte chunks returned by native download calls.
pub type ByteStream<E> = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, E>> + Send>>;

/// Caller-provided content for uploads.
///
/// `open` may be called more than once: resumable uploads re-open the
/// source to restart from a server-confirmed offset.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Open a fresh stream positioned at the start of the content.
    ///
    /// `None` means the content is unavailable, which adapters treat as a
    /// fatal precondition violation.
    async fn open(&self) -> Result<Option<ByteReader>>;

    /// Content length, if known.
    fn size(&self) -> Option<u64>;

    /// Last modification time of the content, if known.
    fn modified(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// In-memory content.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
    modified: Option<DateTime<Utc>>,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            modified: None,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl DataSource for BytesSource {
    async fn open(&self) -> Result<Option<ByteReader>> {
        Ok(Some(Box::new(Cursor::new(self.data.clone()))))
    }

    fn size(&self) -> Option<u64> {
        Some(self.len())
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }
}

/// Content of a local file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: Option<u64>,
    modified: Option<DateTime<Utc>>,
}

impl FileSource {
    /// Create a source for `path`, reading its size and modification time.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(Error::InvalidInput(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
        Ok(Self {
            size: Some(meta.len()),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            path,
        })
    }
}

#[async_trait]
impl DataSource for FileSource {
    async fn open(&self) -> Result<Option<ByteReader>> {
        match tokio::fs::File::open(&self.path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }
}

/// Open `source` and skip to `offset`.
pub(crate) async fn open_at(source: &dyn DataSource, offset: u64, what: &str) -> Result<ByteReader> {
    let mut reader = source
        .open()
        .await?
        .ok_or_else(|| Error::fatal_msg(format!("upload {}", what), "data source has no stream"))?;

    if offset > 0 {
        let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink())
            .await
            .map_err(|e| Error::fatal(format!("upload {}", what), e))?;
        if skipped < offset {
            return Err(Error::fatal_msg(
                format!("upload {}", what),
                format!("data source ended at byte {} before offset {}", skipped, offset),
            ));
        }
    }

    Ok(reader)
}

/// Read exactly `len` bytes from `reader`.
pub(crate) async fn read_chunk(reader: &mut ByteReader, len: usize, what: &str) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::fatal(format!("read source for {}", what), e))?;
    Ok(Bytes::from(buf))
}

/// Read the whole source, checking it matches the declared size.
pub(crate) async fn read_all(source: &dyn DataSource, size: u64, what: &str) -> Result<Bytes> {
    let mut reader = open_at(source, 0, what).await?;
    let data = read_chunk(&mut reader, size as usize, what).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_bytes_source_reopens() {
        let source = BytesSource::new(&b"hello world"[..]);
        assert_eq!(source.size(), Some(11));

        let mut reader = open_at(&source, 6, "t").await.unwrap();
        let rest = read_chunk(&mut reader, 5, "t").await.unwrap();
        assert_eq!(&rest[..], b"world");

        let again = read_all(&source, 11, "t").await.unwrap();
        assert_eq!(&again[..], b"hello world");
    }

    #[tokio::test]
    async fn test_offset_past_end_is_fatal() {
        let source = BytesSource::new(&b"abc"[..]);
        let result = open_at(&source, 10, "t").await;
        assert!(matches!(result, Err(Error::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_short_source_is_fatal() {
        let source = BytesSource::new(&b"abc"[..]);
        let result = read_all(&source, 5, "t").await;
        assert!(matches!(result, Err(Error::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_file_source() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"on disk").unwrap();

        let source = FileSource::new(tmp.path()).await.unwrap();
        assert_eq!(source.size(), Some(7));
        assert!(source.modified().is_some());
        let data = read_all(&source, 7, "t").await.unwrap();
        assert_eq!(&data[..], b"on disk");
    }

    struct Unavailable;

    #[async_trait]
    impl DataSource for Unavailable {
        async fn open(&self) -> Result<Option<ByteReader>> {
            Ok(None)
        }

        fn size(&self) -> Option<u64> {
            None
        }
    }

    #[tokio::test]
    async fn test_missing_stream_is_fatal() {
        let result = open_at(&Unavailable, 0, "t").await;
        assert!(matches!(result, Err(Error::Fatal { .. })));
    }
}
