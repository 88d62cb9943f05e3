//! Request bodies: length measurement, MD5 digests and spill files.
//!
//! A body is hashed either in memory or through a temp file. The temp file is
//! owned by the [`MaterializedBody`] and removed when it is dropped, so every
//! exit path of the owning request cleans up.

use std::fmt;
use std::io::{self, Cursor};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use md5::{Digest, Md5};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::constants::{BODY_CHUNK_SIZE, TEMP_FILE_PREFIX, TEMP_FILE_SUFFIX};
use crate::progress::ProgressTracker;

/// Body type handed to the transport.
pub type OutgoingBody = UnsyncBoxBody<Bytes, io::Error>;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised while measuring or materializing a body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The body kind does not expose its length without being consumed.
    #[error("body length is unknown without consuming it")]
    UnknownLength,

    /// Reading the body or writing the spill file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A request body as supplied by the caller.
pub enum RequestBody {
    /// In-memory bytes.
    Bytes(Bytes),
    /// An open file, sent from its current position.
    File(File),
    /// A reader bounded to `limit` bytes.
    Limited {
        /// The source reader.
        reader: BoxReader,
        /// Maximum bytes read from it.
        limit: u64,
    },
    /// An arbitrary reader of unknown length.
    Reader(BoxReader),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::File(_) => f.write_str("File"),
            Self::Limited { limit, .. } => f.debug_struct("Limited").field("limit", limit).finish(),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl RequestBody {
    /// Wraps a reader of unknown length.
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    /// Wraps a reader, reading at most `limit` bytes.
    pub fn limited(reader: impl AsyncRead + Send + Unpin + 'static, limit: u64) -> Self {
        Self::Limited {
            reader: Box::new(reader),
            limit,
        }
    }

    /// Determines the body length without consuming it.
    ///
    /// A file counts only the bytes left after its current position.
    ///
    /// # Errors
    ///
    /// [`BodyError::UnknownLength`] for arbitrary readers, or the I/O error of
    /// a failed file stat or seek.
    pub async fn measure(&mut self) -> Result<u64, BodyError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.len() as u64),
            Self::File(file) => {
                let len = file.metadata().await?.len();
                let position = file.stream_position().await?;
                Ok(len.saturating_sub(position))
            }
            Self::Limited { limit, .. } => Ok(*limit),
            Self::Reader(_) => Err(BodyError::UnknownLength),
        }
    }

    fn into_reader(self) -> BoxReader {
        match self {
            Self::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            Self::File(file) => Box::new(file),
            Self::Limited { reader, limit } => Box::new(reader.take(limit)),
            Self::Reader(reader) => reader,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<File> for RequestBody {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

/// Where a materialized body lives.
#[derive(Debug)]
pub enum BodyStorage {
    /// Held in memory.
    Memory(Bytes),
    /// Spilled to a temp file, deleted on drop.
    TempFile(NamedTempFile),
}

/// A body that has been fully read, hashed and made re-readable.
#[derive(Debug)]
pub struct MaterializedBody {
    content_length: u64,
    content_md5: String,
    storage: BodyStorage,
}

impl MaterializedBody {
    /// Bytes in the body.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Base64 MD5 digest of the body.
    #[must_use]
    pub fn content_md5(&self) -> &str {
        &self.content_md5
    }

    /// Backing storage.
    #[must_use]
    pub fn storage(&self) -> &BodyStorage {
        &self.storage
    }

    /// Path of the spill file, if the body was spilled.
    #[must_use]
    pub fn temp_path(&self) -> Option<&Path> {
        match &self.storage {
            BodyStorage::TempFile(file) => Some(file.path()),
            BodyStorage::Memory(_) => None,
        }
    }

    /// Opens a fresh reader positioned at the start of the body.
    ///
    /// # Errors
    ///
    /// Propagates failure to reopen the spill file.
    pub fn open(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(match &self.storage {
            BodyStorage::Memory(bytes) => Box::new(Cursor::new(bytes.clone())),
            BodyStorage::TempFile(file) => Box::new(File::from_std(file.reopen()?)),
        })
    }
}

/// Reads `body` fully, computing its MD5 digest.
///
/// When `length` is zero (unknown) or above `threshold` the body is copied to
/// a temp file in `temp_dir` (the system temp dir when `None`) and hashed from
/// there; otherwise it is buffered in memory.
///
/// # Errors
///
/// Returns [`BodyError::Io`] when the body cannot be read or the spill file
/// cannot be created or written. A partially written spill file is removed.
pub async fn calc_digest(
    body: RequestBody,
    length: u64,
    threshold: u64,
    temp_dir: Option<&Path>,
) -> Result<MaterializedBody, BodyError> {
    if length == 0 || length > threshold {
        return spill(body, temp_dir).await;
    }

    let bytes = match body {
        RequestBody::Bytes(bytes) => bytes,
        other => {
            let mut buf = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
            other.into_reader().read_to_end(&mut buf).await?;
            Bytes::from(buf)
        }
    };
    let content_md5 = STANDARD.encode(Md5::digest(&bytes));
    Ok(MaterializedBody {
        content_length: bytes.len() as u64,
        content_md5,
        storage: BodyStorage::Memory(bytes),
    })
}

async fn spill(body: RequestBody, temp_dir: Option<&Path>) -> Result<MaterializedBody, BodyError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_FILE_PREFIX).suffix(TEMP_FILE_SUFFIX);
    let temp = match temp_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    debug!(path = %temp.path().display(), "spilling request body to temp file");

    let mut writer = File::from_std(temp.reopen()?);
    let mut reader = body.into_reader();
    let content_length = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    drop(writer);

    let mut hasher = Md5::new();
    let mut file = File::from_std(temp.reopen()?);
    let mut chunk = vec![0u8; BODY_CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }

    Ok(MaterializedBody {
        content_length,
        content_md5: STANDARD.encode(hasher.finalize()),
        storage: BodyStorage::TempFile(temp),
    })
}

/// Streams `reader` in chunks, reporting each chunk to `tracker`.
pub(crate) fn stream_body(reader: BoxReader, tracker: ProgressTracker) -> OutgoingBody {
    let stream = ReaderStream::with_capacity(reader, BODY_CHUNK_SIZE).map_ok(move |chunk| {
        tracker.advance(chunk.len() as u64);
        Frame::data(chunk)
    });
    StreamBody::new(stream).boxed_unsync()
}

pub(crate) fn empty_body() -> OutgoingBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// The body of one request as seen by the executor.
pub(crate) enum PreparedBody {
    Empty,
    Materialized(MaterializedBody),
    /// Sent as supplied; only in-memory bytes survive a resend.
    Direct(Option<RequestBody>),
}

impl PreparedBody {
    /// Whether the body can be sent again after a redirect.
    pub(crate) fn is_replayable(&self) -> bool {
        match self {
            Self::Empty | Self::Materialized(_) => true,
            Self::Direct(body) => matches!(body, Some(RequestBody::Bytes(_))),
        }
    }

    /// Builds the transport body; `None` once a one-shot body was consumed.
    pub(crate) fn outgoing(&mut self, tracker: &ProgressTracker) -> io::Result<Option<OutgoingBody>> {
        let reader: BoxReader = match self {
            Self::Empty => return Ok(Some(empty_body())),
            Self::Materialized(body) => body.open()?,
            Self::Direct(slot) => match slot.take() {
                Some(RequestBody::Bytes(bytes)) => {
                    *slot = Some(RequestBody::Bytes(bytes.clone()));
                    Box::new(Cursor::new(bytes))
                }
                Some(other) => other.into_reader(),
                None => return Ok(None),
            },
        };
        Ok(Some(stream_body(reader, tracker.clone())))
    }

    pub(crate) fn temp_path(&self) -> Option<&Path> {
        match self {
            Self::Materialized(body) => body.temp_path(),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // base64(md5("hello world"))
    const HELLO_MD5: &str = "XrY7u+Ae7tCTyyK7j1rNww==";

    async fn read_all(body: &MaterializedBody) -> Vec<u8> {
        let mut out = Vec::new();
        body.open().unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    fn spill_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_measure_known_kinds() {
        assert_eq!(RequestBody::from("hello").measure().await.unwrap(), 5);
        let mut limited = RequestBody::limited(Cursor::new(vec![0u8; 100]), 10);
        assert_eq!(limited.measure().await.unwrap(), 10);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![7u8; 1234]).unwrap();
        let file = File::open(&path).await.unwrap();
        assert_eq!(RequestBody::from(file).measure().await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn test_measure_file_counts_from_current_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![7u8; 1234]).unwrap();
        let mut file = File::open(&path).await.unwrap();
        let mut head = vec![0u8; 200];
        file.read_exact(&mut head).await.unwrap();

        let mut body = RequestBody::from(file);
        assert_eq!(body.measure().await.unwrap(), 1034);
        let materialized = calc_digest(body, 1034, 4096, None).await.unwrap();
        assert_eq!(materialized.content_length(), 1034);
    }

    #[tokio::test]
    async fn test_measure_unknown_reader_fails() {
        let mut body = RequestBody::reader(Cursor::new(b"abc".to_vec()));
        assert!(matches!(body.measure().await, Err(BodyError::UnknownLength)));
    }

    #[tokio::test]
    async fn test_small_body_hashed_in_memory() {
        let body = calc_digest(RequestBody::from("hello world"), 11, 1024, None)
            .await
            .unwrap();
        assert_eq!(body.content_md5(), HELLO_MD5);
        assert_eq!(body.content_length(), 11);
        assert!(body.temp_path().is_none());
        assert_eq!(read_all(&body).await, b"hello world");
    }

    #[tokio::test]
    async fn test_large_body_spills_and_is_rereadable() {
        let dir = TempDir::new().unwrap();
        let body = calc_digest(RequestBody::from("hello world"), 11, 4, Some(dir.path()))
            .await
            .unwrap();

        assert_eq!(body.content_md5(), HELLO_MD5);
        assert_eq!(body.content_length(), 11);
        let path = body.temp_path().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(TEMP_FILE_PREFIX), "{name}");
        assert!(name.ends_with(TEMP_FILE_SUFFIX), "{name}");

        assert_eq!(read_all(&body).await, b"hello world");
        assert_eq!(read_all(&body).await, b"hello world");

        drop(body);
        assert!(!path.exists());
        assert!(spill_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_length_spills() {
        let dir = TempDir::new().unwrap();
        let reader = RequestBody::reader(Cursor::new(b"hello world".to_vec()));
        let body = calc_digest(reader, 0, 1024, Some(dir.path())).await.unwrap();
        assert!(body.temp_path().is_some());
        assert_eq!(body.content_length(), 11);
        assert_eq!(body.content_md5(), HELLO_MD5);
    }

    #[tokio::test]
    async fn test_limited_reader_is_truncated() {
        let reader = RequestBody::limited(Cursor::new(b"hello world, and more".to_vec()), 11);
        let body = calc_digest(reader, 11, 1024, None).await.unwrap();
        assert_eq!(body.content_md5(), HELLO_MD5);
    }

    #[tokio::test]
    async fn test_spill_to_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = calc_digest(RequestBody::from("x"), 0, 1, Some(&missing))
            .await
            .unwrap_err();
        assert!(matches!(err, BodyError::Io(_)));
    }

    #[tokio::test]
    async fn test_direct_bytes_are_replayable() {
        let tracker = ProgressTracker::new(None, 3);
        let mut prepared = PreparedBody::Direct(Some(RequestBody::from("abc")));
        assert!(prepared.is_replayable());
        assert!(prepared.outgoing(&tracker).unwrap().is_some());
        assert!(prepared.outgoing(&tracker).unwrap().is_some());

        let mut one_shot = PreparedBody::Direct(Some(RequestBody::reader(Cursor::new(vec![1u8]))));
        assert!(!one_shot.is_replayable());
        assert!(one_shot.outgoing(&tracker).unwrap().is_some());
        assert!(one_shot.outgoing(&tracker).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_body_reports_progress() {
        let tracker = ProgressTracker::new(None, 11);
        let body = stream_body(Box::new(Cursor::new(b"hello world".to_vec())), tracker.clone());
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
        assert_eq!(tracker.consumed(), 11);
    }
}
