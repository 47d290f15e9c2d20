//! File sources chunks are read from.

use std::fmt;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use tokio::fs;

/// MIME type used when none is known.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A shared handle on a file, handed out to execution units without copying its content.
pub type FileRef = Arc<dyn FileLike>;

/// File-like interface.
///
/// Exposes the metadata needed to validate and describe a file, together with random access reads of byte ranges.
pub trait FileLike: fmt::Debug + Send + Sync {
    /// File name.
    fn name(&self) -> &str;

    /// File MIME type, e.g. `image/png`.
    fn mime_type(&self) -> &str;

    /// File size in bytes.
    fn size(&self) -> u64;

    /// Last modification time, in milliseconds since UNIX epoch.
    fn last_modified(&self) -> u64;

    /// Read bytes within `range`.
    ///
    /// The whole range must be returned, a short read being considered as an error by callers.
    fn read(&self, range: Range<u64>) -> BoxFuture<'_, io::Result<Bytes>>;
}

/// A file held in memory.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    mime_type: String,
    last_modified: u64,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: DEFAULT_MIME_TYPE.to_owned(),
            last_modified: 0,
            data: data.into(),
        }
    }

    #[inline]
    pub fn with_mime_type(self, mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            ..self
        }
    }

    #[inline]
    pub fn with_last_modified(self, last_modified: u64) -> Self {
        Self { last_modified, ..self }
    }

    /// Wrap this file into a shareable [`FileRef`].
    #[inline]
    pub fn into_ref(self) -> FileRef {
        Arc::new(self)
    }
}

impl FileLike for MemoryFile {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    #[inline]
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    fn last_modified(&self) -> u64 {
        self.last_modified
    }

    fn read(&self, range: Range<u64>) -> BoxFuture<'_, io::Result<Bytes>> {
        let result = if range.start <= range.end && range.end <= self.size() {
            Ok(self.data.slice(range.start as usize..range.end as usize))
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {range:?} out of bounds for {} bytes", self.size()),
            ))
        };

        futures::future::ready(result).boxed()
    }
}

/// A file stored on the local file system.
///
/// Metadata is captured once when opening, then every read opens its own handle so that concurrent reads never
/// share a cursor.
#[derive(Debug, Clone)]
pub struct DiskFile {
    path: PathBuf,
    name: String,
    mime_type: String,
    size: u64,
    last_modified: u64,
}

impl DiskFile {
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path).await?;

        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("not a file: `{}`", path.display())));
        }

        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_millis() as u64);

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            mime_type: DEFAULT_MIME_TYPE.to_owned(),
            size: metadata.len(),
            last_modified,
            path,
        })
    }

    #[inline]
    pub fn with_mime_type(self, mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            ..self
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    #[inline]
    pub fn into_ref(self) -> FileRef {
        Arc::new(self)
    }
}

impl FileLike for DiskFile {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    fn last_modified(&self) -> u64 {
        self.last_modified
    }

    fn read(&self, range: Range<u64>) -> BoxFuture<'_, io::Result<Bytes>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        async move {
            if range.start > range.end || range.end > self.size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("range {range:?} out of bounds for {} bytes", self.size),
                ));
            }

            let mut file = fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(range.start)).await?;

            let mut buf = BytesMut::zeroed((range.end - range.start) as usize);
            file.read_exact(&mut buf).await?;

            Ok(buf.freeze())
        }
        .boxed()
    }
}
