use std::collections::{HashMap, VecDeque};
use std::io;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::ChunkDescriptor;
use crate::file::FileLike;
use crate::{hash, Error};

/// Maximum number of digests kept by a [`ChunkBuilder`].
pub const MEMO_CAPACITY: usize = 100;

/// Maximum number of content bytes kept by a [`ChunkBuilder`] as digest keys.
///
/// Chunks larger than this are never memoized.
pub const MEMO_BYTE_BUDGET: usize = 64 * 1_024 * 1_024;

/// Digests memoized by content, evicted in insertion order.
///
/// Keys are private copies of chunk contents, so that the memo never keeps whole file buffers alive.
#[derive(Debug, Default)]
struct Memo {
    digests: HashMap<Bytes, String>,
    order: VecDeque<Bytes>,
    bytes: usize,
}

impl Memo {
    fn insert(&mut self, content: &[u8], digest: String) {
        if content.len() > MEMO_BYTE_BUDGET {
            return;
        }

        let content = Bytes::copy_from_slice(content);

        if self.digests.insert(content.clone(), digest).is_none() {
            self.bytes += content.len();
            self.order.push_back(content);
        }

        while self.digests.len() > MEMO_CAPACITY || self.bytes > MEMO_BYTE_BUDGET {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.digests.remove(&oldest);
                    self.bytes -= oldest.len();
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.digests.clear();
        self.order.clear();
        self.bytes = 0;
    }
}

/// Chunk descriptors builder.
///
/// Reads chunk bytes from files and digests them, remembering the latest digests by content so that identical
/// chunks (within a file or across files) are only hashed once.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    memo: Mutex<Memo>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the descriptor of chunk `index` of `file`, split by `chunk_size` bytes.
    pub async fn build(&self, file: &dyn FileLike, index: u64, chunk_size: u64) -> Result<ChunkDescriptor, Error> {
        let start = index.saturating_mul(chunk_size);
        let end = start.saturating_add(chunk_size).min(file.size());

        let read_error = |source| Error::FileRead {
            file: file.name().to_owned(),
            chunk_index: index,
            source,
        };

        if start > end || (start == end && file.size() > 0) {
            return Err(read_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk index out of range for {} bytes", file.size()),
            )));
        }

        let content = file.read(start..end).await.map_err(read_error)?;

        if content.len() as u64 != end - start {
            return Err(read_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {} bytes out of {}", content.len(), end - start),
            )));
        }

        let cached = self.memo().digests.get(&content).cloned();

        let hash = match cached {
            Some(hash) => {
                tracing::trace!("Reusing digest of chunk #{index} of `{}`", file.name());
                hash
            }
            None => {
                let hash = hash::digest(content.clone()).await.map_err(|err| match err {
                    Error::Hash { message, .. } => Error::Hash {
                        file: Some(file.name().to_owned()),
                        chunk_index: Some(index),
                        message,
                    },
                    err => err,
                })?;

                self.memo().insert(&content, hash.clone());

                hash
            }
        };

        Ok(ChunkDescriptor { start, end, index, hash })
    }

    /// Build descriptors of contiguous chunks within `indices`, ordered by ascending index.
    pub async fn build_range(
        &self,
        file: &dyn FileLike,
        indices: Range<u64>,
        chunk_size: u64,
    ) -> Result<Vec<ChunkDescriptor>, Error> {
        let mut chunks = Vec::with_capacity(indices.end.saturating_sub(indices.start) as usize);

        for index in indices {
            chunks.push(self.build(file, index, chunk_size).await?);
        }

        Ok(chunks)
    }

    /// Drop every memoized digest.
    pub fn clear(&self) {
        self.memo().clear();
    }

    /// Number of memoized digests.
    pub fn size(&self) -> usize {
        self.memo().digests.len()
    }

    #[inline]
    fn memo(&self) -> MutexGuard<'_, Memo> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use futures::future::{BoxFuture, FutureExt};

    use super::*;
    use crate::file::MemoryFile;
    use crate::hash::digest_sync;

    #[tokio::test]
    async fn test_build_bounds() {
        let builder = ChunkBuilder::new();
        let file = MemoryFile::new("a.bin", b"abcdefghij".to_vec());

        let chunk = builder.build(&file, 0, 4).await.unwrap();
        assert_eq!((chunk.start, chunk.end, chunk.index), (0, 4, 0));
        assert_eq!(chunk.hash, digest_sync(b"abcd"));

        let chunk = builder.build(&file, 2, 4).await.unwrap();
        assert_eq!((chunk.start, chunk.end, chunk.index), (8, 10, 2));
        assert_eq!(chunk.hash, digest_sync(b"ij"));

        let err = builder.build(&file, 3, 4).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FileRead);
        assert_eq!(err.chunk_index(), Some(3));
    }

    #[tokio::test]
    async fn test_build_range() {
        let builder = ChunkBuilder::new();
        let file = MemoryFile::new("a.bin", b"abcdefghij".to_vec());

        let chunks = builder.build_range(&file, 1..3, 3).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(chunks[0].hash, digest_sync(b"def"));
        assert_eq!(chunks[1].hash, digest_sync(b"ghi"));
    }

    #[tokio::test]
    async fn test_memo_is_keyed_by_content() {
        let builder = ChunkBuilder::new();
        let a = MemoryFile::new("a.bin", b"xyzxyzxy".to_vec());
        let b = MemoryFile::new("b.bin", b"xyz".to_vec());

        let chunks = builder.build_range(&a, 0..3, 3).await.unwrap();
        assert_eq!(chunks[0].hash, chunks[1].hash);
        assert_eq!(builder.size(), 2);

        let other = builder.build(&b, 0, 3).await.unwrap();
        assert_eq!(other.hash, chunks[0].hash);
        assert_eq!(builder.size(), 2);

        builder.clear();
        assert_eq!(builder.size(), 0);
        assert_eq!(builder.build(&b, 0, 3).await.unwrap(), other);
    }

    #[tokio::test]
    async fn test_memo_eviction() {
        let builder = ChunkBuilder::new();
        let data: Vec<u8> = (0..=MEMO_CAPACITY as u8 + 10).collect();
        let file = MemoryFile::new("a.bin", data);

        builder.build_range(&file, 0..file.size(), 1).await.unwrap();
        assert_eq!(builder.size(), MEMO_CAPACITY);

        let memo = builder.memo();
        assert!(!memo.digests.contains_key(&[0u8][..]));
        assert!(memo.digests.contains_key(&[MEMO_CAPACITY as u8 + 10][..]));
        assert_eq!(memo.order.len(), MEMO_CAPACITY);
    }

    #[derive(Debug)]
    struct ShortFile;

    impl FileLike for ShortFile {
        fn name(&self) -> &str {
            "short.bin"
        }

        fn mime_type(&self) -> &str {
            crate::file::DEFAULT_MIME_TYPE
        }

        fn size(&self) -> u64 {
            8
        }

        fn last_modified(&self) -> u64 {
            0
        }

        fn read(&self, _: Range<u64>) -> BoxFuture<'_, io::Result<Bytes>> {
            futures::future::ok(Bytes::from_static(b"ab")).boxed()
        }
    }

    #[tokio::test]
    async fn test_short_read() {
        let err = ChunkBuilder::new().build(&ShortFile, 0, 4).await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::FileRead);
        assert_eq!(err.file(), Some("short.bin"));
    }

    #[test]
    fn test_memo_keys_are_copies() {
        let data = Bytes::from(vec![7u8; 64]);
        let mut memo = Memo::default();

        memo.insert(&data.slice(0..8), "digest".to_owned());

        let key = memo.order.front().unwrap();
        assert_eq!(key.len(), 8);
        assert_ne!(key.as_ptr(), data.as_ptr());
        assert_eq!(memo.bytes, 8);
    }

    #[test]
    fn test_memo_byte_budget() {
        let mut memo = Memo::default();

        memo.insert(&vec![0u8; MEMO_BYTE_BUDGET + 1], "too large".to_owned());
        assert!(memo.digests.is_empty());
        assert_eq!(memo.bytes, 0);

        memo.insert(&vec![1u8; MEMO_BYTE_BUDGET / 2 + 1], "first".to_owned());
        memo.insert(&vec![2u8; MEMO_BYTE_BUDGET / 2 + 1], "second".to_owned());

        assert_eq!(memo.digests.values().collect::<Vec<_>>(), ["second"]);
        assert_eq!(memo.bytes, MEMO_BYTE_BUDGET / 2 + 1);

        memo.clear();
        assert_eq!(memo.bytes, 0);
    }
}
