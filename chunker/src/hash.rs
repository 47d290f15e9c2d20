//! Content digests of chunks.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::Error;

/// Length of a hex encoded digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 digest of `bytes` in the background.
///
/// Hashing is offloaded to the blocking thread pool so that large chunks do not stall other tasks.
///
/// ```
/// # tokio_test::block_on(async {
/// let hash = chunker::hash::digest("hello world".into()).await.unwrap();
///
/// assert_eq!(hash, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
/// # })
/// ```
pub async fn digest(bytes: Bytes) -> Result<String, Error> {
    tokio::task::spawn_blocking(move || digest_sync(&bytes))
        .await
        .map_err(|err| Error::Hash {
            file: None,
            chunk_index: None,
            message: err.to_string(),
        })
}

/// Compute the lowercase hex SHA-256 digest of `bytes` on the current thread.
#[inline]
pub fn digest_sync(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
