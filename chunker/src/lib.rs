//! A simple crate splitting files into hashed chunks.
//!
//! A generic, robust and efficient crate providing features dedicated to:
//! - splitting files into fixed-size chunks, each one being described by its byte range and its SHA-256 hex digest,
//! - choosing chunk size and worker count adaptively from file size,
//! - building chunks in parallel over a reusable pool of background workers,
//! - processing files in batch (all chunks of a file at once) or in stream (chunks as soon as available) modes,
//! - validating, cancelling and retrying files processing.
//!
//! Files are seen through the [`FileLike`](file::FileLike) trait, either in-memory or on-disk. A file of `size` bytes split
//! by `chunk_size` bytes is made of `ceil(size / chunk_size)` chunks, indexed from `0`, contiguous and covering the whole
//! file. Chunk index ranges are spread over pool workers, and chunks are gathered back by index whatever the order
//! workers complete in:
//!
//! ```text
//!     file (12 MiB, 5 MiB chunks)
//!       L chunk #0 [0 MiB, 5 MiB)   -> worker A
//!       L chunk #1 [5 MiB, 10 MiB)  -> worker B
//!       L chunk #2 [10 MiB, 12 MiB) -> worker C
//! ```
//!
//! Digests are memoized by chunk content, so that identical chunks are only hashed once as long as they stay among
//! the latest [`MEMO_CAPACITY`] digests.
//!
//! Failures are typed by [`ErrorKind`]. Files failing validation are skipped, cancellations always take precedence over
//! any other outcome, and other failures abort processing once retries, if any, are exhausted.

mod error;
pub use error::*;

mod chunk;
pub use chunk::*;

mod cancel;
pub use cancel::*;

mod options;
pub use options::*;

mod session;
pub use session::*;

pub mod file;
pub mod hash;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod validate;
