use std::fmt;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::Arc;

use crate::retry::RetryConfig;
use crate::validate::ValidationConfig;
use crate::{Error, ProgressSnapshot};

/// Progress callback, called several times per file.
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;
/// Error callback, informational only: failures are returned anyway.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Processing options.
///
/// ```
/// use chunker::strategy::MIB;
/// use chunker::Options;
///
/// let options = Options::default()
///     .with_chunk_size(2 * MIB)
///     .with_worker_count(3)
///     .with_error_handler(|err| eprintln!("{} ({})", err, err.kind()));
///
/// assert_eq!(options.chunk_size.unwrap().get(), 2 * MIB);
/// assert!(options.adaptive_chunk_size);
/// ```
#[derive(Clone)]
pub struct Options {
    /// Explicit chunk size, taking precedence over adaptive sizing.
    pub chunk_size: Option<NonZeroU64>,
    /// Explicit worker count, also capping adaptive sizing.
    pub worker_count: Option<NonZeroUsize>,
    /// Whether to choose chunk size and worker count from file size when no chunk size is given.
    pub adaptive_chunk_size: bool,
    pub on_progress: Option<ProgressCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Retry files processing on failure.
    pub retry: Option<RetryConfig>,
    /// Validate files before processing them.
    pub validation: Option<ValidationConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: None,
            worker_count: None,
            adaptive_chunk_size: true,
            on_progress: None,
            on_error: None,
            retry: None,
            validation: None,
        }
    }
}

impl Options {
    /// Set an explicit chunk size, `0` meaning no explicit chunk size.
    #[inline]
    pub fn with_chunk_size(self, chunk_size: u64) -> Self {
        Self {
            chunk_size: NonZeroU64::new(chunk_size),
            ..self
        }
    }

    /// Set an explicit worker count, `0` meaning no explicit worker count.
    #[inline]
    pub fn with_worker_count(self, worker_count: usize) -> Self {
        Self {
            worker_count: NonZeroUsize::new(worker_count),
            ..self
        }
    }

    #[inline]
    pub fn with_adaptive_chunk_size(self, adaptive_chunk_size: bool) -> Self {
        Self {
            adaptive_chunk_size,
            ..self
        }
    }

    #[inline]
    pub fn with_progress_handler(self, on_progress: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) -> Self {
        Self {
            on_progress: Some(Arc::new(on_progress)),
            ..self
        }
    }

    #[inline]
    pub fn with_error_handler(self, on_error: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        Self {
            on_error: Some(Arc::new(on_error)),
            ..self
        }
    }

    #[inline]
    pub fn with_retry(self, retry: RetryConfig) -> Self {
        Self {
            retry: Some(retry),
            ..self
        }
    }

    #[inline]
    pub fn with_validation(self, validation: ValidationConfig) -> Self {
        Self {
            validation: Some(validation),
            ..self
        }
    }

    pub(crate) fn report_progress(&self, progress: &ProgressSnapshot) {
        tracing::trace!(
            "Processed {}/{} bytes of `{}` ({}%)",
            progress.loaded_bytes,
            progress.total_bytes,
            progress.file.name(),
            progress.percentage
        );

        if let Some(ref on_progress) = self.on_progress {
            on_progress(progress);
        }
    }

    pub(crate) fn report_error(&self, err: &Error) {
        tracing::debug!("Reporting {} failure: {err}", err.kind());

        if let Some(ref on_error) = self.on_error {
            on_error(err);
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("chunk_size", &self.chunk_size)
            .field("worker_count", &self.worker_count)
            .field("adaptive_chunk_size", &self.adaptive_chunk_size)
            .field("on_progress", &self.on_progress.as_ref().map(|_| ".."))
            .field("on_error", &self.on_error.as_ref().map(|_| ".."))
            .field("retry", &self.retry)
            .field("validation", &self.validation)
            .finish()
    }
}
