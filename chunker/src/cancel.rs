use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation flag.
///
/// Clones share the same flag, so cancelling through any clone is seen by all of them, from any thread. Once
/// cancelled, a token is never reset.
///
/// Cancellation is only checked at well defined points (before a file starts, before a queued task is assigned,
/// when a task result comes back), work already handed to a worker keeps running and its result is dropped.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!("Cancellation requested.");
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled() && clone.is_cancelled());
    }

    #[test]
    fn test_cancel_across_threads() {
        let token = CancellationToken::new();

        let handle = std::thread::spawn({
            let token = token.clone();
            move || token.cancel()
        });
        handle.join().unwrap();

        assert!(token.is_cancelled());
    }
}
