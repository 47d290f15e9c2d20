//! Batch and stream processing of files.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::stream::{Stream, StreamExt};

use crate::file::FileRef;
use crate::orchestrator::FileProcessor;
use crate::pool::{self, Pool};
use crate::retry::with_retry_if;
use crate::validate::validate;
use crate::{strategy, CancellationToken, ChunkDescriptor, Error, FileResult, Options};

/// Files to process.
#[derive(Debug, Clone)]
pub enum Input {
    File(FileRef),
    Files(Vec<FileRef>),
}

impl Input {
    fn into_files(self) -> Vec<FileRef> {
        match self {
            Input::File(file) => vec![file],
            Input::Files(files) => files,
        }
    }
}

impl From<FileRef> for Input {
    #[inline]
    fn from(file: FileRef) -> Self {
        Input::File(file)
    }
}

impl From<Vec<FileRef>> for Input {
    #[inline]
    fn from(files: Vec<FileRef>) -> Self {
        Input::Files(files)
    }
}

/// Callbacks of batch processing.
pub trait BatchHandler: Send {
    /// Called once a file is complete, `is_done` being only set for the last input file.
    fn on_file(&mut self, result: &FileResult, is_done: bool) {
        let _ = (result, is_done);
    }

    /// Called once after the last file, unless processing has been aborted.
    fn on_complete(&mut self, results: &[FileResult]) {
        let _ = results;
    }
}

impl BatchHandler for () {}

/// Callbacks of stream processing.
pub trait StreamHandler: Send {
    /// Called for each chunk as soon as it is available, `is_done` being set for the last chunk of a file.
    fn on_chunk(&mut self, file: &FileRef, chunk: &ChunkDescriptor, is_done: bool);
}

impl<F: FnMut(&FileRef, &ChunkDescriptor, bool) + Send> StreamHandler for F {
    #[inline]
    fn on_chunk(&mut self, file: &FileRef, chunk: &ChunkDescriptor, is_done: bool) {
        self(file, chunk, is_done)
    }
}

/// A processing session.
///
/// A session processes files one after the other, each file being chunked over its [`Pool`] workers. Every file of a
/// session shares the same [`CancellationToken`].
///
/// # Failures
/// Files failing validation are reported to the error callback and skipped. Any other failure aborts the session, after
/// exhausting retries when configured. Failures are reported to the error callback as they happen, except cancellations.
///
/// Only read, hash and worker failures are retried (see [`Error::is_retryable()`]): invalid files, cancellations and
/// workers that cannot be started at all (no Tokio runtime) fail right away.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use std::num::NonZeroUsize;
/// use chunker::file::{FileRef, MemoryFile};
/// use chunker::pool::Pool;
/// use chunker::{Options, Session};
///
/// let files: Vec<FileRef> = vec![
///     MemoryFile::new("a.txt", "hello").into_ref(),
///     MemoryFile::new("b.txt", "world!").into_ref(),
/// ];
///
/// let session = Session::with_pool(Pool::new(NonZeroUsize::MIN), Options::default().with_chunk_size(4));
/// let results = session.batch(files, &mut ()).await.unwrap();
///
/// assert_eq!(results[1].name, "b.txt");
/// assert_eq!(results[1].chunks.len(), 2);
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    pool: Pool,
    options: Options,
    token: CancellationToken,
}

impl Session {
    /// Create a session running on the process-wide pool.
    pub fn new(options: Options) -> Self {
        Self::with_pool(pool::global(), options)
    }

    /// Create a session running on `pool`.
    pub fn with_pool(pool: Pool, options: Options) -> Self {
        Self {
            pool,
            options,
            token: CancellationToken::new(),
        }
    }

    /// The cancellation token shared by all files of this session.
    #[inline]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[inline]
    fn processor(&self) -> FileProcessor<'_> {
        FileProcessor::new(&self.pool, &self.options, &self.token)
    }

    /// Process each input file in order, collecting all of their chunks.
    pub async fn batch(&self, input: impl Into<Input>, handler: &mut impl BatchHandler) -> Result<Vec<FileResult>, Error> {
        let files = input.into().into_files();
        let last = files.len().checked_sub(1);

        let mut results = Vec::with_capacity(files.len());

        for (i, file) in files.iter().enumerate() {
            if !self.admit(file)? {
                continue;
            }

            let processor = self.processor();
            let chunks = self.retrying(move || processor.process(file)).await?;

            let result = FileResult::new(&**file, chunks);
            handler.on_file(&result, Some(i) == last);
            results.push(result);
        }

        handler.on_complete(&results);

        Ok(results)
    }

    /// Process each input file in order, handing chunks out as soon as they are available.
    ///
    /// Chunks of a file come out in completion order of the worker tasks, ascending within a task.
    pub async fn stream(&self, input: impl Into<Input>, handler: &mut impl StreamHandler) -> Result<(), Error> {
        let files = input.into().into_files();
        let handler = Mutex::new(handler);
        let handler = &handler;

        for file in &files {
            if !self.admit(file)? {
                continue;
            }

            let processor = self.processor();
            let total = strategy::chunk_count(file.size(), processor.parameters(file.size()).chunk_size);

            self.retrying(move || {
                let mut processed = 0;

                processor.process_with(file, move |chunks| {
                    let mut guard = handler.lock().unwrap_or_else(PoisonError::into_inner);
                    let handler = &mut **guard;

                    for chunk in chunks {
                        processed += 1;
                        handler.on_chunk(file, chunk, processed == total);
                    }
                })
            })
            .await?;
        }

        Ok(())
    }

    /// Process every selection of files coming from `selections` in the background, in batch mode.
    ///
    /// Watching stops once `selections` is exhausted, or on the next selection after cancellation. A failing
    /// selection does not prevent next ones from being processed.
    ///
    /// # Panics
    /// This method panics if called outside of a Tokio runtime.
    pub fn watch_batch<S, H>(self, selections: S, mut handler: H) -> CancellationToken
    where
        S: Stream<Item = Vec<FileRef>> + Send + 'static,
        H: BatchHandler + 'static,
    {
        let token = self.token();

        tokio::spawn(async move {
            let mut selections = std::pin::pin!(selections);

            while let Some(files) = selections.next().await {
                if !self.keep_watching(self.batch(files, &mut handler).await.map(drop)) {
                    break;
                }
            }

            tracing::debug!("Stopped watching file selections.");
        });

        token
    }

    /// Process every selection of files coming from `selections` in the background, in stream mode.
    ///
    /// Watching stops the same way as [`Session::watch_batch()`].
    ///
    /// # Panics
    /// This method panics if called outside of a Tokio runtime.
    pub fn watch_stream<S, H>(self, selections: S, mut handler: H) -> CancellationToken
    where
        S: Stream<Item = Vec<FileRef>> + Send + 'static,
        H: StreamHandler + 'static,
    {
        let token = self.token();

        tokio::spawn(async move {
            let mut selections = std::pin::pin!(selections);

            while let Some(files) = selections.next().await {
                if !self.keep_watching(self.stream(files, &mut handler).await) {
                    break;
                }
            }

            tracing::debug!("Stopped watching file selections.");
        });

        token
    }

    fn keep_watching(&self, result: Result<(), Error>) -> bool {
        match result {
            Err(Error::Cancelled) => false,
            Err(err) => {
                tracing::debug!("Selection processing aborted: {err}");
                !self.token.is_cancelled()
            }
            Ok(()) => !self.token.is_cancelled(),
        }
    }

    /// Check cancellation and validation before processing `file`.
    ///
    /// Returns `false` when the file is invalid and must be skipped.
    fn admit(&self, file: &FileRef) -> Result<bool, Error> {
        if self.token.is_cancelled() {
            tracing::debug!("Cancelled before processing `{}`.", file.name());
            return Err(Error::Cancelled);
        }

        match validate(&**file, self.options.validation.as_ref()) {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::debug!("Skipping `{}`: {err}", file.name());
                self.options.report_error(&err);
                Ok(false)
            }
        }
    }

    async fn retrying<T, F, Fut>(&self, operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match self.options.retry {
            Some(ref config) => with_retry_if(operation, config, Error::is_retryable).await,
            None => {
                let mut operation = operation;
                operation().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::{BoxFuture, FutureExt};

    use super::*;
    use crate::file::MemoryFile;
    use crate::hash::digest_sync;
    use crate::pool::{ChunkRunner, Request, Response, Runner};
    use crate::retry::RetryConfig;
    use crate::validate::ValidationConfig;
    use crate::{ChunkBuilder, ErrorKind};

    fn pool() -> Pool {
        Pool::new(NonZeroUsize::new(2).unwrap())
    }

    fn files() -> Vec<FileRef> {
        vec![
            MemoryFile::new("a.txt", "aaaabbbbcc").with_mime_type("text/plain").into_ref(),
            MemoryFile::new("b.png", "bbbb").with_mime_type("image/png").into_ref(),
            MemoryFile::new("c.txt", "ccccccccc").with_mime_type("text/plain").into_ref(),
        ]
    }

    fn options() -> Options {
        Options::default().with_chunk_size(4).with_worker_count(2)
    }

    /// Records batch callbacks, optionally cancelling `token` after the first file.
    #[derive(Default)]
    struct Recorder {
        files: Vec<(String, bool)>,
        completed: Vec<usize>,
        token: Option<CancellationToken>,
    }

    impl BatchHandler for Recorder {
        fn on_file(&mut self, result: &FileResult, is_done: bool) {
            self.files.push((result.name.clone(), is_done));

            if let Some(ref token) = self.token {
                token.cancel();
            }
        }

        fn on_complete(&mut self, results: &[FileResult]) {
            self.completed.push(results.len());
        }
    }

    /// A runner failing its very first request, then building chunks as usual.
    #[derive(Default)]
    struct FlakyRunner {
        failed: AtomicBool,
        inner: ChunkRunner,
    }

    impl Runner for FlakyRunner {
        fn run(&self, request: Request) -> BoxFuture<'static, Response> {
            if self.failed.swap(true, Ordering::SeqCst) {
                self.inner.run(request)
            } else {
                futures::future::ready(Response::Failure(Error::worker("flaky"))).boxed()
            }
        }
    }

    fn error_kinds(options: Options) -> (Options, Arc<Mutex<Vec<ErrorKind>>>) {
        let kinds = Arc::new(Mutex::new(vec![]));
        let options = options.with_error_handler({
            let kinds = Arc::clone(&kinds);
            move |err| kinds.lock().unwrap().push(err.kind())
        });

        (options, kinds)
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_batch() {
        let session = Session::with_pool(pool(), options());
        let mut recorder = Recorder::default();

        let results = session.batch(files(), &mut recorder).await.unwrap();

        assert_eq!(results.iter().map(|result| result.name.as_str()).collect::<Vec<_>>(), ["a.txt", "b.png", "c.txt"]);
        assert_eq!(results[0].chunks.len(), 3);
        assert_eq!(results[0].chunks[1].hash, digest_sync(b"bbbb"));
        assert_eq!(results[1].mime_type, "image/png");
        assert_eq!(results[2].size, 9);

        assert_eq!(
            recorder.files,
            [("a.txt".to_owned(), false), ("b.png".to_owned(), false), ("c.txt".to_owned(), true)]
        );
        assert_eq!(recorder.completed, [3]);
    }

    #[tokio::test]
    async fn test_batch_single_file() {
        let session = Session::with_pool(pool(), options());
        let file = MemoryFile::new("single.bin", "0123456789").into_ref();

        let results = session.batch(file, &mut ()).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunks.last().map(|chunk| chunk.end), Some(10));
    }

    #[tokio::test]
    async fn test_invalid_file_skipped() {
        let (options, kinds) = error_kinds(options().with_validation(ValidationConfig::default().with_blocked_types(["image/*"])));
        let session = Session::with_pool(pool(), options);
        let mut recorder = Recorder::default();

        let results = session.batch(files(), &mut recorder).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(recorder.files.len(), 2);
        assert_eq!(recorder.completed, [2]);
        assert_eq!(*kinds.lock().unwrap(), [ErrorKind::InvalidFile]);
    }

    #[tokio::test]
    async fn test_batch_cancelled() {
        let (options, kinds) = error_kinds(options());
        let session = Session::with_pool(pool(), options);
        let mut recorder = Recorder {
            token: Some(session.token()),
            ..Default::default()
        };

        let err = session.batch(files(), &mut recorder).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(recorder.files.len(), 1);
        assert!(recorder.completed.is_empty());
        assert!(kinds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_retry() {
        let retry = RetryConfig::default().with_initial_delay(Duration::from_millis(1));
        let (options, kinds) = error_kinds(options().with_retry(retry));
        let session = Session::with_pool(Pool::with_runner(NonZeroUsize::MIN, FlakyRunner::default()), options);

        let results = session.batch(files(), &mut ()).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunks.len(), 3);
        assert_eq!(*kinds.lock().unwrap(), [ErrorKind::Worker]);
        assert!(logs_contain("retrying"));
    }

    #[tokio::test]
    async fn test_failure_without_retry() {
        let (options, kinds) = error_kinds(options());
        let session = Session::with_pool(Pool::with_runner(NonZeroUsize::MIN, FlakyRunner::default()), options);
        let mut recorder = Recorder::default();

        let err = session.batch(files(), &mut recorder).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Worker);
        assert_eq!(err.file(), Some("a.txt"));
        assert_eq!(err.chunk_index(), Some(0));
        assert!(recorder.files.is_empty());
        assert_eq!(*kinds.lock().unwrap(), [ErrorKind::Worker]);
    }

    #[tokio::test]
    async fn test_stream() {
        let session = Session::with_pool(pool(), options());
        let mut received = vec![];

        session
            .stream(files(), &mut |file: &FileRef, chunk: &ChunkDescriptor, is_done: bool| {
                received.push((file.name().to_owned(), chunk.index, is_done))
            })
            .await
            .unwrap();

        assert_eq!(received.len(), 3 + 1 + 3);

        for name in ["a.txt", "b.png", "c.txt"] {
            let done = received.iter().filter(|(file, _, is_done)| file == name && *is_done).count();
            assert_eq!(done, 1, "{name}");
        }

        // files are processed one after the other
        let names: Vec<_> = received.iter().map(|(file, ..)| file.as_str()).collect();
        assert!(names.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(received.iter().filter(|(.., is_done)| *is_done).all(|(file, index, _)| {
            received.iter().rev().find(|(other, ..)| other == file).map(|(_, last, _)| last) == Some(index)
        }));
    }

    #[tokio::test]
    async fn test_stream_cancelled() {
        let session = Session::with_pool(pool(), options());
        session.token().cancel();
        let mut received = 0;

        let err = session.stream(files(), &mut |_: &FileRef, _: &ChunkDescriptor, _: bool| received += 1).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(received, 0);
    }

    #[tokio::test]
    async fn test_shared_builder() {
        let builder = Arc::new(ChunkBuilder::new());
        let session = Session::with_pool(Pool::with_builder(NonZeroUsize::MIN, Arc::clone(&builder)), options());

        let first = session.batch(files(), &mut ()).await.unwrap();
        assert!(builder.size() > 0);

        builder.clear();
        assert_eq!(builder.size(), 0);

        let second = session.batch(files(), &mut ()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_watch_batch() {
        let (sender, receiver) = futures::channel::mpsc::unbounded();
        let (done_sender, mut done) = tokio::sync::mpsc::unbounded_channel();

        struct Forward(tokio::sync::mpsc::UnboundedSender<Vec<String>>);

        impl BatchHandler for Forward {
            fn on_complete(&mut self, results: &[FileResult]) {
                let _ = self.0.send(results.iter().map(|result| result.name.clone()).collect());
            }
        }

        let token = Session::with_pool(pool(), options()).watch_batch(receiver, Forward(done_sender));

        sender.unbounded_send(files()).unwrap();
        assert_eq!(done.recv().await.unwrap(), ["a.txt", "b.png", "c.txt"]);

        sender.unbounded_send(files()[1..].to_vec()).unwrap();
        assert_eq!(done.recv().await.unwrap(), ["b.png", "c.txt"]);

        token.cancel();
        sender.unbounded_send(files()).unwrap();

        // the watcher stops, dropping its handler
        assert_eq!(done.recv().await, None);
    }

    #[tokio::test]
    async fn test_watch_stream_ends_with_selections() {
        let (sender, receiver) = futures::channel::mpsc::unbounded();
        let (chunk_sender, mut chunks) = tokio::sync::mpsc::unbounded_channel();

        let _ = Session::with_pool(pool(), options()).watch_stream(
            receiver,
            move |file: &FileRef, chunk: &ChunkDescriptor, _: bool| {
                let _ = chunk_sender.send((file.name().to_owned(), chunk.index));
            },
        );

        sender.unbounded_send(files()[1..2].to_vec()).unwrap();
        drop(sender);

        assert_eq!(chunks.recv().await, Some(("b.png".to_owned(), 0)));
        assert_eq!(chunks.recv().await, None);
    }

    #[test]
    fn test_worker_load_not_retried() {
        let retry = RetryConfig::default().with_initial_delay(Duration::from_secs(3_600));
        let (options, kinds) = error_kinds(options().with_retry(retry));
        let session = Session::with_pool(pool(), options);

        // no runtime, so no worker can ever be started
        let err = futures::executor::block_on(session.batch(files(), &mut ())).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WorkerLoad);
        assert_eq!(*kinds.lock().unwrap(), [ErrorKind::WorkerLoad]);
        assert_eq!(session.pool().worker_count(), 0);
    }

    /// The only test relying on the process-wide pool, as it resets it.
    #[test]
    fn test_global_pool() {
        let runtime = || tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        for _ in 0..2 {
            runtime().block_on(async {
                let results = Session::new(options()).batch(files(), &mut ()).await.unwrap();

                assert_eq!(results.len(), 3);
                assert_eq!(results[2].chunks.len(), 3);
            });
        }

        let global = pool::global();
        assert!(Session::new(options()).pool().ptr_eq(&global));
        assert_eq!(global.max_workers(), strategy::default_parallelism());

        runtime().block_on(async {
            let file: FileRef = MemoryFile::new("queued.bin", "0123456789").into_ref();
            let request = |index| Request {
                file: Arc::clone(&file),
                chunk_size: 4,
                start_index: index,
                end_index: index + 1,
            };

            // tasks are assigned as soon as submitted, nothing runs before the first await
            let running: Vec<_> = (0..global.max_workers().get() as u64)
                .map(|index| global.submit(request(index % 3), None))
                .collect();
            let queued = global.submit(request(0), None);

            assert_eq!(global.idle_worker_count(), 0);
            assert_eq!(global.queue_len(), 1);

            pool::reset_global();

            assert_eq!(global.worker_count(), 0);
            assert_eq!(global.queue_len(), 0);
            assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::Worker);
            drop(running);
        });

        assert!(!pool::global().ptr_eq(&global));
    }
}
