//! This module provides the execution pool building chunks in the background.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, Future, FutureExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::file::FileRef;
use crate::{strategy, CancellationToken, ChunkBuilder, ChunkDescriptor, Error};

static GLOBAL: Mutex<Option<Pool>> = Mutex::new(None);
static WORKER_ID: AtomicUsize = AtomicUsize::new(0);

/// Task request sent to a worker: build chunks `start_index..end_index` of `file`.
#[derive(Debug, Clone)]
pub struct Request {
    pub file: FileRef,
    pub chunk_size: u64,
    pub start_index: u64,
    pub end_index: u64,
}

/// Task response sent back by a worker.
#[derive(Debug)]
pub enum Response {
    /// Chunks of the requested range, ordered by ascending index.
    Success(Vec<ChunkDescriptor>),
    /// The task failed.
    Failure(Error),
    /// Legacy response shape, made of chunks only, considered as a success.
    Bare(Vec<ChunkDescriptor>),
}

impl Response {
    pub fn into_result(self) -> Result<Vec<ChunkDescriptor>, Error> {
        match self {
            Response::Success(chunks) => Ok(chunks),
            Response::Bare(chunks) => {
                tracing::trace!("Accepting legacy bare response of {} chunks.", chunks.len());
                Ok(chunks)
            }
            Response::Failure(err) => Err(err),
        }
    }
}

/// Work actually done by workers for each request.
pub trait Runner: Send + Sync + 'static {
    fn run(&self, request: Request) -> BoxFuture<'static, Response>;
}

/// Default runner, building chunk descriptors with a shared [`ChunkBuilder`].
#[derive(Debug, Clone, Default)]
pub struct ChunkRunner {
    builder: Arc<ChunkBuilder>,
}

impl ChunkRunner {
    #[inline]
    pub fn new(builder: Arc<ChunkBuilder>) -> Self {
        Self { builder }
    }

    #[inline]
    pub fn builder(&self) -> &Arc<ChunkBuilder> {
        &self.builder
    }
}

impl Runner for ChunkRunner {
    fn run(&self, request: Request) -> BoxFuture<'static, Response> {
        let builder = Arc::clone(&self.builder);

        async move {
            let Request {
                file,
                chunk_size,
                start_index,
                end_index,
            } = request;

            match builder.build_range(&*file, start_index..end_index, chunk_size).await {
                Ok(chunks) => Response::Success(chunks),
                Err(err) => Response::Failure(err),
            }
        }
        .boxed()
    }
}

/// A task waiting for a worker, or running on it.
struct Task {
    request: Request,
    cancel: Option<CancellationToken>,
    reply: oneshot::Sender<Result<Vec<ChunkDescriptor>, Error>>,
}

/// Message actually sent to a worker.
struct Envelope {
    request: Request,
    reply: oneshot::Sender<Response>,
}

#[derive(Default)]
struct State {
    /// Workers, either idle or busy.
    workers: Vec<Worker>,
    /// Tasks waiting for an idle worker, in submission order.
    queue: VecDeque<Task>,
}

struct Shared {
    max_workers: NonZeroUsize,
    runner: Arc<dyn Runner>,
    state: Mutex<State>,
}

/// A pool of reusable workers building chunk ranges in the background.
///
/// # Scheduling
/// Workers are only started on the first submitted task. A submitted task is assigned to any idle worker, or queued
/// when every worker is busy. Whenever a worker completes a task, the oldest queued task is assigned to it right away.
///
/// # Failures
/// Task failures are sent back as is. When a worker dies while running a task, this task fails with a worker error
/// and the dead worker is replaced on demand. Tasks are never retried by the pool.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use std::num::NonZeroUsize;
/// use chunker::file::MemoryFile;
/// use chunker::pool::{Pool, Request};
///
/// let pool = Pool::new(NonZeroUsize::MIN);
/// let file = MemoryFile::new("hello.txt", "hello world").into_ref();
///
/// let chunks = pool
///     .submit(Request { file, chunk_size: 5, start_index: 0, end_index: 3 }, None)
///     .await
///     .unwrap();
///
/// assert_eq!(chunks.len(), 3);
/// assert_eq!(chunks[2].end, 11);
/// # })
/// ```
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Create a pool of up to `max_workers` workers building chunks with their own [`ChunkBuilder`].
    pub fn new(max_workers: NonZeroUsize) -> Self {
        Self::with_runner(max_workers, ChunkRunner::default())
    }

    /// Create a pool of up to `max_workers` workers sharing `builder`.
    pub fn with_builder(max_workers: NonZeroUsize, builder: Arc<ChunkBuilder>) -> Self {
        Self::with_runner(max_workers, ChunkRunner::new(builder))
    }

    /// Create a pool of up to `max_workers` workers running requests with `runner`.
    pub fn with_runner(max_workers: NonZeroUsize, runner: impl Runner) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_workers,
                runner: Arc::new(runner),
                state: Default::default(),
            }),
        }
    }

    #[inline]
    pub fn max_workers(&self) -> NonZeroUsize {
        self.shared.max_workers
    }

    /// Whether both handles refer to the same pool.
    #[inline]
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Submit a task and return a handle on its result.
    ///
    /// The task is scheduled right away, before the returned future is polled. If `cancel` is cancelled by the time the
    /// task gets a worker, it fails with [`Error::Cancelled`] without running.
    ///
    /// **Dropping the returned future does not cancel the task**, its result is just discarded.
    pub fn submit(
        &self,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> impl Future<Output = Result<Vec<ChunkDescriptor>, Error>> + Send + 'static {
        let (reply, receiver) = oneshot::channel();

        self.shared.schedule(Task { request, cancel, reply });

        receiver.map(|result| result.unwrap_or_else(|_| Err(Error::worker("task discarded by a terminated pool"))))
    }

    /// Number of workers currently started.
    pub fn worker_count(&self) -> usize {
        self.shared.state().workers.len()
    }

    /// Number of tasks waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.shared.state().queue.len()
    }

    /// Number of started workers waiting for a task.
    pub fn idle_worker_count(&self) -> usize {
        self.shared.state().workers.iter().filter(|worker| !worker.busy).count()
    }

    /// Terminate every worker and discard queued tasks.
    ///
    /// Running and queued tasks fail with a worker error. The pool can still be used afterwards, starting new workers.
    pub fn terminate_all(&self) {
        let (workers, queue) = {
            let mut state = self.shared.state();
            (std::mem::take(&mut state.workers), std::mem::take(&mut state.queue))
        };

        tracing::debug!("Terminating {} workers, discarding {} queued tasks...", workers.len(), queue.len());

        for worker in workers {
            worker.handle.abort();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();

        f.debug_struct("Pool")
            .field("max_workers", &self.shared.max_workers)
            .field("workers", &state.workers.len())
            .field("idle", &state.workers.iter().filter(|worker| !worker.busy).count())
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Shared {
    #[inline]
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start missing workers, up to `max_workers`.
    ///
    /// Workers that are not running anymore (e.g. their runtime has been shut down) are dropped beforehand so that
    /// they get replaced.
    fn start_workers(&self, state: &mut State) -> Result<(), Error> {
        state.workers.retain(|worker| {
            let running = worker.is_running();

            if !running {
                tracing::debug!("Dropping stopped worker {}.", worker.id);
            }

            running
        });

        while state.workers.len() < self.max_workers.get() {
            let id = WORKER_ID.fetch_add(1, Ordering::Relaxed);

            state.workers.push(Worker::start(id, Arc::clone(&self.runner))?);
        }

        Ok(())
    }

    /// Mark an idle worker as busy, returning what is needed to dispatch a task to it.
    fn acquire(state: &mut State) -> Option<Assignment> {
        state
            .workers
            .iter_mut()
            .find(|worker| !worker.busy && worker.is_running())
            .map(|worker| {
                worker.busy = true;

                Assignment {
                    id: worker.id,
                    sender: worker.sender.clone(),
                    runtime: worker.runtime.clone(),
                }
            })
    }

    fn schedule(self: &Arc<Self>, task: Task) {
        let mut state = self.state();

        if let Err(err) = self.start_workers(&mut state) {
            tracing::warn!("Cannot start workers: {err}");

            if state.workers.is_empty() {
                drop(state);
                let _ = task.reply.send(Err(err));
                return;
            }
        }

        match Self::acquire(&mut state) {
            Some(assignment) => {
                drop(state);
                self.dispatch(assignment, task);
            }
            None => {
                tracing::trace!("All workers busy, queueing task ({} already queued).", state.queue.len());
                state.queue.push_back(task);
            }
        }
    }

    /// Run `task` on its assigned worker, then keep on running queued tasks until the queue is exhausted.
    ///
    /// The dispatch loop runs on the caller's runtime, falling back to the worker's own one.
    fn dispatch(self: &Arc<Self>, assignment: Assignment, task: Task) {
        let shared = Arc::clone(self);
        let runtime = Handle::try_current().unwrap_or_else(|_| assignment.runtime.clone());

        runtime.spawn(async move {
            let mut next = Some((assignment, task));

            while let Some((assignment, Task { request, cancel, reply })) = next.take() {
                let (alive, result) = shared.run(&assignment, request, cancel).await;

                next = shared.release(assignment.id, alive);

                // the receiver may have been dropped, the result is then discarded
                let _ = reply.send(result);
            }
        });
    }

    /// Run a request on a worker, also telling whether the worker survived it.
    async fn run(
        &self,
        assignment: &Assignment,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> (bool, Result<Vec<ChunkDescriptor>, Error>) {
        let id = assignment.id;

        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            tracing::trace!("Skipping cancelled task on worker {id}.");
            return (true, Err(Error::Cancelled));
        }

        let (reply, receiver) = oneshot::channel();

        if assignment.sender.send(Envelope { request, reply }).is_err() {
            tracing::warn!("Worker {id} is not running anymore.");
            return (false, Err(Error::worker(format!("worker {id} is not running"))));
        }

        match receiver.await {
            Ok(response) => (true, response.into_result()),
            Err(_) => {
                tracing::warn!("Worker {id} exited while running a task.");
                (false, Err(Error::worker(format!("worker {id} exited unexpectedly"))))
            }
        }
    }

    /// Release a worker once its task is complete, and assign the next queued task if any.
    ///
    /// A dead worker is dropped instead, a new one being started to run the next queued task. A worker that has
    /// already been dropped (terminated, or found stopped meanwhile) still lets the queue be drained.
    fn release(&self, id: usize, alive: bool) -> Option<(Assignment, Task)> {
        let mut state = self.state();

        if let Some(position) = state.workers.iter().position(|worker| worker.id == id) {
            if alive {
                state.workers[position].busy = false;
            } else {
                let worker = state.workers.swap_remove(position);
                worker.handle.abort();
            }
        }

        let task = state.queue.pop_front()?;

        if let Err(err) = self.start_workers(&mut state) {
            tracing::warn!("Cannot start workers: {err}");
        }

        match Self::acquire(&mut state) {
            Some(assignment) => Some((assignment, task)),
            None => {
                state.queue.push_front(task);
                None
            }
        }
    }
}

struct Assignment {
    id: usize,
    sender: mpsc::UnboundedSender<Envelope>,
    runtime: Handle,
}

/// A background worker running one request at a time.
struct Worker {
    id: usize,
    busy: bool,
    sender: mpsc::UnboundedSender<Envelope>,
    runtime: Handle,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    /// Whether the worker task is still able to receive requests.
    #[inline]
    fn is_running(&self) -> bool {
        !self.sender.is_closed() && !self.handle.is_finished()
    }

    fn start(id: usize, runner: Arc<dyn Runner>) -> Result<Worker, Error> {
        let runtime = Handle::try_current().map_err(|err| Error::WorkerLoad { message: err.to_string() })?;

        tracing::debug!("Starting worker {id}...");

        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();

        let handle = runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Some(Envelope { request, reply }) => {
                        tracing::debug!(
                            "Building chunks {}..{} of `{}` on worker {id}...",
                            request.start_index,
                            request.end_index,
                            request.file.name()
                        );

                        let _ = reply.send(runner.run(request).await);
                    }
                    None => {
                        tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                        break;
                    }
                }
            }
        });

        Ok(Worker {
            id,
            busy: false,
            sender,
            runtime,
            handle,
        })
    }
}

/// Get the process-wide pool, starting it with as many workers as the platform parallelism if needed.
pub fn global() -> Pool {
    GLOBAL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_or_insert_with(|| Pool::new(strategy::default_parallelism()))
        .clone()
}

/// Terminate and forget the process-wide pool, a new one being created on next [`global()`] call.
pub fn reset_global() {
    let pool = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).take();

    if let Some(pool) = pool {
        pool.terminate_all();
    }
}
