//! Per-file orchestration: from a file to its complete ordered chunks.

use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::Arc;

use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::file::FileRef;
use crate::pool::{Pool, Request};
use crate::strategy::{self, ChunkStrategy, DEFAULT_CHUNK_SIZE};
use crate::{CancellationToken, ChunkDescriptor, Error, Options, ProgressSnapshot};

/// Split `0..chunk_count` into at most `worker_count` contiguous ranges of equal length, except for the last one.
pub fn partition(chunk_count: u64, worker_count: usize) -> impl Iterator<Item = Range<u64>> {
    let worker_count = worker_count.max(1) as u64;
    let per_worker = chunk_count.div_ceil(worker_count);

    (0..worker_count)
        .map(move |i| {
            let start = i * per_worker;
            start..(start + per_worker).min(chunk_count)
        })
        // ranges are ascending, only trailing ones may be empty
        .take_while(|range| range.start < range.end)
}

/// Drives a single file through a [`Pool`].
///
/// The file is split in as many index ranges as workers, each range being a pool task. Chunks are gathered back by
/// index whatever the order tasks complete in.
#[derive(Debug, Clone, Copy)]
pub struct FileProcessor<'a> {
    pool: &'a Pool,
    options: &'a Options,
    token: &'a CancellationToken,
}

impl<'a> FileProcessor<'a> {
    pub fn new(pool: &'a Pool, options: &'a Options, token: &'a CancellationToken) -> Self {
        Self { pool, options, token }
    }

    /// Chunk size and worker count used for a file of `file_size` bytes.
    pub fn parameters(self, file_size: u64) -> ChunkStrategy {
        match self.options.chunk_size {
            None if self.options.adaptive_chunk_size => strategy::recommend(file_size, self.options.worker_count),
            chunk_size => {
                let chunk_size = chunk_size.map_or(DEFAULT_CHUNK_SIZE, NonZeroU64::get);
                let worker_count = match self.options.worker_count {
                    Some(worker_count) => worker_count.get(),
                    None => strategy::worker_count_for(strategy::chunk_count(file_size, chunk_size), None),
                };

                ChunkStrategy {
                    chunk_size,
                    worker_count,
                }
            }
        }
    }

    /// Process `file`, returning its chunks ordered by index.
    pub async fn process(self, file: &FileRef) -> Result<Vec<ChunkDescriptor>, Error> {
        self.process_with(file, |_| ()).await
    }

    /// Process `file`, also handing chunks to `on_chunks` as soon as each task completes.
    ///
    /// Failures are reported to the error callback once, cancellations are not reported.
    pub async fn process_with(
        self,
        file: &FileRef,
        on_chunks: impl FnMut(&[ChunkDescriptor]),
    ) -> Result<Vec<ChunkDescriptor>, Error> {
        let result = self.run(file, on_chunks).await;

        if let Err(ref err) = result {
            if !err.is_cancelled() {
                self.options.report_error(err);
            }
        }

        result
    }

    async fn run(self, file: &FileRef, mut on_chunks: impl FnMut(&[ChunkDescriptor])) -> Result<Vec<ChunkDescriptor>, Error> {
        if file.name().is_empty() {
            return Err(Error::invalid_file("", "file has no name"));
        }

        let size = file.size();

        if size == 0 {
            tracing::debug!("Nothing to process for empty file `{}`.", file.name());
            return Ok(vec![]);
        }

        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let ChunkStrategy {
            chunk_size,
            worker_count,
        } = self.parameters(size);
        let chunk_count = strategy::chunk_count(size, chunk_size);

        tracing::debug!(
            "Processing `{}`: {size} bytes, {chunk_count} chunks of {chunk_size} bytes over {worker_count} workers...",
            file.name()
        );

        let mut pending: FuturesUnordered<_> = partition(chunk_count, worker_count)
            .map(|range| {
                let request = Request {
                    file: Arc::clone(file),
                    chunk_size,
                    start_index: range.start,
                    end_index: range.end,
                };

                self.pool
                    .submit(request, Some(self.token.clone()))
                    .map(move |result| (range.start, result))
            })
            .collect();

        let mut slots: Vec<Option<ChunkDescriptor>> = vec![None; chunk_count as usize];
        let mut loaded_bytes = 0;
        let mut processed_chunks = 0;

        while let Some((start_index, result)) = pending.next().await {
            // results are discarded once cancelled, whatever they are
            if self.token.is_cancelled() {
                tracing::debug!("Processing of `{}` cancelled.", file.name());
                return Err(Error::Cancelled);
            }

            let chunks = result.map_err(|err| err.in_range(file.name(), start_index))?;

            loaded_bytes += chunks.iter().map(ChunkDescriptor::len).sum::<u64>();
            processed_chunks += chunks.len() as u64;

            if let Some(last) = chunks.last() {
                let progress = ProgressSnapshot::new(Arc::clone(file), loaded_bytes).with_chunks(
                    last.index,
                    processed_chunks,
                    chunk_count,
                );
                self.options.report_progress(&progress);
            }

            on_chunks(&chunks);

            for chunk in chunks {
                let index = chunk.index;

                match slots.get_mut(index as usize) {
                    Some(slot) => *slot = Some(chunk),
                    None => {
                        return Err(Error::Worker {
                            file: Some(file.name().to_owned()),
                            chunk_index: Some(index),
                            message: format!("unexpected chunk #{index} out of {chunk_count}"),
                        })
                    }
                }
            }
        }

        let chunks = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| Error::Worker {
                    file: Some(file.name().to_owned()),
                    chunk_index: Some(index as u64),
                    message: format!("missing chunk #{index}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let progress = ProgressSnapshot::new(Arc::clone(file), size).with_chunks(chunk_count - 1, chunk_count, chunk_count);
        self.options.report_progress(&progress);

        tracing::debug!("Processed `{}`: {chunk_count} chunks.", file.name());

        Ok(chunks)
    }
}
