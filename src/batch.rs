//! Bounded bulk-operation driver.
//!
//! Items are split into consecutive chunks and handed to a caller-supplied
//! function. Failures either become data (`continue_on_error`) or abort the run
//! at the failing batch. Work finished before an abort is not rolled back.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ProgressFn = Arc<dyn Fn(u32, usize, usize) + Send + Sync>;
type BatchCompleteFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Batches in flight at once. 1 runs them sequentially.
    pub concurrency: usize,
    pub continue_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 1,
            continue_on_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem<T> {
    pub item: T,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome<TIn, TOut> {
    pub successful: Vec<TOut>,
    pub failed: Vec<FailedItem<TIn>>,
    pub total: usize,
    pub processed: usize,
    pub cancelled: bool,
}

impl<TIn, TOut> BatchOutcome<TIn, TOut> {
    fn new(total: usize) -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
            total,
            processed: 0,
            cancelled: false,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.processed == self.total
    }
}

/// Raised when a batch fails and `continue_on_error` is off.
/// `partial` holds every batch that completed, including ones already in
/// flight when the failure surfaced.
#[derive(Debug)]
pub struct BatchAborted<TIn, TOut> {
    /// 1-based index of the failing batch.
    pub batch_index: usize,
    pub batch_count: usize,
    pub cause: String,
    pub partial: BatchOutcome<TIn, TOut>,
}

impl<TIn, TOut> fmt::Display for BatchAborted<TIn, TOut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} of {} failed: {}",
            self.batch_index, self.batch_count, self.cause
        )
    }
}

impl<TIn: fmt::Debug, TOut: fmt::Debug> std::error::Error for BatchAborted<TIn, TOut> {}

impl<TIn, TOut> BatchAborted<TIn, TOut> {
    /// Converts into the crate error, naming each completed output with `label`.
    pub fn into_error<L>(self, label: L) -> crate::error::Error
    where
        L: Fn(&TOut) -> String,
    {
        crate::error::Error::BatchAborted {
            batch: self.batch_index,
            total: self.batch_count,
            cause: self.cause,
            completed: self.partial.successful.iter().map(label).collect(),
        }
    }
}

enum Step<T, E> {
    Done(T),
    Failed(E),
    Skipped,
}

#[derive(Clone, Default)]
pub struct BatchProcessor {
    options: BatchOptions,
    on_progress: Option<ProgressFn>,
    on_batch_complete: Option<BatchCompleteFn>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("options", &self.options)
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    #[must_use]
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options: BatchOptions {
                batch_size: options.batch_size.max(1),
                concurrency: options.concurrency.max(1),
                continue_on_error: options.continue_on_error,
            },
            ..Self::default()
        }
    }

    /// Called with `(percent, processed, total)` after every batch or item.
    #[must_use]
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Called with `(batch_index, batch_count)` after every batch, 1-based.
    #[must_use]
    pub fn on_batch_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_batch_complete = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn options(&self) -> BatchOptions {
        self.options
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn may_start(&self, halted: &AtomicBool) -> bool {
        !self.is_cancelled() && !halted.load(Ordering::SeqCst)
    }

    fn report_progress(&self, processed: usize, total: usize) {
        if let Some(cb) = &self.on_progress {
            cb(progress_percent(processed, total), processed, total);
        }
    }

    pub async fn process<TIn, TOut, E, F, Fut>(
        &self,
        items: Vec<TIn>,
        batch_fn: F,
    ) -> Result<BatchOutcome<TIn, TOut>, BatchAborted<TIn, TOut>>
    where
        TIn: Clone,
        F: Fn(Vec<TIn>) -> Fut,
        Fut: Future<Output = Result<Vec<TOut>, E>>,
        E: fmt::Display,
    {
        let total = items.len();
        let mut outcome = BatchOutcome::new(total);
        if total == 0 {
            return Ok(outcome);
        }

        let chunks: Vec<Vec<TIn>> = items
            .chunks(self.options.batch_size)
            .map(<[TIn]>::to_vec)
            .collect();
        let batch_count = chunks.len();
        debug!(total, batch_count, concurrency = self.options.concurrency, "processing batches");

        // `buffered` yields in submission order, so the partition does not
        // depend on which batch finishes first. Batches are only started while
        // the run is neither cancelled nor halted.
        let halted = AtomicBool::new(false);
        let mut results = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| {
                let fut = self.may_start(&halted).then(|| batch_fn(chunk.clone()));
                async move {
                    let Some(fut) = fut else {
                        return (index, chunk, Step::Skipped);
                    };
                    match fut.await {
                        Ok(out) => (index, chunk, Step::Done(out)),
                        Err(e) => (index, chunk, Step::Failed(e)),
                    }
                }
            })
            .buffered(self.options.concurrency);

        let mut abort: Option<(usize, String)> = None;
        while let Some((index, chunk, step)) = results.next().await {
            match step {
                Step::Skipped => {
                    outcome.cancelled = abort.is_none();
                    break;
                }
                Step::Done(out) => {
                    outcome.successful.extend(out);
                }
                Step::Failed(e) if abort.is_none() && !self.options.continue_on_error => {
                    debug!(batch = index + 1, error = %e, "batch failed, draining in-flight batches");
                    halted.store(true, Ordering::SeqCst);
                    abort = Some((index + 1, e.to_string()));
                    continue;
                }
                Step::Failed(e) => {
                    let error = e.to_string();
                    debug!(batch = index + 1, %error, "batch failed");
                    outcome.failed.extend(chunk.iter().cloned().map(|item| FailedItem {
                        item,
                        error: error.clone(),
                    }));
                }
            }

            outcome.processed += chunk.len();
            if let Some(cb) = &self.on_batch_complete {
                cb(index + 1, batch_count);
            }
            self.report_progress(outcome.processed, total);
        }

        match abort {
            Some((batch_index, cause)) => Err(BatchAborted {
                batch_index,
                batch_count,
                cause,
                partial: outcome,
            }),
            None => Ok(outcome),
        }
    }

    /// One item at a time, for targets without a batch API.
    /// Fires `on_progress` per item; `on_batch_complete` is not used.
    pub async fn process_individual<TIn, TOut, E, F, Fut>(
        &self,
        items: Vec<TIn>,
        item_fn: F,
    ) -> Result<BatchOutcome<TIn, TOut>, BatchAborted<TIn, TOut>>
    where
        TIn: Clone,
        F: Fn(TIn) -> Fut,
        Fut: Future<Output = Result<TOut, E>>,
        E: fmt::Display,
    {
        let total = items.len();
        let mut outcome = BatchOutcome::new(total);

        let halted = AtomicBool::new(false);
        let mut results = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let fut = self.may_start(&halted).then(|| item_fn(item.clone()));
                async move {
                    let Some(fut) = fut else {
                        return (index, item, Step::Skipped);
                    };
                    match fut.await {
                        Ok(out) => (index, item, Step::Done(out)),
                        Err(e) => (index, item, Step::Failed(e)),
                    }
                }
            })
            .buffered(self.options.concurrency);

        let mut abort: Option<(usize, String)> = None;
        while let Some((index, item, step)) = results.next().await {
            match step {
                Step::Skipped => {
                    outcome.cancelled = abort.is_none();
                    break;
                }
                Step::Done(out) => outcome.successful.push(out),
                Step::Failed(e) if abort.is_none() && !self.options.continue_on_error => {
                    halted.store(true, Ordering::SeqCst);
                    abort = Some((index + 1, e.to_string()));
                    continue;
                }
                Step::Failed(e) => {
                    outcome.failed.push(FailedItem {
                        item,
                        error: e.to_string(),
                    });
                }
            }

            outcome.processed += 1;
            self.report_progress(outcome.processed, total);
        }

        match abort {
            Some((batch_index, cause)) => Err(BatchAborted {
                batch_index,
                batch_count: total,
                cause,
                partial: outcome,
            }),
            None => Ok(outcome),
        }
    }
}

/// Runs `batch_fn` over `items` with default options and the given batch size.
pub async fn process_batches<TIn, TOut, E, F, Fut>(
    items: Vec<TIn>,
    batch_size: usize,
    batch_fn: F,
) -> Result<BatchOutcome<TIn, TOut>, BatchAborted<TIn, TOut>>
where
    TIn: Clone,
    F: Fn(Vec<TIn>) -> Fut,
    Fut: Future<Output = Result<Vec<TOut>, E>>,
    E: fmt::Display,
{
    BatchProcessor::new(BatchOptions {
        batch_size,
        ..BatchOptions::default()
    })
    .process(items, batch_fn)
    .await
}

/// Estimated wall time in seconds.
#[must_use]
pub fn estimate_batch_time(item_count: usize, batch_size: usize, avg_batch_ms: u64) -> f64 {
    let batches = item_count.div_ceil(batch_size.max(1));
    (batches as f64 * avg_batch_ms as f64) / 1000.0
}

fn progress_percent(processed: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((processed as f64 / total as f64) * 100.0).round() as u32
}
