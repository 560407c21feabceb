//! Concurrent execution of independent units
//!
//! Two shapes of bounded concurrency are provided:
//! - a fixed pool of worker tasks pulling units from a shared queue, used for
//!   the fetch stage where one unit is one entity code;
//! - a bounded unordered stream, used for the delivery stage where one unit is
//!   one rate and the bound is the sink's connection budget.
//!
//! A unit that fails just produces a failed outcome; siblings keep running.

use futures::stream::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Completed/total counter with an optional terminal progress bar
pub struct ProgressTracker {
    bar: ProgressBar,
    completed: AtomicUsize,
    total: usize,
}

impl ProgressTracker {
    pub fn new(label: &str, total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>7}/{len:7} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(label.to_string());
        Self {
            bar,
            completed: AtomicUsize::new(0),
            total,
        }
    }

    /// Same counters, nothing drawn
    pub fn hidden(total: usize) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            completed: AtomicUsize::new(0),
            total,
        }
    }

    pub fn tick(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bar.inc(1);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Run `handler` over every unit with `num_workers` worker tasks.
///
/// Outcomes come back in completion order. A worker that panics loses the unit
/// it was holding; that is logged and the remaining workers drain the queue.
pub async fn run_worker_pool<T, O, F, Fut>(
    units: Vec<T>,
    num_workers: usize,
    progress: Arc<ProgressTracker>,
    handler: F,
) -> Vec<O>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send,
{
    let total = units.len();
    let num_workers = num_workers.max(1).min(total.max(1));
    info!("🚀 Starting worker pool: {} units, {} workers", total, num_workers);

    let queue = Arc::new(Mutex::new(units.into_iter().collect::<VecDeque<T>>()));
    let handler = Arc::new(handler);
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let queue = Arc::clone(&queue);
        let handler = Arc::clone(&handler);
        let progress = Arc::clone(&progress);
        let sender = sender.clone();

        handles.push(tokio::spawn(async move {
            loop {
                // Take the next unit without holding the lock across an await
                let unit = match queue.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(poisoned) => poisoned.into_inner().pop_front(),
                };
                let Some(unit) = unit else {
                    break;
                };

                let outcome = handler(worker_id, unit).await;
                progress.tick();
                if sender.send(outcome).is_err() {
                    break;
                }
            }
            debug!("Worker {} finished", worker_id);
        }));
    }
    drop(sender);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = receiver.recv().await {
        outcomes.push(outcome);
    }

    for (worker_id, handle) in handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            error!("❌ Worker {} stopped abnormally: {}", worker_id, e);
        }
    }

    if outcomes.len() != total {
        error!("❌ Worker pool produced {} outcomes for {} units", outcomes.len(), total);
    }
    outcomes
}

/// Run `handler` over every element of `units` with at most `limit` in flight,
/// handing each outcome to `on_outcome` as soon as it completes.
pub async fn drain_bounded<S, F, Fut, O, G>(units: S, limit: usize, handler: F, mut on_outcome: G)
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = O>,
    G: FnMut(O),
{
    let mut outcomes = Box::pin(units.map(handler).buffer_unordered(limit.max(1)));
    while let Some(outcome) = outcomes.next().await {
        on_outcome(outcome);
    }
}

/// Collecting variant of [`drain_bounded`] that also advances `progress`
pub async fn run_bounded<I, F, Fut, O>(units: I, limit: usize, progress: &ProgressTracker, handler: F) -> Vec<O>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = O>,
{
    let mut outcomes = Vec::new();
    drain_bounded(futures::stream::iter(units), limit, handler, |outcome| {
        progress.tick();
        outcomes.push(outcome);
    })
    .await;
    outcomes
}
