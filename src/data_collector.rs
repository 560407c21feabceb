use chrono::NaiveDate;
use futures::future;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::{RateSink, RateSource, SourceFailure};
use crate::concurrent_fetcher::{drain_bounded, run_bounded, run_worker_pool, ProgressTracker};
use crate::errors::{DeliveryFailureKind, FailureCause};
use crate::models::{DeliveryOutcome, NormalizedRate, RawObservation, WorkItem};
use crate::normalizer::normalize;

/// Stages a run moves through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Enumerate,
    Fetch,
    Normalize,
    Deliver,
    Report,
}

/// Forward-only stage tracker
#[derive(Debug)]
pub struct RunState {
    stage: PipelineStage,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            stage: PipelineStage::Enumerate,
        }
    }
}

impl RunState {
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Move to `next`. Going backwards is refused and leaves the stage as is.
    pub fn advance(&mut self, next: PipelineStage) -> bool {
        if next < self.stage {
            error!("Refusing stage transition {:?} -> {:?}", self.stage, next);
            return false;
        }
        debug!("Stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
        true
    }
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub units_total: usize,
    pub units_completed: usize,
    pub observations: usize,
    pub malformed: usize,
    pub delivered: usize,
    pub delivery_failures: HashMap<DeliveryFailureKind, usize>,
    pub fetch_failures: HashMap<FailureCause, usize>,
    pub units_aborted: usize,
    pub dates_skipped: usize,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.units_total += other.units_total;
        self.units_completed += other.units_completed;
        self.observations += other.observations;
        self.malformed += other.malformed;
        self.delivered += other.delivered;
        for (kind, count) in other.delivery_failures {
            *self.delivery_failures.entry(kind).or_insert(0) += count;
        }
        for (cause, count) in other.fetch_failures {
            *self.fetch_failures.entry(cause).or_insert(0) += count;
        }
        self.units_aborted += other.units_aborted;
        self.dates_skipped += other.dates_skipped;
    }

    pub fn failed_deliveries(&self) -> usize {
        self.delivery_failures.values().sum()
    }

    pub fn failed_fetches(&self) -> usize {
        self.fetch_failures.values().sum()
    }

    pub fn has_failures(&self) -> bool {
        self.malformed > 0 || self.failed_deliveries() > 0 || self.failed_fetches() > 0
    }

    fn record_observation(&mut self, observation: Result<RawObservation, SourceFailure>) -> Option<NormalizedRate> {
        match observation {
            Ok(raw) => {
                self.observations += 1;
                match normalize(&raw) {
                    Ok(rate) => Some(rate),
                    Err(e) => {
                        self.malformed += 1;
                        warn!(
                            "⚠️ Dropping {} {}/{} {} from {}: {}",
                            raw.source, raw.base, raw.target, raw.date, raw.origin, e
                        );
                        None
                    }
                }
            }
            Err(failure) => {
                *self.fetch_failures.entry(failure.cause()).or_insert(0) += 1;
                if failure.aborted() {
                    self.units_aborted += 1;
                    self.dates_skipped += failure.skipped;
                }
                None
            }
        }
    }

    fn record_delivery(&mut self, outcome: DeliveryOutcome) {
        match outcome.failure_kind() {
            None => self.delivered += 1,
            Some(kind) => *self.delivery_failures.entry(kind).or_insert(0) += 1,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "📊 Units: {}/{} completed, {} aborted ({} dates skipped)",
            self.units_completed, self.units_total, self.units_aborted, self.dates_skipped
        );
        info!(
            "📊 Observations: {} fetched, {} malformed; deliveries: {} ok, {} failed",
            self.observations,
            self.malformed,
            self.delivered,
            self.failed_deliveries()
        );
        for (cause, count) in &self.fetch_failures {
            info!("   fetch failures ({}): {}", cause, count);
        }
        for (kind, count) in &self.delivery_failures {
            info!("   delivery failures ({}): {}", kind, count);
        }
    }
}

/// Tuning for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub fetch_workers: usize,
    pub delivery_concurrency: usize,
    /// Fetch and normalize only, nothing is sent to the sink
    pub dry_run: bool,
    pub show_progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            fetch_workers: 16,
            delivery_concurrency: 32,
            dry_run: false,
            show_progress: false,
        }
    }
}

/// Wires sources, the normalizer and the sink together
pub struct RatePipeline<S> {
    sink: Arc<S>,
    options: PipelineOptions,
}

impl<S> RatePipeline<S>
where
    S: RateSink + 'static,
{
    pub fn new(sink: Arc<S>, options: PipelineOptions) -> Self {
        Self { sink, options }
    }

    fn progress(&self, label: &str, total: usize) -> ProgressTracker {
        if self.options.show_progress {
            ProgressTracker::new(label, total)
        } else {
            ProgressTracker::hidden(total)
        }
    }

    /// Historical backfill: one unit per code, each unit streams its
    /// observations into the sink while other codes are still fetching.
    pub async fn run_historical<R>(&self, source: Arc<R>, codes: Vec<String>, dates: Vec<NaiveDate>) -> IngestReport
    where
        R: RateSource + 'static,
    {
        let mut state = RunState::default();
        let items: Vec<WorkItem> = codes
            .into_iter()
            .map(|code| WorkItem::Historical {
                code,
                dates: dates.clone(),
            })
            .collect();
        info!(
            "📅 Historical run: {} codes x {} dates from {}",
            items.len(),
            dates.len(),
            source.source_tag()
        );

        // Fetch, normalize and deliver are interleaved per unit
        state.advance(PipelineStage::Deliver);
        let progress = Arc::new(self.progress("codes", items.len()));
        let sink = Arc::clone(&self.sink);
        let delivery_limit = self.options.delivery_concurrency;
        let dry_run = self.options.dry_run;

        let unit_reports = run_worker_pool(items, self.options.fetch_workers, Arc::clone(&progress), move |worker_id, item| {
            let source = Arc::clone(&source);
            let sink = Arc::clone(&sink);
            async move {
                debug!("Worker {}: starting {}", worker_id, item.label());
                let report = ingest_item(source.as_ref(), sink.as_ref(), &item, delivery_limit, dry_run).await;
                if report.units_aborted > 0 {
                    warn!("⚠️ Worker {}: {} aborted early", worker_id, item.label());
                } else {
                    info!(
                        "✅ Worker {}: {} done ({} delivered, {} failed)",
                        worker_id,
                        item.label(),
                        report.delivered,
                        report.failed_deliveries()
                    );
                }
                report
            }
        })
        .await;
        progress.finish();

        state.advance(PipelineStage::Report);
        let mut report = IngestReport::default();
        for unit in unit_reports {
            report.merge(unit);
        }
        report.log_summary();
        report
    }

    /// Bulk run: every item is fetched and normalized first, then all rates
    /// are delivered with bounded concurrency.
    pub async fn run_bulk<R>(&self, source: &R, items: Vec<WorkItem>) -> IngestReport
    where
        R: RateSource,
    {
        let mut state = RunState::default();
        let mut report = IngestReport {
            units_total: items.len(),
            ..IngestReport::default()
        };
        info!("📦 Bulk run: {} items from {}", items.len(), source.source_tag());

        state.advance(PipelineStage::Fetch);
        let mut observations = Vec::new();
        for item in &items {
            let fetched: Vec<_> = source.observations(item).collect().await;
            observations.extend(fetched);
        }

        state.advance(PipelineStage::Normalize);
        let rates: Vec<NormalizedRate> = observations
            .into_iter()
            .filter_map(|observation| report.record_observation(observation))
            .collect();
        info!("🔢 {} rates normalized, {} dropped", rates.len(), report.malformed);

        state.advance(PipelineStage::Deliver);
        if self.options.dry_run {
            info!("Dry run: skipping delivery of {} rates", rates.len());
        } else {
            let progress = self.progress("deliveries", rates.len());
            let sink = self.sink.as_ref();
            let outcomes = run_bounded(rates.iter(), self.options.delivery_concurrency, &progress, |rate| {
                sink.deliver(rate)
            })
            .await;
            progress.finish();
            for outcome in outcomes {
                report.record_delivery(outcome);
            }
        }

        state.advance(PipelineStage::Report);
        report.units_completed = items.len();
        report.log_summary();
        report
    }
}

/// Fetch → normalize → deliver for a single work item
pub async fn ingest_item<R, S>(
    source: &R,
    sink: &S,
    item: &WorkItem,
    delivery_limit: usize,
    dry_run: bool,
) -> IngestReport
where
    R: RateSource + ?Sized,
    S: RateSink + ?Sized,
{
    let mut fetch_side = IngestReport::default();
    let mut delivery_side = IngestReport::default();

    let rates = source
        .observations(item)
        .filter_map(|observation| future::ready(fetch_side.record_observation(observation)));

    if dry_run {
        rates.for_each(|_| future::ready(())).await;
    } else {
        drain_bounded(
            rates,
            delivery_limit,
            |rate| async move { sink.deliver(&rate).await },
            |outcome| delivery_side.record_delivery(outcome),
        )
        .await;
    }

    fetch_side.merge(delivery_side);
    fetch_side.units_total = 1;
    fetch_side.units_completed = 1;
    fetch_side
}
