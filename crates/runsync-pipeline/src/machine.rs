//! Change aggregation state machine
//!
//! A single sequential actor over the journaled signal stream. Each
//! iteration either debounces a batch of changes or runs a full
//! reconciliation, fans the resulting per-run imports out with failure
//! isolation, evicts stale run cache entries and checkpoints. Waiting for
//! signals is the only suspension point that can be interrupted; the
//! processing half of an iteration always runs to its checkpoint.

use crate::batch::{Batch, LogicalClock};
use crate::import::ImportOrchestrator;
use crate::journal::{JournalEntry, PipelineJournal};
use crate::metrics::pipeline_metrics;
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::state::PipelineState;
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, stream};
use runsync_common::config::PipelineConfig;
use runsync_common::{Result, RunData, Signal, parent_dirs};
use runsync_store::RunFile;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// First pause after a failed iteration; doubles up to [`RETRY_MAX`]
const RETRY_INITIAL: StdDuration = StdDuration::from_secs(1);
const RETRY_MAX: StdDuration = StdDuration::from_secs(60);

/// Outcome of one full reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullScanSummary {
    pub ok: bool,
    pub runs: usize,
    pub failures: usize,
    pub objects_scanned: usize,
    pub obsolete: usize,
}

/// Snapshot published after every iteration
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub started: bool,
    pub instance_id: Option<Uuid>,
    pub iterations: u64,
    /// Iterations abandoned on a journal error
    pub failed_iterations: u64,
    /// Highest acknowledged journal sequence number
    pub cursor: u64,
    pub last_batch_size: usize,
    pub last_full_scan: Option<FullScanSummary>,
    pub cached_runs: usize,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

/// What one iteration did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub signals: usize,
    pub malformed: usize,
    pub batch_size: usize,
    pub runs_dispatched: usize,
    pub run_failures: usize,
    pub orphans: usize,
    pub evicted: Vec<String>,
    pub full_scan: Option<FullScanSummary>,
}

/// Signals consumed by one iteration, not yet acknowledged
#[derive(Debug)]
struct Collected {
    cursor: u64,
    clock: LogicalClock,
    batch: Batch,
    full_scan: bool,
    signals: usize,
    malformed: usize,
}

impl Collected {
    fn new(cursor: u64) -> Self {
        Self {
            cursor,
            clock: LogicalClock::default(),
            batch: Batch::new(),
            full_scan: false,
            signals: 0,
            malformed: 0,
        }
    }

    /// Consume one journal entry; malformed payloads are acknowledged as
    /// no-ops
    fn accept(&mut self, entry: &JournalEntry) -> Option<Signal> {
        self.cursor = entry.seq;
        self.clock.observe(entry.enqueued_at);
        self.signals += 1;
        pipeline_metrics().record_signal();
        match entry.decode() {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(seq = entry.seq, error = %e, "Skipping malformed signal");
                pipeline_metrics().record_malformed_signal();
                self.malformed += 1;
                None
            }
        }
    }
}

/// The singleton pipeline actor
pub struct Pipeline {
    orchestrator: Arc<ImportOrchestrator>,
    engine: ReconciliationEngine,
    journal: PipelineJournal,
    state: PipelineState,
    cursor: u64,
    max_concurrent_imports: usize,
    instance_id: Uuid,
    iterations: u64,
    status: watch::Sender<PipelineStatus>,
}

impl Pipeline {
    /// Build the actor, resuming from the journal's checkpoint if there is
    /// one. A checkpointed state wins over `config`.
    pub fn new(
        orchestrator: Arc<ImportOrchestrator>,
        journal: PipelineJournal,
        config: &PipelineConfig,
        instance_id: Uuid,
    ) -> Result<Self> {
        let (state, cursor) = match journal.load()? {
            Some(checkpoint) => {
                let state = checkpoint.state;
                if state.threshold_seconds != config.threshold_seconds
                    || state.cache_ttl_hours != config.cache_ttl_hours
                {
                    info!(
                        threshold_seconds = state.threshold_seconds,
                        cache_ttl_hours = state.cache_ttl_hours,
                        configured_threshold_seconds = config.threshold_seconds,
                        configured_cache_ttl_hours = config.cache_ttl_hours,
                        "Checkpointed settings differ from configuration, keeping checkpoint"
                    );
                }
                info!(
                    cursor = checkpoint.cursor,
                    cached_runs = state.run_cache.len(),
                    "Resuming pipeline from checkpoint"
                );
                (state, checkpoint.cursor)
            }
            None => {
                info!("No checkpoint found, starting from configuration");
                (
                    PipelineState::new(config.threshold_seconds, config.cache_ttl_hours),
                    0,
                )
            }
        };

        let engine = ReconciliationEngine::new(
            orchestrator.store().clone(),
            orchestrator.index().clone(),
        );
        let (status, _) = watch::channel(PipelineStatus::default());
        Ok(Self {
            orchestrator,
            engine,
            journal,
            state,
            cursor,
            max_concurrent_imports: config.max_concurrent_imports.max(1),
            instance_id,
            iterations: 0,
            status,
        })
    }

    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub const fn state(&self) -> &PipelineState {
        &self.state
    }

    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Loop until `shutdown` flips to true or its sender goes away.
    ///
    /// Nothing stops the loop but shutdown. Import and full-scan failures
    /// are isolated per run; a journal failure abandons the iteration
    /// without acknowledging it, and the same signals are read again after
    /// a backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(instance_id = %self.instance_id, cursor = self.cursor, "Pipeline started");
        self.publish(None);
        let mut backoff = RETRY_INITIAL;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let collected = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                collected = self.collect() => collected,
            };
            let result = match collected {
                Ok(collected) => self.process(collected).await.map(drop),
                Err(e) => Err(e),
            };
            let Err(e) = result else {
                backoff = RETRY_INITIAL;
                continue;
            };

            error!(
                error = %e,
                cursor = self.cursor,
                retry_in = ?backoff,
                "Pipeline iteration failed"
            );
            pipeline_metrics().record_iteration_failure();
            self.status.send_modify(|status| status.failed_iterations += 1);
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RETRY_MAX);
        }
        info!(cursor = self.cursor, "Pipeline stopped");
    }

    /// Wait for the next signal and run one full iteration.
    ///
    /// On error nothing is acknowledged: the cursor stays put and the next
    /// call reads the same signals again.
    pub async fn step(&mut self) -> Result<IterationReport> {
        let collected = self.collect().await?;
        self.process(collected).await
    }

    /// Wait for the first signal, then debounce changes until the timer
    /// fires or a full scan is requested. Nothing is acknowledged here.
    async fn collect(&self) -> Result<Collected> {
        let mut collected = Collected::new(self.cursor);

        let batch_start = loop {
            let entry = self.journal.recv_after(collected.cursor).await?;
            match collected.accept(&entry) {
                Some(Signal::Full) => {
                    collected.full_scan = true;
                    return Ok(collected);
                }
                Some(Signal::Change(shot)) => {
                    collected.batch.merge(shot);
                    break entry.enqueued_at;
                }
                None => {}
            }
        };

        let threshold = self.state.threshold();
        let timer = tokio::time::sleep(threshold);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                entry = self.journal.recv_after(collected.cursor) => {
                    let entry = entry?;
                    match collected.accept(&entry) {
                        Some(Signal::Change(shot)) => collected.batch.merge(shot),
                        Some(Signal::Full) => {
                            collected.full_scan = true;
                            break;
                        }
                        None => {}
                    }
                }
                () = &mut timer => {
                    if let Some(deadline) = i64::try_from(threshold.as_secs())
                        .ok()
                        .and_then(Duration::try_seconds)
                        .and_then(|d| batch_start.checked_add_signed(d))
                    {
                        collected.clock.observe(deadline);
                    }
                    break;
                }
            }
        }
        debug!(
            files = collected.batch.len(),
            full_scan = collected.full_scan,
            "Batch closed"
        );
        Ok(collected)
    }

    async fn process(&mut self, collected: Collected) -> Result<IterationReport> {
        let Collected {
            cursor,
            clock,
            batch,
            full_scan,
            signals,
            malformed,
        } = collected;
        let mut report = IterationReport {
            signals,
            malformed,
            batch_size: batch.len(),
            ..IterationReport::default()
        };

        if !batch.is_empty() {
            pipeline_metrics().record_batch();
            let (runs, orphans) = self.assemble(batch);
            report.orphans = orphans;
            info!(
                files = report.batch_size,
                runs = runs.len(),
                orphans,
                "Processing change batch"
            );
            let (dispatched, failures) = self.dispatch(runs).await;
            report.runs_dispatched = dispatched;
            report.run_failures = failures;
        }

        if let Some(now) = clock.now() {
            report.evicted = self.state.run_cache.evict(now, self.state.cache_ttl());
            if !report.evicted.is_empty() {
                info!(count = report.evicted.len(), "Evicted idle runs from cache");
                pipeline_metrics().record_evictions(report.evicted.len() as u64);
            }
        }

        if full_scan {
            report.full_scan = Some(self.full_scan().await);
        }

        self.journal.checkpoint(&self.state, cursor)?;
        self.cursor = cursor;
        self.iterations += 1;
        pipeline_metrics().set_cached_runs(self.state.run_cache.len() as u64);
        self.publish(Some(&report));
        Ok(report)
    }

    /// Turn a closed batch into per-run import work. Returns the work and
    /// the number of dropped data files.
    fn assemble(&mut self, batch: Batch) -> (Vec<RunData>, usize) {
        let store = self.orchestrator.store().clone();
        let mut runs: BTreeMap<String, RunData> = BTreeMap::new();
        let mut data: Vec<RunFile> = Vec::new();

        for shot in batch.into_shots() {
            let file = store.classify(&shot.path, shot.last_write_time);
            if let Ok(run) = file.run_path().map(str::to_string) {
                self.state.run_cache.touch(&run, file.last_write_time());
                runs.entry(run.clone())
                    .or_insert_with(|| RunData::new(run))
                    .meta = Some(file.shot().clone());
            }
            if file.is_data() {
                data.push(file);
            } else if !file.is_metadata() {
                debug!(path = file.path(), "Skipping non-importable file");
            }
        }

        let mut orphans = 0;
        for file in data {
            let owner = parent_dirs(file.path())
                .find(|dir| runs.contains_key(*dir))
                .or_else(|| self.state.run_cache.find_run(file.path()))
                .map(str::to_string);
            let Some(run) = owner else {
                warn!(path = file.path(), "No run found for data file, dropping change");
                pipeline_metrics().record_orphan();
                orphans += 1;
                continue;
            };
            self.state.run_cache.touch(&run, file.last_write_time());
            runs.entry(run.clone())
                .or_insert_with(|| RunData::new(run))
                .data
                .push(file.into_shot());
        }

        (runs.into_values().collect(), orphans)
    }

    /// Import every run concurrently; a failing run is logged and never
    /// affects its siblings. Returns (dispatched, failed).
    async fn dispatch(&self, runs: Vec<RunData>) -> (usize, usize) {
        let dispatched = runs.len();
        let failures = stream::iter(runs)
            .map(|run| {
                let orchestrator = self.orchestrator.clone();
                async move {
                    let run_path = run.run_path.clone();
                    match orchestrator.import_run(run).await {
                        Ok(outcome) => {
                            debug!(
                                run = %run_path,
                                data_files = outcome.data_files,
                                meta = outcome.meta_written,
                                "Run imported"
                            );
                            false
                        }
                        Err(e) => {
                            error!(run = %run_path, error = %e, "Run import failed");
                            true
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrent_imports)
            .filter(|failed| futures::future::ready(*failed))
            .count()
            .await;
        pipeline_metrics().record_dispatch(dispatched as u64, failures as u64);
        (dispatched, failures)
    }

    /// Reconcile the whole store against the index and import the difference
    async fn full_scan(&self) -> FullScanSummary {
        match self.engine.diff().await {
            Ok(reconciliation) => {
                let ReconcileReport {
                    objects_scanned,
                    obsolete,
                    ..
                } = reconciliation.report;
                pipeline_metrics().record_obsolete(obsolete.len() as u64);
                let (runs, failures) = self.dispatch(reconciliation.imports).await;
                pipeline_metrics().record_full_scan(true);
                info!(runs, failures, objects_scanned, "Full scan finished");
                FullScanSummary {
                    ok: true,
                    runs,
                    failures,
                    objects_scanned,
                    obsolete: obsolete.len(),
                }
            }
            Err(e) => {
                error!(error = %e, "Full scan failed");
                pipeline_metrics().record_full_scan(false);
                FullScanSummary::default()
            }
        }
    }

    fn publish(&self, report: Option<&IterationReport>) {
        let cached_runs = self.state.run_cache.len();
        self.status.send_modify(|status| {
            status.started = true;
            status.instance_id = Some(self.instance_id);
            status.iterations = self.iterations;
            status.cursor = self.cursor;
            status.cached_runs = cached_runs;
            if let Some(report) = report {
                status.last_batch_size = report.batch_size;
                if let Some(summary) = &report.full_scan {
                    status.last_full_scan = Some(summary.clone());
                }
                status.last_checkpoint = Some(Utc::now());
            }
        });
    }
}
