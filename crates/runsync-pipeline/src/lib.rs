//! runsync Pipeline - Change aggregation and import orchestration
//!
//! This crate keeps the metadata index in sync with the run store:
//! - [`Pipeline`]: the singleton actor debouncing change signals and
//!   running full scans
//! - [`PipelineJournal`]: durable signal queue and checkpoint store
//! - [`ReconciliationEngine`]: full store/index diff
//! - [`ImportOrchestrator`]: per-run import with pluggable importers
//! - [`PipelineLease`]: single active instance per state directory

pub mod batch;
pub mod import;
pub mod journal;
pub mod lease;
pub mod machine;
pub mod metrics;
pub mod reconcile;
pub mod state;

pub use batch::{Batch, LogicalClock};
pub use import::{
    DataImporter, ImportContext, ImportOrchestrator, ImportOutcome, JsonParamsImporter,
    ParamsImporter,
};
pub use journal::{Checkpoint, JournalEntry, JournalError, PipelineJournal};
pub use lease::{LeaseHolder, PipelineLease};
pub use machine::{FullScanSummary, IterationReport, Pipeline, PipelineStatus};
pub use metrics::{PipelineMetrics, pipeline_metrics};
pub use reconcile::{
    ObsoleteObject, ObsoleteReason, ReconcileReport, Reconciliation, ReconciliationEngine,
};
pub use state::{PipelineState, RunCache};
