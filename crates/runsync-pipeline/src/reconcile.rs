//! Full diff between the run store and the metadata index
//!
//! The store grouping says what should be indexed; streaming the index
//! crosses off everything already current. What is left is the minimal set
//! of (re)imports. Indexed objects with no counterpart in the store are
//! reported as obsolete and never deleted.

use futures::TryStreamExt;
use runsync_common::{FileShot, IndexedObject, ObjectType, Result, RunData};
use runsync_index::MetadataIndex;
use runsync_store::{RunRecord, RunStore};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Why an indexed object has drifted from the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ObsoleteReason {
    /// The object's run no longer exists in the store
    RunMissing,
    /// The run exists but the object's file does not
    FileMissing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsoleteObject {
    pub run: String,
    pub path: String,
    pub object_type: ObjectType,
    pub reason: ObsoleteReason,
}

/// Counts gathered during one diff
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub objects_scanned: usize,
    pub indexed_runs: usize,
    pub obsolete: Vec<ObsoleteObject>,
}

/// Result of a full diff
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub imports: Vec<RunData>,
    pub report: ReconcileReport,
}

/// Store files of one run still waiting to be confirmed current
struct PendingRun {
    meta: Option<FileShot>,
    /// Keyed by full store path
    data: BTreeMap<String, FileShot>,
}

impl From<RunRecord> for PendingRun {
    fn from(record: RunRecord) -> Self {
        Self {
            meta: record.meta.map(|f| f.into_shot()),
            data: record
                .data
                .into_iter()
                .map(|f| {
                    let shot = f.into_shot();
                    (shot.path.clone(), shot)
                })
                .collect(),
        }
    }
}

/// Computes required imports from a full store listing and index scan
pub struct ReconciliationEngine {
    store: Arc<RunStore>,
    index: Arc<dyn MetadataIndex>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<RunStore>, index: Arc<dyn MetadataIndex>) -> Self {
        Self { store, index }
    }

    pub async fn diff(&self) -> Result<Reconciliation> {
        let records = self.store.group_by_run().await?;
        let mut pending: BTreeMap<String, PendingRun> = records
            .into_iter()
            .map(|r| (r.run_path.clone(), PendingRun::from(r)))
            .collect();

        let mut report = ReconcileReport::default();
        let mut runs = BTreeSet::new();
        let mut objects = self.index.get_all_objects();
        while let Some(object) = objects.try_next().await? {
            report.objects_scanned += 1;
            runs.insert(object.run.clone());
            if let Some(reason) = check_object(&mut pending, &object) {
                tracing::warn!(
                    run = %object.run,
                    path = %object.path,
                    kind = %object.object_type,
                    ?reason,
                    "Obsolete indexed object"
                );
                report.obsolete.push(ObsoleteObject {
                    run: object.run,
                    path: object.path,
                    object_type: object.object_type,
                    reason,
                });
            }
        }
        report.indexed_runs = runs.len();

        let imports: Vec<RunData> = pending
            .into_iter()
            .filter_map(|(run_path, run)| {
                let data = RunData {
                    run_path,
                    meta: run.meta,
                    data: run.data.into_values().collect(),
                };
                (!data.is_empty()).then_some(data)
            })
            .collect();

        tracing::info!(
            scanned = report.objects_scanned,
            runs = report.indexed_runs,
            obsolete = report.obsolete.len(),
            imports = imports.len(),
            "Reconciliation finished"
        );
        Ok(Reconciliation { imports, report })
    }
}

/// Cross off `object` from the pending work; returns why it is obsolete, if
/// it is
fn check_object(
    pending: &mut BTreeMap<String, PendingRun>,
    object: &IndexedObject,
) -> Option<ObsoleteReason> {
    let Some(run) = pending.get_mut(&object.run) else {
        return Some(ObsoleteReason::RunMissing);
    };
    match object.object_type {
        ObjectType::Data => {
            let full_path = object.full_path();
            let Some(file) = run.data.get(&full_path) else {
                return Some(ObsoleteReason::FileMissing);
            };
            if object.last_write_time >= file.last_write_time {
                run.data.remove(&full_path);
            }
            None
        }
        ObjectType::Metadata => {
            if run
                .meta
                .as_ref()
                .is_some_and(|meta| object.last_write_time >= meta.last_write_time)
            {
                run.meta = None;
            }
            None
        }
    }
}
