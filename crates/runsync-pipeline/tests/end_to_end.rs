//! Full scan from an empty index through to a current one

use async_trait::async_trait;
use runsync_common::config::PipelineConfig;
use runsync_common::{IndexedObject, ObjectType, Result, Signal, Variables};
use runsync_index::{MetadataIndex, RedbIndex};
use runsync_pipeline::{
    DataImporter, ImportOrchestrator, JsonParamsImporter, Pipeline, PipelineJournal,
    ReconciliationEngine,
};
use runsync_store::{ImportFilter, LocalBackend, RunFileClassifier, RunStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PATTERN: &str = r"^(?<runId>\d{4}-\d{2}-\d{2}_[^/]+)/params\.json$";

struct LineCountImporter;

impl ImportFilter for LineCountImporter {
    fn can_import(&self, path: &str) -> bool {
        path.ends_with(".data")
    }
}

#[async_trait]
impl DataImporter for LineCountImporter {
    async fn import(&self, local: &Path, object: &mut IndexedObject) -> Result<bool> {
        let text = tokio::fs::read_to_string(local).await?;
        object.meta.insert("lines", i64::try_from(text.lines().count()).unwrap_or(i64::MAX));
        let before = object.meta.variables()?;
        let mut after = Variables::new();
        after.insert("lines".to_string(), vec!["count".to_string()]);
        object.meta.set_variables(&after);
        Ok(before != after)
    }
}

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

#[tokio::test]
async fn test_full_scan_imports_then_settles() {
    let store_dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    write(store_dir.path(), "2024-01-01_exp/params.json", r#"{"gain": 2}"#);
    write(store_dir.path(), "2024-01-01_exp/out.data", "1\n2\n3\n");

    let filter = Arc::new(LineCountImporter);
    let store = Arc::new(RunStore::new(
        Arc::new(LocalBackend::new(store_dir.path()).unwrap()),
        RunFileClassifier::new(PATTERN).unwrap(),
        filter.clone(),
    ));
    let index = Arc::new(RedbIndex::open(state_dir.path().join("index.redb")).unwrap());
    let orchestrator = Arc::new(ImportOrchestrator::new(
        store.clone(),
        index.clone(),
        Arc::new(JsonParamsImporter),
        filter,
    ));
    let journal = PipelineJournal::open(state_dir.path().join("journal.redb")).unwrap();
    let config = PipelineConfig {
        threshold_seconds: 0,
        ..PipelineConfig::default()
    };
    let mut pipeline =
        Pipeline::new(orchestrator, journal.clone(), &config, uuid::Uuid::new_v4()).unwrap();

    journal.enqueue(&Signal::Full).unwrap();
    let first = pipeline.step().await.unwrap();
    let summary = first.full_scan.unwrap();
    assert!(summary.ok);
    assert_eq!(summary.runs, 1);
    assert_eq!(summary.failures, 0);

    let meta = index.get_meta_object("2024-01-01_exp").await.unwrap().unwrap();
    assert_eq!(meta.object_type, ObjectType::Metadata);
    assert_eq!(meta.meta.variables().unwrap()["lines"], vec!["count"]);
    let data = index
        .get_data_object("2024-01-01_exp", "out.data")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.meta.get_int("lines").unwrap(), 3);

    journal.enqueue(&Signal::Full).unwrap();
    let second = pipeline.step().await.unwrap();
    assert_eq!(second.full_scan.unwrap().runs, 0);

    let engine = ReconciliationEngine::new(store, index);
    assert!(engine.diff().await.unwrap().imports.is_empty());
}
