//! Per-run import
//!
//! [`ImportOrchestrator::import_run`] writes one Metadata object per run and
//! hands data files to a [`DataImporter`], which writes its own per-file
//! objects. Content parsing is delegated to pluggable importers.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use runsync_common::{
    Error, FileShot, IndexedObject, MetaValue, ObjectType, PARAMS_KEY, Result, RunData, Variables,
};
use runsync_index::{DataQuery, MetadataIndex};
use runsync_store::{ImportFilter, RunFile, RunStore};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// Shared collaborators for one import call
#[derive(Clone, Copy)]
pub struct ImportContext<'a> {
    pub store: &'a RunStore,
    pub index: &'a dyn MetadataIndex,
    /// Files imported at once within one run
    pub concurrency: usize,
}

/// Parses a run's metadata file
#[async_trait]
pub trait ParamsImporter: Send + Sync {
    async fn import_params(&self, local: &Path) -> Result<MetaValue>;
}

/// Metadata files are JSON documents
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonParamsImporter;

#[async_trait]
impl ParamsImporter for JsonParamsImporter {
    async fn import_params(&self, local: &Path) -> Result<MetaValue> {
        let bytes = tokio::fs::read(local).await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::import(local.display().to_string(), e.to_string()))?;
        Ok(MetaValue::from(value))
    }
}

/// Imports data file content and maintains per-file objects
#[async_trait]
pub trait DataImporter: ImportFilter {
    /// Import one local copy into `object`.
    ///
    /// Returns true when the object's variable set changed.
    async fn import(&self, local: &Path, object: &mut IndexedObject) -> Result<bool>;

    /// Import every file of a run. Returns true if any variable set changed.
    async fn import_run_data(
        &self,
        ctx: &ImportContext<'_>,
        run: &str,
        files: &[FileShot],
    ) -> Result<bool> {
        let imports: Vec<_> = files
            .iter()
            .map(|shot| import_data_file(self, ctx, run, shot))
            .collect();
        let changes: Vec<bool> = stream::iter(imports)
            .buffer_unordered(ctx.concurrency.max(1))
            .try_collect()
            .await?;
        Ok(changes.into_iter().any(|changed| changed))
    }

    /// Union, per importer, of the variable names of every Data object of
    /// the run
    async fn summary_metadata(&self, index: &dyn MetadataIndex, run: &str) -> Result<Variables> {
        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut objects = index.query_data_objects(run, DataQuery::default());
        while let Some(object) = objects.try_next().await? {
            for (importer, names) in object.meta.variables()? {
                merged.entry(importer).or_default().extend(names);
            }
        }
        Ok(merged
            .into_iter()
            .map(|(importer, names)| (importer, names.into_iter().collect()))
            .collect())
    }
}

async fn import_data_file<I>(
    importer: &I,
    ctx: &ImportContext<'_>,
    run: &str,
    shot: &FileShot,
) -> Result<bool>
where
    I: DataImporter + ?Sized,
{
    let file = ctx.store.classify(&shot.path, shot.last_write_time);
    let mut object =
        IndexedObject::for_file(run, file.path(), ObjectType::Data, file.last_write_time())?;
    if let Some(existing) = ctx.index.get_data_object(run, &object.path).await? {
        object.meta = existing.meta;
    }

    let local = ctx.store.materialize_local(file.path()).await?;
    let changed = importer.import(local.path(), &mut object).await?;
    drop(local);

    ctx.index.put_object(&object).await?;
    tracing::debug!(run, path = file.path(), changed, "Imported data file");
    Ok(changed)
}

/// What one `import_run` call did
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOutcome {
    pub run_path: String,
    pub meta_written: bool,
    pub data_files: usize,
    pub variables_changed: bool,
}

/// Per-run import driver
pub struct ImportOrchestrator {
    store: Arc<RunStore>,
    index: Arc<dyn MetadataIndex>,
    params: Arc<dyn ParamsImporter>,
    data: Arc<dyn DataImporter>,
    file_concurrency: usize,
}

impl ImportOrchestrator {
    pub fn new(
        store: Arc<RunStore>,
        index: Arc<dyn MetadataIndex>,
        params: Arc<dyn ParamsImporter>,
        data: Arc<dyn DataImporter>,
    ) -> Self {
        Self {
            store,
            index,
            params,
            data,
            file_concurrency: 8,
        }
    }

    #[must_use]
    pub fn with_file_concurrency(mut self, concurrency: usize) -> Self {
        self.file_concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    #[must_use]
    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    /// (Re)import one run.
    ///
    /// Data files are imported first so that a metadata object written in
    /// the same call summarizes them. Errors are returned to the caller and
    /// leave other runs untouched.
    pub async fn import_run(&self, run: RunData) -> Result<ImportOutcome> {
        let RunData {
            run_path,
            meta,
            mut data,
        } = run;

        if meta.is_some() && self.index.get_meta_object(&run_path).await?.is_none() {
            data = self
                .store
                .list_data_under(&run_path)
                .map_ok(RunFile::into_shot)
                .try_collect()
                .await?;
            tracing::debug!(run = %run_path, count = data.len(), "New run, discovered data files");
        }
        tracing::info!(run = %run_path, count = data.len(), meta = meta.is_some(), "Updating run");

        let ctx = ImportContext {
            store: &self.store,
            index: self.index.as_ref(),
            concurrency: self.file_concurrency,
        };
        let variables_changed = if data.is_empty() {
            false
        } else {
            self.data.import_run_data(&ctx, &run_path, &data).await?
        };

        let meta_written = match &meta {
            Some(meta) => {
                self.import_metadata(&run_path, meta).await?;
                true
            }
            None => {
                if variables_changed {
                    self.refresh_variables(&run_path).await?;
                }
                false
            }
        };

        Ok(ImportOutcome {
            run_path,
            meta_written,
            data_files: data.len(),
            variables_changed,
        })
    }

    async fn import_metadata(&self, run: &str, meta: &FileShot) -> Result<()> {
        let file = self.store.classify(&meta.path, meta.last_write_time);
        let mut object =
            IndexedObject::for_file(run, file.path(), ObjectType::Metadata, file.last_write_time())?;
        for (key, value) in file.path_metadata()? {
            object.meta.insert(key.clone(), value.clone());
        }

        let (params, variables) = tokio::try_join!(
            self.read_params(&file),
            self.data.summary_metadata(self.index.as_ref(), run)
        )?;
        object.meta.insert(PARAMS_KEY, params);
        object.meta.set_variables(&variables);

        self.index.put_object(&object).await
    }

    async fn read_params(&self, file: &RunFile) -> Result<MetaValue> {
        let local = self.store.materialize_local(file.path()).await?;
        self.params.import_params(local.path()).await
    }

    async fn refresh_variables(&self, run: &str) -> Result<()> {
        let Some(mut object) = self.index.get_meta_object(run).await? else {
            return Ok(());
        };
        let variables = self
            .data
            .summary_metadata(self.index.as_ref(), run)
            .await?;
        object.meta.set_variables(&variables);
        self.index.put_object(&object).await?;
        tracing::debug!(run, "Refreshed run variables");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use runsync_index::RedbIndex;
    use runsync_store::{LocalBackend, RunFileClassifier};
    use tempfile::TempDir;

    pub const PATTERN: &str = r"^(?<runId>(?<stamp>\d{4}-\d{2}-\d{2})_[^/]+)/params\.json$";

    /// Treats the first line of a `.data` file as its comma-separated
    /// variable names
    pub struct HeaderImporter;

    impl ImportFilter for HeaderImporter {
        fn can_import(&self, path: &str) -> bool {
            path.ends_with(".data")
        }
    }

    #[async_trait]
    impl DataImporter for HeaderImporter {
        async fn import(&self, local: &Path, object: &mut IndexedObject) -> Result<bool> {
            let text = tokio::fs::read_to_string(local).await?;
            let mut names: Vec<String> = text
                .lines()
                .next()
                .unwrap_or_default()
                .split(',')
                .map(str::to_string)
                .collect();
            names.sort();
            let before = object.meta.variables()?;
            let mut after = Variables::new();
            after.insert("header".to_string(), names);
            object.meta.set_variables(&after);
            Ok(before != after)
        }
    }

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    pub fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    pub struct Fixture {
        pub store_dir: TempDir,
        pub _index_dir: TempDir,
        pub store: Arc<RunStore>,
        pub index: Arc<RedbIndex>,
        pub orchestrator: Arc<ImportOrchestrator>,
    }

    pub fn fixture() -> Fixture {
        fixture_with(PATTERN)
    }

    pub fn fixture_with(pattern: &str) -> Fixture {
        let store_dir = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(store_dir.path()).unwrap();
        let store = Arc::new(RunStore::new(
            Arc::new(backend),
            RunFileClassifier::new(pattern).unwrap(),
            Arc::new(HeaderImporter),
        ));
        let index = Arc::new(RedbIndex::open(index_dir.path().join("index.redb")).unwrap());
        let orchestrator = Arc::new(ImportOrchestrator::new(
            store.clone(),
            index.clone(),
            Arc::new(JsonParamsImporter),
            Arc::new(HeaderImporter),
        ));
        Fixture {
            store_dir,
            _index_dir: index_dir,
            store,
            index,
            orchestrator,
        }
    }

    fn run_data(run: &str, meta: Option<&str>, data: &[&str]) -> RunData {
        RunData {
            run_path: run.to_string(),
            meta: meta.map(|p| FileShot::new(p, t(10))),
            data: data.iter().map(|p| FileShot::new(*p, t(10))).collect(),
        }
    }

    #[tokio::test]
    async fn test_new_run_discovers_data_files() {
        let f = fixture();
        let root = f.store_dir.path();
        write(root, "2024-01-01_exp/params.json", r#"{"speed": 3}"#);
        write(root, "2024-01-01_exp/a.data", "t,x");
        write(root, "2024-01-01_exp/sub/b.data", "t,y");

        let outcome = f
            .orchestrator
            .import_run(run_data("2024-01-01_exp", Some("2024-01-01_exp/params.json"), &[]))
            .await
            .unwrap();
        assert!(outcome.meta_written);
        assert_eq!(outcome.data_files, 2);

        let meta = f.index.get_meta_object("2024-01-01_exp").await.unwrap().unwrap();
        assert_eq!(meta.path, "params.json");
        assert_eq!(meta.meta.get_str("stamp").unwrap(), "2024-01-01");
        let MetaValue::Map(params) = meta.meta.get(PARAMS_KEY).unwrap() else {
            panic!("params should be a map");
        };
        assert_eq!(params["speed"], MetaValue::Int(3));
        assert_eq!(
            meta.meta.variables().unwrap()["header"],
            vec!["t", "x", "y"]
        );
        assert!(
            f.index
                .get_data_object("2024-01-01_exp", "sub/b.data")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_known_run_imports_listed_files_only() {
        let f = fixture();
        let root = f.store_dir.path();
        write(root, "2024-01-01_exp/params.json", "{}");
        write(root, "2024-01-01_exp/a.data", "t,x");
        f.orchestrator
            .import_run(run_data("2024-01-01_exp", Some("2024-01-01_exp/params.json"), &[]))
            .await
            .unwrap();

        write(root, "2024-01-01_exp/b.data", "t,z");
        write(root, "2024-01-01_exp/c.data", "t");
        let outcome = f
            .orchestrator
            .import_run(run_data(
                "2024-01-01_exp",
                Some("2024-01-01_exp/params.json"),
                &["2024-01-01_exp/b.data"],
            ))
            .await
            .unwrap();
        assert_eq!(outcome.data_files, 1);
        assert!(
            f.index
                .get_data_object("2024-01-01_exp", "c.data")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_variables_refresh_without_meta() {
        let f = fixture();
        let root = f.store_dir.path();
        write(root, "2024-01-01_exp/params.json", "{}");
        write(root, "2024-01-01_exp/a.data", "t,x");
        f.orchestrator
            .import_run(run_data("2024-01-01_exp", Some("2024-01-01_exp/params.json"), &[]))
            .await
            .unwrap();

        write(root, "2024-01-01_exp/a.data", "t,x,w");
        let outcome = f
            .orchestrator
            .import_run(run_data("2024-01-01_exp", None, &["2024-01-01_exp/a.data"]))
            .await
            .unwrap();
        assert!(outcome.variables_changed);
        assert!(!outcome.meta_written);

        let meta = f.index.get_meta_object("2024-01-01_exp").await.unwrap().unwrap();
        assert_eq!(meta.meta.variables().unwrap()["header"], vec!["t", "w", "x"]);
    }

    #[tokio::test]
    async fn test_unchanged_variables_skip_refresh() {
        let f = fixture();
        let root = f.store_dir.path();
        write(root, "2024-01-01_exp/a.data", "t,x");
        let outcome = f
            .orchestrator
            .import_run(run_data("2024-01-01_exp", None, &["2024-01-01_exp/a.data"]))
            .await
            .unwrap();
        assert!(outcome.variables_changed);
        let outcome = f
            .orchestrator
            .import_run(run_data("2024-01-01_exp", None, &["2024-01-01_exp/a.data"]))
            .await
            .unwrap();
        assert!(!outcome.variables_changed);
        assert!(f.index.get_meta_object("2024-01-01_exp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_params_fail_the_run() {
        let f = fixture();
        write(f.store_dir.path(), "2024-01-01_exp/params.json", "not json");
        let err = f
            .orchestrator
            .import_run(run_data("2024-01-01_exp", Some("2024-01-01_exp/params.json"), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Import { .. }));
        assert!(f.index.get_meta_object("2024-01-01_exp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_data_file_fails_the_run() {
        let f = fixture();
        let err = f
            .orchestrator
            .import_run(run_data("2024-01-01_exp", None, &["2024-01-01_exp/gone.data"]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
