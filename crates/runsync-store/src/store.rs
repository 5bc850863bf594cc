//! Run store: classification, filtering, caching and run grouping over a
//! [`StoreBackend`]

use crate::backend::{LocalFile, StoreBackend};
use crate::classifier::{RunFile, RunFileClassifier};
use crate::filter::ImportFilter;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt, future};
use runsync_common::{Error, Result, RunData, is_ancestor_dir, parent_dirs};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Per-run aggregate built during one traversal. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunRecord {
    pub run_path: String,
    pub meta: Option<RunFile>,
    pub data: Vec<RunFile>,
}

impl RunRecord {
    #[must_use]
    pub fn into_run_data(self) -> RunData {
        RunData {
            run_path: self.run_path,
            meta: self.meta.map(RunFile::into_shot),
            data: self.data.into_iter().map(RunFile::into_shot).collect(),
        }
    }
}

/// File store view used by the pipeline
pub struct RunStore {
    backend: Arc<dyn StoreBackend>,
    classifier: RunFileClassifier,
    filter: Arc<dyn ImportFilter>,
    cache_all: bool,
    listing: OnceCell<Arc<Vec<RunFile>>>,
}

impl RunStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        classifier: RunFileClassifier,
        filter: Arc<dyn ImportFilter>,
    ) -> Self {
        Self {
            backend,
            classifier,
            filter,
            cache_all: false,
            listing: OnceCell::new(),
        }
    }

    /// Memoize the first full listing for the lifetime of this store
    #[must_use]
    pub const fn with_cache_all(mut self, cache_all: bool) -> Self {
        self.cache_all = cache_all;
        self
    }

    #[must_use]
    pub fn absolute_base_path(&self) -> &str {
        self.backend.absolute_base_path()
    }

    /// Store-relative form of an absolute location, if it lies in the store
    #[must_use]
    pub fn relative_path(&self, absolute: &str) -> Option<String> {
        let normalized = absolute.replace('\\', "/");
        normalized
            .strip_prefix(self.absolute_base_path())
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }

    /// Classify a path and mark it as data if the filter accepts it
    #[must_use]
    pub fn classify(&self, path: &str, last_write_time: DateTime<Utc>) -> RunFile {
        self.classifier
            .classify(path, last_write_time)
            .with_data(self.can_import(path))
    }

    #[must_use]
    pub fn can_import(&self, path: &str) -> bool {
        self.filter.can_import(path)
    }

    /// Every file that is metadata, importable data or both
    pub async fn list_all(&self) -> Result<Vec<RunFile>> {
        if self.cache_all {
            return Ok(self.cached_listing().await?.as_ref().clone());
        }
        self.traverse("").try_collect().await
    }

    /// Importable data files below `run_path` (`""` for the whole store)
    pub fn list_data_under(&self, run_path: &str) -> BoxStream<'_, Result<RunFile>> {
        let prefix = run_prefix(run_path);
        if self.cache_all {
            return stream::once(self.cached_listing())
                .map_ok(move |files| {
                    let matching: Vec<Result<RunFile>> = files
                        .iter()
                        .filter(|f| f.is_data() && f.path().starts_with(&prefix))
                        .cloned()
                        .map(Ok)
                        .collect();
                    stream::iter(matching)
                })
                .try_flatten()
                .boxed();
        }
        self.traverse(&prefix)
            .try_filter(|file| future::ready(file.is_data()))
            .boxed()
    }

    /// Group the current listing by run
    pub async fn group_by_run(&self) -> Result<Vec<RunRecord>> {
        Ok(group_files(self.list_all().await?))
    }

    pub async fn materialize_local(&self, path: &str) -> Result<LocalFile> {
        self.backend.materialize_local(path).await
    }

    async fn cached_listing(&self) -> Result<Arc<Vec<RunFile>>> {
        self.listing
            .get_or_try_init(|| async {
                let files: Vec<RunFile> = self.traverse("").try_collect().await?;
                tracing::info!(count = files.len(), "Cached full store listing");
                Ok::<_, Error>(Arc::new(files))
            })
            .await
            .cloned()
    }

    fn traverse(&self, prefix: &str) -> BoxStream<'_, Result<RunFile>> {
        let shots = if prefix.is_empty() {
            self.backend.traverse_all()
        } else {
            self.backend.traverse_under(prefix)
        };
        shots
            .try_filter_map(move |shot| {
                let file = self.classify(&shot.path, shot.last_write_time);
                let keep = file.is_metadata() || file.is_data();
                future::ready(Ok(keep.then_some(file)))
            })
            .boxed()
    }
}

fn run_prefix(run_path: &str) -> String {
    if run_path.is_empty() {
        String::new()
    } else {
        format!("{run_path}/")
    }
}

/// Two-phase grouping.
///
/// Phase one keeps every metadata file whose run has no ancestor run; when
/// runs nest, the outer one wins regardless of listing order. Phase two
/// hands each data file to the deepest kept run containing it; files under
/// no run are dropped. A metadata file that is also data takes part in both
/// phases.
#[must_use]
pub fn group_files(files: impl IntoIterator<Item = RunFile>) -> Vec<RunRecord> {
    let files: Vec<RunFile> = files.into_iter().collect();
    let mut metas: Vec<RunFile> = files.iter().filter(|f| f.is_metadata()).cloned().collect();
    let data = files.into_iter().filter(RunFile::is_data);

    // Ancestors have shorter paths, so they are seen before their descendants.
    metas.sort_by(|a, b| {
        let (ra, rb) = (run_of(a), run_of(b));
        ra.len()
            .cmp(&rb.len())
            .then_with(|| ra.cmp(rb))
            .then_with(|| a.path().cmp(b.path()))
    });

    let mut runs: BTreeMap<String, RunRecord> = BTreeMap::new();
    for meta in metas {
        let run = run_of(&meta).to_string();
        if runs.contains_key(&run) {
            tracing::warn!(run = %run, path = meta.path(), "Run already has a metadata file");
            continue;
        }
        if let Some(outer) = runs.keys().find(|outer| is_ancestor_dir(outer, &run)) {
            tracing::debug!(run = %run, outer = %outer, "Nested run discarded");
            continue;
        }
        runs.insert(
            run.clone(),
            RunRecord {
                run_path: run,
                meta: Some(meta),
                data: Vec::new(),
            },
        );
    }

    for file in data {
        let owner = parent_dirs(file.path()).find(|dir| runs.contains_key(*dir));
        match owner.and_then(|dir| runs.get_mut(dir)) {
            Some(record) => record.data.push(file),
            None => tracing::debug!(path = file.path(), "Data file outside any run"),
        }
    }

    runs.into_values().collect()
}

fn run_of(file: &RunFile) -> &str {
    file.run_path().unwrap_or_default()
}
