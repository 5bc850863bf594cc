//! Metadata index contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use runsync_common::{IndexedObject, Result};

/// Filter for [`MetadataIndex::query_data_objects`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataQuery {
    /// Only paths (relative to the run) starting with this prefix
    pub path_prefix: Option<String>,
    /// Only objects written at or after this time
    pub modified_since: Option<DateTime<Utc>>,
    /// Reverse path order
    pub descending: bool,
    pub limit: Option<usize>,
}

impl DataQuery {
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub(crate) fn accepts(&self, object: &IndexedObject) -> bool {
        self.modified_since
            .is_none_or(|since| object.last_write_time >= since)
    }
}

/// Persisted per-(run, file) objects
///
/// Implementations provide per-object atomicity only; callers never rely on
/// multi-object transactions.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// The run's Metadata object, if indexed
    async fn get_meta_object(&self, run: &str) -> Result<Option<IndexedObject>>;

    /// A Data object by run and run-relative path
    async fn get_data_object(&self, run: &str, path: &str) -> Result<Option<IndexedObject>>;

    /// Insert or replace by (run, path, type)
    async fn put_object(&self, object: &IndexedObject) -> Result<()>;

    /// Every indexed object, lazily
    fn get_all_objects(&self) -> BoxStream<'_, Result<IndexedObject>>;

    /// Data objects of one run, lazily
    fn query_data_objects(
        &self,
        run: &str,
        query: DataQuery,
    ) -> BoxStream<'_, Result<IndexedObject>>;

    /// Run owning an indexed object at the full store `path`
    async fn get_run(&self, path: &str) -> Result<Option<String>>;
}
