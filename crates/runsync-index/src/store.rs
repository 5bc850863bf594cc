//! Embedded metadata index backed by redb.
//!
//! Objects live in one table keyed so that a run's Metadata object and its
//! Data objects sort together: `m\0{run}` and `d\0{run}\0{path}`. Listings
//! page through the table in key order with one read transaction per page,
//! so long scans never pin a snapshot for their whole duration.

use crate::index::{DataQuery, MetadataIndex};
use crate::tables;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt, future};
use redb::{Database, ReadableTable};
use runsync_common::{Error, IndexedObject, ObjectType, Result, parent_dirs, relative_to_run};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

const PAGE_SIZE: usize = 256;

/// Error type for index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for IndexError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Io(e) => Self::Io(e),
            IndexError::Json(e) => Self::Serialization(e.to_string()),
            other => Self::storage(other.to_string()),
        }
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

fn meta_key(run: &str) -> String {
    format!("m\0{run}")
}

fn data_key(run: &str, path: &str) -> String {
    format!("d\0{run}\0{path}")
}

fn object_key(object: &IndexedObject) -> String {
    match object.object_type {
        ObjectType::Metadata => meta_key(&object.run),
        ObjectType::Data => data_key(&object.run, &object.path),
    }
}

struct Page {
    objects: Vec<IndexedObject>,
    last_key: Option<String>,
}

/// Metadata index stored in a single redb file
#[derive(Clone)]
pub struct RedbIndex {
    db: Arc<Database>,
}

impl RedbIndex {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::OBJECTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get(&self, key: &str) -> IndexResult<Option<IndexedObject>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::OBJECTS)?;
        match table.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, object: &IndexedObject) -> IndexResult<()> {
        let bytes = serde_json::to_vec(object)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::OBJECTS)?;
            table.insert(object_key(object).as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn read_page(
        &self,
        lower: &Bound<String>,
        upper: &Bound<String>,
        descending: bool,
    ) -> IndexResult<Page> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::OBJECTS)?;
        let range = table.range::<&str>((
            lower.as_ref().map(String::as_str),
            upper.as_ref().map(String::as_str),
        ))?;
        let entries: Box<dyn Iterator<Item = _>> = if descending {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let mut objects = Vec::with_capacity(PAGE_SIZE);
        let mut last_key = None;
        for entry in entries.take(PAGE_SIZE) {
            let (key, value) = entry?;
            objects.push(serde_json::from_slice(value.value())?);
            last_key = Some(key.value().to_string());
        }
        if objects.len() < PAGE_SIZE {
            last_key = None;
        }
        Ok(Page { objects, last_key })
    }

    /// Page lazily through `[lower, upper)` in key order
    fn scan(
        &self,
        lower: Bound<String>,
        upper: Bound<String>,
        descending: bool,
    ) -> BoxStream<'_, Result<IndexedObject>> {
        stream::try_unfold(Some((lower, upper)), move |cursor| async move {
            let Some((lower, upper)) = cursor else {
                return Ok(None);
            };
            let page = self.read_page(&lower, &upper, descending)?;
            let next = page.last_key.map(|key| {
                if descending {
                    (lower, Bound::Excluded(key))
                } else {
                    (Bound::Excluded(key), upper)
                }
            });
            Ok::<_, Error>(Some((page.objects, next)))
        })
        .map_ok(|objects| stream::iter(objects.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

#[async_trait]
impl MetadataIndex for RedbIndex {
    async fn get_meta_object(&self, run: &str) -> Result<Option<IndexedObject>> {
        Ok(self.get(&meta_key(run))?)
    }

    async fn get_data_object(&self, run: &str, path: &str) -> Result<Option<IndexedObject>> {
        Ok(self.get(&data_key(run, path))?)
    }

    async fn put_object(&self, object: &IndexedObject) -> Result<()> {
        self.put(object)?;
        tracing::debug!(
            run = %object.run,
            path = %object.path,
            kind = %object.object_type,
            "Indexed object"
        );
        Ok(())
    }

    fn get_all_objects(&self) -> BoxStream<'_, Result<IndexedObject>> {
        self.scan(Bound::Unbounded, Bound::Unbounded, false)
    }

    fn query_data_objects(
        &self,
        run: &str,
        query: DataQuery,
    ) -> BoxStream<'_, Result<IndexedObject>> {
        let prefix = query.path_prefix.clone().unwrap_or_default();
        let limit = query.limit;
        let lower = Bound::Included(data_key(run, &prefix));
        // '\x01' sorts right after the '\0' separator ending this run's keys
        let upper = Bound::Excluded(format!("d\0{run}\x01"));
        let matching = self
            .scan(lower, upper, query.descending)
            .try_filter(move |object| {
                future::ready(object.path.starts_with(&prefix) && query.accepts(object))
            });
        match limit {
            Some(limit) => matching.take(limit).boxed(),
            None => matching.boxed(),
        }
    }

    async fn get_run(&self, path: &str) -> Result<Option<String>> {
        for dir in parent_dirs(path) {
            let Some(rest) = relative_to_run(dir, path) else {
                continue;
            };
            if self.get(&data_key(dir, rest))?.is_some() {
                return Ok(Some(dir.to_string()));
            }
            if self
                .get(&meta_key(dir))?
                .is_some_and(|meta| meta.path == rest)
            {
                return Ok(Some(dir.to_string()));
            }
        }
        Ok(None)
    }
}
