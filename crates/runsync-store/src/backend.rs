//! Storage backend abstraction
//!
//! A backend only knows how to enumerate files and hand out local copies.
//! Classification, filtering, caching and grouping live in
//! [`crate::RunStore`] on top of it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use runsync_common::{FileShot, Result};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Enumerates and materializes store files
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Prefix that turns a store-relative path into an absolute location
    fn absolute_base_path(&self) -> &str;

    /// Every file whose path starts with `prefix` (`""` for the whole store)
    fn traverse_under(&self, prefix: &str) -> BoxStream<'static, Result<FileShot>>;

    /// Every file in the store
    fn traverse_all(&self) -> BoxStream<'static, Result<FileShot>> {
        self.traverse_under("")
    }

    /// Make the file available on the local filesystem
    async fn materialize_local(&self, path: &str) -> Result<LocalFile>;
}

/// Local handle to a store file
///
/// A scratch copy is deleted when the handle is dropped.
#[derive(Debug)]
pub enum LocalFile {
    /// The store file itself
    Borrowed(PathBuf),
    /// A private copy in the scratch directory
    Scratch(TempPath),
}

impl LocalFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Borrowed(path) => path.as_path(),
            Self::Scratch(path) => &**path,
        }
    }
}
