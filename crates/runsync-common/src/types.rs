//! Core data model
//!
//! Paths are relative to the store root and always use `/` separators.

use crate::error::{Error, Result};
use crate::value::MetaBag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed snapshot identity of one file
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShot {
    pub path: String,
    pub last_write_time: DateTime<Utc>,
}

impl FileShot {
    pub fn new(path: impl Into<String>, last_write_time: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            last_write_time,
        }
    }
}

/// A unit of import work: (re)import these files for this run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    pub run_path: String,
    pub meta: Option<FileShot>,
    pub data: Vec<FileShot>,
}

impl RunData {
    pub fn new(run_path: impl Into<String>) -> Self {
        Self {
            run_path: run_path.into(),
            meta: None,
            data: Vec::new(),
        }
    }

    /// True when there is nothing left to import
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.is_none() && self.data.is_empty()
    }
}

/// Kind of an indexed object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Data,
    Metadata,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("data"),
            Self::Metadata => f.write_str("metadata"),
        }
    }
}

/// Persisted unit of the metadata index, keyed by (run, path, type)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedObject {
    /// Run directory, relative to the store root
    pub run: String,
    /// File path relative to `run`
    pub path: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub last_write_time: DateTime<Utc>,
    #[serde(default)]
    pub meta: MetaBag,
}

impl IndexedObject {
    /// Build an object for a store file that lives under `run`.
    ///
    /// Fails with [`Error::InvalidState`] when `file_path` is not inside the
    /// run directory.
    pub fn for_file(
        run: &str,
        file_path: &str,
        object_type: ObjectType,
        last_write_time: DateTime<Utc>,
    ) -> Result<Self> {
        let path = relative_to_run(run, file_path).ok_or_else(|| {
            Error::invalid_state(format!("file {file_path} is not under run {run}"))
        })?;
        Ok(Self {
            run: run.to_string(),
            path: path.to_string(),
            object_type,
            last_write_time,
            meta: MetaBag::new(),
        })
    }

    /// Store path of the underlying file
    #[must_use]
    pub fn full_path(&self) -> String {
        if self.run.is_empty() {
            self.path.clone()
        } else {
            format!("{}/{}", self.run, self.path)
        }
    }
}

/// Path of `file_path` relative to `run`, when it lies strictly inside it
#[must_use]
pub fn relative_to_run<'a>(run: &str, file_path: &'a str) -> Option<&'a str> {
    if run.is_empty() {
        return (!file_path.is_empty()).then_some(file_path);
    }
    file_path
        .strip_prefix(run)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

/// Directories that could own `path`, deepest first, ending with the root `""`
///
/// `"b/d/e.csv"` yields `"b/d"`, `"b"`, `""`. Walking this sequence and
/// stopping at the first known run gives the longest-prefix owner.
pub fn parent_dirs(path: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(path);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.rfind('/') {
            Some(idx) => {
                let parent = &current[..idx];
                rest = Some(parent);
                Some(parent)
            }
            None if current.is_empty() => {
                rest = None;
                None
            }
            None => {
                rest = None;
                Some("")
            }
        }
    })
}

/// True when `dir` is a strict ancestor directory of `path`
#[must_use]
pub fn is_ancestor_dir(dir: &str, path: &str) -> bool {
    if dir.is_empty() {
        return !path.is_empty();
    }
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
}

/// External signal consumed by the pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Signal {
    /// A file was written
    Change(FileShot),
    /// Reconcile the whole store against the index
    Full,
}
