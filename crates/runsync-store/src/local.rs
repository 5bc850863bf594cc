//! Local filesystem backend
//!
//! Traversal walks the root directory on the blocking pool and feeds a
//! bounded channel, so listings stream without holding the whole tree in
//! memory. Zero-length files are skipped: a producer has created them but
//! not written them yet.

use crate::backend::{LocalFile, StoreBackend};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use runsync_common::{Error, FileShot, Result};
use std::path::{Component, Path, PathBuf};
use tempfile::TempPath;
use tokio::sync::mpsc;
use walkdir::WalkDir;

const CHANNEL_DEPTH: usize = 256;

/// Run store rooted at a local directory
#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
    base_path: String,
    scratch_dir: Option<PathBuf>,
}

impl LocalBackend {
    /// Open a store rooted at `root`, which must be an existing directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(|e| {
            Error::configuration(format!("run store root {}: {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(Error::configuration(format!(
                "run store root {} is not a directory",
                root.display()
            )));
        }
        let base_path = format!("{}/", root.display());
        Ok(Self {
            root,
            base_path,
            scratch_dir: None,
        })
    }

    /// Copy files into `dir` before handing them out
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        self.scratch_dir = Some(dir);
        Ok(self)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::invalid_state(format!(
                "{path:?} is not a store-relative file path"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StoreBackend for LocalBackend {
    fn absolute_base_path(&self) -> &str {
        &self.base_path
    }

    fn traverse_under(&self, prefix: &str) -> BoxStream<'static, Result<FileShot>> {
        let start = Some((self.root.clone(), prefix.to_string()));
        let rx: Option<mpsc::Receiver<Result<FileShot>>> = None;
        stream::unfold((start, rx), |(mut start, mut rx)| async move {
            if let Some((root, prefix)) = start.take() {
                let (tx, new_rx) = mpsc::channel(CHANNEL_DEPTH);
                tokio::task::spawn_blocking(move || walk(&root, &prefix, &tx));
                rx = Some(new_rx);
            }
            let item = rx.as_mut()?.recv().await?;
            Some((item, (start, rx)))
        })
        .boxed()
    }

    async fn materialize_local(&self, path: &str) -> Result<LocalFile> {
        let source = self.resolve(path)?;
        let Some(scratch) = self.scratch_dir.clone() else {
            return match tokio::fs::metadata(&source).await {
                Ok(meta) if meta.is_file() => Ok(LocalFile::Borrowed(source)),
                Ok(_) => Err(Error::NotFound(path.to_string())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::NotFound(path.to_string()))
                }
                Err(e) => Err(e.into()),
            };
        };
        let temp = tokio::task::spawn_blocking(move || copy_to_scratch(&source, &scratch))
            .await
            .map_err(|e| Error::storage(format!("scratch copy task failed: {e}")))??;
        tracing::debug!(path, scratch = %temp.display(), "Materialized scratch copy");
        Ok(LocalFile::Scratch(temp))
    }
}

/// The scratch file is removed on drop, so an error anywhere after its
/// creation leaves nothing behind.
fn copy_to_scratch(source: &Path, scratch: &Path) -> Result<TempPath> {
    let suffix = source
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut temp = tempfile::Builder::new()
        .prefix("runsync-")
        .suffix(&suffix)
        .tempfile_in(scratch)?;
    let mut src = std::fs::File::open(source)?;
    std::io::copy(&mut src, temp.as_file_mut())?;
    Ok(temp.into_temp_path())
}

fn walk(root: &Path, prefix: &str, tx: &mpsc::Sender<Result<FileShot>>) {
    let start = match prefix.rfind('/') {
        Some(idx) => root.join(&prefix[..idx]),
        None => root.to_path_buf(),
    };
    if !start.is_dir() {
        return;
    }
    for entry in WalkDir::new(&start).sort_by_file_name() {
        let item = match entry {
            Ok(entry) => match to_shot(root, &entry) {
                Ok(Some(shot)) if shot.path.starts_with(prefix) => Ok(shot),
                Ok(_) => continue,
                Err(e) => Err(e),
            },
            Err(e) => Err(Error::Io(e.into())),
        };
        let failed = item.is_err();
        if tx.blocking_send(item).is_err() || failed {
            return;
        }
    }
}

fn to_shot(root: &Path, entry: &walkdir::DirEntry) -> Result<Option<FileShot>> {
    if !entry.file_type().is_file() {
        return Ok(None);
    }
    let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;
    if meta.len() == 0 {
        return Ok(None);
    }
    let Ok(relative) = entry.path().strip_prefix(root) else {
        return Ok(None);
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        let Some(part) = component.as_os_str().to_str() else {
            tracing::warn!(path = %entry.path().display(), "Skipping non UTF-8 path");
            return Ok(None);
        };
        parts.push(part);
    }
    let modified: DateTime<Utc> = meta.modified()?.into();
    Ok(Some(FileShot::new(parts.join("/"), modified.trunc_subsecs(0))))
}
