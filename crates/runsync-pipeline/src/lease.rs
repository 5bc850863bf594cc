//! Exclusive pipeline lease.
//!
//! Exactly one actor may own a pipeline state directory. The lease is an
//! exclusive, non-blocking file lock on `pipeline.lock` (via `fs2`) plus a
//! JSON sidecar describing the holder.

use chrono::Utc;
use fs2::FileExt;
use runsync_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LOCK_FILE: &str = "pipeline.lock";
pub const SIDECAR_FILE: &str = "pipeline.lock.json";

/// Holder description written next to the lock file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub pid: u32,
    pub instance_id: Uuid,
    pub acquired_at: String,
}

/// Held lease; released when dropped
pub struct PipelineLease {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
    instance_id: Uuid,
}

impl PipelineLease {
    /// Try to become the single active pipeline for `state_dir`.
    ///
    /// Fails immediately with [`Error::LeaseHeld`] if another instance owns
    /// it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let lock_path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let instance_id = Uuid::new_v4();
                info!(path = %lock_path.display(), %instance_id, "Acquired pipeline lease");
                let sidecar_path = write_sidecar(state_dir, instance_id);
                Ok(Self {
                    _file: file,
                    lock_path,
                    sidecar_path,
                    instance_id,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let holder = read_holder(state_dir)
                    .map(|h| format!(" (pid {}, instance {})", h.pid, h.instance_id))
                    .unwrap_or_default();
                Err(Error::LeaseHeld(format!("{}{holder}", lock_path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        debug!(path = %self.lock_path.display(), "Releasing pipeline lease");
        if let Some(path) = &self.sidecar_path
            && let Err(e) = fs::remove_file(path)
        {
            debug!(path = %path.display(), error = %e, "Failed to remove lease sidecar");
        }
        // closing the file drops the flock
    }
}

impl std::fmt::Debug for PipelineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLease")
            .field("lock_path", &self.lock_path)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

fn write_sidecar(state_dir: &Path, instance_id: Uuid) -> Option<PathBuf> {
    let holder = LeaseHolder {
        pid: std::process::id(),
        instance_id,
        acquired_at: Utc::now().to_rfc3339(),
    };
    let path = state_dir.join(SIDECAR_FILE);
    match serde_json::to_vec_pretty(&holder)
        .map_err(io::Error::other)
        .and_then(|payload| fs::write(&path, payload))
    {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to write lease sidecar");
            None
        }
    }
}

/// Current holder, if a sidecar is present and readable
#[must_use]
pub fn read_holder(state_dir: &Path) -> Option<LeaseHolder> {
    let bytes = fs::read(state_dir.join(SIDECAR_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}
