//! Durable signal journal backed by redb.
//!
//! Producers append signals with a monotonically increasing sequence
//! number. The actor reads past its acknowledged cursor and, at the end of
//! each iteration, commits its state, the new cursor and the deletion of
//! every consumed signal in one write transaction. Anything read but not
//! checkpointed is delivered again after a restart.

use crate::state::PipelineState;
use chrono::{DateTime, TimeZone, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use runsync_common::{Error, Result, Signal};
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

// Key: sequence number, Value: bincode-encoded StoredEntry
const SIGNALS: TableDefinition<u64, &[u8]> = TableDefinition::new("signals");
// Key: counter name
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
// Key: "state", Value: bincode-encoded PipelineState
const CHECKPOINT: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoint");

const NEXT_SEQ: &str = "next_seq";
const CURSOR: &str = "cursor";
const STATE: &str = "state";

/// Error type for journal operations
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
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
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for JournalError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<JournalError> for Error {
    fn from(e: JournalError) -> Self {
        match e {
            JournalError::Io(e) => Self::Io(e),
            JournalError::Bincode(e) => Self::Serialization(e.to_string()),
            other => Self::storage(other.to_string()),
        }
    }
}

pub type JournalResult<T> = std::result::Result<T, JournalError>;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    enqueued_at_ms: i64,
    payload: Vec<u8>,
}

/// One journaled signal, possibly malformed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl JournalEntry {
    pub fn decode(&self) -> std::result::Result<Signal, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Last committed iteration boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub state: PipelineState,
    /// Highest acknowledged sequence number
    pub cursor: u64,
}

/// Shared handle to the journal database
#[derive(Clone)]
pub struct PipelineJournal {
    db: Arc<Database>,
    notify: Arc<Notify>,
    #[cfg(test)]
    refused_checkpoints: Arc<std::sync::atomic::AtomicUsize>,
}

impl PipelineJournal {
    /// Open (or create) the journal at the given path.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(SIGNALS)?;
            let _t = write_txn.open_table(COUNTERS)?;
            let _t = write_txn.open_table(CHECKPOINT)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            notify: Arc::new(Notify::new()),
            #[cfg(test)]
            refused_checkpoints: Arc::default(),
        })
    }

    /// Append a signal stamped with the current time
    pub fn enqueue(&self, signal: &Signal) -> Result<u64> {
        self.enqueue_at(signal, Utc::now())
    }

    pub fn enqueue_at(&self, signal: &Signal, at: DateTime<Utc>) -> Result<u64> {
        let payload = serde_json::to_vec(signal)?;
        self.enqueue_raw(&payload, at)
    }

    /// Append an undecoded payload
    pub fn enqueue_raw(&self, payload: &[u8], at: DateTime<Utc>) -> Result<u64> {
        let seq = self.append(payload, at)?;
        self.notify.notify_one();
        Ok(seq)
    }

    fn append(&self, payload: &[u8], at: DateTime<Utc>) -> JournalResult<u64> {
        let entry = StoredEntry {
            enqueued_at_ms: at.timestamp_millis(),
            payload: payload.to_vec(),
        };
        let bytes = bincode::serialize(&entry)?;
        let write_txn = self.db.begin_write()?;
        let seq = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(NEXT_SEQ)?.map_or(1, |v| v.value());
            counters.insert(NEXT_SEQ, seq + 1)?;
            let mut signals = write_txn.open_table(SIGNALS)?;
            signals.insert(seq, bytes.as_slice())?;
            seq
        };
        write_txn.commit()?;
        Ok(seq)
    }

    /// First entry after `cursor`, if any
    pub fn next_after(&self, cursor: u64) -> Result<Option<JournalEntry>> {
        Ok(self.read_next(cursor)?)
    }

    fn read_next(&self, cursor: u64) -> JournalResult<Option<JournalEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SIGNALS)?;
        let mut range = table.range::<u64>((Bound::Excluded(cursor), Bound::Unbounded))?;
        let Some(entry) = range.next() else {
            return Ok(None);
        };
        let (seq, value) = entry?;
        let stored: StoredEntry = bincode::deserialize(value.value())?;
        Ok(Some(JournalEntry {
            seq: seq.value(),
            enqueued_at: Utc
                .timestamp_millis_opt(stored.enqueued_at_ms)
                .single()
                .unwrap_or_default(),
            payload: stored.payload,
        }))
    }

    /// Wait for the first entry after `cursor`
    pub async fn recv_after(&self, cursor: u64) -> Result<JournalEntry> {
        loop {
            if let Some(entry) = self.next_after(cursor)? {
                return Ok(entry);
            }
            // a permit left by an earlier enqueue only costs one extra check
            self.notify.notified().await;
        }
    }

    /// Number of signals not yet acknowledged
    pub fn pending(&self) -> Result<u64> {
        let read_txn = self.db.begin_read().map_err(JournalError::from)?;
        let table = read_txn.open_table(SIGNALS).map_err(JournalError::from)?;
        Ok(table.len().map_err(JournalError::from)?)
    }

    /// Last committed checkpoint, `None` on first start
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.read_checkpoint()?)
    }

    fn read_checkpoint(&self) -> JournalResult<Option<Checkpoint>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHECKPOINT)?;
        let Some(bytes) = table.get(STATE)? else {
            return Ok(None);
        };
        let state: PipelineState = bincode::deserialize(bytes.value())?;
        let counters = read_txn.open_table(COUNTERS)?;
        let cursor = counters.get(CURSOR)?.map_or(0, |v| v.value());
        Ok(Some(Checkpoint { state, cursor }))
    }

    /// Persist `state`, acknowledge every signal up to `cursor` and delete
    /// them, atomically
    pub fn checkpoint(&self, state: &PipelineState, cursor: u64) -> Result<()> {
        #[cfg(test)]
        if self.take_refused_checkpoint() {
            return Err(Error::storage("checkpoint refused"));
        }
        Ok(self.write_checkpoint(state, cursor)?)
    }

    /// Make the next `count` checkpoints fail without touching the database
    #[cfg(test)]
    pub(crate) fn refuse_checkpoints(&self, count: usize) {
        self.refused_checkpoints
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_refused_checkpoint(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.refused_checkpoints
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write_checkpoint(&self, state: &PipelineState, cursor: u64) -> JournalResult<()> {
        let bytes = bincode::serialize(state)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINT)?;
            table.insert(STATE, bytes.as_slice())?;

            let mut counters = write_txn.open_table(COUNTERS)?;
            counters.insert(CURSOR, cursor)?;

            let mut signals = write_txn.open_table(SIGNALS)?;
            let consumed = signals
                .range(..=cursor)?
                .map(|entry| entry.map(|(seq, _)| seq.value()))
                .collect::<std::result::Result<Vec<u64>, _>>()?;
            for seq in consumed {
                signals.remove(seq)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runsync_common::FileShot;
    use tempfile::TempDir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change(path: &str, secs: i64) -> Signal {
        Signal::Change(FileShot::new(path, t(secs)))
    }

    #[test]
    fn test_delivery_in_enqueue_order() {
        let dir = TempDir::new().unwrap();
        let journal = PipelineJournal::open(dir.path().join("journal.redb")).unwrap();
        journal.enqueue_at(&change("a", 1), t(100)).unwrap();
        journal.enqueue_at(&Signal::Full, t(101)).unwrap();

        let first = journal.next_after(0).unwrap().unwrap();
        assert_eq!(first.decode().unwrap(), change("a", 1));
        assert_eq!(first.enqueued_at, t(100));
        let second = journal.next_after(first.seq).unwrap().unwrap();
        assert_eq!(second.decode().unwrap(), Signal::Full);
        assert!(journal.next_after(second.seq).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_acknowledges_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.redb");
        let journal = PipelineJournal::open(&path).unwrap();
        assert!(journal.load().unwrap().is_none());

        let a = journal.enqueue_at(&change("a", 1), t(1)).unwrap();
        let b = journal.enqueue_at(&change("b", 1), t(2)).unwrap();
        let mut state = PipelineState::new(5, 1);
        state.run_cache.touch("r", t(1));
        journal.checkpoint(&state, a).unwrap();

        assert_eq!(journal.pending().unwrap(), 1);
        assert_eq!(journal.next_after(0).unwrap().unwrap().seq, b);
        drop(journal);

        let journal = PipelineJournal::open(&path).unwrap();
        let checkpoint = journal.load().unwrap().unwrap();
        assert_eq!(checkpoint.state, state);
        assert_eq!(checkpoint.cursor, a);
        // unacknowledged signal survives the reopen
        let redelivered = journal.next_after(checkpoint.cursor).unwrap().unwrap();
        assert_eq!(redelivered.seq, b);
        // sequence numbers keep increasing
        assert!(journal.enqueue(&Signal::Full).unwrap() > b);
    }

    #[test]
    fn test_malformed_payload_is_kept_raw() {
        let dir = TempDir::new().unwrap();
        let journal = PipelineJournal::open(dir.path().join("journal.redb")).unwrap();
        journal.enqueue_raw(b"{not json", t(1)).unwrap();
        let entry = journal.next_after(0).unwrap().unwrap();
        assert!(entry.decode().is_err());
        assert_eq!(entry.payload, b"{not json");
    }

    #[tokio::test]
    async fn test_recv_wakes_on_enqueue() {
        let dir = TempDir::new().unwrap();
        let journal = PipelineJournal::open(dir.path().join("journal.redb")).unwrap();
        let producer = journal.clone();
        let waiter = tokio::spawn(async move { journal.recv_after(0).await });
        tokio::task::yield_now().await;
        producer.enqueue(&Signal::Full).unwrap();
        let entry = waiter.await.unwrap().unwrap();
        assert_eq!(entry.decode().unwrap(), Signal::Full);
    }
}
