//! Change batching and the orchestration clock

use chrono::{DateTime, Utc};
use runsync_common::FileShot;
use std::collections::BTreeMap;

/// Debounced set of changed files, last write wins per path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    files: BTreeMap<String, DateTime<Utc>>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one change. An older time for a known path is discarded.
    pub fn merge(&mut self, shot: FileShot) {
        match self.files.get_mut(&shot.path) {
            Some(time) => {
                if shot.last_write_time > *time {
                    *time = shot.last_write_time;
                }
            }
            None => {
                self.files.insert(shot.path, shot.last_write_time);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<DateTime<Utc>> {
        self.files.get(path).copied()
    }

    pub fn into_shots(self) -> impl Iterator<Item = FileShot> {
        self.files
            .into_iter()
            .map(|(path, time)| FileShot::new(path, time))
    }
}

/// Time as seen by the orchestration.
///
/// Advances only from journal timestamps and timer deadlines, never from a
/// direct wall-clock read, so a replayed iteration sees the same "now".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogicalClock {
    now: Option<DateTime<Utc>>,
}

impl LogicalClock {
    /// Move forward to `time` if it is later
    pub fn observe(&mut self, time: DateTime<Utc>) {
        if self.now.is_none_or(|now| time > now) {
            self.now = Some(time);
        }
    }

    #[must_use]
    pub const fn now(&self) -> Option<DateTime<Utc>> {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_last_write_wins() {
        let mut batch = Batch::new();
        batch.merge(FileShot::new("r/a.csv", t(10)));
        batch.merge(FileShot::new("r/a.csv", t(12)));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get("r/a.csv"), Some(t(12)));

        batch.merge(FileShot::new("r/a.csv", t(11)));
        assert_eq!(batch.get("r/a.csv"), Some(t(12)));

        batch.merge(FileShot::new("r/b.csv", t(1)));
        let shots: Vec<FileShot> = batch.into_shots().collect();
        assert_eq!(shots.len(), 2);
    }

    #[test]
    fn test_clock_only_moves_forward() {
        let mut clock = LogicalClock::default();
        assert_eq!(clock.now(), None);
        clock.observe(t(5));
        clock.observe(t(3));
        assert_eq!(clock.now(), Some(t(5)));
        clock.observe(t(8));
        assert_eq!(clock.now(), Some(t(8)));
    }
}
