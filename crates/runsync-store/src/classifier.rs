//! Path classification
//!
//! A single regular expression decides whether a store path is a run's
//! metadata file. The `runId` named capture gives the run directory; any
//! other named captures become path-derived metadata fields. Whether a file
//! is importable data is decided separately, so a metadata file can be
//! data as well.

use chrono::{DateTime, Utc};
use regex::Regex;
use runsync_common::{Error, FileShot, Result};
use std::collections::BTreeMap;

/// Name of the capture holding the run directory
pub const RUN_ID_CAPTURE: &str = "runId";

/// Classifies store paths as metadata or data
#[derive(Clone, Debug)]
pub struct RunFileClassifier {
    pattern: Regex,
}

impl RunFileClassifier {
    /// Compile the metadata pattern.
    ///
    /// An invalid expression or one without a `runId` capture is a
    /// configuration error.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::configuration(format!("invalid metadata pattern: {e}")))?;
        if !regex.capture_names().flatten().any(|n| n == RUN_ID_CAPTURE) {
            return Err(Error::configuration(format!(
                "metadata pattern {pattern:?} has no named capture `{RUN_ID_CAPTURE}`"
            )));
        }
        tracing::info!(pattern, "Metadata file pattern");
        Ok(Self { pattern: regex })
    }

    /// Classify one path. Pure function of the path text.
    ///
    /// A path is metadata when the pattern matches it with `runId` set. If
    /// the pattern makes `runId` optional, a match that leaves it unset has
    /// no run directory and the path is not metadata.
    #[must_use]
    pub fn classify(&self, path: &str, last_write_time: DateTime<Utc>) -> RunFile {
        let matched = self.pattern.captures(path).and_then(|caps| {
            let run_path = caps.name(RUN_ID_CAPTURE)?.as_str().to_string();
            let fields = self
                .pattern
                .capture_names()
                .flatten()
                .filter(|name| *name != RUN_ID_CAPTURE)
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.to_string(), m.as_str().to_string()))
                })
                .collect();
            Some(MetadataMatch { run_path, fields })
        });
        tracing::debug!(path, metadata = matched.is_some(), "Classified file");
        RunFile {
            shot: FileShot::new(path, last_write_time),
            matched,
            data: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MetadataMatch {
    run_path: String,
    fields: BTreeMap<String, String>,
}

/// A file snapshot plus its path-derived classification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunFile {
    shot: FileShot,
    matched: Option<MetadataMatch>,
    data: bool,
}

impl RunFile {
    /// Mark the file as importable data
    #[must_use]
    pub const fn with_data(mut self, data: bool) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.shot.path
    }

    #[must_use]
    pub const fn last_write_time(&self) -> DateTime<Utc> {
        self.shot.last_write_time
    }

    #[must_use]
    pub const fn shot(&self) -> &FileShot {
        &self.shot
    }

    #[must_use]
    pub fn into_shot(self) -> FileShot {
        self.shot
    }

    #[must_use]
    pub const fn is_metadata(&self) -> bool {
        self.matched.is_some()
    }

    #[must_use]
    pub const fn is_data(&self) -> bool {
        self.data
    }

    /// Run directory captured by `runId`
    pub fn run_path(&self) -> Result<&str> {
        self.metadata_match().map(|m| m.run_path.as_str())
    }

    /// Named captures other than `runId` that took part in the match
    pub fn path_metadata(&self) -> Result<&BTreeMap<String, String>> {
        self.metadata_match().map(|m| &m.fields)
    }

    fn metadata_match(&self) -> Result<&MetadataMatch> {
        self.matched.as_ref().ok_or_else(|| {
            Error::invalid_state(format!("{} is not a metadata file", self.shot.path))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PATTERN: &str = r"^(?<runId>(?<stamp>\d+)?.*)/params\.json$";

    fn t() -> DateTime<Utc> {
        Utc.timestamp_opt(10, 0).unwrap()
    }

    #[test]
    fn test_metadata_match_fields() {
        let classifier = RunFileClassifier::new(PATTERN).unwrap();
        let file = classifier.classify("000_b/c/params.json", t());
        assert!(file.is_metadata());
        assert_eq!(file.run_path().unwrap(), "000_b/c");
        let fields = file.path_metadata().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["stamp"], "000");
    }

    #[test]
    fn test_optional_capture_omitted() {
        let classifier = RunFileClassifier::new(PATTERN).unwrap();
        let file = classifier.classify("b/params.json", t());
        assert_eq!(file.run_path().unwrap(), "b");
        assert!(file.path_metadata().unwrap().is_empty());
    }

    #[test]
    fn test_data_file() {
        let classifier = RunFileClassifier::new(PATTERN).unwrap();
        let file = classifier.classify("b/out.csv", t());
        assert!(!file.is_metadata());
        assert!(matches!(file.run_path(), Err(Error::InvalidState(_))));
        assert!(file.path_metadata().is_err());
    }

    #[test]
    fn test_match_without_run_id_is_not_metadata() {
        let classifier = RunFileClassifier::new(r"^(?:(?<runId>[^/]+)/)?params\.json$").unwrap();
        let nested = classifier.classify("r/params.json", t());
        assert_eq!(nested.run_path().unwrap(), "r");
        let top = classifier.classify("params.json", t());
        assert!(!top.is_metadata());
        assert!(top.run_path().is_err());
    }

    #[test]
    fn test_roles_are_independent() {
        let classifier = RunFileClassifier::new(PATTERN).unwrap();
        let file = classifier.classify("b/params.json", t());
        assert!(file.is_metadata());
        assert!(!file.is_data());
        let file = file.with_data(true);
        assert!(file.is_metadata());
        assert!(file.is_data());
    }

    #[test]
    fn test_pattern_without_run_id() {
        let err = RunFileClassifier::new(r"^(?<run>.*)/params\.json$").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = RunFileClassifier::new(r"^(?<runId>.*").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = RunFileClassifier::new(PATTERN).unwrap();
        let a = classifier.classify("x/y/params.json", t());
        let b = classifier.classify("x/y/params.json", t());
        assert_eq!(a, b);
    }
}
