//! CSV data importer
//!
//! Records the sorted header columns of a CSV file as its variables and
//! the number of data rows.

use async_trait::async_trait;
use runsync_common::{Error, IndexedObject, Result};
use runsync_pipeline::DataImporter;
use runsync_store::{ExtensionFilter, ImportFilter};
use std::path::Path;

/// Importer name under which columns are recorded
pub const CSV_KEY: &str = "csv";
pub const ROWS_KEY: &str = "rows";

pub struct CsvImporter {
    filter: ExtensionFilter,
}

impl CsvImporter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            filter: ExtensionFilter::new(extensions),
        }
    }
}

impl ImportFilter for CsvImporter {
    fn can_import(&self, path: &str) -> bool {
        self.filter.can_import(path)
    }
}

#[async_trait]
impl DataImporter for CsvImporter {
    async fn import(&self, local: &Path, object: &mut IndexedObject) -> Result<bool> {
        let path = local.to_path_buf();
        let (columns, rows) = tokio::task::spawn_blocking(move || read_csv(&path))
            .await
            .map_err(|e| Error::import(local.display().to_string(), e.to_string()))??;

        let before = object.meta.variables()?;
        let mut after = before.clone();
        after.insert(CSV_KEY.to_string(), columns);
        object.meta.set_variables(&after);
        object.meta.insert(ROWS_KEY, rows);
        Ok(before != after)
    }
}

fn read_csv(path: &Path) -> Result<(Vec<String>, i64)> {
    let fail = |e: csv::Error| Error::import(path.display().to_string(), e.to_string());
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(fail)?;

    let mut columns: Vec<String> = reader
        .headers()
        .map_err(fail)?
        .iter()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    columns.sort();
    columns.dedup();

    let mut rows: i64 = 0;
    for record in reader.records() {
        record.map_err(fail)?;
        rows += 1;
    }
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use runsync_common::ObjectType;
    use tempfile::TempDir;

    fn object() -> IndexedObject {
        let time = Utc.timestamp_opt(10, 0).unwrap();
        IndexedObject::for_file("run", "run/a.csv", ObjectType::Data, time).unwrap()
    }

    #[test]
    fn test_can_import_by_extension() {
        let importer = CsvImporter::new(["csv"]);
        assert!(importer.can_import("run/a.csv"));
        assert!(importer.can_import("run/A.CSV"));
        assert!(!importer.can_import("run/a.txt"));
    }

    #[tokio::test]
    async fn test_import_records_columns_and_rows() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.csv");
        std::fs::write(&file, "time, temp,pressure\n1,2,3\n2,3,4\n").unwrap();

        let importer = CsvImporter::new(["csv"]);
        let mut object = object();
        assert!(importer.import(&file, &mut object).await.unwrap());
        assert_eq!(
            object.meta.variables().unwrap()[CSV_KEY],
            vec!["pressure", "temp", "time"]
        );
        assert_eq!(object.meta.get_int(ROWS_KEY).unwrap(), 2);

        // same columns, more rows: variables unchanged
        std::fs::write(&file, "time,temp,pressure\n1,2,3\n2,3,4\n3,4,5\n").unwrap();
        assert!(!importer.import(&file, &mut object).await.unwrap());
        assert_eq!(object.meta.get_int(ROWS_KEY).unwrap(), 3);

        std::fs::write(&file, "time,temp\n1,2\n").unwrap();
        assert!(importer.import(&file, &mut object).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_header_is_an_import_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.csv");
        std::fs::write(&file, [0xff, 0xfe, b',', b'x', b'\n']).unwrap();

        let err = CsvImporter::new(["csv"])
            .import(&file, &mut object())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Import { .. }));
    }
}
