//! Data file selection

use std::path::Path;

/// Decides which files are importable data
pub trait ImportFilter: Send + Sync {
    fn can_import(&self, path: &str) -> bool;
}

impl<F> ImportFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn can_import(&self, path: &str) -> bool {
        self(path)
    }
}

/// Accepts files by extension, case-insensitively
#[derive(Clone, Debug)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl ImportFilter for ExtensionFilter {
    fn can_import(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_filter() {
        let filter = ExtensionFilter::new([".CSV", "tsv"]);
        assert!(filter.can_import("run/a.csv"));
        assert!(filter.can_import("run/b.TSV"));
        assert!(!filter.can_import("run/params.json"));
        assert!(!filter.can_import("run/noext"));
    }

    #[test]
    fn test_closure_filter() {
        let filter = |p: &str| p.ends_with(".data");
        assert!(filter.can_import("x/e.data"));
        assert!(!ImportFilter::can_import(&filter, "x/e.csv"));
    }
}
