//! Raw dataset discovery and loading.
//!
//! Datasets are line-oriented password lists (plain or gzip) anywhere under
//! the datasets directory. A dataset is addressed by its file stem, so
//! `leaks/en/rockyou.txt.gz` is `rockyou`. A dataset value may list several
//! patterns separated by `+` or `,`, and each pattern is a glob over stems.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use glob_match::glob_match;
use ignore::WalkBuilder;

use crate::error::{BenchError, Result};
use crate::eval::source::read_lines;

/// Extensions recognised as password lists.
const DATASET_EXTENSIONS: &[&str] = &["txt", "gz", "lst", "csv"];

/// Index of the datasets directory.
#[derive(Debug, Clone)]
pub struct DatasetCatalog {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl DatasetCatalog {
    /// Walk the datasets directory once and remember every candidate file.
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(BenchError::config(format!(
                "datasets directory does not exist: {}",
                root.display()
            )));
        }

        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(false)
            .require_git(false)
            .follow_links(true)
            .threads(0)
            .build_parallel();

        let files = Mutex::new(Vec::new());
        walker.run(|| {
            Box::new(|entry| {
                if let Ok(entry) = entry {
                    let path = entry.path();
                    if path.is_file() && has_dataset_extension(path) {
                        if let Ok(mut files) = files.lock() {
                            files.push(path.to_path_buf());
                        }
                    }
                }
                ignore::WalkState::Continue
            })
        });

        let mut files = files
            .into_inner()
            .map_err(|_| BenchError::config("dataset scan poisoned"))?;
        files.sort();

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Distinct dataset names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.iter().map(|p| dataset_stem(p)).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Every file whose stem matches one of the patterns in `names`, sorted.
    pub fn select(&self, names: &str) -> Result<Vec<PathBuf>> {
        let patterns: Vec<String> = names
            .split(['+', ','])
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        let selected: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|path| {
                let stem = dataset_stem(path).to_lowercase();
                patterns.iter().any(|p| glob_match(p, &stem))
            })
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(BenchError::config(format!(
                "'{}' matches no dataset under {}",
                names,
                self.root.display()
            )));
        }
        Ok(selected)
    }

    /// Read and concatenate the selected datasets, in path order.
    pub fn load(&self, names: &str) -> Result<Vec<String>> {
        let mut passwords = Vec::new();
        for path in self.select(names)? {
            let lines = read_lines(&path)?;
            tracing::debug!(path = %path.display(), count = lines.len(), "loaded dataset");
            passwords.extend(lines);
        }
        Ok(passwords)
    }
}

fn has_dataset_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DATASET_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// File name with every dataset extension removed.
pub fn dataset_stem(path: &Path) -> String {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    while let Some((stem, ext)) = name.rsplit_once('.') {
        if DATASET_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) && !stem.is_empty() {
            name = stem.to_string();
        } else {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog() -> (TempDir, DatasetCatalog) {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("en").join("social");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("rockyou.txt"), "123456\npassword\n\n").unwrap();
        std::fs::write(nested.join("linkedin.txt"), "linkedin1\n").unwrap();
        std::fs::write(nested.join("myspace.txt"), "myspace1\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        let catalog = DatasetCatalog::scan(dir.path()).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_stem_strips_stacked_extensions() {
        assert_eq!(dataset_stem(Path::new("a/rockyou.txt.gz")), "rockyou");
        assert_eq!(dataset_stem(Path::new("phpbb.v2.txt")), "phpbb.v2");
    }

    #[test]
    fn test_select_by_name_and_glob() {
        let (_dir, catalog) = catalog();
        assert_eq!(catalog.select("rockyou").unwrap().len(), 1);
        assert_eq!(catalog.select("*i*").unwrap().len(), 1);
        assert_eq!(catalog.select("linkedin+myspace").unwrap().len(), 2);
        assert!(catalog.select("notes").is_err());
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let (_dir, catalog) = catalog();
        assert_eq!(catalog.load("rockyou").unwrap(), vec!["123456", "password"]);
    }

    #[test]
    fn test_missing_root_is_configuration_error() {
        let err = DatasetCatalog::scan(Path::new("/nonexistent/datasets")).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }
}
