//! Operational entrypoints: the indexing, retrieval and removal pipelines
//! the CLI dispatches to. Each pipeline is a plain function over an args
//! struct so integration tests can drive it without spawning the binary.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;

use crate::error::RetrievalError;

pub mod indexing;
pub mod removal;
pub mod retrieval;

pub use indexing::{run_indexing, run_with_encoder, IndexArgs};
pub use removal::{run_removal, RemoveArgs};
pub use retrieval::{run_retrieval, RetrieveArgs, RetrievalResult};

const LOCK_FILE: &str = ".lock";

/// Terminal report of a mutating pipeline run.
#[derive(Debug, Serialize)]
pub struct RunStatus {
    pub status: &'static str,
    pub info: String,
}

/// Guard holding the embedding root's exclusive advisory lock. Mutating
/// pipelines hold this for their whole run so two writers can never
/// interleave ledger and index updates.
pub struct RootLock {
    _file: File,
}

pub fn lock_root(root: &Path) -> Result<RootLock> {
    fs::create_dir_all(root)
        .with_context(|| format!("failed to create embedding root {}", root.display()))?;
    let file = File::create(root.join(LOCK_FILE))
        .with_context(|| format!("failed to open lock file under {}", root.display()))?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "embedding root {} is locked by another process",
            root.display()
        )
    })?;
    Ok(RootLock { _file: file })
}

/// Resolves `inputs_root/name`, listing the root's actual entries in the
/// error when the dataset is absent.
pub fn dataset_dir(inputs_root: &Path, name: &str) -> Result<PathBuf> {
    let dir = inputs_root.join(name);
    if !dir.exists() {
        let mut available: Vec<String> = fs::read_dir(inputs_root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        available.sort();
        return Err(RetrievalError::PathNotFound {
            path: dir,
            available,
        }
        .into());
    }
    if !dir.is_dir() {
        return Err(RetrievalError::NotADirectory { path: dir }.into());
    }
    Ok(dir)
}

/// Splits "dataset/filename.ext" into the dataset name and the bare stem.
pub(crate) fn split_id(raw: &str) -> Option<(&str, &str)> {
    let (dataset, file) = raw.split_once('/')?;
    let stem = file.split('.').next().unwrap_or(file);
    Some((dataset, stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_dataset_lists_siblings() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("present")).unwrap();

        let err = dataset_dir(dir.path(), "absent").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("absent"), "{msg}");
        assert!(msg.contains("present"), "{msg}");
    }

    #[test]
    fn second_lock_on_same_root_fails() {
        let dir = tempdir().unwrap();
        let _held = lock_root(dir.path()).unwrap();
        assert!(lock_root(dir.path()).is_err());
    }

    #[test]
    fn split_id_strips_first_qualifier() {
        assert_eq!(split_id("ds1/slide.ome.tiff"), Some(("ds1", "slide")));
        assert_eq!(split_id("ds1/slide"), Some(("ds1", "slide")));
        assert_eq!(split_id("bare"), None);
    }
}
