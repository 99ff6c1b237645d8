//! Typed error taxonomy for the retrieval core.
//!
//! Operational entrypoints (`ops`, `cli`) wrap these in [`anyhow::Error`] for
//! context chaining; library layers return them directly so callers can match
//! on the failure class.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("path not found: {path} (available: {available:?})")]
    PathNotFound {
        path: PathBuf,
        available: Vec<String>,
    },

    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// An image root mixes plain files and directories, so no single slide
    /// reader can be chosen for the dataset.
    #[error("contents of {path} are not homogeneous (mixed files and directories)")]
    HeterogeneousDatasetLayout { path: PathBuf },

    #[error("embedding root {root} has a ledger without a config block")]
    MissingLedgerConfig { root: PathBuf },

    /// A facet-chain hop found no record for an alias. `document` and
    /// `element` identify the hop, `alias` the key that had no match.
    #[error("alias resolution failed in {document}: no {element} with alias '{alias}'")]
    AliasResolutionFailure {
        document: &'static str,
        element: &'static str,
        alias: String,
    },

    #[error("unknown filter syntax: {reason}")]
    UnknownFilterSyntax { reason: String },

    #[error("retrieval received neither a query nor a metadata filter")]
    EmptyQueryAndFilter,

    #[error("id '{id}' is not present in the index mapping")]
    IdTranslationFailure { id: String },

    #[error("index artifacts under {root} are out of sync: {reason}")]
    IndexPersistenceMismatch { root: PathBuf, reason: String },

    /// Runtime key lookup over a closed set failed. Carries the known set so
    /// the valid options show up in the message without re-running.
    #[error("unknown {what} '{key}', options: {known:?}")]
    UnknownVariant {
        what: &'static str,
        key: String,
        known: &'static [&'static str],
    },
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
