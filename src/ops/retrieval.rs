//! Similarity retrieval pipeline: resolve the query embedding, narrow the
//! candidate set by dataset selection and metadata filtration, then run the
//! exact nearest-neighbour search. With no query the pipeline degrades to
//! pure metadata filtration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::encoder::{load_embedding, EncoderKind, EMBEDDING_SUFFIX};
use crate::error::RetrievalError;
use crate::index::VectorIndex;
use crate::ledger::{DatasetLog, ProgressLedger};
use crate::metadata::filter::FilterExpr;
use crate::xmlutil;

use super::{split_id, RunStatus};

#[derive(Debug, Clone)]
pub struct RetrieveArgs {
    pub inputs_root: PathBuf,
    /// Embedding root name under `<inputs_root>/embeddings/`.
    pub embeddings: String,
    /// Path to an embedding artifact, a slide on disk, or a
    /// `dataset/filename` reference into the embedding root.
    pub query: Option<String>,
    pub k_best: usize,
    /// Restrict candidates to these fully-encoded datasets.
    pub datasets: Vec<String>,
    /// Path to a filter document, `.json` (flat syntax) or `.xml` (tree
    /// syntax).
    pub metadata: Option<PathBuf>,
    pub save: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct RetrievalResult {
    pub query: Option<String>,
    #[serde(rename = "metadata-filter")]
    pub metadata_filter: Option<String>,
    #[serde(rename = "target-dataset")]
    pub target_dataset: Vec<String>,
    pub embedding_database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarities: Option<Vec<(String, f32)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered: Option<Vec<String>>,
}

pub fn run_retrieval(args: &RetrieveArgs) -> Result<RetrievalResult> {
    if args.query.is_none() && args.metadata.is_none() {
        return Err(RetrievalError::EmptyQueryAndFilter.into());
    }

    let emb_parent = args.inputs_root.join(super::indexing::EMBEDDINGS_SUBDIR);
    let emb_root = super::dataset_dir(&emb_parent, &args.embeddings)?;
    let ledger = ProgressLedger::load(&emb_root)?;
    let index = VectorIndex::load(&emb_root)?;

    // Candidate restriction. `None` means the whole index; `Some` is a hard
    // restriction even when it narrows to nothing, so a filter that matches
    // no sample yields an empty result instead of searching everything.
    let mut candidates: Option<Vec<String>> = None;
    if !args.datasets.is_empty() {
        let mut ids = Vec::new();
        for name in &args.datasets {
            ids.extend(dataset_ids(&emb_root, &ledger, name)?);
        }
        tracing::info!(count = ids.len(), "selected candidates by dataset");
        candidates = Some(ids);
    }
    if let Some(filter_path) = &args.metadata {
        let expr = load_filter(filter_path)?;
        let filtered = index.filter_metadata(&expr, candidates.as_deref());
        tracing::info!(count = filtered.len(), "samples fulfill the filter conditions");
        candidates = Some(filtered);
    }

    let similarities = match &args.query {
        Some(query) => {
            let embedding = resolve_query_embedding(&emb_root, &ledger, query)?;
            Some(match &candidates {
                Some(ids) => index.search_subset(&embedding, args.k_best, ids)?,
                None => index.search(&embedding, args.k_best)?,
            })
        }
        None => None,
    };
    let filtered = if args.query.is_none() { candidates } else { None };

    let result = RetrievalResult {
        query: args.query.clone(),
        metadata_filter: args.metadata.as_ref().map(|p| p.display().to_string()),
        target_dataset: args.datasets.clone(),
        embedding_database: args.embeddings.clone(),
        similarities,
        filtered,
    };
    if let Some(save) = &args.save {
        write_result(save, &result)?;
    }
    Ok(result)
}

/// Candidate ids ("dataset/filename") of one fully-encoded dataset, read
/// from its sample log.
fn dataset_ids(emb_root: &Path, ledger: &ProgressLedger, name: &str) -> Result<Vec<String>> {
    match ledger.dataset(name) {
        Some(state) if state.fully_processed => {
            let log = DatasetLog::load(&emb_root.join(name))?;
            Ok(log
                .samples
                .iter()
                .map(|s| format!("{name}/{}", s.wsi))
                .collect())
        }
        _ => bail!("requested dataset {name} is not fully encoded"),
    }
}

/// Resolves the query argument to an embedding vector.
///
/// A path ending in the embedding suffix is loaded as a pre-encoded
/// artifact. A path that exists on disk is encoded live with the root's
/// pinned encoder. Anything else is tried as a `dataset/filename` reference
/// to an artifact already in the root.
fn resolve_query_embedding(
    emb_root: &Path,
    ledger: &ProgressLedger,
    query: &str,
) -> Result<Vec<f32>> {
    let path = Path::new(query);
    if query.ends_with(EMBEDDING_SUFFIX) {
        tracing::info!(%query, "treating query as pre-encoded embedding");
        return load_embedding(path);
    }
    if path.exists() {
        tracing::info!(%query, encoder = %ledger.config.encoder, "encoding query slide");
        let encoder = EncoderKind::parse(&ledger.config.encoder)?.instantiate()?;
        return encoder.encode(path, ledger.config.level);
    }
    if let Some((dataset, stem)) = split_id(query) {
        let artifact = emb_root
            .join(dataset)
            .join(crate::encoder::embedding_artifact_name(stem));
        if artifact.is_file() {
            tracing::info!(%query, "resolved query to an indexed embedding");
            return load_embedding(&artifact);
        }
    }
    Err(RetrievalError::PathNotFound {
        path: path.to_path_buf(),
        available: Vec::new(),
    }
    .into())
}

/// Parses a filter document, dispatching on its extension.
fn load_filter(path: &Path) -> Result<FilterExpr> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "json" => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read filter {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("filter {} is not valid JSON", path.display()))?;
            Ok(FilterExpr::parse_flat(&value)?)
        }
        "xml" => {
            let doc = xmlutil::read_document(path)?;
            Ok(FilterExpr::parse_tree(&doc)?)
        }
        other => Err(RetrievalError::UnknownFilterSyntax {
            reason: format!("unsupported filter file extension '{other}' (expected json or xml)"),
        }
        .into()),
    }
}

fn write_result(save: &Path, result: &RetrievalResult) -> Result<()> {
    let path = if save.extension().is_some_and(|e| e == "json") {
        save.to_path_buf()
    } else {
        let mut p = save.as_os_str().to_owned();
        p.push(".json");
        PathBuf::from(p)
    };
    let payload = serde_json::to_vec_pretty(result)?;
    fs::write(&path, payload)
        .with_context(|| format!("failed to write results to {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote retrieval results");
    Ok(())
}

/// Terminal report for CLI dispatch. The full result is serialized into
/// `info` so callers parsing stdout see the same document that `--save`
/// writes.
pub fn status_of(result: &RetrievalResult) -> Result<RunStatus> {
    Ok(RunStatus {
        status: "Finished",
        info: serde_json::to_string(result)?,
    })
}
