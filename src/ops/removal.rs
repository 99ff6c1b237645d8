//! Removal pipeline: tombstone one slide's vector, delete its embedding
//! artifact and drop its entry from the dataset sample log.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::encoder::embedding_artifact_name;
use crate::index::VectorIndex;
use crate::ledger::DatasetLog;

use super::{lock_root, RunStatus};

#[derive(Debug, Clone)]
pub struct RemoveArgs {
    pub inputs_root: PathBuf,
    /// Embedding root name under `<inputs_root>/embeddings/`.
    pub embeddings: String,
    /// Dataset the slide belongs to.
    pub name: String,
    /// Slide filename (with or without its source extension).
    pub slide: String,
}

pub fn run_removal(args: &RemoveArgs) -> Result<RunStatus> {
    let emb_parent = args.inputs_root.join(super::indexing::EMBEDDINGS_SUBDIR);
    let emb_root = super::dataset_dir(&emb_parent, &args.embeddings)?;
    let _lock = lock_root(&emb_root)?;

    let stem = args.slide.split('.').next().unwrap_or(&args.slide);
    let id = format!("{}/{stem}", args.name);

    let mut index = VectorIndex::load(&emb_root)?;
    index.remove(std::slice::from_ref(&id))?;

    let emb_dir = emb_root.join(&args.name);
    let artifact = emb_dir.join(embedding_artifact_name(stem));
    if artifact.is_file() {
        fs::remove_file(&artifact)
            .with_context(|| format!("failed to delete {}", artifact.display()))?;
    }

    // The log records the source filename, which may carry an extension the
    // caller omitted. Match on the stem.
    let mut log = DatasetLog::load(&emb_dir)?;
    let recorded = log
        .samples
        .iter()
        .find(|s| s.wsi.split('.').next().unwrap_or(&s.wsi) == stem)
        .map(|s| s.wsi.clone());
    match recorded {
        Some(wsi) => {
            log.remove_sample(&wsi)?;
        }
        None => bail!("slide {} has no entry in the sample log of {}", args.slide, args.name),
    }

    tracing::info!(%id, "removed slide from the embedding root");
    Ok(RunStatus {
        status: "Finished",
        info: format!("removed {id} from {}", args.embeddings),
    })
}
