//! Batch indexing pipeline: encode every slide of a dataset, logging each
//! finished sample durably, then register the complete dataset into the
//! vector index in one batch.
//!
//! The pipeline is resumable at sample granularity. A sample is logged only
//! after its embedding artifact is on disk, so a crash mid-run loses at most
//! the sample being encoded; the next run re-lists the slides, subtracts the
//! logged ones and continues. Bulk registration happens exactly once, when
//! the log covers the whole dataset.

use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::encoder::{embedding_artifact_name, save_embedding, EncoderKind, SlideEncoder, SlideReaderKind};
use crate::index::VectorIndex;
use crate::ledger::{DatasetLog, LedgerConfig, ProgressLedger, SampleEntry};
use crate::metadata::{resolver, KnowledgeBase};

use super::{dataset_dir, lock_root, RunStatus};

pub const DATASETS_SUBDIR: &str = "datasets";
pub const EMBEDDINGS_SUBDIR: &str = "embeddings";
pub const IMAGES_DIR: &str = "IMAGES";

#[derive(Debug, Clone)]
pub struct IndexArgs {
    pub inputs_root: PathBuf,
    /// Dataset directory name under `<inputs_root>/datasets/`.
    pub name: String,
    /// Embedding root name under `<inputs_root>/embeddings/`.
    pub embeddings: String,
    pub encoder: String,
    pub level: u32,
    pub remove_bg: String,
    pub full_precision: bool,
}

impl IndexArgs {
    pub fn embedding_root(&self) -> PathBuf {
        self.inputs_root.join(EMBEDDINGS_SUBDIR).join(&self.embeddings)
    }

    fn requested_config(&self) -> Result<LedgerConfig> {
        // Canonicalize the encoder name before it is pinned to the root.
        let kind = EncoderKind::parse(&self.encoder)?;
        Ok(LedgerConfig {
            encoder: kind.as_str().to_string(),
            level: self.level,
            full_precision: self.full_precision,
            remove_bg: self.remove_bg.clone(),
        })
    }
}

/// Runs the pipeline with the encoder named by the root's pinned config
/// (falling back to the caller's choice for a fresh root).
pub fn run_indexing(args: &IndexArgs) -> Result<RunStatus> {
    let root = args.embedding_root();
    let pinned = if ProgressLedger::exists(&root) {
        ProgressLedger::load(&root)?.config.encoder
    } else {
        args.encoder.clone()
    };
    let encoder = EncoderKind::parse(&pinned)?.instantiate()?;
    run_with_encoder(args, encoder.as_ref())
}

/// Runs the pipeline with a caller-supplied encoder.
pub fn run_with_encoder(args: &IndexArgs, encoder: &dyn SlideEncoder) -> Result<RunStatus> {
    let dataset = dataset_dir(&args.inputs_root.join(DATASETS_SUBDIR), &args.name)?;
    let emb_root = args.embedding_root();
    let _lock = lock_root(&emb_root)?;

    let mut ledger = ProgressLedger::open_or_create(&emb_root, args.requested_config()?)?;
    if ledger.dataset(&args.name).is_some_and(|d| d.fully_processed) {
        return Ok(RunStatus {
            status: "Finished",
            info: format!(
                "dataset {} is recorded as fully processed in {}, skipping",
                args.name,
                crate::ledger::CONFIG_FILE
            ),
        });
    }
    ledger.ensure_dataset(&args.name)?;

    let images_dir = dataset.join(IMAGES_DIR);
    let reader = SlideReaderKind::detect_for_dir(&images_dir)?;
    let slides = list_slides(&images_dir)?;
    tracing::info!(
        dataset = %args.name,
        count = slides.len(),
        reader = reader.as_str(),
        "listed slides"
    );

    let emb_dir = emb_root.join(&args.name);
    fs::create_dir_all(&emb_dir)
        .with_context(|| format!("failed to create {}", emb_dir.display()))?;
    let mut log = DatasetLog::open(&emb_dir, &args.name, slides.len())?;

    let processed = log.processed().len();
    let pending: Vec<&String> = {
        let done = log.processed();
        slides.iter().filter(|s| !done.contains(s.as_str())).collect()
    };
    if processed > 0 {
        tracing::info!(
            dataset = %args.name,
            processed,
            remaining = pending.len(),
            "dataset partially processed, resuming"
        );
    }

    let pb = progress_bar(pending.len() as u64);
    let started = Instant::now();
    let encoded = pending.len();
    // The pinned config governs encoding, not the caller's arguments, so
    // every dataset under this root shares one embedding space.
    let level = ledger.config.level;
    for slide in pending {
        let wsi_path = images_dir.join(slide);
        let vector = encoder
            .encode(&wsi_path, level)
            .with_context(|| format!("failed to encode {}", wsi_path.display()))?;
        let stem = slide.split('.').next().unwrap_or(slide);
        let artifact = embedding_artifact_name(stem);
        save_embedding(&emb_dir.join(&artifact), &vector)?;
        log.append(SampleEntry {
            wsi: slide.clone(),
            mask: None,
            embedding: artifact,
        })?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    if log.is_complete() {
        let range = register_dataset(&emb_root, &emb_dir, &dataset, &args.name, &log, encoder.dimension())?;
        ledger.mark_fully_processed(&args.name, range)?;
    }

    Ok(RunStatus {
        status: "Finished",
        info: format!(
            "encoded {} of {} slides in {:.2?}",
            encoded,
            slides.len(),
            started.elapsed()
        ),
    })
}

/// Loads every logged embedding of a completed dataset, resolves its facet
/// record from the knowledge base and adds the whole batch to the index.
fn register_dataset(
    emb_root: &Path,
    emb_dir: &Path,
    dataset: &Path,
    name: &str,
    log: &DatasetLog,
    dim: usize,
) -> Result<(u64, u64)> {
    let kb = KnowledgeBase::load(dataset)?;
    let mut index = if VectorIndex::exists(emb_root) {
        VectorIndex::load(emb_root)?
    } else {
        VectorIndex::create(emb_root, dim)?
    };

    // A crash between registration and the ledger's terminal mark leaves
    // the batch (or part of it) already live; only the missing ids are
    // added so the rerun converges instead of tripping on duplicates.
    let mut vectors = Vec::new();
    let mut ids = Vec::new();
    let mut facets = Vec::new();
    let mut all_ids = Vec::with_capacity(log.samples.len());
    for sample in &log.samples {
        let stem = sample.wsi.split('.').next().unwrap_or(&sample.wsi);
        let id = format!("{name}/{stem}");
        if index.slot_of(&id).is_none() {
            vectors.push(crate::encoder::load_embedding(&emb_dir.join(&sample.embedding))?);
            facets.push(resolver::resolve_image(&kb, stem)?);
            ids.push(id.clone());
        }
        all_ids.push(id);
    }
    if !vectors.is_empty() {
        index.add(&vectors, &ids, &facets)?;
    }

    let slots: Vec<u64> = all_ids
        .iter()
        .map(|id| {
            index
                .slot_of(id)
                .with_context(|| format!("id '{id}' missing after registration"))
        })
        .collect::<Result<_>>()?;
    let first = slots.iter().copied().min().unwrap_or(0);
    let last = slots.iter().copied().max().unwrap_or(0);
    Ok((first, last))
}

fn list_slides(images_dir: &Path) -> Result<Vec<String>> {
    let mut slides: Vec<String> = fs::read_dir(images_dir)
        .with_context(|| format!("failed to list {}", images_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    slides.sort();
    Ok(slides)
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if std::io::stderr().is_terminal() {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} slides encoded")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
    } else {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb
}
