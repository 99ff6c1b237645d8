//! Durable indexing progress ledger.
//!
//! One embedding root carries `embedding_config.xml`: the pipeline config
//! pinned at first use plus the state of every dataset indexed into the
//! root. Each dataset subdirectory carries `indexed.xml`, the append-only
//! log of processed samples. All mutations parse the current document,
//! apply one change and rewrite atomically (temp file + rename + fsync), so
//! a crash can never leave a half-written ledger.
//!
//! The config block is authoritative once written: callers that pass
//! conflicting parameters for the same root are overridden (with a warning)
//! to keep the embedding space homogeneous.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::RetrievalError;
use crate::xmlutil::{self, Element};

pub const CONFIG_FILE: &str = "embedding_config.xml";
pub const DATASET_LOG_FILE: &str = "indexed.xml";

/// Pipeline parameters pinned to an embedding root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub encoder: String,
    pub level: u32,
    pub full_precision: bool,
    pub remove_bg: String,
}

/// State of one dataset within an embedding root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetState {
    pub name: String,
    pub fully_processed: bool,
    /// Slot range recorded at bulk registration, informational only.
    pub slot_range: Option<(u64, u64)>,
}

/// The per-root ledger document.
#[derive(Debug)]
pub struct ProgressLedger {
    root: PathBuf,
    pub config: LedgerConfig,
    datasets: Vec<DatasetState>,
}

impl ProgressLedger {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    pub fn exists(root: &Path) -> bool {
        Self::path(root).is_file()
    }

    /// Loads an existing ledger; the config block must be present.
    pub fn load(root: &Path) -> Result<Self> {
        let doc = xmlutil::read_document(&Self::path(root))?;
        let config_elem = doc
            .child("config")
            .ok_or_else(|| RetrievalError::MissingLedgerConfig {
                root: root.to_path_buf(),
            })?;

        let config = LedgerConfig {
            encoder: attr_required(config_elem, "encoder", root)?,
            level: attr_required(config_elem, "level", root)?
                .parse()
                .context("ledger config 'level' is not an integer")?,
            full_precision: parse_bool(&attr_required(config_elem, "full_precision", root)?),
            remove_bg: attr_required(config_elem, "remove_bg", root)?,
        };

        let mut datasets = Vec::new();
        if let Some(list) = doc.child("datasets") {
            for ds in list.children_named("dataset") {
                let Some(name) = ds.attr("name") else { continue };
                let slot_range = match (ds.attr("indexID0"), ds.attr("indexID1")) {
                    (Some(a), Some(b)) => Some((a.parse()?, b.parse()?)),
                    _ => None,
                };
                datasets.push(DatasetState {
                    name: name.to_string(),
                    fully_processed: ds.attr("fully_processed").is_some_and(|v| parse_bool(v)),
                    slot_range,
                });
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            config,
            datasets,
        })
    }

    /// Creates a fresh ledger for a never-seen root.
    pub fn create(root: &Path, config: LedgerConfig) -> Result<Self> {
        let ledger = Self {
            root: root.to_path_buf(),
            config,
            datasets: Vec::new(),
        };
        ledger.write()?;
        Ok(ledger)
    }

    /// Opens the root's ledger, creating it with `requested` on first use.
    ///
    /// When the root already has a config, the recorded parameters win over
    /// any conflicting `requested` values, keeping the embedding space
    /// homogeneous.
    pub fn open_or_create(root: &Path, requested: LedgerConfig) -> Result<Self> {
        if Self::exists(root) {
            let ledger = Self::load(root)?;
            if ledger.config != requested {
                tracing::warn!(
                    root = %root.display(),
                    pinned_encoder = %ledger.config.encoder,
                    pinned_level = ledger.config.level,
                    "embedding root already configured; overriding caller arguments \
                     to preserve embedding-space homogeneity"
                );
            }
            Ok(ledger)
        } else {
            Self::create(root, requested)
        }
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetState> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn datasets(&self) -> &[DatasetState] {
        &self.datasets
    }

    /// Adds a dataset entry in the in-progress state if not yet present.
    pub fn ensure_dataset(&mut self, name: &str) -> Result<()> {
        if self.dataset(name).is_none() {
            self.datasets.push(DatasetState {
                name: name.to_string(),
                fully_processed: false,
                slot_range: None,
            });
            self.write()?;
        }
        Ok(())
    }

    /// Transitions a dataset to its terminal state, recording the slot range
    /// assigned by the bulk registration.
    pub fn mark_fully_processed(&mut self, name: &str, slot_range: (u64, u64)) -> Result<()> {
        let ds = self
            .datasets
            .iter_mut()
            .find(|d| d.name == name)
            .with_context(|| format!("dataset '{name}' has no ledger entry"))?;
        ds.fully_processed = true;
        ds.slot_range = Some(slot_range);
        self.write()?;
        tracing::info!(dataset = name, ?slot_range, "dataset fully processed");
        Ok(())
    }

    fn write(&self) -> Result<()> {
        let mut root = Element::new("embeddings");

        let mut config = Element::new("config");
        config.set_attr("encoder", &self.config.encoder);
        config.set_attr("level", self.config.level.to_string());
        config.set_attr("full_precision", fmt_bool(self.config.full_precision));
        config.set_attr("remove_bg", &self.config.remove_bg);
        root.children.push(config);

        let mut list = Element::new("datasets");
        for ds in &self.datasets {
            let mut elem = Element::new("dataset");
            elem.set_attr("name", &ds.name);
            elem.set_attr("fully_processed", fmt_bool(ds.fully_processed));
            if let Some((first, last)) = ds.slot_range {
                elem.set_attr("indexID0", first.to_string());
                elem.set_attr("indexID1", last.to_string());
            }
            list.children.push(elem);
        }
        root.children.push(list);

        xmlutil::write_document(&Self::path(&self.root), &root)
    }
}

/// One processed sample in a dataset log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    /// Source slide filename (with extension) or DICOM directory name.
    pub wsi: String,
    pub mask: Option<String>,
    /// Embedding artifact filename within the dataset's embedding directory.
    pub embedding: String,
}

/// The per-dataset `indexed.xml` sample log.
#[derive(Debug)]
pub struct DatasetLog {
    path: PathBuf,
    pub name: String,
    /// Item count declared when the log was first written. Completion is
    /// `samples.len() == total`.
    pub total: usize,
    pub samples: Vec<SampleEntry>,
}

impl DatasetLog {
    pub fn log_path(dataset_embedding_dir: &Path) -> PathBuf {
        dataset_embedding_dir.join(DATASET_LOG_FILE)
    }

    /// Opens the dataset log, keeping the recorded total when the log
    /// already exists, otherwise starting fresh with `declared_total`.
    pub fn open(dataset_embedding_dir: &Path, name: &str, declared_total: usize) -> Result<Self> {
        let path = Self::log_path(dataset_embedding_dir);
        if path.is_file() {
            Self::load(dataset_embedding_dir)
        } else {
            Ok(Self {
                path,
                name: name.to_string(),
                total: declared_total,
                samples: Vec::new(),
            })
        }
    }

    /// Loads an existing dataset log. A missing or corrupt attribute is an
    /// error naming the document, not a silently defaulted record.
    pub fn load(dataset_embedding_dir: &Path) -> Result<Self> {
        let path = Self::log_path(dataset_embedding_dir);
        let doc = xmlutil::read_document(&path)?;
        let mut samples = Vec::new();
        for sample in doc.children_named("sample") {
            samples.push(SampleEntry {
                wsi: log_attr(sample, "wsi", &path)?,
                mask: sample
                    .attr("mask")
                    .filter(|m| *m != "None")
                    .map(str::to_string),
                embedding: log_attr(sample, "embedding", &path)?,
            });
        }
        let name = log_attr(&doc, "name", &path)?;
        let total = log_attr(&doc, "total", &path)?.parse().with_context(|| {
            format!("dataset log {} has a non-numeric 'total'", path.display())
        })?;
        Ok(Self {
            path,
            name,
            total,
            samples,
        })
    }

    /// Source filenames already recorded.
    pub fn processed(&self) -> HashSet<&str> {
        self.samples.iter().map(|s| s.wsi.as_str()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.samples.len() >= self.total
    }

    /// Appends one sample record and flushes the document durably. This is
    /// the single mutation point: call it only after the sample's embedding
    /// artifact is safely on disk.
    pub fn append(&mut self, entry: SampleEntry) -> Result<()> {
        self.samples.push(entry);
        self.write()
    }

    /// Drops the sample for a source filename. Returns whether an entry was
    /// removed.
    pub fn remove_sample(&mut self, wsi: &str) -> Result<bool> {
        let before = self.samples.len();
        self.samples.retain(|s| s.wsi != wsi);
        let removed = self.samples.len() != before;
        if removed {
            self.write()?;
        }
        Ok(removed)
    }

    fn write(&self) -> Result<()> {
        let mut root = Element::new("dataset");
        root.set_attr("total", self.total.to_string());
        root.set_attr("name", &self.name);
        for sample in &self.samples {
            let mut elem = Element::new("sample");
            elem.set_attr("wsi", &sample.wsi);
            elem.set_attr("mask", sample.mask.as_deref().unwrap_or("None"));
            elem.set_attr("embedding", &sample.embedding);
            root.children.push(elem);
        }
        xmlutil::write_document(&self.path, &root)
    }
}

fn fmt_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn log_attr(elem: &Element, name: &str, path: &Path) -> Result<String> {
    elem.attr(name).map(str::to_string).with_context(|| {
        format!(
            "dataset log {} is missing attribute '{name}'",
            path.display()
        )
    })
}

fn attr_required(elem: &Element, name: &str, root: &Path) -> Result<String> {
    elem.attr(name)
        .map(str::to_string)
        .with_context(|| {
            format!(
                "ledger config under {} is missing attribute '{name}'",
                root.display()
            )
        })
}
