//! Append-only exact nearest-neighbor index with external-id mapping.
//!
//! Slots are assigned monotonically and never reused: the vector arena only
//! grows, removal tombstones the id in the mapping and leaves the slot's
//! storage in place. Vectors live on disk and in the arena at half precision
//! and are widened to f32 for distance arithmetic.
//!
//! Distances are **squared Euclidean** everywhere. Callers that need true
//! Euclidean take the square root themselves; no call site in this crate
//! does.
//!
//! Persistence is three co-located artifacts under the embedding root:
//! `index.wvi` (raw vectors), `mapping.json` (slot-to-id mapping plus
//! tombstoned ids) and `metadata.json` (id to facet record). They are
//! written together on every mutation and validated against each other on
//! load.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::metadata::FacetRecord;
use crate::metadata::filter::FilterExpr;

/// Magic bytes for the raw vector artifact.
pub const INDEX_MAGIC: [u8; 4] = *b"WVIX";

/// Vector artifact file version.
pub const INDEX_VERSION: u16 = 1;

pub const INDEX_FILE: &str = "index.wvi";
pub const MAPPING_FILE: &str = "mapping.json";
pub const FACETS_FILE: &str = "metadata.json";

#[derive(Debug)]
pub struct VectorIndex {
    root: PathBuf,
    dim: usize,
    /// Slot arena, `ntotal * dim` half-precision values.
    vectors: Vec<f16>,
    slot_to_id: BTreeMap<u64, String>,
    id_to_slot: HashMap<String, u64>,
    /// Ids retired from the mapping. Their slots are never surfaced again
    /// and their storage is not reclaimed.
    tombstoned: BTreeSet<String>,
    facets: BTreeMap<String, FacetRecord>,
}

/// On-disk form of `mapping.json`.
#[derive(Debug, Serialize, Deserialize)]
struct MappingFile {
    slot_to_id: BTreeMap<u64, String>,
    #[serde(default)]
    tombstones: BTreeSet<String>,
}

impl VectorIndex {
    /// Initializes an empty index over `dim`-dimensional vectors rooted at
    /// `root`. Nothing is written until the first [`add`](Self::add).
    pub fn create(root: &Path, dim: usize) -> Result<Self> {
        anyhow::ensure!(dim > 0, "vector dimension must be positive");
        Ok(Self {
            root: root.to_path_buf(),
            dim,
            vectors: Vec::new(),
            slot_to_id: BTreeMap::new(),
            id_to_slot: HashMap::new(),
            tombstoned: BTreeSet::new(),
            facets: BTreeMap::new(),
        })
    }

    /// Whether an index has been persisted under `root`.
    pub fn exists(root: &Path) -> bool {
        root.join(INDEX_FILE).is_file()
    }

    /// Total number of slots ever assigned, tombstoned ones included.
    pub fn ntotal(&self) -> usize {
        if self.dim == 0 { 0 } else { self.vectors.len() / self.dim }
    }

    /// Number of live (searchable) entries.
    pub fn live_count(&self) -> usize {
        self.slot_to_id.len()
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Live ids in slot order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.slot_to_id.values().map(String::as_str)
    }

    pub fn facet_record(&self, id: &str) -> Option<&FacetRecord> {
        self.facets.get(id)
    }

    /// Slot of a live id.
    pub fn slot_of(&self, id: &str) -> Option<u64> {
        self.id_to_slot.get(id).copied()
    }

    /// Appends a batch of vectors under new slots and persists the index.
    ///
    /// Returns the contiguous slot range `(first, last)` assigned to the
    /// batch. Fails if the batch is empty or ragged, if any vector has the
    /// wrong dimension, or if any id is already live.
    pub fn add(
        &mut self,
        vectors: &[Vec<f32>],
        ids: &[String],
        facets: &[FacetRecord],
    ) -> Result<(u64, u64)> {
        anyhow::ensure!(!vectors.is_empty(), "add called with an empty batch");
        anyhow::ensure!(
            vectors.len() == ids.len() && ids.len() == facets.len(),
            "batch lengths disagree: {} vectors, {} ids, {} facet records",
            vectors.len(),
            ids.len(),
            facets.len()
        );
        for (id, vector) in ids.iter().zip(vectors) {
            anyhow::ensure!(
                vector.len() == self.dim,
                "vector for '{id}' has dimension {}, index expects {}",
                vector.len(),
                self.dim
            );
            anyhow::ensure!(
                !self.id_to_slot.contains_key(id),
                "id '{id}' is already present in the index"
            );
        }
        let mut seen = BTreeSet::new();
        for id in ids {
            anyhow::ensure!(seen.insert(id), "duplicate id '{id}' within batch");
        }

        let first = self.ntotal() as u64;
        for ((vector, id), facet) in vectors.iter().zip(ids).zip(facets) {
            let slot = self.ntotal() as u64;
            self.vectors.extend(vector.iter().map(|v| f16::from_f32(*v)));
            self.slot_to_id.insert(slot, id.clone());
            self.id_to_slot.insert(id.clone(), slot);
            self.facets.insert(id.clone(), facet.clone());
            // Re-adding a previously removed id revives it under a new slot.
            self.tombstoned.remove(id);
        }
        let last = self.ntotal() as u64 - 1;

        self.save()?;
        tracing::info!(
            first,
            last,
            live = self.live_count(),
            root = %self.root.display(),
            "registered vectors"
        );
        Ok((first, last))
    }

    /// Exact k-nearest search over all live slots.
    ///
    /// Results are ordered by ascending squared Euclidean distance, ties
    /// broken by slot insertion order. At most `min(k, live_count)` results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        self.ranked(query, k, |_, _| true)
    }

    /// Exact k-nearest search restricted to `candidate_ids`.
    ///
    /// Candidate ids may carry a trailing `.qualifier` (e.g. a source file
    /// extension), which is stripped before translation. An id absent from
    /// the mapping is an error unless it was tombstoned, in which case it is
    /// skipped so removed items can never resurface through stale candidate
    /// lists. An empty selector yields an empty result.
    pub fn search_subset(
        &self,
        query: &[f32],
        k: usize,
        candidate_ids: &[String],
    ) -> Result<Vec<(String, f32)>> {
        let mut selector = BTreeSet::new();
        for raw in candidate_ids {
            let id = strip_qualifier(raw);
            match self.id_to_slot.get(id) {
                Some(slot) => {
                    selector.insert(*slot);
                }
                None if self.tombstoned.contains(id) => {}
                None => {
                    return Err(RetrievalError::IdTranslationFailure { id: id.to_string() }.into());
                }
            }
        }
        if selector.is_empty() {
            return Ok(Vec::new());
        }
        self.ranked(query, k, |slot, _| selector.contains(&slot))
    }

    fn ranked(
        &self,
        query: &[f32],
        k: usize,
        keep: impl Fn(u64, &str) -> bool,
    ) -> Result<Vec<(String, f32)>> {
        anyhow::ensure!(
            query.len() == self.dim,
            "query has dimension {}, index expects {}",
            query.len(),
            self.dim
        );

        let mut hits: Vec<(f32, u64)> = self
            .slot_to_id
            .iter()
            .filter(|(slot, id)| keep(**slot, id))
            .map(|(slot, _)| (self.squared_l2(query, *slot), *slot))
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.truncate(k);

        Ok(hits
            .into_iter()
            .map(|(dist, slot)| (self.slot_to_id[&slot].clone(), dist))
            .collect())
    }

    fn squared_l2(&self, query: &[f32], slot: u64) -> f32 {
        let start = slot as usize * self.dim;
        self.vectors[start..start + self.dim]
            .iter()
            .zip(query)
            .map(|(stored, q)| {
                let d = stored.to_f32() - q;
                d * d
            })
            .sum()
    }

    /// Logically retires ids from the mapping and persists the index. Slots
    /// are not reclaimed. Unknown ids are errors; already-tombstoned ids are
    /// no-ops.
    pub fn remove(&mut self, ids: &[String]) -> Result<()> {
        let mut changed = false;
        for raw in ids {
            let id = strip_qualifier(raw);
            match self.id_to_slot.remove(id) {
                Some(slot) => {
                    self.slot_to_id.remove(&slot);
                    self.facets.remove(id);
                    self.tombstoned.insert(id.to_string());
                    changed = true;
                }
                None if self.tombstoned.contains(id) => {}
                None => {
                    return Err(RetrievalError::IdTranslationFailure { id: id.to_string() }.into());
                }
            }
        }
        if changed {
            self.save()?;
        }
        Ok(())
    }

    /// Evaluates a filter over the facet store.
    ///
    /// With `ids = None` all live ids are considered; otherwise only the
    /// given ids (trailing qualifiers stripped). Returns matching ids in
    /// slot order respectively input order.
    pub fn filter_metadata(&self, expr: &FilterExpr, ids: Option<&[String]>) -> Vec<String> {
        let matches = |id: &str| {
            self.facets
                .get(id)
                .is_some_and(|record| expr.matches(record))
        };
        let subset: Vec<String> = match ids {
            None => self.ids().filter(|id| matches(id)).map(str::to_string).collect(),
            Some(ids) => ids
                .iter()
                .map(|raw| strip_qualifier(raw))
                .filter(|id| matches(id))
                .map(str::to_string)
                .collect(),
        };
        tracing::info!(matched = subset.len(), "facet filter evaluated");
        subset
    }

    /// Persists all three artifacts. Each is written temp-then-rename; the
    /// vector artifact goes last so a torn write is caught by the load-time
    /// cross-checks rather than silently accepted.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let mapping = MappingFile {
            slot_to_id: self.slot_to_id.clone(),
            tombstones: self.tombstoned.clone(),
        };
        write_json_atomic(&self.root.join(MAPPING_FILE), &mapping)?;
        write_json_atomic(&self.root.join(FACETS_FILE), &self.facets)?;
        self.write_vectors(&self.root.join(INDEX_FILE))?;
        Ok(())
    }

    fn write_vectors(&self, path: &Path) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            writer.write_all(&INDEX_MAGIC)?;
            writer.write_all(&INDEX_VERSION.to_le_bytes())?;
            writer.write_all(&(self.dim as u32).to_le_bytes())?;
            writer.write_all(&(self.ntotal() as u64).to_le_bytes())?;
            for value in &self.vectors {
                writer.write_all(&value.to_le_bytes())?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("replace vector artifact {}", path.display()))?;
        Ok(())
    }

    /// Loads an index from its three artifacts, failing loudly when any is
    /// missing or they disagree.
    pub fn load(root: &Path) -> Result<Self> {
        for name in [INDEX_FILE, MAPPING_FILE, FACETS_FILE] {
            if !root.join(name).is_file() {
                return Err(RetrievalError::IndexPersistenceMismatch {
                    root: root.to_path_buf(),
                    reason: format!("artifact {name} is missing"),
                }
                .into());
            }
        }

        let (dim, vectors) = read_vectors(&root.join(INDEX_FILE))?;
        let mapping: MappingFile = read_json(&root.join(MAPPING_FILE))?;
        let facets: BTreeMap<String, FacetRecord> = read_json(&root.join(FACETS_FILE))?;

        let ntotal = (vectors.len() / dim) as u64;
        let mismatch = |reason: String| RetrievalError::IndexPersistenceMismatch {
            root: root.to_path_buf(),
            reason,
        };

        let mut id_to_slot = HashMap::new();
        for (slot, id) in &mapping.slot_to_id {
            if *slot >= ntotal {
                return Err(mismatch(format!(
                    "mapping references slot {slot} but the index has only {ntotal} slots"
                ))
                .into());
            }
            if id_to_slot.insert(id.clone(), *slot).is_some() {
                return Err(mismatch(format!("id '{id}' mapped to more than one slot")).into());
            }
            if !facets.contains_key(id) {
                return Err(mismatch(format!("live id '{id}' has no facet record")).into());
            }
        }

        tracing::debug!(
            ntotal,
            live = mapping.slot_to_id.len(),
            dim,
            root = %root.display(),
            "loaded vector index"
        );
        Ok(Self {
            root: root.to_path_buf(),
            dim,
            vectors,
            slot_to_id: mapping.slot_to_id,
            id_to_slot,
            tombstoned: mapping.tombstones,
            facets,
        })
    }
}

/// Strips a trailing qualifier: everything from the first `.` on.
fn strip_qualifier(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

fn read_vectors(path: &Path) -> Result<(usize, Vec<f16>)> {
    let file =
        File::open(path).with_context(|| format!("open vector artifact {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != INDEX_MAGIC {
        bail!("{} is not a vector index artifact (bad magic)", path.display());
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let version = u16::from_le_bytes(version);
    if version != INDEX_VERSION {
        bail!("unsupported vector index version {version}");
    }
    let mut dim = [0u8; 4];
    reader.read_exact(&mut dim)?;
    let dim = u32::from_le_bytes(dim) as usize;
    let mut count = [0u8; 8];
    reader.read_exact(&mut count)?;
    let count = u64::from_le_bytes(count) as usize;

    let mut payload = vec![0u8; count * dim * 2];
    reader
        .read_exact(&mut payload)
        .with_context(|| format!("vector artifact {} is truncated", path.display()))?;
    let vectors = payload
        .chunks_exact(2)
        .map(|b| f16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok((dim, vectors))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().context("artifact path has no parent")?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(tmp.as_file(), value)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
