//! Slide encoder boundary.
//!
//! The deep patch/slide encoder models are external collaborators: they turn
//! pixels into one fixed-dimension float vector per slide. This module owns
//! everything the core needs to know about them: the closed set of encoder
//! identities with their output dimensions, the [`SlideEncoder`] trait the
//! orchestrator drives, the slide-reader kind detection for an image root,
//! and the on-disk embedding artifact format.
//!
//! Only the deterministic hash encoder is runnable in-process; the named
//! model kinds resolve identity and dimension so ledgers written by an
//! external encoding run stay usable here.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use half::f16;

use crate::error::RetrievalError;

/// Magic bytes for the embedding artifact format.
pub const EMBEDDING_MAGIC: [u8; 4] = *b"WSEM";

/// Embedding artifact file version.
pub const EMBEDDING_VERSION: u16 = 1;

/// File suffix appended to a slide stem to name its embedding artifact.
pub const EMBEDDING_SUFFIX: &str = "_embedding.wse";

/// Dimension of the test/dev hash encoder.
pub const HASH_ENCODER_DIM: usize = 256;

/// A slide-level encoder: one fixed-dimension vector per slide.
pub trait SlideEncoder {
    /// Stable identifier recorded in the ledger config.
    fn id(&self) -> &str;

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Encodes one slide into a vector of exactly [`dimension`](Self::dimension)
    /// floats. `level` is the resolution level the pipeline was pinned to.
    fn encode(&self, slide_path: &Path, level: u32) -> Result<Vec<f32>>;
}

/// The closed set of supported encoder identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    ProvGigaPath,
    Chief,
    Titan,
    Prism,
    /// Deterministic FNV-1a feature-hashing encoder, always available.
    Hash,
}

pub const ENCODER_KINDS: &[&str] = &["ProvGigaPath", "PGP", "CHIEF", "TITAN", "PRISM", "Hash"];

impl EncoderKind {
    pub fn parse(key: &str) -> Result<Self, RetrievalError> {
        match key {
            "ProvGigaPath" | "PGP" => Ok(Self::ProvGigaPath),
            "CHIEF" => Ok(Self::Chief),
            "TITAN" => Ok(Self::Titan),
            "PRISM" => Ok(Self::Prism),
            "Hash" => Ok(Self::Hash),
            _ => Err(RetrievalError::UnknownVariant {
                what: "encoder",
                key: key.to_string(),
                known: ENCODER_KINDS,
            }),
        }
    }

    /// Output dimension of this encoder's slide-level embedding.
    pub fn dimension(self) -> usize {
        match self {
            Self::ProvGigaPath | Self::Chief | Self::Titan => 768,
            Self::Prism => 1280,
            Self::Hash => HASH_ENCODER_DIM,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProvGigaPath => "ProvGigaPath",
            Self::Chief => "CHIEF",
            Self::Titan => "TITAN",
            Self::Prism => "PRISM",
            Self::Hash => "Hash",
        }
    }

    /// Instantiates an in-process encoder for this kind.
    ///
    /// The deep models run in the external inference collaborator; asking
    /// for them here is an error rather than a silent fallback.
    pub fn instantiate(self) -> Result<Box<dyn SlideEncoder>> {
        match self {
            Self::Hash => Ok(Box::new(HashSlideEncoder::default())),
            other => bail!(
                "encoder '{}' requires the external model runtime; \
                 only precomputed embeddings or the 'Hash' encoder run in-process",
                other.as_str()
            ),
        }
    }
}

/// How the slides of an image root are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideReaderKind {
    /// Each slide is a DICOM directory.
    Dicom,
    /// Each slide is a single image file.
    SingleFile,
}

impl SlideReaderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dicom => "wsidicom",
            Self::SingleFile => "openslide",
        }
    }

    /// Picks the reader for an image root: all children directories → DICOM,
    /// all children files → single-file. A mix is a layout error.
    pub fn detect_for_dir(images_dir: &Path) -> Result<Self, RetrievalError> {
        let entries = std::fs::read_dir(images_dir).map_err(|_| RetrievalError::PathNotFound {
            path: images_dir.to_path_buf(),
            available: Vec::new(),
        })?;

        let mut dirs = 0usize;
        let mut files = 0usize;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                dirs += 1;
            } else {
                files += 1;
            }
        }
        match (dirs, files) {
            (_, 0) => Ok(Self::Dicom),
            (0, _) => Ok(Self::SingleFile),
            _ => Err(RetrievalError::HeterogeneousDatasetLayout {
                path: images_dir.to_path_buf(),
            }),
        }
    }

    pub fn detect_for_file(path: &Path) -> Result<Self, RetrievalError> {
        if path.is_dir() {
            Ok(Self::Dicom)
        } else if path.is_file() {
            Ok(Self::SingleFile)
        } else {
            Err(RetrievalError::PathNotFound {
                path: path.to_path_buf(),
                available: Vec::new(),
            })
        }
    }
}

/// FNV-1a feature-hashing encoder over the raw slide bytes.
///
/// Deterministic and dependency-free, which makes it the encoder of choice
/// for tests and for smoke-testing a deployment without model weights. For a
/// DICOM directory the per-file digests are combined in filename order so the
/// result is stable across filesystems.
#[derive(Debug, Clone)]
pub struct HashSlideEncoder {
    id: String,
    dimension: usize,
}

impl Default for HashSlideEncoder {
    fn default() -> Self {
        Self::new(HASH_ENCODER_DIM)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental FNV-1a over fixed 8-byte windows, committing each full window
/// into a signed bucket. The running state survives read-buffer and file
/// boundaries so the digest depends only on the byte stream; `flush` commits
/// a trailing window shorter than 8 bytes instead of dropping it.
struct WindowHasher {
    hash: u64,
    pending: usize,
}

impl WindowHasher {
    fn new() -> Self {
        Self {
            hash: FNV_OFFSET,
            pending: 0,
        }
    }

    fn absorb(&mut self, counts: &mut [f32], bytes: &[u8]) {
        for byte in bytes {
            self.hash ^= u64::from(*byte);
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
            self.pending += 1;
            if self.pending == 8 {
                self.commit(counts);
            }
        }
    }

    fn commit(&mut self, counts: &mut [f32]) {
        let bucket = (self.hash >> 1) as usize % counts.len();
        let sign = if self.hash & 1 == 0 { 1.0 } else { -1.0 };
        counts[bucket] += sign;
        self.hash = FNV_OFFSET;
        self.pending = 0;
    }

    fn flush(&mut self, counts: &mut [f32]) {
        if self.pending > 0 {
            self.commit(counts);
        }
    }
}

impl HashSlideEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            id: format!("fnv1a-{dimension}"),
            dimension,
        }
    }

    fn encode_file(
        &self,
        hasher: &mut WindowHasher,
        counts: &mut [f32],
        path: &Path,
    ) -> Result<()> {
        let file =
            File::open(path).with_context(|| format!("open slide file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.absorb(counts, &buf[..n]);
        }
        Ok(())
    }
}

impl SlideEncoder for HashSlideEncoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, slide_path: &Path, level: u32) -> Result<Vec<f32>> {
        let mut counts = vec![0.0f32; self.dimension];
        let mut hasher = WindowHasher::new();
        // The resolution level participates in the hash so re-pinning a root
        // to a different level cannot silently reuse old vectors.
        hasher.absorb(&mut counts, &level.to_le_bytes());

        match SlideReaderKind::detect_for_file(slide_path)? {
            SlideReaderKind::SingleFile => {
                self.encode_file(&mut hasher, &mut counts, slide_path)?
            }
            SlideReaderKind::Dicom => {
                let mut members: Vec<PathBuf> = std::fs::read_dir(slide_path)?
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                members.sort();
                for member in members {
                    self.encode_file(&mut hasher, &mut counts, &member)?;
                }
            }
        }
        hasher.flush(&mut counts);

        let norm = counts.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut counts {
                *v /= norm;
            }
        }
        Ok(counts)
    }
}

/// Saves an embedding artifact: magic, version, dimension, then the vector
/// at half precision, little endian. Temp-file-then-rename plus fsync so the
/// ledger can safely be appended after this returns.
pub fn save_embedding(path: &Path, vector: &[f32]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        writer.write_all(&EMBEDDING_MAGIC)?;
        writer.write_all(&EMBEDDING_VERSION.to_le_bytes())?;
        writer.write_all(&(vector.len() as u32).to_le_bytes())?;
        for value in vector {
            writer.write_all(&f16::from_f32(*value).to_le_bytes())?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace embedding artifact {}", path.display()))?;
    Ok(())
}

/// Loads an embedding artifact, widening back to f32.
pub fn load_embedding(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path)
        .with_context(|| format!("open embedding artifact {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != EMBEDDING_MAGIC {
        bail!("{} is not an embedding artifact (bad magic)", path.display());
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let version = u16::from_le_bytes(version);
    if version != EMBEDDING_VERSION {
        bail!("unsupported embedding artifact version {version}");
    }
    let mut dim = [0u8; 4];
    reader.read_exact(&mut dim)?;
    let dim = u32::from_le_bytes(dim) as usize;

    let mut payload = vec![0u8; dim * 2];
    reader.read_exact(&mut payload).with_context(|| {
        format!("embedding artifact {} is truncated", path.display())
    })?;
    Ok(payload
        .chunks_exact(2)
        .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
        .collect())
}

/// Artifact name for a slide stem, e.g. `slideA` → `slideA_embedding.wse`.
pub fn embedding_artifact_name(stem: &str) -> String {
    format!("{stem}{EMBEDDING_SUFFIX}")
}
