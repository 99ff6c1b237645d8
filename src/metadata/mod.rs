//! Clinical/biological metadata layer.
//!
//! - [`kb`]: loads the four per-dataset knowledge-base documents and builds
//!   alias indexes over their records.
//! - [`resolver`]: walks the alias-reference chains to produce one
//!   [`FacetRecord`] per slide.
//! - [`filter`]: the boolean facet-filter evaluator with its two surface
//!   syntaxes.

pub mod filter;
pub mod kb;
pub mod resolver;

pub use filter::FilterExpr;
pub use kb::KnowledgeBase;

use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// Resolved facet values for one indexed item. The `_code` lists pair coded
/// vocabulary entries with the human-readable value lists; filters match
/// against both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetRecord {
    pub staining: Vec<String>,
    pub species: Vec<String>,
    pub organ: Vec<String>,
    pub case: Vec<String>,
    pub diagnosis: Vec<String>,
    #[serde(default)]
    pub staining_code: Vec<String>,
    #[serde(default)]
    pub species_code: Vec<String>,
    #[serde(default)]
    pub organ_code: Vec<String>,
}

/// The closed set of filterable facet names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetField {
    Staining,
    Species,
    Organ,
    Case,
    Diagnosis,
}

pub const FACET_FIELDS: &[&str] = &["staining", "species", "organ", "case", "diagnosis"];

impl FacetField {
    pub fn parse(key: &str) -> Result<Self, RetrievalError> {
        match key {
            "staining" => Ok(Self::Staining),
            "species" => Ok(Self::Species),
            "organ" => Ok(Self::Organ),
            "case" => Ok(Self::Case),
            "diagnosis" => Ok(Self::Diagnosis),
            _ => Err(RetrievalError::UnknownVariant {
                what: "facet",
                key: key.to_string(),
                known: FACET_FIELDS,
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staining => "staining",
            Self::Species => "species",
            Self::Organ => "organ",
            Self::Case => "case",
            Self::Diagnosis => "diagnosis",
        }
    }
}

impl FacetRecord {
    /// Human-readable value list for a facet.
    pub fn values(&self, field: FacetField) -> &[String] {
        match field {
            FacetField::Staining => &self.staining,
            FacetField::Species => &self.species,
            FacetField::Organ => &self.organ,
            FacetField::Case => &self.case,
            FacetField::Diagnosis => &self.diagnosis,
        }
    }

    /// Paired code list for a facet; empty for facets without codes.
    pub fn codes(&self, field: FacetField) -> &[String] {
        match field {
            FacetField::Staining => &self.staining_code,
            FacetField::Species => &self.species_code,
            FacetField::Organ => &self.organ_code,
            FacetField::Case | FacetField::Diagnosis => &[],
        }
    }

    /// Membership test used by every filter atom: present in either the
    /// value list or the paired code list.
    pub fn contains(&self, field: FacetField, value: &str) -> bool {
        self.values(field).iter().any(|v| v == value)
            || self.codes(field).iter().any(|c| c == value)
    }
}
