//! Per-dataset knowledge bases.
//!
//! A dataset directory carries a `METADATA/` subdirectory with four XML
//! documents: `image.xml` (image → slide references), `sample.xml` (slides,
//! blocks, specimens, biological beings, cases), `staining.xml` (staining
//! lists) and `observation.xml` (per-case observations). Each document is
//! parsed once and indexed by `alias` so the resolver's chain hops are plain
//! map lookups.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::RetrievalError;
use crate::xmlutil::{self, Element};

pub const METADATA_DIR: &str = "METADATA";

/// Alias-indexed view over the four knowledge-base documents of one dataset.
#[derive(Debug)]
pub struct KnowledgeBase {
    /// image alias → slide alias, from `image.xml` `IMAGE_OF` references.
    pub image_to_slide: BTreeMap<String, String>,
    slides: HashMap<String, Element>,
    blocks: HashMap<String, Element>,
    specimens: HashMap<String, Element>,
    beings: HashMap<String, Element>,
    cases: HashMap<String, Element>,
    stainings: HashMap<String, Element>,
    /// case alias → first observation referencing it.
    observations: HashMap<String, Element>,
}

impl KnowledgeBase {
    /// Loads the knowledge bases for a dataset directory.
    pub fn load(dataset_dir: &Path) -> Result<Self> {
        let meta_dir = dataset_dir.join(METADATA_DIR);

        let image = read(&meta_dir, "image.xml")?;
        let sample = read(&meta_dir, "sample.xml")?;
        let staining = read(&meta_dir, "staining.xml")?;
        let observation = read(&meta_dir, "observation.xml")?;

        let mut image_to_slide = BTreeMap::new();
        for image_elem in image.children_named("IMAGE") {
            let Some(alias) = image_elem.attr("alias") else {
                continue;
            };
            // IMAGE_OF may be nested; take the first reference in the subtree.
            let slide = image_elem
                .descendants()
                .into_iter()
                .find(|e| e.tag == "IMAGE_OF")
                .and_then(|e| e.attr("alias"));
            if let Some(slide) = slide {
                image_to_slide.insert(alias.to_string(), slide.to_string());
            }
        }

        let mut observations = HashMap::new();
        for obs in observation.children_named("OBSERVATION") {
            if let Some(case) = obs.child("CASE_REF").and_then(|r| r.attr("alias")) {
                observations
                    .entry(case.to_string())
                    .or_insert_with(|| obs.clone());
            }
        }

        Ok(Self {
            image_to_slide,
            slides: sample.alias_index("SLIDE"),
            blocks: sample.alias_index("BLOCK"),
            specimens: sample.alias_index("SPECIMEN"),
            beings: sample.alias_index("BIOLOGICAL_BEING"),
            cases: sample.alias_index("CASE"),
            stainings: staining.alias_index("STAINING"),
            observations,
        })
    }

    /// Slide alias for an image alias, the first hop of every chain.
    pub fn slide_for_image(&self, image_id: &str) -> Result<&str, RetrievalError> {
        self.image_to_slide
            .get(image_id)
            .map(String::as_str)
            .ok_or_else(|| RetrievalError::AliasResolutionFailure {
                document: "image.xml",
                element: "IMAGE",
                alias: image_id.to_string(),
            })
    }

    pub fn slide(&self, alias: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.slides, alias, "sample.xml", "SLIDE")
    }

    pub fn block(&self, alias: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.blocks, alias, "sample.xml", "BLOCK")
    }

    pub fn specimen(&self, alias: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.specimens, alias, "sample.xml", "SPECIMEN")
    }

    pub fn biological_being(&self, alias: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.beings, alias, "sample.xml", "BIOLOGICAL_BEING")
    }

    pub fn case(&self, alias: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.cases, alias, "sample.xml", "CASE")
    }

    pub fn staining_list(&self, alias: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.stainings, alias, "staining.xml", "STAINING")
    }

    pub fn observation_for_case(&self, case: &str) -> Result<&Element, RetrievalError> {
        lookup(&self.observations, case, "observation.xml", "OBSERVATION")
    }
}

fn read(meta_dir: &Path, name: &str) -> Result<Element> {
    xmlutil::read_document(&meta_dir.join(name))
        .with_context(|| format!("load knowledge base {name} from {}", meta_dir.display()))
}

fn lookup<'a>(
    index: &'a HashMap<String, Element>,
    alias: &str,
    document: &'static str,
    element: &'static str,
) -> Result<&'a Element, RetrievalError> {
    index
        .get(alias)
        .ok_or_else(|| RetrievalError::AliasResolutionFailure {
            document,
            element,
            alias: alias.to_string(),
        })
}

/// Reference attribute of the first child with the given tag.
pub(crate) fn ref_alias<'a>(
    elem: &'a Element,
    ref_tag: &str,
    document: &'static str,
    element: &'static str,
) -> Result<&'a str, RetrievalError> {
    elem.child(ref_tag)
        .and_then(|r| r.attr("alias"))
        .ok_or_else(|| RetrievalError::AliasResolutionFailure {
            document,
            element,
            alias: format!(
                "{} (missing {ref_tag})",
                elem.attr("alias").unwrap_or("<unaliased>")
            ),
        })
}
