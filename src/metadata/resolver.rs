//! Facet resolution by alias-chain traversal.
//!
//! Every facet of a slide is reached through a chain of alias references
//! across the knowledge bases:
//!
//! - staining: slide → `STAINING_INFORMATION_REF` → staining list → compound
//!   attributes (meaning + code)
//! - species: slide → block (`CREATED_FROM_REF`) → specimens
//!   (`SAMPLED_FROM_REF`) → biological being (`EXTRACTED_FROM_REF`) →
//!   `animal_species` attribute
//! - organ: slide → block → specimens → `anatomical_site` attribute
//! - diagnosis: slide → block → specimen → case (`PART_OF_CASE_REF`) →
//!   observation → `Diagnosis` statement
//!
//! A missing alias at any hop is surfaced as
//! [`RetrievalError::AliasResolutionFailure`] naming the failing hop; chains
//! are never silently shortened. Meanings are lowercased, codes kept
//! verbatim. Organ values are deduplicated and sorted so a record resolves
//! identically run over run.

use std::collections::BTreeSet;

use crate::error::{Result, RetrievalError};
use crate::metadata::kb::{ref_alias, KnowledgeBase};
use crate::metadata::FacetRecord;
use crate::xmlutil::Element;

/// Resolves the complete facet record for one slide alias.
pub fn resolve_slide(kb: &KnowledgeBase, slide_id: &str) -> Result<FacetRecord> {
    let (staining, staining_code) = stain_lists(kb, slide_id)?;
    let (species, species_code) = species_lists(kb, slide_id)?;
    let (organ, organ_code) = organ_lists(kb, slide_id)?;
    let case = case_ids(kb, slide_id)?;
    let diagnosis = diagnoses(kb, &case[0])?;

    Ok(FacetRecord {
        staining,
        species,
        organ,
        case,
        diagnosis,
        staining_code,
        species_code,
        organ_code,
    })
}

/// Resolves the facet record for an image alias (one extra hop through
/// `image.xml`).
pub fn resolve_image(kb: &KnowledgeBase, image_id: &str) -> Result<FacetRecord> {
    let slide_id = kb.slide_for_image(image_id)?.to_string();
    resolve_slide(kb, &slide_id)
}

/// Staining compound meanings (lowercased) and codes for a slide.
pub fn stain_lists(kb: &KnowledgeBase, slide_id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let slide = kb.slide(slide_id)?;
    let list_alias = ref_alias(slide, "STAINING_INFORMATION_REF", "sample.xml", "SLIDE")?;
    let staining_list = kb.staining_list(list_alias)?;

    let mut meanings = Vec::new();
    let mut codes = Vec::new();
    for stain in &staining_list.children {
        for ca in stain.children_named("CODE_ATTRIBUTE") {
            if ca.child_text("TAG") == Some("staining_compound") {
                if let Some(meaning) = descendant_text(ca, "MEANING") {
                    meanings.push(meaning.to_lowercase());
                }
                if let Some(code) = descendant_text(ca, "CODE") {
                    codes.push(code.to_string());
                }
            }
        }
        for sa in stain.children_named("STRING_ATTRIBUTE") {
            if sa.child_text("TAG") == Some("staining_compound") {
                if let Some(value) = sa.child_text("VALUE").filter(|v| !v.is_empty()) {
                    meanings.push(value.to_lowercase());
                }
            }
        }
    }
    Ok((meanings, codes))
}

/// Species meanings (lowercased) and codes for a slide.
pub fn species_lists(kb: &KnowledgeBase, slide_id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut meanings = Vec::new();
    let mut codes = Vec::new();
    for specimen in block_specimens(kb, slide_id)? {
        let being_alias = ref_alias(specimen, "EXTRACTED_FROM_REF", "sample.xml", "SPECIMEN")?;
        let being = kb.biological_being(being_alias)?;
        collect_code_attributes(being, "animal_species", &mut meanings, &mut codes);
    }
    Ok((meanings, codes))
}

/// Anatomical-site meanings (lowercased) and codes for a slide, deduplicated.
pub fn organ_lists(kb: &KnowledgeBase, slide_id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut meanings = Vec::new();
    let mut codes = Vec::new();
    for specimen in block_specimens(kb, slide_id)? {
        collect_code_attributes(specimen, "anatomical_site", &mut meanings, &mut codes);
    }
    Ok((dedup_sorted(meanings), dedup_sorted(codes)))
}

/// Case alias for a slide. Returned as a single-element list to match the
/// shape of the other facets.
pub fn case_ids(kb: &KnowledgeBase, slide_id: &str) -> Result<Vec<String>> {
    for specimen in block_specimens(kb, slide_id)? {
        let case_alias = ref_alias(specimen, "PART_OF_CASE_REF", "sample.xml", "SPECIMEN")?;
        if kb.case(case_alias).is_ok() {
            return Ok(vec![case_alias.to_string()]);
        }
    }
    Err(RetrievalError::AliasResolutionFailure {
        document: "sample.xml",
        element: "CASE",
        alias: slide_id.to_string(),
    })
}

/// Diagnosis statement meanings for a case.
pub fn diagnoses(kb: &KnowledgeBase, case_id: &str) -> Result<Vec<String>> {
    let observation = kb.observation_for_case(case_id)?;
    let statement = observation
        .children_named("STATEMENT")
        .find(|s| s.child_text("STATEMENT_TYPE") == Some("Diagnosis"))
        .ok_or_else(|| RetrievalError::AliasResolutionFailure {
            document: "observation.xml",
            element: "STATEMENT",
            alias: case_id.to_string(),
        })?;

    let mut out = Vec::new();
    for node in statement.descendants() {
        if node.tag == "CODE_ATTRIBUTE" && node.child_text("TAG") == Some("Diagnosis") {
            if let Some(meaning) = descendant_text(node, "MEANING") {
                out.push(meaning.to_string());
            }
        }
    }
    Ok(out)
}

/// Specimens sampled into the block this slide was created from.
fn block_specimens<'a>(kb: &'a KnowledgeBase, slide_id: &str) -> Result<Vec<&'a Element>> {
    let slide = kb.slide(slide_id)?;
    let block_alias = ref_alias(slide, "CREATED_FROM_REF", "sample.xml", "SLIDE")?;
    let block = kb.block(block_alias)?;

    let mut specimens = Vec::new();
    for sampled in block.children_named("SAMPLED_FROM_REF") {
        let alias = sampled
            .attr("alias")
            .ok_or_else(|| RetrievalError::AliasResolutionFailure {
                document: "sample.xml",
                element: "BLOCK",
                alias: format!("{block_alias} (SAMPLED_FROM_REF without alias)"),
            })?;
        specimens.push(kb.specimen(alias)?);
    }
    Ok(specimens)
}

/// Collects meaning (lowercased) and code values of every `CODE_ATTRIBUTE`
/// in the subtree whose `TAG` matches.
fn collect_code_attributes(
    elem: &Element,
    tag: &str,
    meanings: &mut Vec<String>,
    codes: &mut Vec<String>,
) {
    for node in elem.descendants() {
        if node.tag == "CODE_ATTRIBUTE" && node.child_text("TAG") == Some(tag) {
            if let Some(meaning) = descendant_text(node, "MEANING") {
                meanings.push(meaning.to_lowercase());
            }
            if let Some(code) = descendant_text(node, "CODE") {
                codes.push(code.to_string());
            }
        }
    }
}

fn descendant_text<'a>(elem: &'a Element, tag: &str) -> Option<&'a str> {
    elem.descendants()
        .into_iter()
        .find(|e| e.tag == tag)
        .map(|e| e.text.as_str())
        .filter(|t| !t.is_empty())
}

fn dedup_sorted(values: Vec<String>) -> Vec<String> {
    values.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    fn write_kb(dir: &Path, sample: &str) {
        let meta = dir.join("METADATA");
        fs::create_dir_all(&meta).unwrap();
        fs::write(
            meta.join("image.xml"),
            "<IMAGE_SET><IMAGE alias=\"img\">\
             <FILES><IMAGE_OF alias=\"slide-a\"/></FILES>\
             </IMAGE></IMAGE_SET>",
        )
        .unwrap();
        fs::write(meta.join("sample.xml"), sample).unwrap();
        fs::write(
            meta.join("staining.xml"),
            "<STAINING_SET><STAINING alias=\"stain-a\"><COMPOUND>\
             <CODE_ATTRIBUTE><TAG>staining_compound</TAG>\
             <VALUE><CODE>SCT:1</CODE><MEANING>Hematoxylin Stain</MEANING></VALUE>\
             </CODE_ATTRIBUTE>\
             </COMPOUND></STAINING></STAINING_SET>",
        )
        .unwrap();
        fs::write(
            meta.join("observation.xml"),
            "<OBSERVATION_SET><OBSERVATION><CASE_REF alias=\"case-a\"/>\
             <STATEMENT><STATEMENT_TYPE>Diagnosis</STATEMENT_TYPE>\
             <CODE_ATTRIBUTE><TAG>Diagnosis</TAG>\
             <VALUE><CODE>DX:1</CODE><MEANING>Hepatocellular adenoma</MEANING></VALUE>\
             </CODE_ATTRIBUTE>\
             </STATEMENT></OBSERVATION></OBSERVATION_SET>",
        )
        .unwrap();
    }

    const SAMPLE: &str = "<SAMPLE_SET>\
        <SLIDE alias=\"slide-a\">\
        <STAINING_INFORMATION_REF alias=\"stain-a\"/>\
        <CREATED_FROM_REF alias=\"block-a\"/>\
        </SLIDE>\
        <BLOCK alias=\"block-a\">\
        <SAMPLED_FROM_REF alias=\"spec-a\"/>\
        <SAMPLED_FROM_REF alias=\"spec-b\"/>\
        </BLOCK>\
        <SPECIMEN alias=\"spec-a\">\
        <EXTRACTED_FROM_REF alias=\"being-a\"/>\
        <PART_OF_CASE_REF alias=\"case-a\"/>\
        <CODE_ATTRIBUTE><TAG>anatomical_site</TAG>\
        <VALUE><CODE>SCT:2</CODE><MEANING>Liver</MEANING></VALUE>\
        </CODE_ATTRIBUTE>\
        </SPECIMEN>\
        <SPECIMEN alias=\"spec-b\">\
        <EXTRACTED_FROM_REF alias=\"being-a\"/>\
        <PART_OF_CASE_REF alias=\"case-a\"/>\
        <CODE_ATTRIBUTE><TAG>anatomical_site</TAG>\
        <VALUE><CODE>SCT:2</CODE><MEANING>Liver</MEANING></VALUE>\
        </CODE_ATTRIBUTE>\
        </SPECIMEN>\
        <BIOLOGICAL_BEING alias=\"being-a\">\
        <CODE_ATTRIBUTE><TAG>animal_species</TAG>\
        <VALUE><CODE>SCT:3</CODE><MEANING>Felis Catus</MEANING></VALUE>\
        </CODE_ATTRIBUTE>\
        </BIOLOGICAL_BEING>\
        <CASE alias=\"case-a\"/>\
        </SAMPLE_SET>";

    #[test]
    fn image_chain_resolves_all_facets() {
        let dir = TempDir::new().unwrap();
        write_kb(dir.path(), SAMPLE);
        let kb = KnowledgeBase::load(dir.path()).unwrap();

        let record = resolve_image(&kb, "img").unwrap();
        assert_eq!(record.staining, vec!["hematoxylin stain"]);
        assert_eq!(record.staining_code, vec!["SCT:1"]);
        // two specimens carry the same being, so the species repeats
        assert_eq!(record.species, vec!["felis catus", "felis catus"]);
        assert_eq!(record.case, vec!["case-a"]);
        assert_eq!(record.diagnosis, vec!["Hepatocellular adenoma"]);
    }

    #[test]
    fn organ_values_are_deduplicated_and_sorted() {
        let dir = TempDir::new().unwrap();
        write_kb(dir.path(), SAMPLE);
        let kb = KnowledgeBase::load(dir.path()).unwrap();

        let (organs, codes) = organ_lists(&kb, "slide-a").unwrap();
        assert_eq!(organs, vec!["liver"]);
        assert_eq!(codes, vec!["SCT:2"]);
    }

    #[test]
    fn missing_hop_names_document_element_and_alias() {
        // slide references a block that sample.xml never declares
        let broken = "<SAMPLE_SET>\
            <SLIDE alias=\"slide-a\">\
            <STAINING_INFORMATION_REF alias=\"stain-a\"/>\
            <CREATED_FROM_REF alias=\"block-missing\"/>\
            </SLIDE>\
            </SAMPLE_SET>";
        let dir = TempDir::new().unwrap();
        write_kb(dir.path(), broken);
        let kb = KnowledgeBase::load(dir.path()).unwrap();

        let err = species_lists(&kb, "slide-a").unwrap_err();
        match err {
            RetrievalError::AliasResolutionFailure {
                document,
                element,
                alias,
            } => {
                assert_eq!(document, "sample.xml");
                assert_eq!(element, "BLOCK");
                assert_eq!(alias, "block-missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_image_alias_fails_on_the_first_hop() {
        let dir = TempDir::new().unwrap();
        write_kb(dir.path(), SAMPLE);
        let kb = KnowledgeBase::load(dir.path()).unwrap();

        let err = resolve_image(&kb, "nope").unwrap_err();
        assert!(err.to_string().contains("image.xml"));
        assert!(err.to_string().contains("nope"));
    }
}
