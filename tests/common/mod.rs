//! Shared fixtures: builds an inputs tree with slide files and the four
//! per-dataset knowledge-base documents.

use std::fs;
use std::path::Path;

/// One synthetic slide with single-valued facets.
pub struct SlideSpec {
    /// Source filename, extension included.
    pub file: &'static str,
    pub bytes: &'static [u8],
    pub staining: &'static str,
    pub staining_code: &'static str,
    pub species: &'static str,
    pub species_code: &'static str,
    pub organ: &'static str,
    pub organ_code: &'static str,
    pub diagnosis: &'static str,
}

pub fn feline_slide(file: &'static str, bytes: &'static [u8]) -> SlideSpec {
    SlideSpec {
        file,
        bytes,
        staining: "hematoxylin stain",
        staining_code: "SCT:12710003",
        species: "felis catus",
        species_code: "SCT:448169003",
        organ: "liver",
        organ_code: "SCT:10200004",
        diagnosis: "Hepatocellular adenoma",
    }
}

pub fn canine_slide(file: &'static str, bytes: &'static [u8]) -> SlideSpec {
    SlideSpec {
        file,
        bytes,
        staining: "eosin stain",
        staining_code: "SCT:255792006",
        species: "canis familiaris",
        species_code: "SCT:448771007",
        organ: "kidney",
        organ_code: "SCT:64033007",
        diagnosis: "Renal carcinoma",
    }
}

fn stem(file: &str) -> &str {
    file.split('.').next().unwrap_or(file)
}

/// Writes `<inputs_root>/datasets/<name>/` with `IMAGES/` and `METADATA/`.
pub fn build_dataset(inputs_root: &Path, name: &str, slides: &[SlideSpec]) {
    let dataset = inputs_root.join("datasets").join(name);
    let images = dataset.join("IMAGES");
    let metadata = dataset.join("METADATA");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&metadata).unwrap();

    let mut image_xml = String::from("<IMAGE_SET>\n");
    let mut sample_xml = String::from("<SAMPLE_SET>\n");
    let mut staining_xml = String::from("<STAINING_SET>\n");
    let mut observation_xml = String::from("<OBSERVATION_SET>\n");

    for spec in slides {
        fs::write(images.join(spec.file), spec.bytes).unwrap();
        let s = stem(spec.file);

        image_xml.push_str(&format!(
            "<IMAGE alias=\"{s}\"><FILES><IMAGE_OF alias=\"slide-{s}\"/></FILES></IMAGE>\n"
        ));

        sample_xml.push_str(&format!(
            concat!(
                "<SLIDE alias=\"slide-{s}\">",
                "<STAINING_INFORMATION_REF alias=\"stain-{s}\"/>",
                "<CREATED_FROM_REF alias=\"block-{s}\"/>",
                "</SLIDE>\n",
                "<BLOCK alias=\"block-{s}\"><SAMPLED_FROM_REF alias=\"spec-{s}\"/></BLOCK>\n",
                "<SPECIMEN alias=\"spec-{s}\">",
                "<EXTRACTED_FROM_REF alias=\"being-{s}\"/>",
                "<PART_OF_CASE_REF alias=\"case-{s}\"/>",
                "<CODE_ATTRIBUTE><TAG>anatomical_site</TAG>",
                "<VALUE><CODE>{organ_code}</CODE><MEANING>{organ}</MEANING></VALUE>",
                "</CODE_ATTRIBUTE>",
                "</SPECIMEN>\n",
                "<BIOLOGICAL_BEING alias=\"being-{s}\">",
                "<CODE_ATTRIBUTE><TAG>animal_species</TAG>",
                "<VALUE><CODE>{species_code}</CODE><MEANING>{species}</MEANING></VALUE>",
                "</CODE_ATTRIBUTE>",
                "</BIOLOGICAL_BEING>\n",
                "<CASE alias=\"case-{s}\"/>\n",
            ),
            s = s,
            organ = spec.organ,
            organ_code = spec.organ_code,
            species = spec.species,
            species_code = spec.species_code,
        ));

        staining_xml.push_str(&format!(
            concat!(
                "<STAINING alias=\"stain-{s}\"><COMPOUND>",
                "<CODE_ATTRIBUTE><TAG>staining_compound</TAG>",
                "<VALUE><CODE>{code}</CODE><MEANING>{meaning}</MEANING></VALUE>",
                "</CODE_ATTRIBUTE>",
                "</COMPOUND></STAINING>\n",
            ),
            s = s,
            code = spec.staining_code,
            meaning = spec.staining,
        ));

        observation_xml.push_str(&format!(
            concat!(
                "<OBSERVATION><CASE_REF alias=\"case-{s}\"/>",
                "<STATEMENT><STATEMENT_TYPE>Diagnosis</STATEMENT_TYPE>",
                "<CODE_ATTRIBUTE><TAG>Diagnosis</TAG>",
                "<VALUE><CODE>DX:{s}</CODE><MEANING>{diagnosis}</MEANING></VALUE>",
                "</CODE_ATTRIBUTE>",
                "</STATEMENT></OBSERVATION>\n",
            ),
            s = s,
            diagnosis = spec.diagnosis,
        ));
    }

    image_xml.push_str("</IMAGE_SET>\n");
    sample_xml.push_str("</SAMPLE_SET>\n");
    staining_xml.push_str("</STAINING_SET>\n");
    observation_xml.push_str("</OBSERVATION_SET>\n");

    fs::write(metadata.join("image.xml"), image_xml).unwrap();
    fs::write(metadata.join("sample.xml"), sample_xml).unwrap();
    fs::write(metadata.join("staining.xml"), staining_xml).unwrap();
    fs::write(metadata.join("observation.xml"), observation_xml).unwrap();
}
