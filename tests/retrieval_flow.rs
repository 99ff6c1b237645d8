//! End-to-end retrieval: dataset restriction, metadata filtration in both
//! syntaxes, removal, and the CLI surface.

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

use wsi_retrieval::encoder::HashSlideEncoder;
use wsi_retrieval::ops::{self, IndexArgs, RemoveArgs, RetrieveArgs};

fn build_inputs(inputs_root: &Path) {
    common::build_dataset(
        inputs_root,
        "ds1",
        &[
            common::feline_slide("alpha.svs", b"alpha slide bytes"),
            common::feline_slide("beta.svs", b"beta slide bytes"),
            common::canine_slide("gamma.svs", b"gamma slide bytes"),
        ],
    );
    common::build_dataset(
        inputs_root,
        "ds2",
        &[
            common::canine_slide("delta.svs", b"delta slide bytes"),
            common::canine_slide("epsilon.svs", b"epsilon slide bytes"),
        ],
    );
}

fn index_all(inputs_root: &Path) {
    let encoder = HashSlideEncoder::default();
    for name in ["ds1", "ds2"] {
        let args = IndexArgs {
            inputs_root: inputs_root.to_path_buf(),
            name: name.into(),
            embeddings: "db".into(),
            encoder: "Hash".into(),
            level: 1,
            remove_bg: "dilated-otsu".into(),
            full_precision: false,
        };
        ops::run_with_encoder(&args, &encoder).unwrap();
    }
}

fn retrieve_args(inputs_root: &Path) -> RetrieveArgs {
    RetrieveArgs {
        inputs_root: inputs_root.to_path_buf(),
        embeddings: "db".into(),
        query: None,
        k_best: 3,
        datasets: Vec::new(),
        metadata: None,
        save: None,
    }
}

fn emb_root(inputs_root: &Path) -> PathBuf {
    inputs_root.join("embeddings").join("db")
}

#[test]
fn self_retrieval_ranks_the_query_first() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let artifact = emb_root(tmp.path()).join("ds1").join("alpha_embedding.wse");
    let mut args = retrieve_args(tmp.path());
    args.query = Some(artifact.display().to_string());
    args.k_best = 1;

    let result = ops::run_retrieval(&args).unwrap();
    let sims = result.similarities.unwrap();
    assert_eq!(sims.len(), 1);
    assert_eq!(sims[0].0, "ds1/alpha");
    assert_eq!(sims[0].1, 0.0);
}

#[test]
fn query_by_indexed_reference_matches_artifact_query() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/alpha.svs".into());
    args.k_best = 10;

    let result = ops::run_retrieval(&args).unwrap();
    let sims = result.similarities.unwrap();
    // k is clamped to the live population.
    assert_eq!(sims.len(), 5);
    assert_eq!(sims[0].0, "ds1/alpha");
    assert_eq!(sims[0].1, 0.0);
    // Distances come back in ascending order.
    for pair in sims.windows(2) {
        assert!(pair[0].1 <= pair[1].1);
    }
}

#[test]
fn dataset_restriction_limits_candidates() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/alpha.svs".into());
    args.k_best = 10;
    args.datasets = vec!["ds2".into()];

    let result = ops::run_retrieval(&args).unwrap();
    let sims = result.similarities.unwrap();
    assert_eq!(sims.len(), 2);
    assert!(sims.iter().all(|(id, _)| id.starts_with("ds2/")));
}

#[test]
fn restricting_to_an_unfinished_dataset_fails() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/alpha.svs".into());
    args.datasets = vec!["ds9".into()];

    let err = ops::run_retrieval(&args).unwrap_err();
    assert!(err.to_string().contains("not fully encoded"), "{err}");
}

#[test]
fn flat_and_tree_filters_select_the_same_subset() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let flat = tmp.path().join("filter.json");
    fs::write(&flat, r#"{"species": "felis catus"}"#).unwrap();
    let tree = tmp.path().join("filter.xml");
    fs::write(
        &tree,
        r#"<filter><CONDITION variable="SPECIES" value="felis catus"/></filter>"#,
    )
    .unwrap();

    let mut by_flat = Vec::new();
    let mut by_tree = Vec::new();
    for (path, out) in [(&flat, &mut by_flat), (&tree, &mut by_tree)] {
        let mut args = retrieve_args(tmp.path());
        args.metadata = Some(path.clone());
        let result = ops::run_retrieval(&args).unwrap();
        assert!(result.similarities.is_none());
        *out = result.filtered.unwrap();
        out.sort();
    }
    assert_eq!(by_flat, vec!["ds1/alpha".to_string(), "ds1/beta".to_string()]);
    assert_eq!(by_flat, by_tree);
}

#[test]
fn filtered_search_excludes_nonmatching_neighbours() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let filter = tmp.path().join("filter.json");
    fs::write(&filter, r#"{"species": "canis familiaris"}"#).unwrap();

    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/alpha.svs".into());
    args.k_best = 10;
    args.metadata = Some(filter);

    let result = ops::run_retrieval(&args).unwrap();
    let sims = result.similarities.unwrap();
    assert_eq!(sims.len(), 3);
    assert!(sims
        .iter()
        .all(|(id, _)| ["ds1/gamma", "ds2/delta", "ds2/epsilon"].contains(&id.as_str())));
}

#[test]
fn filter_matching_nothing_yields_an_empty_result() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let filter = tmp.path().join("filter.json");
    fs::write(&filter, r#"{"species": "mus musculus"}"#).unwrap();

    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/alpha.svs".into());
    args.metadata = Some(filter);

    let result = ops::run_retrieval(&args).unwrap();
    assert_eq!(result.similarities.unwrap(), Vec::new());
}

#[test]
fn neither_query_nor_filter_is_rejected() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let err = ops::run_retrieval(&retrieve_args(tmp.path())).unwrap_err();
    assert!(err.to_string().contains("neither a query nor a metadata filter"));
}

#[test]
fn save_appends_json_extension() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/alpha.svs".into());
    args.save = Some(tmp.path().join("results"));
    ops::run_retrieval(&args).unwrap();

    let raw = fs::read_to_string(tmp.path().join("results.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["embedding_database"], "db");
    assert_eq!(doc["similarities"][0][0], "ds1/alpha");
}

#[test]
fn removed_slide_never_resurfaces() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    index_all(tmp.path());

    ops::run_removal(&RemoveArgs {
        inputs_root: tmp.path().to_path_buf(),
        embeddings: "db".into(),
        name: "ds1".into(),
        slide: "alpha.svs".into(),
    })
    .unwrap();

    let artifact = emb_root(tmp.path()).join("ds1").join("alpha_embedding.wse");
    assert!(!artifact.exists());

    // Unrestricted search: the tombstoned slide is gone.
    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/beta.svs".into());
    args.k_best = 10;
    let sims = ops::run_retrieval(&args).unwrap().similarities.unwrap();
    assert_eq!(sims.len(), 4);
    assert!(sims.iter().all(|(id, _)| id != "ds1/alpha"));

    // Dataset-restricted search reads the pruned log and still works.
    let mut args = retrieve_args(tmp.path());
    args.query = Some("ds1/beta.svs".into());
    args.k_best = 10;
    args.datasets = vec!["ds1".into()];
    let sims = ops::run_retrieval(&args).unwrap().similarities.unwrap();
    assert_eq!(sims.len(), 2);
}

#[test]
fn cli_index_then_retrieve_roundtrip() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());
    let inputs = tmp.path().to_str().unwrap();

    for name in ["ds1", "ds2"] {
        Command::new(assert_cmd::cargo::cargo_bin!("wsir"))
            .args([
                "--inputs-root",
                inputs,
                "index",
                "-n",
                name,
                "-e",
                "db",
                "--encoder",
                "Hash",
            ])
            .assert()
            .success()
            .stdout(contains("Finished"));
    }

    Command::new(assert_cmd::cargo::cargo_bin!("wsir"))
        .args([
            "--inputs-root",
            inputs,
            "retrieve",
            "-e",
            "db",
            "-q",
            "ds1/alpha.svs",
            "-k",
            "2",
        ])
        .assert()
        .success()
        .stdout(contains("ds1/alpha"));
}

#[test]
fn cli_rejects_unknown_encoder() {
    let tmp = TempDir::new().unwrap();
    build_inputs(tmp.path());

    Command::new(assert_cmd::cargo::cargo_bin!("wsir"))
        .args([
            "--inputs-root",
            tmp.path().to_str().unwrap(),
            "index",
            "-n",
            "ds1",
            "-e",
            "db",
            "--encoder",
            "ResNet",
        ])
        .assert()
        .failure()
        .stderr(contains("unknown encoder"));
}
