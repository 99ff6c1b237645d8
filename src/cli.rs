//! Command-line surface of the retrieval core.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::ops::{self, IndexArgs, RemoveArgs, RetrieveArgs};

#[derive(Parser)]
#[command(name = "wsir")]
#[command(about = "Content-based retrieval over whole-slide image embeddings")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory holding `datasets/` and `embeddings/`
    #[arg(long, global = true, default_value = "inputs")]
    pub inputs_root: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Encode a dataset's slides and register it into the vector index
    Index {
        /// Dataset directory name under `<inputs_root>/datasets/`
        #[arg(short, long)]
        name: String,

        /// Embedding root name under `<inputs_root>/embeddings/`
        #[arg(short, long)]
        embeddings: String,

        /// Slide encoder (ignored when the root already pins one)
        #[arg(long, default_value = "ProvGigaPath")]
        encoder: String,

        /// Slide resolution level to encode
        #[arg(long, default_value_t = 1)]
        level: u32,

        /// Background removal strategy
        #[arg(long, default_value = "dilated-otsu")]
        remove_bg: String,

        /// Keep embeddings in full precision during encoding
        #[arg(long)]
        full_precision: bool,
    },

    /// Find the k most similar slides for a query, optionally restricted by
    /// dataset selection and metadata filtration
    Retrieve {
        /// Embedding root name under `<inputs_root>/embeddings/`
        #[arg(short, long)]
        embeddings: String,

        /// Query: embedding artifact, slide path, or `dataset/filename`
        #[arg(short, long)]
        query: Option<String>,

        /// Number of best matches to return
        #[arg(short, long, default_value_t = 3)]
        k_best: usize,

        /// Restrict candidates to these datasets
        #[arg(long, num_args = 1..)]
        datasets: Vec<String>,

        /// Metadata filter document (.json flat syntax or .xml tree syntax)
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Write the result document to this path
        #[arg(short, long)]
        save: Option<PathBuf>,
    },

    /// Remove one slide from an embedding root
    Remove {
        /// Embedding root name under `<inputs_root>/embeddings/`
        #[arg(short, long)]
        embeddings: String,

        /// Dataset the slide belongs to
        #[arg(short, long)]
        name: String,

        /// Slide filename, with or without its source extension
        #[arg(long)]
        slide: String,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let status = match cli.command {
        Commands::Index {
            name,
            embeddings,
            encoder,
            level,
            remove_bg,
            full_precision,
        } => ops::run_indexing(&IndexArgs {
            inputs_root: cli.inputs_root,
            name,
            embeddings,
            encoder,
            level,
            remove_bg,
            full_precision,
        })?,
        Commands::Retrieve {
            embeddings,
            query,
            k_best,
            datasets,
            metadata,
            save,
        } => {
            let result = ops::run_retrieval(&RetrieveArgs {
                inputs_root: cli.inputs_root,
                embeddings,
                query,
                k_best,
                datasets,
                metadata,
                save,
            })?;
            ops::retrieval::status_of(&result)?
        }
        Commands::Remove {
            embeddings,
            name,
            slide,
        } => ops::run_removal(&RemoveArgs {
            inputs_root: cli.inputs_root,
            embeddings,
            name,
            slide,
        })?,
    };
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}
