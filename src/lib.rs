//! Content-based image retrieval core for whole-slide image embeddings.
//!
//! The crate is organized around one embedding root per encoder
//! configuration:
//!
//! - [`encoder`]: slide encoders and the embedding artifact format
//! - [`ledger`]: the crash-resumable indexing progress ledger
//! - [`metadata`]: clinical facet resolution and metadata filtration
//! - [`index`]: the exact nearest-neighbour vector index
//! - [`ops`]: the indexing, retrieval and removal pipelines
//! - [`cli`]: command-line surface

pub mod cli;
pub mod encoder;
pub mod error;
pub mod index;
pub mod ledger;
pub mod metadata;
pub mod ops;
pub mod xmlutil;

pub use error::RetrievalError;
pub use index::VectorIndex;
