//! Per-sample gene set enrichment scores.
//!
//! Every sample of an expression matrix is ranked by expression and walked
//! against every gene set; the maximum of the running sum is the score of
//! the pair. Samples are scored in parallel on a dedicated thread pool.
//! Large single cell data can be scored in batches that are spilled to disk
//! and later reduced to the most variable gene sets.

pub mod config;
pub mod core;
pub mod error;
pub mod utils;

pub use crate::core::data::structures::{ExpressionMatrix, GeneSet, Layout, ScoreMatrix};
pub use crate::core::engine::{GseaEngine, GseaParams};
pub use crate::error::{GseaError, Result};
