//! Core of the crate: data structures, the scoring engine and its building
//! blocks.

pub mod base;
pub mod data;
pub mod engine;
pub mod enrichment;
