//! Module containing the normalisation of expression data.

pub mod normalisation;
