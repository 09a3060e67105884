//! Module contains the gene set enrichment scoring, its scheduling and the
//! out-of-core chunked mode with the variance filter

pub mod chunked;
pub mod gsea;
pub mod scheduler;
pub mod variance_filter;
