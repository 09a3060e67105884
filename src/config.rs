//! Run configuration read from a TOML file.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::engine::GseaParams;
use crate::error::{GseaError, Result};

/// Default name of the configuration file
pub const DEFAULT_CONFIG_FILE: &str = "gsea.toml";

/// Configuration of a run
///
/// Every key is optional in the file; missing keys take their default.
///
/// ### Fields
///
/// * `expression_matrix_file` - The expression matrix.
/// * `expression_matrix_sep` - Its separator; `t` or `\t` for tabs.
/// * `gene_sets_file` - The gene set table.
/// * `gene_sets_sep` - Its separator.
/// * `output_file` - The result table.
/// * `output_sep` - Its separator.
/// * `ranking_file` - Variance ranking written by the filter.
/// * `threads` - Number of workers, `0` for all hardware threads.
/// * `normalized_data` - If `false`, bulk input is normalised first.
/// * `progress_interval` - Samples between progress lines, `0` disables them.
/// * `single_cell` - Sample-major input scored in the chunked mode.
/// * `batch_size` - Samples per worker and batch in the chunked mode.
/// * `chunk_dir` - Explicit chunk directory.
/// * `keep_gene_sets` - Number of most variable gene sets kept after a
///   chunked run; all if not set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GseaConfig {
    pub expression_matrix_file: PathBuf,
    pub expression_matrix_sep: String,
    pub gene_sets_file: PathBuf,
    pub gene_sets_sep: String,
    pub output_file: PathBuf,
    pub output_sep: String,
    pub ranking_file: PathBuf,
    pub threads: usize,
    pub normalized_data: bool,
    pub progress_interval: usize,
    pub single_cell: bool,
    pub batch_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_gene_sets: Option<usize>,
}

impl Default for GseaConfig {
    fn default() -> Self {
        Self {
            expression_matrix_file: PathBuf::from("expression-matrix.csv"),
            expression_matrix_sep: ",".to_string(),
            gene_sets_file: PathBuf::from("gene-sets.csv"),
            gene_sets_sep: ",".to_string(),
            output_file: PathBuf::from("results.csv"),
            output_sep: ",".to_string(),
            ranking_file: PathBuf::from("var"),
            threads: 0,
            normalized_data: false,
            progress_interval: 100,
            single_cell: false,
            batch_size: 50,
            chunk_dir: None,
            keep_gene_sets: None,
        }
    }
}

/// Parse a separator setting
///
/// ### Params
///
/// * `s` - The setting; `t`, `\t` or `tab` select a tab.
///
/// ### Returns
///
/// The separator byte, `None` if the setting is not a single ASCII character.
pub fn parse_separator(s: &str) -> Option<u8> {
    match s {
        "t" | "\\t" | "\t" | "tab" => Some(b'\t'),
        _ => {
            let bytes = s.as_bytes();
            (bytes.len() == 1 && bytes[0].is_ascii()).then_some(bytes[0])
        }
    }
}

impl GseaConfig {
    /// Read a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GseaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file, creating it with the defaults if missing
    ///
    /// ### Params
    ///
    /// * `path` - Path of the configuration file.
    ///
    /// ### Returns
    ///
    /// The configuration.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::from_file(path);
        }
        warn!(
            "No configuration at {}, writing the defaults",
            path.display()
        );
        let config = Self::default();
        std::fs::write(path, toml::to_string(&config)?)?;
        Ok(config)
    }

    /// Check separators and sizes
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("expression_matrix_sep", &self.expression_matrix_sep),
            ("gene_sets_sep", &self.gene_sets_sep),
            ("output_sep", &self.output_sep),
        ] {
            if parse_separator(value).is_none() {
                return Err(GseaError::Config(format!(
                    "{} must be a single character, got {:?}",
                    key, value
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(GseaError::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    fn separator(value: &str) -> Result<u8> {
        parse_separator(value)
            .ok_or_else(|| GseaError::Config(format!("invalid separator {:?}", value)))
    }

    pub fn expression_matrix_separator(&self) -> Result<u8> {
        Self::separator(&self.expression_matrix_sep)
    }

    pub fn gene_sets_separator(&self) -> Result<u8> {
        Self::separator(&self.gene_sets_sep)
    }

    pub fn output_separator(&self) -> Result<u8> {
        Self::separator(&self.output_sep)
    }

    /// The engine parameters of this configuration
    pub fn params(&self) -> Result<GseaParams> {
        Ok(GseaParams {
            n_threads: self.threads,
            progress_interval: self.progress_interval,
            single_cell_early_exit: true,
            batch_size: self.batch_size,
            output_sep: self.output_separator()?,
        })
    }

    /// Log the effective configuration
    pub fn log_summary(&self) {
        info!("Expression matrix: {}", self.expression_matrix_file.display());
        info!("Gene sets: {}", self.gene_sets_file.display());
        info!("Output: {}", self.output_file.display());
        info!(
            "Threads: {} Batch size: {} Single cell: {} Normalized: {}",
            self.threads, self.batch_size, self.single_cell, self.normalized_data
        );
        if let Some(k) = self.keep_gene_sets {
            info!("Keeping the {} most variable gene sets", k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_keys_take_defaults() {
        let config: GseaConfig = toml::from_str("threads = 4\nexpression_matrix_sep = \"t\"\n").unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.expression_matrix_separator().unwrap(), b'\t');
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.progress_interval, 100);
        assert!(!config.single_cell);
        assert_eq!(config.keep_gene_sets, None);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        let created = GseaConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, GseaConfig::default());
        let loaded = GseaConfig::load_or_create(&path).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_invalid_separator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "output_sep = \";;\"\n").unwrap();
        assert!(matches!(
            GseaConfig::from_file(&path),
            Err(GseaError::Config(_))
        ));
        assert_eq!(parse_separator(";"), Some(b';'));
        assert_eq!(parse_separator("\\t"), Some(b'\t'));
        assert_eq!(parse_separator(""), None);
    }

    #[test]
    fn test_params() {
        let config = GseaConfig {
            threads: 3,
            batch_size: 7,
            ..GseaConfig::default()
        };
        let params = config.params().unwrap();
        assert_eq!(params.n_threads, 3);
        assert_eq!(params.batch_size, 7);
        assert_eq!(params.output_sep, b',');
    }
}
