use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use gseaflow::config::{GseaConfig, DEFAULT_CONFIG_FILE};
use gseaflow::core::data::synthetic_data::{
    generate_expression, generate_gene_sets, SyntheticExpressionParams, SyntheticGeneSetParams,
};
use gseaflow::core::data::table_io::{
    read_bulk_matrix, read_gene_sets, read_single_cell_sample_ids, write_expression_matrix,
    write_gene_sets, write_scores, SingleCellRowReader,
};
use gseaflow::core::enrichment::chunked::{ChunkRunContext, ChunkedPipeline};
use gseaflow::utils::logging::setup_log;
use gseaflow::{GseaEngine, Layout};

/// Per-sample gene set enrichment scores
#[derive(Parser, Debug)]
#[command(version, about = "Per-sample gene set enrichment scores", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score the expression matrix of a configuration
    Run {
        /// Configuration file, created with the defaults if missing
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Keep the most variable gene sets of a chunked run
    Filter {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Directory holding the chunks
        #[arg(long)]
        chunk_dir: PathBuf,
        /// Number of gene sets to keep
        #[arg(short, long)]
        keep: usize,
    },
    /// Write a synthetic data set and a matching configuration
    Simulate {
        #[arg(short, long)]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 1000)]
        genes: usize,
        #[arg(long, default_value_t = 100)]
        samples: usize,
        #[arg(long, default_value_t = 50)]
        gene_sets: usize,
        #[arg(long, default_value_t = 15)]
        min_size: usize,
        #[arg(long, default_value_t = 200)]
        max_size: usize,
        /// Write a single cell (sample-major) matrix
        #[arg(long)]
        single_cell: bool,
        /// Dropout probability for single cell data
        #[arg(long)]
        dropout: Option<f64>,
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    setup_log();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(&config),
        Command::Filter {
            config,
            chunk_dir,
            keep,
        } => filter(&config, &chunk_dir, keep),
        Command::Simulate {
            out_dir,
            genes,
            samples,
            gene_sets,
            min_size,
            max_size,
            single_cell,
            dropout,
            seed,
        } => {
            let expression = SyntheticExpressionParams {
                n_genes: genes,
                n_samples: samples,
                layout: if single_cell {
                    Layout::SampleMajor
                } else {
                    Layout::GeneMajor
                },
                dropout,
                seed,
            };
            let sets = SyntheticGeneSetParams {
                n_gene_sets: gene_sets,
                min_size,
                max_size,
                seed: seed.wrapping_add(1),
            };
            simulate(&out_dir, &expression, &sets)
        }
    }
}

fn load_config(path: &Path) -> Result<GseaConfig> {
    let config = GseaConfig::load_or_create(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    config.log_summary();
    Ok(config)
}

fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let params = config.params()?;
    let matrix_sep = config.expression_matrix_separator()?;
    let start = Instant::now();

    let gene_sets = read_gene_sets(&config.gene_sets_file, config.gene_sets_separator()?)
        .with_context(|| format!("failed to read {}", config.gene_sets_file.display()))?;

    if config.single_cell {
        let n_samples = read_single_cell_sample_ids(&config.expression_matrix_file, matrix_sep)?.len();
        let rows = SingleCellRowReader::open(&config.expression_matrix_file, matrix_sep)
            .with_context(|| format!("failed to open {}", config.expression_matrix_file.display()))?;
        let engine = GseaEngine::new(rows.gene_ids().to_vec(), &gene_sets, params)?;

        let ctx = ChunkRunContext::new(config.chunk_dir.clone(), Some(n_samples));
        let summary = ChunkedPipeline::new(&engine, ctx).run(rows)?;
        info!(
            "Scored {} samples in {} chunks",
            summary.sample_ids.len(),
            summary.n_chunks
        );

        let Some(chunk_dir) = summary.chunk_dir else {
            warn!("no data to filter");
            return Ok(());
        };
        let n_keep = config
            .keep_gene_sets
            .unwrap_or_else(|| engine.catalog().len());
        engine.try_filter_results(
            &chunk_dir,
            &summary.sample_ids,
            n_keep,
            &config.output_file,
            &config.ranking_file,
        )?;
    } else {
        let mut matrix = read_bulk_matrix(&config.expression_matrix_file, matrix_sep)
            .with_context(|| format!("failed to read {}", config.expression_matrix_file.display()))?;
        if !config.normalized_data {
            GseaEngine::normalise(&mut matrix);
        }
        let engine = GseaEngine::from_matrix(&matrix, &gene_sets, params)?;
        match config.keep_gene_sets {
            Some(n_keep) => {
                let scores = engine.run(&matrix)?;
                let filtered = engine.keep_most_variable(&scores, n_keep, &config.ranking_file)?;
                write_scores(
                    &config.output_file,
                    engine.params().output_sep,
                    &filtered,
                    matrix.layout(),
                )?;
                info!("Results written to {}", config.output_file.display());
            }
            None => {
                engine.run_to_file(&matrix, &config.output_file)?;
            }
        }
    }

    info!("Done in {:.2?}", start.elapsed());
    Ok(())
}

fn filter(config_path: &Path, chunk_dir: &Path, keep: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let matrix_sep = config.expression_matrix_separator()?;

    let gene_sets = read_gene_sets(&config.gene_sets_file, config.gene_sets_separator()?)?;
    let gene_ids = SingleCellRowReader::open(&config.expression_matrix_file, matrix_sep)?
        .gene_ids()
        .to_vec();
    let sample_ids = read_single_cell_sample_ids(&config.expression_matrix_file, matrix_sep)?;
    let engine = GseaEngine::new(gene_ids, &gene_sets, config.params()?)?;

    let summary = engine
        .try_filter_results(
            chunk_dir,
            &sample_ids,
            keep,
            &config.output_file,
            &config.ranking_file,
        )
        .context("failed to filter the chunks")?;
    if let Some(summary) = summary {
        info!(
            "Merged {} chunks into {}",
            summary.n_chunks,
            config.output_file.display()
        );
    }
    Ok(())
}

fn simulate(
    out_dir: &Path,
    expression: &SyntheticExpressionParams,
    sets: &SyntheticGeneSetParams,
) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let matrix = generate_expression(expression)?;
    let gene_sets = generate_gene_sets(matrix.gene_ids(), sets)?;

    let config = GseaConfig {
        expression_matrix_file: out_dir.join("expression-matrix.csv"),
        gene_sets_file: out_dir.join("gene-sets.csv"),
        output_file: out_dir.join("results.csv"),
        ranking_file: out_dir.join("var"),
        single_cell: expression.layout == Layout::SampleMajor,
        ..GseaConfig::default()
    };
    write_expression_matrix(&config.expression_matrix_file, b',', &matrix)?;
    write_gene_sets(&config.gene_sets_file, b',', &gene_sets)?;
    let config_path = out_dir.join(DEFAULT_CONFIG_FILE);
    std::fs::write(&config_path, toml::to_string(&config)?)?;

    info!(
        "Wrote {} genes x {} samples and {} gene sets, run with --config {}",
        matrix.n_genes(),
        matrix.n_samples(),
        gene_sets.len(),
        config_path.display()
    );
    Ok(())
}
