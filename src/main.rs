use anyhow::{Context, Result};
use audiogen_eval::config::AppConfig;
use audiogen_eval::engine::{Evaluator, MetricReport};
use audiogen_eval::features::FeatureStore;
use audiogen_eval::ndb::NdbModel;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "audiogen-eval",
    version,
    about = "Compare generated audio against a reference set using CNN14 features"
)]
struct Cli {
    /// Config file (defaults to ~/.config/audiogen-eval/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute KL, Inception Score, FID and KID between two feature stores
    Evaluate {
        /// Features of the generated audio (JSON file or directory of clips)
        generated: PathBuf,

        /// Features of the reference audio
        reference: PathBuf,

        /// Pair KL samples by file name
        #[arg(long)]
        same_name: bool,

        /// Only use the first N samples of each store
        #[arg(long)]
        limit: Option<usize>,

        /// Seed for the Inception Score shuffle and KID subsets
        #[arg(long)]
        seed: Option<u64>,

        /// Inception Score splits
        #[arg(long)]
        splits: Option<usize>,

        /// Number of KID subsets
        #[arg(long)]
        subsets: Option<usize>,

        /// Samples per KID subset
        #[arg(long)]
        subset_size: Option<usize>,

        /// Number of parallel workers (0 = from config, then rayon default)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Write the six-key JSON report here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Bin the reference set and count bins where the generated set differs
    Ndb {
        /// Features of the reference audio
        reference: PathBuf,

        /// Features of the generated audio
        generated: PathBuf,

        /// Number of k-means bins
        #[arg(long)]
        bins: Option<usize>,

        /// Evaluate a random subset of this many generated samples
        #[arg(long)]
        samples: Option<usize>,

        /// Z-score both sets with the reference statistics first
        #[arg(long)]
        whiten: bool,

        /// Feature layer to bin (defaults to the embedding layer)
        #[arg(long)]
        layer: Option<String>,
    },

    /// Show the sample count and layer widths of a feature store
    Inspect {
        store: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Config file is optional: --config > XDG default > built-in defaults
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::load(),
    };

    match cli.command {
        Commands::Evaluate {
            generated,
            reference,
            same_name,
            limit,
            seed,
            splits,
            subsets,
            subset_size,
            jobs,
            output,
        } => {
            let mut metrics = config.metrics.clone();
            metrics.same_name |= same_name;
            if let Some(seed) = seed {
                metrics.isc.seed = seed;
                metrics.kid.seed = seed;
            }
            if let Some(splits) = splits {
                metrics.isc.splits = splits;
            }
            if let Some(subsets) = subsets {
                metrics.kid.subsets = subsets;
            }
            if let Some(subset_size) = subset_size {
                metrics.kid.subset_size = subset_size;
            }

            let generated = load_store(&generated, limit)?;
            let reference = load_store(&reference, limit)?;

            let report = Evaluator::new(metrics)
                .with_workers(config.resolve_workers(jobs))
                .evaluate(&generated, &reference);

            print_report(&report);

            if let Some(path) = output {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                serde_json::to_writer_pretty(file, &report)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!();
                println!("Report written to {}", path.display());
            }
        }

        Commands::Ndb {
            reference,
            generated,
            bins,
            samples,
            whiten,
            layer,
        } => {
            let mut params = config.ndb.clone();
            if let Some(bins) = bins {
                params.bins = bins;
            }
            if samples.is_some() {
                params.query_samples = samples;
            }
            params.whiten |= whiten;
            let layer = layer.unwrap_or_else(|| config.metrics.embedding_layer.clone());

            let reference = load_store(&reference, None)?;
            let generated = load_store(&generated, None)?;

            let model = NdbModel::fit(&reference, &layer, &params)
                .context("Failed to bin the reference set")?;
            let report = model
                .evaluate(&generated)
                .context("NDB evaluation failed")?;
            println!("{}", report);
        }

        Commands::Inspect { store } => {
            let features = load_store(&store, None)?;
            println!("Store:   {}", store.display());
            println!("Samples: {}", features.len());
            println!();
            println!("{:<20} {:>8}", "Layer", "Width");
            println!("{}", "-".repeat(29));
            for (name, layer) in features.layers() {
                println!("{:<20} {:>8}", name, layer.dim());
            }
        }
    }

    Ok(())
}

fn load_store(path: &Path, limit: Option<usize>) -> Result<FeatureStore> {
    let store = FeatureStore::load(path)
        .with_context(|| format!("Failed to load features from {}", path.display()))?;
    match limit {
        Some(n) => store
            .truncated(n)
            .with_context(|| format!("Failed to truncate {}", path.display())),
        None => Ok(store),
    }
}

/// Print every metric on its own line, then the one-line summary.
fn print_report(report: &MetricReport) {
    for (key, value) in report.entries() {
        println!("{:<32} {:>12.6}", key, value);
    }
    println!();
    println!("{}", report);
}
