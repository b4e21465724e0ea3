//! CLI for recording, verifying and spoofing proofs of learning

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::prelude::*;

use pol::dataset::DatasetName;
use pol::registry::Architecture;
use pol::verifier::RankingMode;
use pol::{Metric, ProveConfig, SpoofConfig, VerifyConfig};

#[derive(Parser)]
#[command(name = "pol")]
#[command(about = "Proof-of-learning verification and spoofing", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on a shuffled sequence and record a proof directory
    Prove(ProveArgs),
    /// Verify a proof directory
    Verify(VerifyArgs),
    /// Forge a trajectory between two genuine checkpoints
    Spoof(SpoofArgs),
}

/// Options shared by every subcommand; unset flags keep the config value.
#[derive(Args)]
struct CommonArgs {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dataset name (CIFAR10, CIFAR100 or SYNTHETIC)
    #[arg(long)]
    dataset: Option<DatasetName>,

    /// Directory holding the CIFAR binary files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Architecture identifier
    #[arg(long)]
    model: Option<Architecture>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f32>,
}

#[derive(Args)]
struct ProveArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output proof directory
    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    save_freq: Option<usize>,

    /// Keep only the first N indices of the sequence
    #[arg(long)]
    samples: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Round parameters through binary16
    #[arg(long)]
    half: bool,
}

#[derive(Args)]
struct VerifyArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Proof directory
    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    save_freq: Option<usize>,

    /// Distance metrics (1, 2, inf, cos)
    #[arg(long, value_delimiter = ',')]
    dist: Option<Vec<Metric>>,

    /// Thresholds, one per metric
    #[arg(long, value_delimiter = ',')]
    delta: Option<Vec<f64>>,

    /// Intervals checked per metric and epoch; 0 replays every interval
    #[arg(long)]
    q: Option<usize>,

    /// p-value threshold of the initialization test
    #[arg(long)]
    init_threshold: Option<f64>,

    #[arg(long, value_enum)]
    ranking: Option<RankingMode>,

    /// Reuse ranking replays for the deep check
    #[arg(long)]
    cache_replays: bool,

    /// Round parameters through binary16
    #[arg(long)]
    half: bool,
}

#[derive(Args)]
struct SpoofArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Proof directory with the genuine checkpoints
    #[arg(long)]
    proof_dir: Option<PathBuf>,

    /// Step of the genuine end checkpoint
    #[arg(long)]
    iter: Option<usize>,

    #[arg(long)]
    t: Option<usize>,

    #[arg(long)]
    k: Option<usize>,

    #[arg(long)]
    retry: Option<usize>,

    #[arg(long)]
    gd: Option<f64>,

    #[arg(long)]
    nd: Option<f64>,

    #[arg(long)]
    round: Option<usize>,

    #[arg(long)]
    cut: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Keep the organically trained states instead of overwriting them
    #[arg(long)]
    no_verify: bool,

    #[arg(long)]
    output_root: Option<PathBuf>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn prove_config(args: ProveArgs) -> anyhow::Result<ProveConfig> {
    let mut config = match &args.common.config {
        Some(path) => ProveConfig::from_file(path)?,
        None => ProveConfig::default(),
    };
    set(&mut config.dataset, args.common.dataset);
    config.data_dir = args.common.data_dir.or(config.data_dir);
    set(&mut config.architecture, args.common.model);
    set(&mut config.batch_size, args.common.batch_size);
    set(&mut config.lr, args.common.lr);
    set(&mut config.model_dir, args.model_dir);
    set(&mut config.epochs, args.epochs);
    set(&mut config.save_freq, args.save_freq);
    config.samples = args.samples.or(config.samples);
    set(&mut config.seed, args.seed);
    config.half |= args.half;
    Ok(config)
}

fn verify_config(args: VerifyArgs) -> anyhow::Result<VerifyConfig> {
    let mut config = match &args.common.config {
        Some(path) => VerifyConfig::from_file(path)?,
        None => VerifyConfig::default(),
    };
    set(&mut config.dataset, args.common.dataset);
    config.data_dir = args.common.data_dir.or(config.data_dir);
    set(&mut config.architecture, args.common.model);
    set(&mut config.batch_size, args.common.batch_size);
    set(&mut config.lr, args.common.lr);
    set(&mut config.model_dir, args.model_dir);
    set(&mut config.epochs, args.epochs);
    set(&mut config.save_freq, args.save_freq);
    set(&mut config.metrics, args.dist);
    set(&mut config.thresholds, args.delta);
    set(&mut config.q, args.q);
    set(&mut config.init_threshold, args.init_threshold);
    set(&mut config.ranking, args.ranking);
    config.cache_replays |= args.cache_replays;
    config.half |= args.half;
    Ok(config)
}

fn spoof_config(args: SpoofArgs) -> anyhow::Result<SpoofConfig> {
    let mut config = match &args.common.config {
        Some(path) => SpoofConfig::from_file(path)?,
        None => SpoofConfig::default(),
    };
    set(&mut config.dataset, args.common.dataset);
    config.data_dir = args.common.data_dir.or(config.data_dir);
    set(&mut config.architecture, args.common.model);
    set(&mut config.batch_size, args.common.batch_size);
    set(&mut config.lr, args.common.lr);
    set(&mut config.proof_dir, args.proof_dir);
    set(&mut config.iter, args.iter);
    set(&mut config.t, args.t);
    set(&mut config.k, args.k);
    set(&mut config.retry, args.retry);
    set(&mut config.gd, args.gd);
    set(&mut config.nd, args.nd);
    set(&mut config.round, args.round);
    set(&mut config.cut, args.cut);
    set(&mut config.seed, args.seed);
    set(&mut config.output_root, args.output_root);
    if args.no_verify {
        config.verify = false;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Prove(args) => {
            let config = prove_config(args)?;
            let summary = pol::prove(&config).context("recording proof failed")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Verify(args) => {
            let config = verify_config(args)?;
            let report = pol::verify_proof(&config).context("verification could not run")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            if !report.verdict.is_valid() {
                std::process::exit(1);
            }
        }
        Commands::Spoof(args) => {
            let config = spoof_config(args)?;
            let outcome = pol::spoof(&config).context("spoofing run failed")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        }
    }
    Ok(())
}
