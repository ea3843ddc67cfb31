use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use rl_hypersearch::hypers::catalogue;
use rl_hypersearch::store::export_csv;
use rl_hypersearch::{
    BayesConfig, BayesianSearch, BoostConfig, BoostedSearch, CommandTrainer, HyperSchema,
    JsonlRunStore, Optimizer, Pipeline, PipelineConfig, RunStore, SearchConfig, SearchDriver,
    TreeNetwork,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Hyperparameter search for RL trading agents")]
struct Cli {
    /// Log at debug level (flat and hydrated configs per run)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score candidates until stopped (or `--rounds` is reached)
    Search {
        #[arg(long, default_value = "ppo_agent")]
        agent: String,
        /// conv2d | lstm
        #[arg(short = 'n', long, default_value = "conv2d")]
        net_type: String,
        /// How many processes share the GPU
        #[arg(short = 'g', long, default_value_t = 1.0)]
        gpu_split: f64,
        /// Guess-override group to score first; -1 skips the guess phase
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        guess: i64,
        /// Gradient-boosted Monte-Carlo search instead of Bayesian
        #[arg(long)]
        boost: bool,
        #[arg(long, default_value = "runs.jsonl")]
        runs: PathBuf,
        #[arg(long)]
        rounds: Option<usize>,
        #[arg(long, default_value_t = 20260226)]
        seed: u64,
        /// Surrogate predictions per boosted round
        #[arg(long, default_value_t = 1_000_000)]
        mc_samples: usize,
        /// Program that trains one candidate (hyper set JSON on stdin)
        #[arg(long)]
        trainer: String,
        /// Extra arguments for the trainer, after `--`
        #[arg(last = true)]
        trainer_args: Vec<String>,
    },
    /// Print the full hyper set of a stored run, or of the guesses
    Winner {
        #[arg(long, default_value = "ppo_agent")]
        agent: String,
        #[arg(short = 'n', long, default_value = "conv2d")]
        net_type: String,
        #[arg(short = 'g', long, default_value_t = 1.0)]
        gpu_split: f64,
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value = "runs.jsonl")]
        runs: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write every run of a network family as CSV
    Export {
        #[arg(short = 'n', long, default_value = "conv2d")]
        net_type: String,
        #[arg(long, default_value = "runs.jsonl")]
        runs: PathBuf,
        /// Defaults to stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Search {
            agent,
            net_type,
            gpu_split,
            guess,
            boost,
            runs,
            rounds,
            seed,
            mc_samples,
            trainer,
            trainer_args,
        } => {
            if gpu_split <= 0.0 {
                bail!("--gpu-split must be > 0");
            }
            if boost && mc_samples == 0 {
                bail!("--mc-samples must be >= 1");
            }
            let schema = load_schema(&agent, &net_type)?;
            let pipeline = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig { gpu_split });
            let store = JsonlRunStore::open(&runs)
                .with_context(|| format!("failed to open {}", runs.display()))?;

            let optimizer: Box<dyn Optimizer> = if boost {
                Box::new(BoostedSearch::new(
                    BoostConfig {
                        mc_samples,
                        ..BoostConfig::default()
                    },
                    seed,
                ))
            } else {
                Box::new(BayesianSearch::new(BayesConfig::default(), seed))
            };

            let config = SearchConfig {
                guess_group: usize::try_from(guess).ok(),
                max_rounds: rounds,
                seed,
                ..SearchConfig::default()
            };
            info!(
                agent = %agent,
                net = %net_type,
                strategy = optimizer.name(),
                ledger = %runs.display(),
                "starting search"
            );

            let mut driver = SearchDriver::new(
                pipeline,
                Arc::new(store),
                Box::new(CommandTrainer::new(trainer, trainer_args)),
                optimizer,
                config,
            );
            driver.run()?;
        }
        Commands::Winner {
            agent,
            net_type,
            gpu_split,
            id,
            runs,
            out,
        } => {
            let schema = load_schema(&agent, &net_type)?;
            let pipeline = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig { gpu_split });
            let record = match &id {
                Some(id) => {
                    let store = JsonlRunStore::open(&runs)?;
                    Some(store.select_by_id(id)?.flat)
                }
                None => None,
            };
            let hypers = pipeline.winner(record)?;

            let payload = json!({
                "id": id,
                "flat": hypers.flat,
                "main": hypers.main,
                "network": hypers.network,
            });
            let text = serde_json::to_string_pretty(&payload)?;
            match out {
                Some(path) => {
                    fs::write(&path, text)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!("Saved winner: {}", path.display());
                }
                None => println!("{text}"),
            }
        }
        Commands::Export { net_type, runs, out } => {
            let store = JsonlRunStore::open(&runs)?;
            let rows = store.select_all(&net_type)?;
            match out {
                Some(path) => {
                    let file = fs::File::create(&path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    export_csv(&rows, file)?;
                    info!(runs = rows.len(), "Saved export: {}", path.display());
                }
                None => export_csv(&rows, std::io::stdout().lock())?,
            }
        }
    }

    Ok(())
}

fn load_schema(agent: &str, net: &str) -> Result<HyperSchema> {
    HyperSchema::load(agent, net).with_context(|| {
        format!(
            "known agents: {}; known nets: {}",
            catalogue::AGENTS.join(", "),
            catalogue::NETS.join(", ")
        )
    })
}
