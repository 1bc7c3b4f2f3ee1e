use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use generate::Mode;
use ingest::{Document, FileReader};
use pipeline::config::EmbedderKind;
use pipeline::ledger::{load_manifest, ACCEPTED_FILE};
use pipeline::telemetry::{init_tracing, LogFormat};
use pipeline::{Capabilities, RunConfig, RunDriver, RunLedger, RunManifest};

#[derive(Parser)]
#[command(name = "ragtest", version, about = "Generate RAG evaluation test cases from a document corpus")]
struct Cli {
    /// Configuration file (json, toml or yaml)
    #[arg(long, global = true, env = "RAGTEST_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run
    Run(RunArgs),
    /// Continue a cancelled, failed or interrupted run
    Resume {
        run_id: String,
        #[arg(long)]
        ledger_root: Option<PathBuf>,
        #[arg(long, env = "RAGTEST_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Print a run's manifest
    Show {
        run_id: String,
        #[arg(long)]
        ledger_root: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Files or directories of .txt / .md documents
    #[arg(long, required = true, num_args = 1..)]
    corpus: Vec<PathBuf>,
    /// single-hop or multi-hop
    #[arg(long)]
    mode: Option<Mode>,
    /// default, fast or thorough
    #[arg(long)]
    preset: Option<String>,
    /// Chunks per chain in multi-hop mode
    #[arg(long)]
    hops: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    max_units: Option<usize>,
    #[arg(long)]
    max_retries: Option<usize>,
    #[arg(long)]
    novelty_threshold: Option<f32>,
    /// Grade groundedness with the generator as a judge
    #[arg(long)]
    judge: bool,
    /// Use the built-in hashing embedder instead of an embedding service
    #[arg(long)]
    offline_embeddings: bool,
    #[arg(long)]
    ledger_root: Option<PathBuf>,
    #[arg(long, env = "RAGTEST_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(hops) = self.hops {
            config.target_hops = hops;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.max_units.is_some() {
            config.max_units = self.max_units;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(threshold) = self.novelty_threshold {
            config.validation.novelty_threshold = threshold;
        }
        if self.judge {
            config.validation.use_judge = true;
        }
        if self.offline_embeddings {
            config.providers.embedder = EmbedderKind::Hashing;
        }
        if let Some(root) = &self.ledger_root {
            config.ledger_root = root.clone();
        }
        if self.api_key.is_some() {
            config.providers.api_key = self.api_key.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level);

    match cli.command {
        Command::Run(args) => run(cli.config.as_deref(), args).await,
        Command::Resume {
            run_id,
            ledger_root,
            api_key,
        } => resume(cli.config.as_deref(), &run_id, ledger_root, api_key).await,
        Command::Show {
            run_id,
            ledger_root,
        } => {
            let root = ledger_root_for(cli.config.as_deref(), ledger_root)?;
            let manifest = load_manifest(&root, &run_id)
                .await
                .with_context(|| format!("Failed to load run {run_id}"))?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(())
        }
    }
}

async fn run(config_file: Option<&Path>, args: RunArgs) -> Result<()> {
    let base = match &args.preset {
        Some(name) => match RunConfig::preset(name) {
            Some(config) => config,
            None => bail!("Unknown preset {name:?} (expected default, fast or thorough)"),
        },
        None => RunConfig::default(),
    };
    let mut config = RunConfig::load(base, config_file).context("Failed to load configuration")?;
    args.apply(&mut config);

    let corpus: Vec<String> = args
        .corpus
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    let ledger = RunLedger::start_run(&config.ledger_root.clone(), config.clone(), corpus.clone())
        .await
        .context("Failed to start run")?;

    execute(config, Arc::new(ledger), &corpus).await
}

async fn resume(
    config_file: Option<&Path>,
    run_id: &str,
    ledger_root: Option<PathBuf>,
    api_key: Option<String>,
) -> Result<()> {
    let root = ledger_root_for(config_file, ledger_root)?;
    let manifest = load_manifest(&root, run_id)
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?;

    let mut config = manifest.config.clone();
    config.ledger_root = root.clone();
    config.providers.api_key = api_key;
    config.validate().context("Stored configuration is no longer valid")?;

    let ledger = RunLedger::resume(&root, run_id)
        .await
        .with_context(|| format!("Failed to resume run {run_id}"))?;

    execute(config, Arc::new(ledger), &manifest.corpus).await
}

async fn execute(config: RunConfig, ledger: Arc<RunLedger>, corpus: &[String]) -> Result<()> {
    let documents = match load_documents(corpus).await {
        Ok(documents) => documents,
        Err(err) => {
            ledger.fail(&format!("{err:#}")).await?;
            return Err(err);
        }
    };

    let capabilities = Capabilities::from_config(&config)?;
    let cancel = CancellationToken::new();
    let driver = RunDriver::new(config, capabilities).with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight units");
            cancel.cancel();
        }
    });

    let manifest = driver.run(ledger.clone(), documents).await?;
    report(&manifest, ledger.dir());
    Ok(())
}

async fn load_documents(corpus: &[String]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in corpus {
        let loaded = FileReader::load_documents(Path::new(path))
            .await
            .with_context(|| format!("Failed to read corpus at {path}"))?;
        documents.extend(loaded);
    }
    Ok(documents)
}

fn ledger_root_for(config_file: Option<&Path>, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(root) => Ok(root),
        None => Ok(RunConfig::load(RunConfig::default(), config_file)
            .context("Failed to load configuration")?
            .ledger_root),
    }
}

fn report(manifest: &RunManifest, dir: &Path) {
    println!("{}", manifest.summary());
    println!("Accepted test cases: {}", dir.join(ACCEPTED_FILE).display());
}
