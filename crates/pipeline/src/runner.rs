use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::config::RunConfig;
use crate::ledger::{PersistenceError, RunLedger, UnitOutcome, UnitRecord};
use crate::manifest::{RunManifest, RunStatus};
use chains::{Chain, ChainFinder};
use generate::{GenerationOutcome, Mode, Orchestrator, TokenUsage};
use index::{IndexError, RetrievalIndex};
use ingest::{Chunk, CorpusStore, Document, IngestError};
use validate::{ValidateError, Validator, Verdict};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("cannot restore accepted questions: {0}")]
    Validate(#[from] ValidateError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error("seed plan differs from the one recorded for this run ({recorded} != {current}); the corpus or chunking changed")]
    PlanChanged { recorded: String, current: String },
}

/// One unit of work: a chunk in single-hop mode, a chain in multi-hop mode.
#[derive(Debug, Clone)]
pub enum Seed {
    Chunk(Chunk),
    Chain(Chain),
}

impl Seed {
    /// The chunks a candidate from this seed may cite.
    pub fn evidence(&self) -> &[Chunk] {
        match self {
            Seed::Chunk(chunk) => std::slice::from_ref(chunk),
            Seed::Chain(chain) => &chain.chunks,
        }
    }
}

/// Deterministic seed sequence for a corpus, plus the multi-hop seeds that
/// produced no chain. Capped at `max_units`.
pub fn plan_seeds(config: &RunConfig, index: &RetrievalIndex, chunks: &[Chunk]) -> (Vec<Seed>, usize) {
    let (mut seeds, zero_chain_seeds) = match config.mode {
        Mode::SingleHop => (chunks.iter().cloned().map(Seed::Chunk).collect::<Vec<_>>(), 0),
        Mode::MultiHop => {
            let plan = ChainFinder::new(index).seed_chains(
                chunks,
                config.target_hops,
                config.max_chains_per_seed,
            );
            (
                plan.chains.into_iter().map(Seed::Chain).collect(),
                plan.zero_chain_seeds,
            )
        }
    };

    if let Some(max_units) = config.max_units {
        seeds.truncate(max_units);
    }
    (seeds, zero_chain_seeds)
}

/// Digest over every seed's position and the ids and content of its evidence.
/// Records are matched to seeds by position, so resuming needs the same digest.
pub fn plan_fingerprint(seeds: &[Seed]) -> String {
    let mut hasher = Sha256::new();
    for (position, seed) in seeds.iter().enumerate() {
        hasher.update((position as u64).to_le_bytes());
        for chunk in seed.evidence() {
            hasher.update(chunk.chunk_id.as_bytes());
            hasher.update(b"\0");
            hasher.update(chunk.content_hash().as_bytes());
        }
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..16])
}

struct WorkerContext {
    seeds: Vec<Seed>,
    next: AtomicUsize,
    orchestrator: Orchestrator,
    validator: Validator,
    ledger: Arc<RunLedger>,
    cancel: CancellationToken,
}

/// Drives a run: ingest, index, plan seeds, then a bounded pool of workers
/// that each take a seed through generation, validation and recording.
pub struct RunDriver {
    config: RunConfig,
    capabilities: Capabilities,
    cancel: CancellationToken,
}

impl RunDriver {
    pub fn new(config: RunConfig, capabilities: Capabilities) -> Self {
        Self {
            config,
            capabilities,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops the run after the in-flight units are recorded.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every seed not yet recorded in `ledger` and writes the final
    /// status. Any error also marks the run failed.
    pub async fn run(&self, ledger: Arc<RunLedger>, documents: Vec<Document>) -> Result<RunManifest, RunError> {
        match self.execute(&ledger, documents).await {
            Ok(status) => Ok(ledger.finish(status).await?),
            Err(err) => {
                if let Err(persist_err) = ledger.fail(&err.to_string()).await {
                    warn!(error = %persist_err, "Could not record run failure");
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, ledger: &Arc<RunLedger>, documents: Vec<Document>) -> Result<RunStatus, RunError> {
        let config = &self.config;
        let retry = config.retry.policy();

        let mut store = CorpusStore::new(config.chunking.clone(), config.keywords.clone());
        let chunks = store.ingest(documents)?;
        if chunks.is_empty() {
            return Err(IngestError::EmptyCorpus.into());
        }

        let mut index = RetrievalIndex::new(self.capabilities.embedder.clone(), retry.clone());
        index.add_chunks(&chunks);
        let embedded = index.embed(&chunks).await?;
        let cached = index.cache_stats();
        debug!(
            computed = embedded.computed,
            reused = embedded.cached,
            chunk_embeddings = cached.chunk_embeddings,
            text_embeddings = cached.text_embeddings,
            "Chunk embeddings ready"
        );
        let index = Arc::new(index);

        let (seeds, zero_chain_seeds) = plan_seeds(config, &index, &chunks);
        let fingerprint = plan_fingerprint(&seeds);
        if let Some(recorded) = ledger.manifest().await.plan_fingerprint {
            if recorded != fingerprint {
                return Err(RunError::PlanChanged {
                    recorded,
                    current: fingerprint,
                });
            }
        }
        ledger.set_plan(seeds.len(), zero_chain_seeds, fingerprint).await?;
        info!(
            mode = %config.mode,
            chunks = chunks.len(),
            seeds = seeds.len(),
            zero_chain_seeds,
            cursor = ledger.checkpoint().await,
            "Seeds planned"
        );

        let orchestrator = Orchestrator::new(self.capabilities.generator.clone(), retry.clone());
        let mut validator = Validator::new(config.validation.clone(), index.clone(), retry);
        if config.validation.use_judge {
            validator = validator.with_judge(self.capabilities.generator.clone());
        }
        for case in ledger.accepted_cases().await {
            validator.remember_accepted(&case).await?;
        }

        let total = seeds.len();
        let pool_cancel = self.cancel.child_token();
        let context = Arc::new(WorkerContext {
            seeds,
            next: AtomicUsize::new(0),
            orchestrator,
            validator,
            ledger: ledger.clone(),
            cancel: pool_cancel.clone(),
        });

        let mut workers = JoinSet::new();
        for worker in 0..config.concurrency.min(total.max(1)) {
            workers.spawn(worker_loop(worker, context.clone()));
        }

        let mut first_error: Option<RunError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result.map_err(RunError::from),
                Err(join_err) => Err(RunError::Worker(join_err.to_string())),
            };
            if let Err(err) = result {
                pool_cancel.cancel();
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        if ledger.checkpoint().await >= total {
            Ok(RunStatus::Completed)
        } else {
            info!(cursor = ledger.checkpoint().await, total, "Run cancelled before all seeds were recorded");
            Ok(RunStatus::Cancelled)
        }
    }
}

async fn worker_loop(worker: usize, ctx: Arc<WorkerContext>) -> Result<usize, PersistenceError> {
    let mut processed = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            debug!(worker, "Cancellation requested, worker stopping");
            break;
        }
        let seed = ctx.next.fetch_add(1, Ordering::SeqCst);
        if seed >= ctx.seeds.len() {
            break;
        }
        if ctx.ledger.is_recorded(seed).await {
            continue;
        }

        let record = process_unit(&ctx, seed).await;
        ctx.ledger.record(record).await?;
        processed += 1;
    }

    debug!(worker, processed, "Worker finished");
    Ok(processed)
}

async fn process_unit(ctx: &WorkerContext, seed: usize) -> UnitRecord {
    let unit = &ctx.seeds[seed];
    let outcome = match unit {
        Seed::Chunk(chunk) => ctx.orchestrator.generate_single_hop(chunk).await,
        Seed::Chain(chain) => ctx.orchestrator.generate_multi_hop(chain).await,
    };

    let record = match outcome {
        GenerationOutcome::Failed { failure } => UnitRecord::new(
            seed,
            UnitOutcome::Failed {
                error: failure.to_string(),
            },
            failure.attempts,
            TokenUsage::default(),
        ),
        GenerationOutcome::Generated {
            candidate,
            mut usage,
            attempts,
        } => match ctx.validator.validate(candidate, unit.evidence()).await {
            Ok(validated) => {
                usage.add(validated.usage);
                let outcome = match validated.verdict {
                    Verdict::Accepted(case) => UnitOutcome::Accepted { case },
                    Verdict::Rejected { case, reason } => UnitOutcome::Rejected { case, reason },
                };
                UnitRecord::new(seed, outcome, attempts, usage)
            }
            Err(err) => UnitRecord::new(
                seed,
                UnitOutcome::Failed {
                    error: err.to_string(),
                },
                attempts + err.attempts(),
                usage,
            ),
        },
    };

    match &record.outcome {
        UnitOutcome::Accepted { case } => info!(seed, case = %case.id, "Unit accepted"),
        UnitOutcome::Rejected { case, reason } => {
            info!(seed, case = %case.id, reason = %reason, "Unit rejected")
        }
        UnitOutcome::Failed { error } => warn!(seed, attempts = record.attempts, error = %error, "Unit failed"),
    }
    record
}
