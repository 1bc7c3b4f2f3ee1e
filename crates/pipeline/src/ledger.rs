use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig};
use crate::manifest::{RunCounts, RunManifest, RunStatus};
use generate::{RejectionReason, TestCase, TokenUsage};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const RECORDS_FILE: &str = "records.jsonl";
pub const ACCEPTED_FILE: &str = "accepted.jsonl";

/// The run's files could not be read or written. Fatal to the run.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cannot {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} is corrupt at line {line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run {0} not found")]
    NotFound(String),
    #[error("run {0} is already completed")]
    AlreadyCompleted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Accepted { case: TestCase },
    Rejected { case: TestCase, reason: RejectionReason },
    Failed { error: String },
}

/// One line of `records.jsonl`: the final outcome of one seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub seed: usize,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
    pub attempts: usize,
    pub usage: TokenUsage,
    pub recorded_at: DateTime<Utc>,
}

impl UnitRecord {
    pub fn new(seed: usize, outcome: UnitOutcome, attempts: usize, usage: TokenUsage) -> Self {
        Self {
            seed,
            outcome,
            attempts,
            usage,
            recorded_at: Utc::now(),
        }
    }
}

struct LedgerState {
    manifest: RunManifest,
    records: File,
    accepted: BTreeMap<usize, TestCase>,
}

/// Durable state of one run. Every mutation goes through one lock, so
/// `records.jsonl` and `manifest.json` always have a single writer.
pub struct RunLedger {
    dir: PathBuf,
    state: Mutex<LedgerState>,
}

pub fn run_dir(root: &Path, run_id: &str) -> PathBuf {
    root.join(run_id)
}

fn io_error<'p>(action: &'static str, path: &'p Path) -> impl FnOnce(std::io::Error) -> PersistenceError + 'p {
    move |source| PersistenceError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

impl RunLedger {
    /// Creates the run directory and manifest. An invalid configuration is
    /// still persisted, as a `failed` run, before the error is returned.
    pub async fn start_run(root: &Path, config: RunConfig, corpus: Vec<String>) -> Result<Self, LedgerError> {
        let run_id = Uuid::new_v4().to_string();
        let dir = run_dir(root, &run_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(io_error("create", &dir))?;

        let validation = config.validate();
        let mut manifest = RunManifest::new(run_id.clone(), config, corpus);

        if let Err(err) = validation {
            let now = Utc::now();
            manifest.status = RunStatus::Failed;
            manifest.error = Some(err.to_string());
            manifest.updated_at = now;
            manifest.completed_at = Some(now);
            write_manifest(&dir, &manifest).await?;
            warn!(run_id = %run_id, error = %err, "Run rejected: invalid configuration");
            return Err(err.into());
        }

        write_manifest(&dir, &manifest).await?;
        let records = open_records(&dir).await?;

        info!(run_id = %run_id, mode = %manifest.mode, dir = %dir.display(), "Run started");
        Ok(Self {
            dir,
            state: Mutex::new(LedgerState {
                manifest,
                records,
                accepted: BTreeMap::new(),
            }),
        })
    }

    /// Reopens an unfinished run. `records.jsonl` is replayed to rebuild the
    /// counters and cursor; a torn trailing line is dropped from the file.
    pub async fn resume(root: &Path, run_id: &str) -> Result<Self, LedgerError> {
        let dir = run_dir(root, run_id);
        let mut manifest = load_manifest(root, run_id).await?;
        if manifest.status == RunStatus::Completed {
            return Err(LedgerError::AlreadyCompleted(run_id.to_string()));
        }

        let replayed = replay_records(&dir.join(RECORDS_FILE)).await?;

        manifest.cursor = 0;
        manifest.completed_ahead.clear();
        manifest.counts = RunCounts {
            zero_chain_seeds: manifest.counts.zero_chain_seeds,
            ..RunCounts::default()
        };
        manifest.usage = TokenUsage::default();
        manifest.rejections.clear();

        let mut accepted = BTreeMap::new();
        for record in replayed {
            if !manifest.is_recorded(record.seed) {
                apply(&mut manifest, &mut accepted, record);
            }
        }

        manifest.status = RunStatus::Running;
        manifest.error = None;
        manifest.completed_at = None;
        manifest.updated_at = Utc::now();
        write_manifest(&dir, &manifest).await?;
        let records = open_records(&dir).await?;

        info!(
            run_id = %run_id,
            cursor = manifest.cursor,
            recorded = manifest.counts.generated + manifest.counts.failed,
            "Run resumed"
        );
        Ok(Self {
            dir,
            state: Mutex::new(LedgerState {
                manifest,
                records,
                accepted,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn run_id(&self) -> String {
        self.state.lock().await.manifest.run_id.clone()
    }

    pub async fn manifest(&self) -> RunManifest {
        self.state.lock().await.manifest.clone()
    }

    /// Seed cursor: every seed index below it is recorded.
    pub async fn checkpoint(&self) -> usize {
        self.state.lock().await.manifest.cursor
    }

    pub async fn is_recorded(&self, seed: usize) -> bool {
        self.state.lock().await.manifest.is_recorded(seed)
    }

    /// Accepted cases in seed order.
    pub async fn accepted_cases(&self) -> Vec<TestCase> {
        self.state.lock().await.accepted.values().cloned().collect()
    }

    pub async fn set_plan(
        &self,
        total_units: usize,
        zero_chain_seeds: usize,
        fingerprint: String,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.manifest.total_units = Some(total_units);
        state.manifest.plan_fingerprint = Some(fingerprint);
        state.manifest.counts.zero_chain_seeds = zero_chain_seeds;
        state.manifest.updated_at = Utc::now();
        write_manifest(&self.dir, &state.manifest).await
    }

    /// Appends the outcome of one seed and updates the manifest. A seed that
    /// is already recorded is ignored.
    pub async fn record(&self, record: UnitRecord) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        if state.manifest.is_recorded(record.seed) {
            debug!(seed = record.seed, "Seed already recorded, skipping");
            return Ok(());
        }

        let mut line = serde_json::to_vec(&record).map_err(|source| PersistenceError::Encode {
            what: "unit record",
            source,
        })?;
        line.push(b'\n');

        let path = self.dir.join(RECORDS_FILE);
        state
            .records
            .write_all(&line)
            .await
            .map_err(io_error("append to", &path))?;
        state.records.flush().await.map_err(io_error("flush", &path))?;
        state.records.sync_data().await.map_err(io_error("sync", &path))?;

        let LedgerState { manifest, accepted, .. } = &mut *state;
        apply(manifest, accepted, record);
        manifest.updated_at = Utc::now();
        write_manifest(&self.dir, manifest).await
    }

    /// Writes the final status and exports the accepted cases.
    pub async fn finish(&self, status: RunStatus) -> Result<RunManifest, PersistenceError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.manifest.status = status;
        state.manifest.updated_at = now;
        if status == RunStatus::Completed {
            state.manifest.completed_at = Some(now);
        }

        write_accepted(&self.dir, state.accepted.values()).await?;
        write_manifest(&self.dir, &state.manifest).await?;

        info!(
            run_id = %state.manifest.run_id,
            status = %status,
            accepted = state.manifest.counts.accepted,
            rejected = state.manifest.counts.rejected,
            failed = state.manifest.counts.failed,
            "Run finished"
        );
        Ok(state.manifest.clone())
    }

    pub async fn fail(&self, error: &str) -> Result<RunManifest, PersistenceError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.manifest.status = RunStatus::Failed;
        state.manifest.error = Some(error.to_string());
        state.manifest.updated_at = now;
        state.manifest.completed_at = Some(now);
        write_accepted(&self.dir, state.accepted.values()).await?;
        write_manifest(&self.dir, &state.manifest).await?;

        warn!(run_id = %state.manifest.run_id, error, "Run failed");
        Ok(state.manifest.clone())
    }
}

fn apply(manifest: &mut RunManifest, accepted: &mut BTreeMap<usize, TestCase>, record: UnitRecord) {
    manifest.usage.add(record.usage);
    match record.outcome {
        UnitOutcome::Accepted { case } => {
            manifest.counts.generated += 1;
            manifest.counts.accepted += 1;
            accepted.insert(record.seed, case);
        }
        UnitOutcome::Rejected { reason, .. } => {
            manifest.counts.generated += 1;
            manifest.counts.rejected += 1;
            *manifest.rejections.entry(reason).or_insert(0) += 1;
        }
        UnitOutcome::Failed { .. } => manifest.counts.failed += 1,
    }
    manifest.mark_recorded(record.seed);
}

pub async fn load_manifest(root: &Path, run_id: &str) -> Result<RunManifest, LedgerError> {
    let path = run_dir(root, run_id).join(MANIFEST_FILE);
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LedgerError::NotFound(run_id.to_string()));
        }
        Err(err) => return Err(io_error("read", &path)(err).into()),
    };
    serde_json::from_slice(&bytes).map_err(|err| {
        PersistenceError::Corrupt {
            path,
            line: err.line(),
            reason: err.to_string(),
        }
        .into()
    })
}

async fn open_records(dir: &Path) -> Result<File, PersistenceError> {
    let path = dir.join(RECORDS_FILE);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(io_error("open", &path))
}

/// Replaces `path` with `contents` through a temporary file and a rename.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).await.map_err(io_error("create", &tmp))?;
    file.write_all(contents).await.map_err(io_error("write", &tmp))?;
    file.sync_all().await.map_err(io_error("sync", &tmp))?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(io_error("rename", path))
}

async fn write_manifest(dir: &Path, manifest: &RunManifest) -> Result<(), PersistenceError> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|source| PersistenceError::Encode {
        what: "manifest",
        source,
    })?;
    write_atomic(&dir.join(MANIFEST_FILE), &json).await
}

async fn write_accepted<'a>(
    dir: &Path,
    cases: impl Iterator<Item = &'a TestCase>,
) -> Result<(), PersistenceError> {
    let mut out = Vec::new();
    for case in cases {
        serde_json::to_writer(&mut out, case).map_err(|source| PersistenceError::Encode {
            what: "accepted case",
            source,
        })?;
        out.push(b'\n');
    }
    write_atomic(&dir.join(ACCEPTED_FILE), &out).await
}

/// Parses `records.jsonl`. Only the last line may be incomplete (a crash
/// mid-append); it is cut off the file. Anything else unreadable is corrupt.
async fn replay_records(path: &Path) -> Result<Vec<UnitRecord>, PersistenceError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error("read", path)(err)),
    };

    let mut records = Vec::new();
    let mut good_len = 0;
    for (idx, segment) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let Some(body) = segment.strip_suffix(b"\n") else {
            break;
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            good_len += segment.len();
            continue;
        }
        let record: UnitRecord = serde_json::from_slice(body).map_err(|err| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: err.to_string(),
        })?;
        records.push(record);
        good_len += segment.len();
    }

    if good_len < bytes.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - good_len,
            "Truncating torn record line"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(io_error("open", path))?;
        file.set_len(good_len as u64)
            .await
            .map_err(io_error("truncate", path))?;
        file.sync_all().await.map_err(io_error("sync", path))?;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use generate::Mode;

    fn case(seed: usize) -> TestCase {
        TestCase::new(
            Mode::SingleHop,
            vec![format!("chunk-{seed}")],
            format!("Question {seed}?"),
            format!("Answer {seed}"),
        )
    }

    fn accepted(seed: usize) -> UnitRecord {
        UnitRecord::new(
            seed,
            UnitOutcome::Accepted { case: case(seed).accept() },
            1,
            TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 2,
            },
        )
    }

    fn rejected(seed: usize) -> UnitRecord {
        let reason = RejectionReason::Ungrounded;
        UnitRecord::new(
            seed,
            UnitOutcome::Rejected {
                case: case(seed).reject(reason),
                reason,
            },
            1,
            TokenUsage::default(),
        )
    }

    #[tokio::test]
    async fn test_record_updates_counts_and_cursor() {
        let root = tempfile::tempdir().unwrap();
        let ledger = RunLedger::start_run(root.path(), RunConfig::default(), Vec::new())
            .await
            .unwrap();

        ledger.record(accepted(0)).await.unwrap();
        ledger.record(rejected(2)).await.unwrap();
        ledger
            .record(UnitRecord::new(1, UnitOutcome::Failed { error: "down".into() }, 4, TokenUsage::default()))
            .await
            .unwrap();
        // Duplicate delivery of a recorded seed changes nothing.
        ledger.record(accepted(0)).await.unwrap();

        let manifest = ledger.manifest().await;
        assert_eq!(manifest.cursor, 3);
        assert_eq!(manifest.counts.generated, 2);
        assert_eq!(manifest.counts.accepted, 1);
        assert_eq!(manifest.counts.rejected, 1);
        assert_eq!(manifest.counts.failed, 1);
        assert_eq!(manifest.rejections[&RejectionReason::Ungrounded], 1);
        assert_eq!(manifest.usage.prompt_tokens, 10);

        let on_disk = load_manifest(root.path(), &manifest.run_id).await.unwrap();
        assert_eq!(on_disk.cursor, 3);
    }

    #[tokio::test]
    async fn test_invalid_config_persists_failed_run() {
        let root = tempfile::tempdir().unwrap();
        let mut config = RunConfig::default();
        config.concurrency = 0;

        let err = RunLedger::start_run(root.path(), config, Vec::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LedgerError::Config(_)));

        let run_dir = std::fs::read_dir(root.path()).unwrap().next().unwrap().unwrap();
        let run_id = run_dir.file_name().to_string_lossy().to_string();
        let manifest = load_manifest(root.path(), &run_id).await.unwrap();
        assert_eq!(manifest.status, RunStatus::Failed);
        assert!(manifest.error.unwrap().contains("concurrency"));
    }

    #[tokio::test]
    async fn test_resume_replays_records_and_drops_torn_line() {
        let root = tempfile::tempdir().unwrap();
        let ledger = RunLedger::start_run(root.path(), RunConfig::default(), Vec::new())
            .await
            .unwrap();
        let run_id = ledger.run_id().await;
        ledger.record(accepted(0)).await.unwrap();
        ledger.record(accepted(1)).await.unwrap();
        drop(ledger);

        let records_path = run_dir(root.path(), &run_id).join(RECORDS_FILE);
        let mut contents = std::fs::read(&records_path).unwrap();
        let intact = contents.len();
        contents.extend_from_slice(br#"{"seed":2,"outcome":"acc"#);
        std::fs::write(&records_path, &contents).unwrap();

        let resumed = RunLedger::resume(root.path(), &run_id).await.unwrap();
        assert_eq!(resumed.checkpoint().await, 2);
        assert_eq!(resumed.manifest().await.counts.accepted, 2);
        assert_eq!(resumed.accepted_cases().await.len(), 2);
        assert_eq!(std::fs::metadata(&records_path).unwrap().len() as usize, intact);

        resumed.record(accepted(2)).await.unwrap();
        assert_eq!(resumed.checkpoint().await, 3);
    }

    #[tokio::test]
    async fn test_completed_run_cannot_be_resumed() {
        let root = tempfile::tempdir().unwrap();
        let ledger = RunLedger::start_run(root.path(), RunConfig::default(), Vec::new())
            .await
            .unwrap();
        let run_id = ledger.run_id().await;
        ledger.record(accepted(0)).await.unwrap();
        ledger.finish(RunStatus::Completed).await.unwrap();

        let exported = std::fs::read_to_string(run_dir(root.path(), &run_id).join(ACCEPTED_FILE)).unwrap();
        assert_eq!(exported.lines().count(), 1);

        assert!(matches!(
            RunLedger::resume(root.path(), &run_id).await,
            Err(LedgerError::AlreadyCompleted(_))
        ));
        assert!(matches!(
            load_manifest(root.path(), "missing").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let ledger = RunLedger::start_run(root.path(), RunConfig::default(), Vec::new())
            .await
            .unwrap();
        let run_id = ledger.run_id().await;
        ledger.record(accepted(0)).await.unwrap();
        drop(ledger);

        let records_path = run_dir(root.path(), &run_id).join(RECORDS_FILE);
        let mut contents = b"not json\n".to_vec();
        contents.extend(std::fs::read(&records_path).unwrap());
        std::fs::write(&records_path, contents).unwrap();

        assert!(matches!(
            RunLedger::resume(root.path(), &run_id).await,
            Err(LedgerError::Persistence(PersistenceError::Corrupt { line: 1, .. }))
        ));
    }
}
