use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ingest::Document;
use llm::testing::FnGenerator;
use llm::HashingEmbedder;
use pipeline::config::EmbedderKind;
use pipeline::ledger::{ACCEPTED_FILE, RECORDS_FILE};
use pipeline::{Capabilities, RunConfig, RunDriver, RunError, RunLedger, RunStatus};

const FACTS: [&str; 9] = [
    "Paris is the capital of France.",
    "Mount Everest is the tallest mountain on Earth.",
    "The Amazon river flows through Brazil.",
    "Photosynthesis converts sunlight into chemical energy.",
    "Beethoven composed nine symphonies.",
    "Honeybees communicate through a waggle dance.",
    "Copper conducts electricity very well.",
    "The Sahara desert spans northern Africa.",
    "Jupiter hosts a storm called the Great Red Spot.",
];

fn corpus(facts: &[&str]) -> Vec<Document> {
    facts
        .iter()
        .enumerate()
        .map(|(i, text)| Document::new(format!("d{i}"), *text, format!("mem://d{i}")))
        .collect()
}

fn config(concurrency: usize) -> RunConfig {
    let mut config = RunConfig::default();
    config.concurrency = concurrency;
    config.retry.max_retries = 0;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 1;
    config.validation.novelty_threshold = 0.99;
    config.providers.embedder = EmbedderKind::Hashing;
    config
}

/// Asks about whatever passage the prompt carries and answers with it verbatim.
fn echo_answer(prompt: &str) -> String {
    let passage = prompt
        .split_once("PASSAGE:\n")
        .and_then(|(_, rest)| rest.split_once("\n\nOUTPUT FORMAT"))
        .map(|(passage, _)| passage.trim())
        .unwrap_or_default();
    format!("Q: What does the record say about {passage}?\nA: {passage}")
}

fn echo() -> FnGenerator {
    FnGenerator::new(|prompt, _| Ok(echo_answer(prompt)))
}

/// Echoes, and cancels `cancel` while answering call number `at`.
fn cancelling_at(at: usize, cancel: CancellationToken) -> (FnGenerator, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let generator = FnGenerator::new(move |prompt, _| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == at {
            cancel.cancel();
        }
        Ok(echo_answer(prompt))
    });
    (generator, calls)
}

fn capabilities(generator: FnGenerator) -> Capabilities {
    Capabilities::new(Arc::new(generator), Arc::new(HashingEmbedder::new(256)))
}

async fn accepted_ids(ledger: &RunLedger) -> Vec<String> {
    ledger
        .accepted_cases()
        .await
        .into_iter()
        .map(|case| case.id)
        .collect()
}

async fn reference_ids(root: &std::path::Path, facts: &[&str], concurrency: usize) -> Vec<String> {
    let ledger = Arc::new(
        RunLedger::start_run(root, config(concurrency), Vec::new())
            .await
            .unwrap(),
    );
    let manifest = RunDriver::new(config(concurrency), capabilities(echo()))
        .run(ledger.clone(), corpus(facts))
        .await
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.counts.accepted, facts.len());
    accepted_ids(&ledger).await
}

fn recorded_seeds(ledger: &RunLedger) -> Vec<u64> {
    std::fs::read_to_string(ledger.dir().join(RECORDS_FILE))
        .unwrap()
        .lines()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            record["seed"].as_u64().unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_run() {
    let root = tempfile::tempdir().unwrap();
    let facts = &FACTS[..5];
    let expected = reference_ids(root.path(), facts, 1).await;

    let cancel = CancellationToken::new();
    let (interrupting, calls) = cancelling_at(3, cancel.clone());
    let ledger = Arc::new(
        RunLedger::start_run(root.path(), config(1), Vec::new())
            .await
            .unwrap(),
    );
    let run_id = ledger.run_id().await;
    let manifest = RunDriver::new(config(1), capabilities(interrupting))
        .with_cancellation(cancel)
        .run(ledger.clone(), corpus(facts))
        .await
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Cancelled);
    assert_eq!(manifest.cursor, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    drop(ledger);

    // A fresh generator only sees the remaining seeds.
    let resumed = Arc::new(RunLedger::resume(root.path(), &run_id).await.unwrap());
    assert_eq!(resumed.checkpoint().await, 3);
    let generator = echo();
    let manifest = RunDriver::new(config(1), capabilities(generator.clone()))
        .run(resumed.clone(), corpus(facts))
        .await
        .unwrap();

    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(generator.calls(), 2);
    assert_eq!(manifest.counts.accepted, 5);
    assert_eq!(manifest.cursor, 5);
    assert_eq!(accepted_ids(&resumed).await, expected);

    assert_eq!(recorded_seeds(&resumed), vec![0, 1, 2, 3, 4]);
    let exported = std::fs::read_to_string(resumed.dir().join(ACCEPTED_FILE)).unwrap();
    assert_eq!(exported.lines().count(), 5);
}

#[tokio::test]
async fn test_cancelled_worker_pool_records_whole_units_only() {
    let root = tempfile::tempdir().unwrap();
    let expected = reference_ids(root.path(), &FACTS, 3).await;

    let cancel = CancellationToken::new();
    let (interrupting, calls) = cancelling_at(4, cancel.clone());
    let ledger = Arc::new(
        RunLedger::start_run(root.path(), config(3), Vec::new())
            .await
            .unwrap(),
    );
    let run_id = ledger.run_id().await;
    let manifest = RunDriver::new(config(3), capabilities(interrupting))
        .with_cancellation(cancel)
        .run(ledger.clone(), corpus(&FACTS))
        .await
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Cancelled);

    // Every unit that reached the generator was recorded exactly once.
    let seeds = recorded_seeds(&ledger);
    let unique: BTreeSet<u64> = seeds.iter().copied().collect();
    assert_eq!(unique.len(), seeds.len());
    assert_eq!(seeds.len(), manifest.counts.generated + manifest.counts.failed);
    assert_eq!(seeds.len(), calls.load(Ordering::SeqCst));
    assert!(seeds.len() < FACTS.len());
    for seed in 0..manifest.cursor as u64 {
        assert!(unique.contains(&seed), "seed {seed} below the cursor is not recorded");
    }
    let first_pass = seeds.len();
    drop(ledger);

    let resumed = Arc::new(RunLedger::resume(root.path(), &run_id).await.unwrap());
    let generator = echo();
    let manifest = RunDriver::new(config(3), capabilities(generator.clone()))
        .run(resumed.clone(), corpus(&FACTS))
        .await
        .unwrap();

    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(generator.calls(), FACTS.len() - first_pass);
    assert_eq!(manifest.cursor, FACTS.len());
    assert!(manifest.completed_ahead.is_empty());
    assert_eq!(accepted_ids(&resumed).await, expected);

    let seeds = recorded_seeds(&resumed);
    let unique: BTreeSet<u64> = seeds.iter().copied().collect();
    assert_eq!(seeds.len(), FACTS.len());
    assert_eq!(unique, (0..FACTS.len() as u64).collect());
}

#[tokio::test]
async fn test_resume_refuses_a_changed_corpus() {
    let root = tempfile::tempdir().unwrap();
    let facts = &FACTS[..3];

    let cancel = CancellationToken::new();
    let (interrupting, _) = cancelling_at(2, cancel.clone());
    let ledger = Arc::new(
        RunLedger::start_run(root.path(), config(1), Vec::new())
            .await
            .unwrap(),
    );
    let run_id = ledger.run_id().await;
    RunDriver::new(config(1), capabilities(interrupting))
        .with_cancellation(cancel)
        .run(ledger.clone(), corpus(facts))
        .await
        .unwrap();
    drop(ledger);

    // A new document sorted first shifts every seed index.
    let mut changed = vec![Document::new("d-new", FACTS[8], "mem://d-new")];
    changed.extend(corpus(facts));

    let resumed = Arc::new(RunLedger::resume(root.path(), &run_id).await.unwrap());
    let generator = echo();
    let err = RunDriver::new(config(1), capabilities(generator.clone()))
        .run(resumed.clone(), changed)
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::PlanChanged { .. }));
    assert_eq!(generator.calls(), 0);
    let manifest = resumed.manifest().await;
    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.cursor, 2);
    drop(resumed);

    // The original corpus still resumes.
    let resumed = Arc::new(RunLedger::resume(root.path(), &run_id).await.unwrap());
    let generator = echo();
    let manifest = RunDriver::new(config(1), capabilities(generator.clone()))
        .run(resumed, corpus(facts))
        .await
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(generator.calls(), 1);
    assert_eq!(manifest.counts.accepted, 3);
}

#[tokio::test]
async fn test_completed_run_cannot_be_resumed() {
    let root = tempfile::tempdir().unwrap();
    let ledger = Arc::new(
        RunLedger::start_run(root.path(), config(1), Vec::new())
            .await
            .unwrap(),
    );
    let run_id = ledger.run_id().await;
    RunDriver::new(config(1), capabilities(echo()))
        .run(ledger, corpus(&FACTS[..2]))
        .await
        .unwrap();

    let err = RunLedger::resume(root.path(), &run_id).await.err().unwrap();
    assert!(matches!(err, pipeline::LedgerError::AlreadyCompleted(_)));
}
