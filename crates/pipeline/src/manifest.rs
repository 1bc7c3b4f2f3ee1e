use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::RunConfig;
use generate::{Mode, RejectionReason, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Stopped on request; can be resumed.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Units the model answered, accepted or not.
    pub generated: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Units whose capability calls ran out of retries.
    pub failed: usize,
    pub zero_chain_seeds: usize,
}

/// Everything known about a run, persisted as `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub mode: Mode,
    pub status: RunStatus,
    pub config: RunConfig,
    /// Files and directories the corpus was read from.
    #[serde(default)]
    pub corpus: Vec<String>,
    pub prompt_version: String,
    /// Every seed index below this one has been recorded.
    pub cursor: usize,
    /// Recorded seed indices at or above `cursor`.
    #[serde(default)]
    pub completed_ahead: BTreeSet<usize>,
    #[serde(default)]
    pub total_units: Option<usize>,
    /// Digest of the planned seed sequence; a resumed run must plan the same one.
    #[serde(default)]
    pub plan_fingerprint: Option<String>,
    pub counts: RunCounts,
    pub usage: TokenUsage,
    #[serde(default)]
    pub rejections: BTreeMap<RejectionReason, usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn new(run_id: String, config: RunConfig, corpus: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode: config.mode,
            status: RunStatus::Running,
            config,
            corpus,
            prompt_version: generate::PROMPT_VERSION.to_string(),
            cursor: 0,
            completed_ahead: BTreeSet::new(),
            total_units: None,
            plan_fingerprint: None,
            counts: RunCounts::default(),
            usage: TokenUsage::default(),
            rejections: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    pub fn is_recorded(&self, seed: usize) -> bool {
        seed < self.cursor || self.completed_ahead.contains(&seed)
    }

    /// Marks `seed` recorded and moves the cursor past every contiguous
    /// recorded index.
    pub fn mark_recorded(&mut self, seed: usize) {
        if seed == self.cursor {
            self.cursor += 1;
            while self.completed_ahead.remove(&self.cursor) {
                self.cursor += 1;
            }
        } else if seed > self.cursor {
            self.completed_ahead.insert(seed);
        }
    }

    /// One-line human summary for the CLI.
    pub fn summary(&self) -> String {
        let breakdown = self
            .rejections
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "run {} [{}] {}: generated={} accepted={} rejected={} failed={} zero_chain_seeds={} cursor={}/{} tokens={}+{}{}",
            self.run_id,
            self.mode,
            self.status,
            self.counts.generated,
            self.counts.accepted,
            self.counts.rejected,
            self.counts.failed,
            self.counts.zero_chain_seeds,
            self.cursor,
            self.total_units.map_or_else(|| "?".to_string(), |n| n.to_string()),
            self.usage.prompt_tokens,
            self.usage.completion_tokens,
            if breakdown.is_empty() {
                String::new()
            } else {
                format!(" rejections: {breakdown}")
            }
        )
    }
}
