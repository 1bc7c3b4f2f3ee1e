pub mod capabilities;
pub mod config;
pub mod ledger;
pub mod manifest;
pub mod runner;
pub mod telemetry;

pub use capabilities::Capabilities;
pub use config::{ConfigError, RunConfig};
pub use ledger::{LedgerError, PersistenceError, RunLedger, UnitOutcome, UnitRecord};
pub use manifest::{RunCounts, RunManifest, RunStatus};
pub use runner::{plan_fingerprint, plan_seeds, RunDriver, RunError, Seed};
