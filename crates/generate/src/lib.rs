pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod testcase;

pub use orchestrator::{GenerationOutcome, Orchestrator, UnitState};
pub use parser::{parse_response, ParseError, QaPair};
pub use prompt::PROMPT_VERSION;
pub use testcase::{JudgeCriterion, JudgeVerdict, Mode, RejectionReason, Status, TestCase, TokenUsage};
