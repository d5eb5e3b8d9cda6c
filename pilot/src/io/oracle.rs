//! Decision oracle capability contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::decision::ActionDecision;
use crate::core::history::HistoryEntry;
use crate::core::intent::ToolCall;
use crate::core::status::RunStatus;
use crate::error::OracleError;

/// Verification verdict for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub completed: bool,
    #[serde(default)]
    pub reason: String,
}

/// External reasoning service: plans, decides, verifies and classifies.
///
/// All calls are single-shot request/response and may take several seconds.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Break `goal` into ordered, granular step descriptions.
    async fn plan(&self, goal: &str) -> Result<Vec<String>, OracleError>;

    /// Decide the next action for `step` given the current screen.
    async fn analyze(
        &self,
        screenshot: &[u8],
        ui_tree: &str,
        step: &str,
        history: &[HistoryEntry],
    ) -> Result<ActionDecision, OracleError>;

    /// Check whether `step` already looks satisfied on screen.
    async fn verify(&self, screenshot: &[u8], step: &str) -> Result<Verdict, OracleError>;

    /// Map a free-text user message to a control intent.
    async fn classify_intent(
        &self,
        message: &str,
        history: &[HistoryEntry],
        status: RunStatus,
    ) -> Result<ToolCall, OracleError>;
}
