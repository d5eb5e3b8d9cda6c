//! Classify free-text user input into a control intent and dispatch it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::core::history::HistoryEntry;
use crate::core::intent::ToolCall;
use crate::core::status::RunStatus;
use crate::error::OracleError;
use crate::io::oracle::DecisionOracle;

/// Reply used when the oracle has no credentials configured.
pub const OFFLINE_REPLY: &str = "Sorry, I am currently offline.";

/// Reply used when `update_goal` carries no goal text.
pub const EMPTY_GOAL_REPLY: &str = "I can't update the goal to an empty task. Please describe the new goal.";

/// Narrow control surface the router dispatches into.
///
/// Every method is idempotent and safe to call while the execution loop runs.
#[async_trait]
pub trait RunControl: Send + Sync {
    fn status(&self) -> RunStatus;
    fn stop(&self);
    /// Returns whether the run was running and is now paused.
    fn pause(&self) -> bool;
    /// Returns whether the run was paused and is now running.
    fn resume(&self) -> bool;
    /// Stop, drain, reset and schedule a fresh start. `Some` replaces the goal.
    async fn restart(&self, new_goal: Option<String>) -> bool;
    /// Send a chat reply to the observers.
    fn reply(&self, message: String);
}

pub struct CommandRouter {
    oracle: Arc<dyn DecisionOracle>,
}

impl CommandRouter {
    pub fn new(oracle: Arc<dyn DecisionOracle>) -> Self {
        Self { oracle }
    }

    /// Classify `message`. Never fails: oracle errors become a chat reply.
    #[instrument(skip_all, fields(status = %status))]
    pub async fn classify(
        &self,
        message: &str,
        history: &[HistoryEntry],
        status: RunStatus,
    ) -> ToolCall {
        match self.oracle.classify_intent(message, history, status).await {
            Ok(call) => {
                info!(intent = call.intent(), "intent classified");
                call
            }
            Err(OracleError::Unavailable(reason)) => {
                warn!(reason = %reason, "intent oracle unavailable");
                ToolCall::reply(OFFLINE_REPLY)
            }
            Err(err) => {
                warn!(error = %err, "intent classification failed");
                ToolCall::reply(format!("Intent recognition failed: {err}"))
            }
        }
    }

    /// Apply a classified intent to the run.
    pub async fn dispatch(&self, target: &dyn RunControl, call: ToolCall) {
        match call {
            ToolCall::StopAgent => {
                target.stop();
                target.reply("Stopping the agent.".to_string());
            }
            ToolCall::PauseAgent => {
                if target.pause() {
                    target.reply("Agent paused. Say 'resume' to continue.".to_string());
                } else {
                    target.reply(format!(
                        "Nothing to pause: the agent is {}.",
                        target.status()
                    ));
                }
            }
            ToolCall::ResumeAgent => {
                if target.resume() {
                    target.reply("Resuming the agent.".to_string());
                } else {
                    target.reply(format!(
                        "Nothing to resume: the agent is {}.",
                        target.status()
                    ));
                }
            }
            ToolCall::RestartAgent => {
                target.reply("Restarting the agent from the beginning.".to_string());
                if !target.restart(None).await {
                    target.reply("Restart failed; the run could not be rescheduled.".to_string());
                }
            }
            ToolCall::UpdateGoal { new_goal } => {
                let goal = new_goal.trim();
                if goal.is_empty() {
                    warn!("rejected empty goal update");
                    target.reply(EMPTY_GOAL_REPLY.to_string());
                    return;
                }
                target.reply(format!("Updating goal and restarting: {goal}"));
                if !target.restart(Some(goal.to_string())).await {
                    target.reply("Restart failed; the run could not be rescheduled.".to_string());
                }
            }
            ToolCall::ReplyToUser { message } => target.reply(message),
        }
    }
}
