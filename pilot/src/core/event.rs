//! Structured events streamed to run observers.

use serde::{Deserialize, Serialize};

use crate::core::decision::{ActionKind, Selector};
use crate::core::status::RunStatus;

/// Sender name on chat replies produced by the agent.
pub const AGENT_SENDER: &str = "agent";

/// One observable run event, discriminated by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    Plan {
        tasks: Vec<String>,
        message: String,
    },
    /// Base64-encoded PNG.
    Screenshot {
        data: String,
    },
    ActionPlan {
        action: ActionKind,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<Selector>,
    },
    TaskComplete {
        message: String,
    },
    ActionExecuted {
        message: String,
    },
    Warning {
        message: String,
    },
    ChatResponse {
        message: String,
        sender: String,
    },
    Complete {
        status: RunStatus,
        message: String,
    },
}

impl RunEvent {
    pub fn status(message: impl Into<String>) -> Self {
        RunEvent::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RunEvent::Error {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        RunEvent::Warning {
            message: message.into(),
        }
    }

    pub fn chat(message: impl Into<String>) -> Self {
        RunEvent::ChatResponse {
            message: message.into(),
            sender: AGENT_SENDER.to_string(),
        }
    }

    pub fn complete(status: RunStatus) -> Self {
        RunEvent::Complete {
            status,
            message: status.summary().to_string(),
        }
    }

    /// Wire discriminator, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Status { .. } => "status",
            RunEvent::Error { .. } => "error",
            RunEvent::Plan { .. } => "plan",
            RunEvent::Screenshot { .. } => "screenshot",
            RunEvent::ActionPlan { .. } => "action_plan",
            RunEvent::TaskComplete { .. } => "task_complete",
            RunEvent::ActionExecuted { .. } => "action_executed",
            RunEvent::Warning { .. } => "warning",
            RunEvent::ChatResponse { .. } => "chat_response",
            RunEvent::Complete { .. } => "complete",
        }
    }
}
