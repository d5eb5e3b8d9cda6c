//! Run lifecycle status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// `Completed`, `Failed`, `Stopped` and `Timeout` are terminal: once reached,
/// only a restart (which resets the run to `Initialized`) can leave them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    SettingUp,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped | RunStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::SettingUp => "setting_up",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::Timeout => "timeout",
        }
    }

    /// Human-readable summary carried by the final `complete` event.
    pub fn summary(self) -> &'static str {
        match self {
            RunStatus::Completed => "All tasks completed successfully",
            RunStatus::Failed => "Run failed",
            RunStatus::Stopped => "Run stopped by user",
            RunStatus::Timeout => "Run exceeded its step limit",
            RunStatus::Initialized
            | RunStatus::SettingUp
            | RunStatus::Running
            | RunStatus::Paused => "Run ended before reaching a terminal state",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
