//! Bounded, append-only run history.
//!
//! Entries are immutable once recorded. The only way an entry leaves the log
//! is by FIFO eviction when the log grows past its limit (or a full reset when
//! the run restarts).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default maximum number of retained entries.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Orchestrator bookkeeping (session started, failures, plan size).
    System,
    /// Output of the decision oracle.
    Model,
    /// Actions the agent carried out.
    Assistant,
}

/// One recorded run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// A free-text entry.
    pub fn note(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            action: None,
            params: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::note(Role::System, content)
    }

    /// An entry describing an action the agent took.
    pub fn action(
        role: Role,
        action: impl Into<String>,
        params: Option<Value>,
        reason: Option<String>,
    ) -> Self {
        Self {
            role,
            content: None,
            action: Some(action.into()),
            params,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// FIFO-bounded history log.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl HistoryLog {
    /// Create an empty log retaining at most `limit` entries (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append entries in order, then drop the oldest ones beyond the limit.
    pub fn append<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = HistoryEntry>,
    {
        self.entries.extend(entries);
        let excess = self.entries.len().saturating_sub(self.limit);
        if excess > 0 {
            self.entries.drain(..excess);
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.append([entry]);
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Discard everything. Only used when a run is reset for a restart.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
