//! Archive of finished runs under `<archive_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::history::HistoryEntry;
use crate::core::status::RunStatus;
use crate::io::config::write_atomic;

/// Summary persisted as `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub app: String,
    pub goal: String,
    pub status: RunStatus,
    pub plan: Vec<String>,
    /// Steps completed when the run ended.
    pub current_step_index: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArchivePaths {
    pub dir: PathBuf,
    pub summary_path: PathBuf,
    pub history_path: PathBuf,
}

impl ArchivePaths {
    pub fn new(root: &Path, run_id: &str) -> Self {
        let dir = root.join(run_id);
        Self {
            summary_path: dir.join("summary.json"),
            history_path: dir.join("history.json"),
            dir,
        }
    }
}

/// Write `summary.json` and `history.json` for a finished run.
///
/// A restarted run overwrites its previous archive.
pub fn archive_run(
    root: &Path,
    summary: &RunSummary,
    history: &[HistoryEntry],
) -> Result<ArchivePaths> {
    let paths = ArchivePaths::new(root, &summary.run_id);
    debug!(dir = %paths.dir.display(), run_id = %summary.run_id, status = %summary.status, "archiving run");
    write_json(&paths.summary_path, summary)?;
    write_json(&paths.history_path, history)?;
    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(path, &payload)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn summary(status: RunStatus) -> RunSummary {
        RunSummary {
            run_id: "run-1".into(),
            app: "app.apk".into(),
            goal: "Log in".into(),
            status,
            plan: vec!["Tap login".into()],
            current_step_index: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn writes_summary_and_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = vec![HistoryEntry::system("Session started")];
        let paths = archive_run(temp.path(), &summary(RunStatus::Completed), &history)
            .expect("archive");

        let raw = fs::read_to_string(&paths.summary_path).expect("summary");
        let loaded: RunSummary = serde_json::from_str(&raw).expect("parse summary");
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.plan, vec!["Tap login".to_string()]);

        let raw = fs::read_to_string(&paths.history_path).expect("history");
        let entries: Vec<HistoryEntry> = serde_json::from_str(&raw).expect("parse history");
        assert_eq!(entries, history);
    }

    /// A restarted run reuses its id; the later archive replaces the earlier one.
    #[test]
    fn rearchive_overwrites() {
        let temp = tempfile::tempdir().expect("tempdir");
        archive_run(temp.path(), &summary(RunStatus::Stopped), &[]).expect("first");
        let paths =
            archive_run(temp.path(), &summary(RunStatus::Failed), &[]).expect("second");
        let raw = fs::read_to_string(&paths.summary_path).expect("summary");
        let loaded: RunSummary = serde_json::from_str(&raw).expect("parse");
        assert_eq!(loaded.status, RunStatus::Failed);
    }
}
