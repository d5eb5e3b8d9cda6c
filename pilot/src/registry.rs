//! Concurrent map of live runs, shared by transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::controller::{RunController, RunRequest, RunSettings};
use crate::core::history::HistoryEntry;
use crate::core::status::RunStatus;
use crate::error::DriverError;
use crate::io::driver::AutomationDriver;
use crate::io::oracle::DecisionOracle;

/// Builds a fresh driver for each run; sessions are never shared.
pub type DriverFactory =
    Arc<dyn Fn() -> Result<Arc<dyn AutomationDriver>, DriverError> + Send + Sync>;

/// How long an unobserved finished run stays queryable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub goal: String,
    pub history: Vec<HistoryEntry>,
}

pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunController>>>,
    drivers: DriverFactory,
    oracle: Arc<dyn DecisionOracle>,
    settings: RunSettings,
    retention: Duration,
}

impl RunRegistry {
    pub fn new(
        drivers: DriverFactory,
        oracle: Arc<dyn DecisionOracle>,
        settings: RunSettings,
    ) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            drivers,
            oracle,
            settings,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Register a run and launch its execution loop.
    ///
    /// Finished runs past their retention are swept first.
    pub fn create(&self, request: RunRequest) -> Result<Arc<RunController>, DriverError> {
        self.reap_finished();
        let run = RunController::new(
            request,
            (self.drivers)()?,
            self.oracle.clone(),
            self.settings.clone(),
        );
        self.runs
            .write()
            .insert(run.run_id().to_string(), run.clone());
        info!(run_id = %run.run_id(), app = %run.app(), "run created");
        run.launch();
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunController>> {
        self.runs.read().get(run_id).cloned()
    }

    pub fn status(&self, run_id: &str) -> Option<RunSnapshot> {
        let run = self.get(run_id)?;
        Some(RunSnapshot {
            run_id: run.run_id().to_string(),
            status: run.status(),
            goal: run.goal(),
            history: run.history(),
        })
    }

    /// Request a stop. Returns `false` for unknown ids.
    pub fn stop(&self, run_id: &str) -> bool {
        match self.get(run_id) {
            Some(run) => {
                run.stop();
                true
            }
            None => false,
        }
    }

    /// Stop and discard a run.
    pub fn remove(&self, run_id: &str) -> Option<Arc<RunController>> {
        let run = self.runs.write().remove(run_id)?;
        run.stop();
        info!(run_id = %run_id, "run removed");
        Some(run)
    }

    /// Stop and discard the run if nobody is observing it any more.
    pub fn release_if_unobserved(&self, run_id: &str) -> bool {
        let observed = self
            .get(run_id)
            .is_some_and(|run| run.events().observer_count() > 0);
        if observed {
            return false;
        }
        self.remove(run_id).is_some()
    }

    /// Discard runs that finished more than `retention` ago and have no
    /// observers. Returns how many were removed.
    pub fn reap_finished(&self) -> usize {
        let now = Utc::now();
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|run_id, run| {
            let Some(finished_at) = run.finished_at() else {
                return true;
            };
            let age = (now - finished_at).to_std().unwrap_or_default();
            let expired = run.status().is_terminal()
                && run.events().observer_count() == 0
                && age >= self.retention;
            if expired {
                debug!(run_id = %run_id, "finished run reaped");
            }
            !expired
        });
        before - runs.len()
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}
