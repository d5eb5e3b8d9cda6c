//! The plan → navigate → execute state machine for one run.
//!
//! A [`StepCycle`] is owned by the execution loop. `plan`, the step cursor and
//! the retry counter live here and nowhere else; the only shared state it
//! writes is the run history. Each call to [`StepCycle::advance`] performs one
//! transition and returns the events it produced, in order.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{ActionDecision, ActionKind};
use crate::core::event::RunEvent;
use crate::core::history::{HistoryEntry, HistoryLog, Role};
use crate::core::phase::{Phase, RetryVerdict, register_failure, route_decision};
use crate::error::RunError;
use crate::executor::{ActionExecutor, ExecutorDefaults};
use crate::io::config::{RunnerConfig, VerifyPolicy};
use crate::io::driver::AutomationDriver;
use crate::io::oracle::DecisionOracle;

/// Knobs for a single cycle.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub max_retries: u32,
    /// History entries handed to `analyze`.
    pub analysis_history: usize,
    pub verify: VerifyPolicy,
    pub executor: ExecutorDefaults,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            analysis_history: 10,
            verify: VerifyPolicy::Skip,
            executor: ExecutorDefaults::default(),
        }
    }
}

impl From<&RunnerConfig> for CycleConfig {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            analysis_history: cfg.analysis_history,
            verify: cfg.verify,
            executor: ExecutorDefaults {
                wait: cfg.default_wait(),
                swipe: cfg.swipe_duration(),
            },
        }
    }
}

pub struct StepCycle {
    goal: String,
    plan: Vec<String>,
    current_step_index: usize,
    retry_count: u32,
    phase: Phase,
    driver: Arc<dyn AutomationDriver>,
    oracle: Arc<dyn DecisionOracle>,
    executor: ActionExecutor,
    history: Arc<Mutex<HistoryLog>>,
    config: CycleConfig,
}

impl StepCycle {
    pub fn new(
        goal: impl Into<String>,
        driver: Arc<dyn AutomationDriver>,
        oracle: Arc<dyn DecisionOracle>,
        history: Arc<Mutex<HistoryLog>>,
        config: CycleConfig,
    ) -> Self {
        let executor = ActionExecutor::new(driver.clone(), config.executor);
        Self {
            goal: goal.into(),
            plan: Vec::new(),
            current_step_index: 0,
            retry_count: 0,
            phase: Phase::Planning,
            driver,
            oracle,
            executor,
            history,
            config,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn plan(&self) -> &[String] {
        &self.plan
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// True when the next `advance` will capture the screen and consult the oracle.
    pub fn needs_observation(&self) -> bool {
        matches!(self.phase, Phase::Navigating) && self.current_step_index < self.plan.len()
    }

    /// Perform one transition. A no-op once the cycle is terminal.
    #[instrument(skip_all, fields(phase = self.phase.name(), step = self.current_step_index))]
    pub async fn advance(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        let phase = std::mem::replace(&mut self.phase, Phase::Planning);
        self.phase = match phase {
            Phase::Planning => self.run_planning(&mut events).await,
            Phase::Navigating => self.run_navigating(&mut events).await,
            Phase::Executing(decision) => self.run_executing(decision, &mut events).await,
            terminal @ (Phase::Completed | Phase::Failed { .. }) => terminal,
        };
        debug!(next = self.phase.name(), events = events.len(), "cycle advanced");
        events
    }

    async fn run_planning(&mut self, events: &mut Vec<RunEvent>) -> Phase {
        match self.oracle.plan(&self.goal).await {
            Ok(plan) => {
                info!(steps = plan.len(), "plan created");
                self.record(HistoryEntry::system(format!(
                    "Plan created with {} steps",
                    plan.len()
                )));
                events.push(RunEvent::Plan {
                    message: format!("Created {}-step plan", plan.len()),
                    tasks: plan.clone(),
                });
                self.plan = plan;
                self.current_step_index = 0;
                self.retry_count = 0;
                Phase::Navigating
            }
            Err(err) => self.fail(RunError::Planning(err), events),
        }
    }

    async fn run_navigating(&mut self, events: &mut Vec<RunEvent>) -> Phase {
        let Some(step) = self.plan.get(self.current_step_index).cloned() else {
            self.record(HistoryEntry::system("All tasks completed"));
            events.push(RunEvent::status("All tasks completed"));
            return Phase::Completed;
        };
        debug!(step = %step, "observing");

        let screenshot = match self.driver.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => return self.fail(err.into(), events),
        };
        let ui_tree = match self.driver.ui_tree().await {
            Ok(tree) => tree,
            Err(err) => return self.fail(err.into(), events),
        };
        events.push(RunEvent::Screenshot {
            data: STANDARD.encode(&screenshot),
        });

        if self.config.verify == VerifyPolicy::BeforeAnalyze {
            match self.oracle.verify(&screenshot, &step).await {
                Ok(verdict) if verdict.completed => {
                    debug!(reason = %verdict.reason, "step verified as complete");
                    self.complete_step(events);
                    return Phase::Navigating;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "verification failed, analyzing instead");
                    events.push(RunEvent::warning(format!(
                        "Verification failed, analyzing screen instead: {err}"
                    )));
                }
            }
        }

        let recent = self.history.lock().recent(self.config.analysis_history);
        let decision = match self
            .oracle
            .analyze(&screenshot, &ui_tree, &step, &recent)
            .await
        {
            Ok(decision) => decision,
            Err(err) => return self.fail(err.into(), events),
        };
        info!(action = %decision.kind, reason = %decision.reason, "decision received");
        events.push(RunEvent::ActionPlan {
            action: decision.kind,
            reason: decision.reason.clone(),
            selector: decision.selector.clone(),
        });

        match route_decision(decision) {
            Phase::Failed { reason } => {
                self.record(HistoryEntry::note(Role::Model, reason.clone()));
                events.push(RunEvent::error(reason.clone()));
                Phase::Failed { reason }
            }
            next => next,
        }
    }

    async fn run_executing(
        &mut self,
        decision: ActionDecision,
        events: &mut Vec<RunEvent>,
    ) -> Phase {
        match decision.kind {
            ActionKind::Done => {
                self.complete_step(events);
                return Phase::Navigating;
            }
            ActionKind::Complete => return Phase::Completed,
            _ => {}
        }

        let result = self.executor.execute(&decision).await;
        if result.ok {
            self.retry_count = 0;
            self.record(HistoryEntry::action(
                Role::Assistant,
                decision.kind.as_str(),
                decision.history_params(),
                Some(decision.reason.clone()),
            ));
            events.push(RunEvent::ActionExecuted {
                message: format!("✓ Executed: {}", decision.kind),
            });
            return Phase::Navigating;
        }

        self.record(HistoryEntry::system(format!(
            "Action '{}' failed: {}",
            decision.kind, result.detail
        )));
        match register_failure(&mut self.retry_count, self.config.max_retries) {
            RetryVerdict::Retry { attempt } => {
                events.push(RunEvent::warning(format!(
                    "Action '{}' failed, retrying ({}/{})",
                    decision.kind, attempt, self.config.max_retries
                )));
                Phase::Navigating
            }
            RetryVerdict::Exhausted { attempts } => self.fail(
                RunError::RetriesExhausted {
                    action: decision.kind.to_string(),
                    attempts,
                },
                events,
            ),
        }
    }

    /// Advance past the current step.
    fn complete_step(&mut self, events: &mut Vec<RunEvent>) {
        let step = self
            .plan
            .get(self.current_step_index)
            .cloned()
            .unwrap_or_default();
        self.current_step_index += 1;
        self.retry_count = 0;
        info!(step = %step, next = self.current_step_index, "step completed");
        self.record(HistoryEntry::action(
            Role::Assistant,
            "task_complete",
            Some(serde_json::json!({ "task": step })),
            None,
        ));
        events.push(RunEvent::TaskComplete {
            message: format!("✓ Completed: {step}"),
        });
    }

    fn fail(&mut self, err: RunError, events: &mut Vec<RunEvent>) -> Phase {
        let reason = err.to_string();
        warn!(reason = %reason, "cycle failed");
        self.record(HistoryEntry::system(reason.clone()));
        events.push(RunEvent::error(reason.clone()));
        Phase::Failed { reason }
    }

    fn record(&self, entry: HistoryEntry) {
        self.history.lock().push(entry);
    }
}
