//! Run lifecycle: setup, the execution loop, control commands and cleanup.
//!
//! A [`RunController`] owns one run end to end. Two activities share it: the
//! execution loop (spawned by [`RunController::launch`]) and the command
//! channel ([`RunController::handle_user_input`]). The command channel only
//! writes `status`, `should_stop` and, through a restart, `goal` and
//! `history`; everything the step cycle owns stays inside the loop task.
//!
//! Status changes go through a `watch` channel so a paused loop wakes as soon
//! as the run is resumed or stopped. A restart waits for the previous loop to
//! exit (bounded by the drain timeout) before resetting the run.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::core::event::RunEvent;
use crate::core::history::{HistoryEntry, HistoryLog};
use crate::core::intent::{ToolCall, parse_user_message};
use crate::core::phase::Phase;
use crate::core::status::RunStatus;
use crate::cycle::{CycleConfig, StepCycle};
use crate::error::{ProtocolError, RunError};
use crate::events::EventEmitter;
use crate::io::archive::{RunSummary, archive_run};
use crate::io::config::RunnerConfig;
use crate::io::driver::AutomationDriver;
use crate::io::oracle::DecisionOracle;
use crate::router::{CommandRouter, RunControl};

/// Per-run settings, derived from [`RunnerConfig`].
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub history_limit: usize,
    /// Observation ceiling per run; 0 disables it.
    pub max_steps: u32,
    pub intent_history: usize,
    pub pause_recheck: Duration,
    pub drain_timeout: Duration,
    pub event_buffer: usize,
    pub archive_dir: Option<PathBuf>,
    pub cycle: CycleConfig,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for RunSettings {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            history_limit: cfg.history_limit,
            max_steps: cfg.max_steps,
            intent_history: cfg.intent_history,
            pause_recheck: cfg.pause_recheck(),
            drain_timeout: cfg.drain_timeout(),
            event_buffer: cfg.event_buffer,
            archive_dir: cfg.archive_dir.clone(),
            cycle: CycleConfig::from(cfg),
        }
    }
}

/// What a run was asked to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Application artifact handed to the driver (e.g. an APK path).
    pub app: String,
    pub goal: String,
}

/// Guarantees the driver session is released once per attempt.
///
/// The loop releases it explicitly; a restart that had to abort the loop
/// releases it instead. If neither happened, dropping the lease releases the
/// session in the background.
struct SessionLease {
    run_id: String,
    driver: Arc<dyn AutomationDriver>,
    opened: AtomicBool,
    released: AtomicBool,
}

impl SessionLease {
    fn new(run_id: &str, driver: Arc<dyn AutomationDriver>) -> Self {
        Self {
            run_id: run_id.to_string(),
            driver,
            opened: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    fn mark_opening(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.driver.quit().await {
            Ok(()) => info!(run_id = %self.run_id, "driver session released"),
            Err(err) => warn!(run_id = %self.run_id, error = %err, "cleanup failed"),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if *self.released.get_mut() || !*self.opened.get_mut() {
            return;
        }
        warn!(run_id = %self.run_id, "session lease dropped without cleanup");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let driver = self.driver.clone();
            let run_id = self.run_id.clone();
            handle.spawn(async move {
                if let Err(err) = driver.quit().await {
                    warn!(run_id = %run_id, error = %err, "background cleanup failed");
                }
            });
        }
    }
}

/// The spawned execution loop of the current attempt.
#[derive(Clone)]
struct LoopTask {
    generation: u64,
    done: Shared<BoxFuture<'static, ()>>,
    abort: AbortHandle,
    lease: Arc<SessionLease>,
}

/// Where the step cycle was when the loop exited.
#[derive(Debug, Default)]
struct Progress {
    plan: Vec<String>,
    step_index: usize,
}

pub struct RunController {
    run_id: String,
    app: String,
    goal: Mutex<String>,
    status: watch::Sender<RunStatus>,
    should_stop: AtomicBool,
    history: Arc<Mutex<HistoryLog>>,
    events: EventEmitter,
    driver: Arc<dyn AutomationDriver>,
    oracle: Arc<dyn DecisionOracle>,
    router: CommandRouter,
    settings: RunSettings,
    task: Mutex<Option<LoopTask>>,
    generation: AtomicU64,
    restart_lock: tokio::sync::Mutex<()>,
    /// Set once the `complete` event of the current attempt went out.
    reported: AtomicBool,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    created_at: DateTime<Utc>,
    me: Weak<RunController>,
}

impl RunController {
    pub fn new(
        request: RunRequest,
        driver: Arc<dyn AutomationDriver>,
        oracle: Arc<dyn DecisionOracle>,
        settings: RunSettings,
    ) -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), request, driver, oracle, settings)
    }

    pub fn with_id(
        run_id: String,
        request: RunRequest,
        driver: Arc<dyn AutomationDriver>,
        oracle: Arc<dyn DecisionOracle>,
        settings: RunSettings,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(RunStatus::Initialized);
        Arc::new_cyclic(|me| Self {
            events: EventEmitter::new(&run_id, settings.event_buffer),
            history: Arc::new(Mutex::new(HistoryLog::new(settings.history_limit))),
            router: CommandRouter::new(oracle.clone()),
            run_id,
            app: request.app,
            goal: Mutex::new(request.goal),
            status,
            should_stop: AtomicBool::new(false),
            driver,
            oracle,
            settings,
            task: Mutex::new(None),
            generation: AtomicU64::new(0),
            restart_lock: tokio::sync::Mutex::new(()),
            reported: AtomicBool::new(false),
            finished_at: Mutex::new(None),
            created_at: Utc::now(),
            me: me.clone(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn goal(&self) -> String {
        self.goal.lock().clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the current attempt reported its final status.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Spawn the execution loop as an independent task.
    ///
    /// Returns `false` if a loop is already running.
    pub fn launch(&self) -> bool {
        let Some(this) = self.me.upgrade() else {
            return false;
        };
        let mut slot = self.task.lock();
        if let Some(task) = slot.as_ref()
            && task.done.peek().is_none()
        {
            debug!(run_id = %self.run_id, "loop already running");
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let lease = Arc::new(SessionLease::new(&self.run_id, self.driver.clone()));
        let span = info_span!("run", run_id = %self.run_id, generation);
        let handle = tokio::spawn(this.drive(lease.clone()).instrument(span));
        let abort = handle.abort_handle();
        let done = handle.map(|_| ()).boxed().shared();
        *slot = Some(LoopTask {
            generation,
            done,
            abort,
            lease,
        });
        true
    }

    /// Launch the loop and wait for the run (and any restart) to finish.
    pub async fn start(self: Arc<Self>) -> RunStatus {
        self.launch();
        self.wait().await
    }

    /// Wait until the current loop (and any restart it led to) has finished.
    pub async fn wait(&self) -> RunStatus {
        loop {
            let Some(task) = self.current_task() else {
                return self.status();
            };
            task.done.clone().await;
            let _restarting = self.restart_lock.lock().await;
            let current = self.current_task().map(|task| task.generation);
            if current == Some(task.generation) {
                return self.status();
            }
        }
    }

    /// Request a stop. Idempotent; terminal statuses are left untouched.
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        let changed = self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = RunStatus::Stopped;
            true
        });
        if changed {
            info!(run_id = %self.run_id, "stop requested");
            self.events.emit(RunEvent::status("Agent stopped"));
        }
    }

    pub fn pause(&self) -> bool {
        let changed = self.transition(RunStatus::Running, RunStatus::Paused);
        if changed {
            info!(run_id = %self.run_id, "paused");
            self.events.emit(RunEvent::status("Agent paused"));
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = self.transition(RunStatus::Paused, RunStatus::Running);
        if changed {
            info!(run_id = %self.run_id, "resumed");
            self.events.emit(RunEvent::status("Agent resumed"));
        }
        changed
    }

    /// Stop the current loop, wait for it to exit, reset the run and schedule
    /// a fresh start. An empty `new_goal` is rejected and changes nothing.
    pub async fn restart(&self, new_goal: Option<String>) -> bool {
        let new_goal = new_goal.map(|goal| goal.trim().to_string());
        if new_goal.as_deref().is_some_and(str::is_empty) {
            warn!(run_id = %self.run_id, "restart with empty goal rejected");
            return false;
        }
        let _restarting = self.restart_lock.lock().await;
        info!(run_id = %self.run_id, new_goal = new_goal.is_some(), "restarting run");
        self.stop();
        self.drain().await;
        self.reset(new_goal);
        self.events.emit(RunEvent::status("Agent restarted"));
        self.launch()
    }

    /// Route one raw command-channel frame.
    ///
    /// A malformed frame is reported to observers as an `error` event and
    /// returned as a value; it never affects the run.
    pub async fn handle_user_input(&self, raw: &str) -> Result<ToolCall, ProtocolError> {
        match parse_user_message(raw) {
            Ok(message) => Ok(self.handle_message(&message).await),
            Err(err) => {
                self.report_protocol_error(&err);
                Err(err)
            }
        }
    }

    /// Tell observers a command frame was rejected.
    pub fn report_protocol_error(&self, err: &ProtocolError) {
        warn!(run_id = %self.run_id, error = %err, "malformed user input");
        self.events
            .emit(RunEvent::error(RunError::Protocol(err.clone()).to_string()));
    }

    /// Classify and dispatch an already-extracted user message.
    pub async fn handle_message(&self, message: &str) -> ToolCall {
        let recent = self.history.lock().recent(self.settings.intent_history);
        let call = self
            .router
            .classify(message, &recent, self.status())
            .await;
        self.router.dispatch(self, call.clone()).await;
        call
    }

    fn current_task(&self) -> Option<LoopTask> {
        self.task.lock().clone()
    }

    fn transition(&self, from: RunStatus, to: RunStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status != from {
                return false;
            }
            *status = to;
            true
        })
    }

    /// Record a loop-reached terminal status unless one is already set.
    fn finish(&self, outcome: RunStatus) -> RunStatus {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = outcome;
            true
        });
        self.status()
    }

    fn record(&self, entry: HistoryEntry) {
        self.history.lock().push(entry);
    }

    async fn drive(self: Arc<Self>, lease: Arc<SessionLease>) -> RunStatus {
        if !self.transition(RunStatus::Initialized, RunStatus::SettingUp) {
            let status = self.status();
            debug!(status = %status, "start ignored");
            if status.is_terminal() {
                self.report_complete(status);
            }
            return status;
        }
        let started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.execute(&lease)).catch_unwind().await;
        let (status, progress) = match outcome {
            Ok((status, progress)) => (status, progress),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "execution loop panicked");
                let err = RunError::Internal(message);
                self.record(HistoryEntry::system(err.to_string()));
                self.events.emit(RunEvent::error(err.to_string()));
                (self.finish(RunStatus::Failed), Progress::default())
            }
        };
        info!(status = %status, "run finished");
        self.report_complete(status);
        self.archive(status, &progress, started_at);
        lease.release().await;
        status
    }

    async fn execute(&self, lease: &SessionLease) -> (RunStatus, Progress) {
        self.events
            .emit(RunEvent::status(format!("Starting session for {}", self.app)));
        lease.mark_opening();
        if let Err(err) = self.driver.start_session(&self.app).await {
            let err = RunError::Setup(err);
            error!(error = %err, "session setup failed");
            self.record(HistoryEntry::system(err.to_string()));
            self.events.emit(RunEvent::error(err.to_string()));
            return (self.finish(RunStatus::Failed), Progress::default());
        }
        self.record(HistoryEntry::system("Session started"));
        if !self.transition(RunStatus::SettingUp, RunStatus::Running) {
            return (self.finish(RunStatus::Stopped), Progress::default());
        }
        self.events.emit(RunEvent::status("Session started"));

        let mut cycle = StepCycle::new(
            self.goal(),
            self.driver.clone(),
            self.oracle.clone(),
            self.history.clone(),
            self.settings.cycle.clone(),
        );
        let mut observations = 0u32;
        let status = loop {
            if self.should_stop() {
                break RunStatus::Stopped;
            }
            self.wait_while_paused().await;
            if self.should_stop() {
                break RunStatus::Stopped;
            }
            if cycle.needs_observation() && self.settings.max_steps > 0 {
                if observations >= self.settings.max_steps {
                    let err = RunError::StepLimit(self.settings.max_steps);
                    warn!(observations, "step limit reached");
                    self.record(HistoryEntry::system(err.to_string()));
                    self.events.emit(RunEvent::error(err.to_string()));
                    break RunStatus::Timeout;
                }
                observations += 1;
            }
            for event in cycle.advance().await {
                self.events.emit(event);
            }
            match cycle.phase() {
                Phase::Completed => break RunStatus::Completed,
                Phase::Failed { .. } => break RunStatus::Failed,
                _ => {}
            }
        };
        let progress = Progress {
            plan: cycle.plan().to_vec(),
            step_index: cycle.current_step_index(),
        };
        (self.finish(status), progress)
    }

    /// Suspend while paused. Wakes on any status change, re-checking at
    /// least every `pause_recheck`.
    async fn wait_while_paused(&self) {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status != RunStatus::Paused || self.should_stop() {
                return;
            }
            let _ = tokio::time::timeout(self.settings.pause_recheck, rx.changed()).await;
        }
    }

    /// Wait for the current loop to exit, aborting it after the drain timeout.
    async fn drain(&self) {
        let Some(task) = self.current_task() else {
            return;
        };
        if tokio::time::timeout(self.settings.drain_timeout, task.done.clone())
            .await
            .is_err()
        {
            warn!(
                run_id = %self.run_id,
                timeout_secs = self.settings.drain_timeout.as_secs(),
                "loop did not exit in time, aborting"
            );
            task.abort.abort();
            task.done.clone().await;
            self.report_complete(self.status());
        }
        task.lease.release().await;
        debug!(run_id = %self.run_id, "previous loop drained");
    }

    fn reset(&self, new_goal: Option<String>) {
        if let Some(goal) = new_goal {
            *self.goal.lock() = goal;
        }
        self.history.lock().clear();
        self.events.clear_backlog();
        self.should_stop.store(false, Ordering::SeqCst);
        self.reported.store(false, Ordering::SeqCst);
        *self.finished_at.lock() = None;
        self.status.send_replace(RunStatus::Initialized);
    }

    /// Emit the final `complete` event, at most once per attempt.
    fn report_complete(&self, status: RunStatus) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.finished_at.lock() = Some(Utc::now());
        self.events.emit(RunEvent::complete(status));
    }

    fn archive(&self, status: RunStatus, progress: &Progress, started_at: DateTime<Utc>) {
        let Some(dir) = &self.settings.archive_dir else {
            return;
        };
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            app: self.app.clone(),
            goal: self.goal(),
            status,
            plan: progress.plan.clone(),
            current_step_index: progress.step_index,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(err) = archive_run(dir, &summary, &self.history()) {
            warn!(error = %format!("{err:#}"), "failed to archive run");
        }
    }
}

#[async_trait]
impl RunControl for RunController {
    fn status(&self) -> RunStatus {
        RunController::status(self)
    }

    fn stop(&self) {
        RunController::stop(self);
    }

    fn pause(&self) -> bool {
        RunController::pause(self)
    }

    fn resume(&self) -> bool {
        RunController::resume(self)
    }

    async fn restart(&self, new_goal: Option<String>) -> bool {
        RunController::restart(self, new_goal).await
    }

    fn reply(&self, message: String) {
        self.events.emit(RunEvent::chat(message));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
