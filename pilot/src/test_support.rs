//! Scripted collaborators for tests.
//!
//! [`ScriptedDriver`] and [`ScriptedOracle`] replay queued results and record
//! every call so tests can assert on what the orchestrator did.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::core::decision::{ActionDecision, ActionKind, Coordinates, Selector};
use crate::core::event::RunEvent;
use crate::core::history::HistoryEntry;
use crate::core::intent::ToolCall;
use crate::core::status::RunStatus;
use crate::error::{DriverError, OracleError};
use crate::io::driver::AutomationDriver;
use crate::io::oracle::{DecisionOracle, Verdict};

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    StartSession(String),
    Screenshot,
    UiTree,
    Click(Selector),
    TypeText(Option<Selector>, String),
    Tap(i32, i32),
    Swipe(Coordinates, Coordinates, Duration),
    ElementExists(Selector),
    Quit,
}

impl DriverCall {
    /// Physical actions, as opposed to session, capture and lookup calls.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            DriverCall::Click(_)
                | DriverCall::TypeText(..)
                | DriverCall::Tap(..)
                | DriverCall::Swipe(..)
        )
    }
}

/// Driver that records calls and replays queued action results.
///
/// Actions succeed unless a result was queued with
/// [`ScriptedDriver::with_action_results`].
pub struct ScriptedDriver {
    calls: Mutex<Vec<DriverCall>>,
    start_error: Option<String>,
    action_results: Mutex<VecDeque<Result<bool, String>>>,
    elements_exist: bool,
    panic_on_screenshot: bool,
    observation_delay: Duration,
    quits: AtomicUsize,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            start_error: None,
            action_results: Mutex::new(VecDeque::new()),
            elements_exist: true,
            panic_on_screenshot: false,
            observation_delay: Duration::ZERO,
            quits: AtomicUsize::new(0),
        }
    }

    pub fn failing_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    pub fn with_action_results<I>(self, results: I) -> Self
    where
        I: IntoIterator<Item = Result<bool, String>>,
    {
        self.action_results.lock().extend(results);
        self
    }

    pub fn with_missing_elements(mut self) -> Self {
        self.elements_exist = false;
        self
    }

    pub fn panicking_on_screenshot(mut self) -> Self {
        self.panic_on_screenshot = true;
        self
    }

    /// Sleep this long inside every screenshot call.
    pub fn with_observation_delay(mut self, delay: Duration) -> Self {
        self.observation_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn actions(&self) -> Vec<DriverCall> {
        self.calls().into_iter().filter(DriverCall::is_action).collect()
    }

    pub fn count(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    pub fn quit_count(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }

    fn next_action_result(&self) -> Result<bool, DriverError> {
        match self.action_results.lock().pop_front() {
            Some(Ok(ok)) => Ok(ok),
            Some(Err(message)) => Err(DriverError::Other(message)),
            None => Ok(true),
        }
    }
}

#[async_trait]
impl AutomationDriver for ScriptedDriver {
    async fn start_session(&self, app: &str) -> Result<(), DriverError> {
        self.record(DriverCall::StartSession(app.to_string()));
        match &self.start_error {
            Some(message) => Err(DriverError::Other(message.clone())),
            None => Ok(()),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.record(DriverCall::Screenshot);
        if self.panic_on_screenshot {
            panic!("scripted screenshot panic");
        }
        if !self.observation_delay.is_zero() {
            tokio::time::sleep(self.observation_delay).await;
        }
        Ok(b"\x89PNG scripted".to_vec())
    }

    async fn ui_tree(&self) -> Result<String, DriverError> {
        self.record(DriverCall::UiTree);
        Ok("<hierarchy/>".to_string())
    }

    async fn click(&self, selector: &Selector) -> Result<bool, DriverError> {
        self.record(DriverCall::Click(selector.clone()));
        if !self.elements_exist {
            return Ok(false);
        }
        self.next_action_result()
    }

    async fn type_text(
        &self,
        target: Option<&Selector>,
        text: &str,
    ) -> Result<bool, DriverError> {
        self.record(DriverCall::TypeText(target.cloned(), text.to_string()));
        self.next_action_result()
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.record(DriverCall::Tap(x, y));
        self.next_action_result().map(|_| ())
    }

    async fn swipe(
        &self,
        from: Coordinates,
        to: Coordinates,
        duration: Duration,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::Swipe(from, to, duration));
        self.next_action_result().map(|_| ())
    }

    async fn element_exists(&self, selector: &Selector) -> Result<bool, DriverError> {
        self.record(DriverCall::ElementExists(selector.clone()));
        Ok(self.elements_exist)
    }

    async fn quit(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Quit);
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Oracle that replays queued plans, decisions, verdicts and intents.
///
/// When the decision queue runs dry it keeps returning the fallback decision
/// (a short `wait` unless replaced), so a run stays alive until stopped.
pub struct ScriptedOracle {
    plans: Mutex<VecDeque<Result<Vec<String>, String>>>,
    default_plan: Vec<String>,
    decisions: Mutex<VecDeque<Result<ActionDecision, String>>>,
    fallback_decision: ActionDecision,
    verdicts: Mutex<VecDeque<Result<Verdict, String>>>,
    intents: Mutex<VecDeque<Result<ToolCall, String>>>,
    analyzed_history_lens: Mutex<Vec<usize>>,
    plan_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    classify_calls: AtomicUsize,
    fail_plan_forever: AtomicBool,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            plans: Mutex::new(VecDeque::new()),
            default_plan: vec!["Open the app".to_string()],
            decisions: Mutex::new(VecDeque::new()),
            fallback_decision: ActionDecision::new(ActionKind::Wait, "scripted idle")
                .with_param("duration", 0.05),
            verdicts: Mutex::new(VecDeque::new()),
            intents: Mutex::new(VecDeque::new()),
            analyzed_history_lens: Mutex::new(Vec::new()),
            plan_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
            fail_plan_forever: AtomicBool::new(false),
        }
    }

    /// Plan returned on every call once queued plans are used up.
    pub fn with_plan(mut self, steps: &[&str]) -> Self {
        self.default_plan = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_plan(self, message: &str) -> Self {
        self.plans.lock().push_back(Err(message.to_string()));
        self
    }

    pub fn always_failing_plan(self) -> Self {
        self.fail_plan_forever.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_decisions<I>(self, decisions: I) -> Self
    where
        I: IntoIterator<Item = ActionDecision>,
    {
        self.decisions.lock().extend(decisions.into_iter().map(Ok));
        self
    }

    pub fn with_analysis_error(self, message: &str) -> Self {
        self.decisions.lock().push_back(Err(message.to_string()));
        self
    }

    pub fn with_fallback_decision(mut self, decision: ActionDecision) -> Self {
        self.fallback_decision = decision;
        self
    }

    pub fn with_verdicts<I>(self, verdicts: I) -> Self
    where
        I: IntoIterator<Item = Result<Verdict, String>>,
    {
        self.verdicts.lock().extend(verdicts);
        self
    }

    pub fn with_intents<I>(self, intents: I) -> Self
    where
        I: IntoIterator<Item = Result<ToolCall, String>>,
    {
        self.intents.lock().extend(intents);
        self
    }

    /// Queue an intent while a run is already in flight.
    pub fn push_intent(&self, intent: ToolCall) {
        self.intents.lock().push_back(Ok(intent));
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyzed_history_lens.lock().len()
    }

    /// History length seen by each `analyze` call, in order.
    pub fn analyzed_history_lens(&self) -> Vec<usize> {
        self.analyzed_history_lens.lock().clone()
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn plan(&self, _goal: &str) -> Result<Vec<String>, OracleError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_plan_forever.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("scripted planner offline".into()));
        }
        match self.plans.lock().pop_front() {
            Some(Ok(plan)) => Ok(plan),
            Some(Err(message)) => Err(OracleError::Unavailable(message)),
            None => Ok(self.default_plan.clone()),
        }
    }

    async fn analyze(
        &self,
        _screenshot: &[u8],
        _ui_tree: &str,
        _step: &str,
        history: &[HistoryEntry],
    ) -> Result<ActionDecision, OracleError> {
        self.analyzed_history_lens.lock().push(history.len());
        match self.decisions.lock().pop_front() {
            Some(Ok(decision)) => Ok(decision),
            Some(Err(message)) => Err(OracleError::Malformed(message)),
            None => Ok(self.fallback_decision.clone()),
        }
    }

    async fn verify(&self, _screenshot: &[u8], _step: &str) -> Result<Verdict, OracleError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        match self.verdicts.lock().pop_front() {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(message)) => Err(OracleError::Malformed(message)),
            None => Ok(Verdict {
                completed: false,
                reason: "scripted".into(),
            }),
        }
    }

    async fn classify_intent(
        &self,
        _message: &str,
        _history: &[HistoryEntry],
        _status: RunStatus,
    ) -> Result<ToolCall, OracleError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        match self.intents.lock().pop_front() {
            Some(Ok(call)) => Ok(call),
            Some(Err(message)) => Err(OracleError::Unavailable(message)),
            None => Err(OracleError::Empty),
        }
    }
}

/// A tap at fixed coordinates.
pub fn tap_at(x: i32, y: i32) -> ActionDecision {
    ActionDecision::new(ActionKind::Tap, "scripted tap").with_coordinates(x, y)
}

pub fn type_text(text: &str) -> ActionDecision {
    ActionDecision::new(ActionKind::Type, "scripted type").with_text(text)
}

pub fn decision(kind: ActionKind) -> ActionDecision {
    ActionDecision::new(kind, format!("scripted {kind}"))
}

/// Drain every event currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Event kinds in order, for compact assertions.
pub fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::kind).collect()
}

/// Shared handles to the scripted collaborators of one test.
pub struct Fixture {
    pub driver: Arc<ScriptedDriver>,
    pub oracle: Arc<ScriptedOracle>,
}

impl Fixture {
    pub fn new(driver: ScriptedDriver, oracle: ScriptedOracle) -> Self {
        Self {
            driver: Arc::new(driver),
            oracle: Arc::new(oracle),
        }
    }
}
