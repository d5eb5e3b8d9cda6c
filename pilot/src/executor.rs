//! Translate an [`ActionDecision`] into a driver call.
//!
//! The executor never fails outward: driver errors and missing arguments are
//! reported as an [`ExecutionResult`] with `ok == false`. Each dispatched kind
//! calls one driver method. The only exception is a `tap`/`click` whose
//! selector cannot be clicked, which falls back to a tap at its coordinates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::decision::{ActionDecision, ActionKind, Coordinates};
use crate::io::driver::AutomationDriver;

/// Outcome of executing one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub ok: bool,
    pub detail: String,
}

impl ExecutionResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Defaults applied when a decision leaves a duration out.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorDefaults {
    pub wait: Duration,
    pub swipe: Duration,
}

impl Default for ExecutorDefaults {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(2),
            swipe: Duration::from_millis(500),
        }
    }
}

pub struct ActionExecutor {
    driver: Arc<dyn AutomationDriver>,
    defaults: ExecutorDefaults,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn AutomationDriver>, defaults: ExecutorDefaults) -> Self {
        Self { driver, defaults }
    }

    #[instrument(skip_all, fields(action = %decision.kind))]
    pub async fn execute(&self, decision: &ActionDecision) -> ExecutionResult {
        let result = match decision.kind {
            ActionKind::Tap | ActionKind::Click => self.press(decision).await,
            ActionKind::Type => self.type_text(decision).await,
            ActionKind::Swipe => self.swipe(decision).await,
            ActionKind::Wait => self.wait(decision).await,
            ActionKind::Done | ActionKind::Complete => {
                ExecutionResult::success(format!("{} marker", decision.kind))
            }
            ActionKind::Fail => ExecutionResult::failure("oracle could not decide"),
        };
        if result.ok {
            debug!(detail = %result.detail, "action succeeded");
        } else {
            warn!(detail = %result.detail, "action failed");
        }
        result
    }

    /// Element-based press, falling back to the literal point.
    async fn press(&self, decision: &ActionDecision) -> ExecutionResult {
        let point = decision.target_point();
        if let Some(selector) = decision.target_selector() {
            let miss = match self.driver.click(selector).await {
                Ok(true) => {
                    return ExecutionResult::success(format!(
                        "clicked {:?} '{}'",
                        selector.strategy, selector.value
                    ));
                }
                Ok(false) => format!("element '{}' could not be clicked", selector.value),
                Err(err) => format!("click on '{}' failed: {err}", selector.value),
            };
            if point.is_none() {
                return ExecutionResult::failure(format!("{miss} and no coordinates supplied"));
            }
            debug!(detail = %miss, "falling back to coordinates");
        }
        match point {
            Some(Coordinates { x, y }) => match self.driver.tap(x, y).await {
                Ok(()) => ExecutionResult::success(format!("tapped ({x}, {y})")),
                Err(err) => ExecutionResult::failure(format!("tap failed: {err}")),
            },
            None => ExecutionResult::failure("no selector or coordinates supplied"),
        }
    }

    async fn type_text(&self, decision: &ActionDecision) -> ExecutionResult {
        let Some(text) = decision.typed_text() else {
            return ExecutionResult::failure("no text supplied");
        };
        let target = decision.target_selector();
        match self.driver.type_text(target, text).await {
            Ok(true) => ExecutionResult::success(match target {
                Some(selector) => format!("typed into '{}'", selector.value),
                None => "typed into focused element".to_string(),
            }),
            Ok(false) => ExecutionResult::failure("text could not be entered"),
            Err(err) => ExecutionResult::failure(format!("type failed: {err}")),
        }
    }

    async fn swipe(&self, decision: &ActionDecision) -> ExecutionResult {
        let coords = (
            decision.param_i32("start_x"),
            decision.param_i32("start_y"),
            decision.param_i32("end_x"),
            decision.param_i32("end_y"),
        );
        let (Some(x1), Some(y1), Some(x2), Some(y2)) = coords else {
            return ExecutionResult::failure("swipe needs start_x, start_y, end_x and end_y");
        };
        let duration = decision
            .param_f64("duration_ms")
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
            .unwrap_or(self.defaults.swipe);
        match self
            .driver
            .swipe(Coordinates::new(x1, y1), Coordinates::new(x2, y2), duration)
            .await
        {
            Ok(()) => ExecutionResult::success(format!("swiped ({x1}, {y1}) -> ({x2}, {y2})")),
            Err(err) => ExecutionResult::failure(format!("swipe failed: {err}")),
        }
    }

    async fn wait(&self, decision: &ActionDecision) -> ExecutionResult {
        let duration = decision
            .param_f64("duration")
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(self.defaults.wait);
        tokio::time::sleep(duration).await;
        ExecutionResult::success(format!("waited {:.1}s", duration.as_secs_f64()))
    }
}
