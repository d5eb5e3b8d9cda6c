//! Step-cycle phases and the pure transition rules between them.

use crate::core::decision::{ActionDecision, ActionKind};

/// Where a step cycle currently is.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Planning,
    Navigating,
    /// Holds the decision recorded while navigating, consumed once.
    Executing(ActionDecision),
    Completed,
    Failed {
        reason: String,
    },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Navigating => "navigating",
            Phase::Executing(_) => "executing",
            Phase::Completed => "completed",
            Phase::Failed { .. } => "failed",
        }
    }
}

/// Next phase for a decision returned while navigating.
pub fn route_decision(decision: ActionDecision) -> Phase {
    match decision.kind {
        ActionKind::Complete => Phase::Completed,
        kind if kind.is_executable() => Phase::Executing(decision),
        _ => Phase::Failed {
            reason: if decision.reason.trim().is_empty() {
                "Oracle could not decide on an action".to_string()
            } else {
                format!("Oracle could not decide on an action: {}", decision.reason)
            },
        },
    }
}

/// Result of counting one failed action against the per-step budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry { attempt: u32 },
    Exhausted { attempts: u32 },
}

/// Increment `retry_count` and decide whether the step may be retried.
pub fn register_failure(retry_count: &mut u32, max_retries: u32) -> RetryVerdict {
    *retry_count += 1;
    if *retry_count >= max_retries {
        RetryVerdict::Exhausted {
            attempts: *retry_count,
        }
    } else {
        RetryVerdict::Retry {
            attempt: *retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_decisions_by_kind() {
        let complete = route_decision(ActionDecision::new(ActionKind::Complete, ""));
        assert_eq!(complete, Phase::Completed);

        for kind in [
            ActionKind::Tap,
            ActionKind::Type,
            ActionKind::Swipe,
            ActionKind::Click,
            ActionKind::Wait,
            ActionKind::Done,
        ] {
            let phase = route_decision(ActionDecision::new(kind, ""));
            assert!(matches!(phase, Phase::Executing(d) if d.kind == kind));
        }
    }

    #[test]
    fn fail_decision_carries_reason() {
        let phase = route_decision(ActionDecision::new(ActionKind::Fail, "screen is blank"));
        let Phase::Failed { reason } = &phase else {
            panic!("expected failure, got {phase:?}");
        };
        assert!(reason.contains("screen is blank"));
    }

    /// The budget allows `max - 1` retries and forces failure at `max`.
    #[test]
    fn retry_budget_exhausts_at_max() {
        let mut count = 0;
        assert_eq!(
            register_failure(&mut count, 3),
            RetryVerdict::Retry { attempt: 1 }
        );
        assert_eq!(
            register_failure(&mut count, 3),
            RetryVerdict::Retry { attempt: 2 }
        );
        assert_eq!(
            register_failure(&mut count, 3),
            RetryVerdict::Exhausted { attempts: 3 }
        );
        assert_eq!(count, 3);
    }
}
