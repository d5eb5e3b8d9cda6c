//! Stable exit codes for `pilot run`.

use crate::core::status::RunStatus;

/// The run completed every plan step.
pub const OK: i32 = 0;
/// Invalid config or arguments, or any other error outside a run.
pub const INVALID: i32 = 1;
/// The run failed (setup, planning, navigation or retries exhausted).
pub const FAILED: i32 = 2;
/// The run was stopped by the user.
pub const STOPPED: i32 = 3;
/// The run hit its step ceiling.
pub const TIMEOUT: i32 = 4;

/// Exit code for a run that ended in `status`.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => OK,
        RunStatus::Stopped => STOPPED,
        RunStatus::Timeout => TIMEOUT,
        _ => FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_map_to_distinct_codes() {
        assert_eq!(for_status(RunStatus::Completed), OK);
        assert_eq!(for_status(RunStatus::Failed), FAILED);
        assert_eq!(for_status(RunStatus::Stopped), STOPPED);
        assert_eq!(for_status(RunStatus::Timeout), TIMEOUT);
        // A run that never reached a terminal state is reported as failed.
        assert_eq!(for_status(RunStatus::Running), FAILED);
    }
}
