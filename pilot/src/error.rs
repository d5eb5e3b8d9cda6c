//! Typed failures at the run orchestrator's boundaries.
//!
//! Collaborators report [`DriverError`] and [`OracleError`]. The orchestrator
//! folds them into [`RunError`], whose variants follow the run failure
//! taxonomy: setup, oracle, action, protocol and internal faults. None of
//! these escape a run; each becomes a status transition plus an `error` event.

use thiserror::Error;

/// Failure reported by an automation driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no active driver session")]
    NoSession,
    #[error("driver request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("driver returned {status}: {message}")]
    Protocol { status: u16, message: String },
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("could not decode driver response: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
}

/// Failure reported by a decision oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oracle returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed oracle reply: {0}")]
    Malformed(String),
    #[error("oracle returned an empty reply")]
    Empty,
}

/// Malformed input on the command channel. Reported to the user, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Why a run (or one of its phases) failed.
#[derive(Debug, Error)]
pub enum RunError {
    /// The driver session could not be opened.
    #[error("Setup failed: {0}")]
    Setup(#[source] DriverError),
    #[error("Planning failed: {0}")]
    Planning(#[source] OracleError),
    /// Observation or analysis of the current screen failed.
    #[error("Navigation failed: {0}")]
    Navigation(String),
    #[error("Action '{action}' failed after {attempts} attempts")]
    RetriesExhausted { action: String, attempts: u32 },
    #[error("Step limit of {0} observations reached")]
    StepLimit(u32),
    #[error("Invalid message: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DriverError> for RunError {
    fn from(err: DriverError) -> Self {
        RunError::Navigation(err.to_string())
    }
}

impl From<OracleError> for RunError {
    fn from(err: OracleError) -> Self {
        RunError::Navigation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_messages_are_user_facing() {
        let setup = RunError::Setup(DriverError::Other("device offline".into()));
        assert_eq!(setup.to_string(), "Setup failed: device offline");

        let retries = RunError::RetriesExhausted {
            action: "tap".into(),
            attempts: 3,
        };
        assert_eq!(retries.to_string(), "Action 'tap' failed after 3 attempts");

        let nav: RunError = OracleError::Empty.into();
        assert_eq!(
            nav.to_string(),
            "Navigation failed: oracle returned an empty reply"
        );
    }
}
