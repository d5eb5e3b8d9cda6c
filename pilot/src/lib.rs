//! Autonomous mobile-app test agent.
//!
//! A run takes an app artifact and a natural-language goal, asks a decision
//! oracle for a step plan, then repeatedly observes the screen, decides on
//! one action and executes it through an automation driver until the plan is
//! complete, the run fails, or the user stops it. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure data and transition rules (history, decisions,
//!   phases, statuses, events, intents). No I/O.
//! - **[`io`]**: Collaborators with side effects (automation driver, oracle,
//!   config, archive) behind the [`io::driver::AutomationDriver`] and
//!   [`io::oracle::DecisionOracle`] traits.
//!
//! Orchestration modules ([`executor`], [`cycle`], [`controller`],
//! [`router`], [`registry`]) combine the two into a controllable run.

pub mod controller;
pub mod core;
pub mod cycle;
pub mod error;
pub mod events;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
pub mod router;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
