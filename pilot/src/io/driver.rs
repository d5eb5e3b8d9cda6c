//! Automation driver capability contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::decision::{Coordinates, Selector};
use crate::error::DriverError;

/// Device session control and physical UI actions.
///
/// Implementations do not retry internally; retry policy belongs to the
/// step cycle. Every method is a suspension point and may take seconds.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Open a session for the given application artifact.
    async fn start_session(&self, app: &str) -> Result<(), DriverError>;

    /// Capture the screen as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Capture the UI hierarchy as a serialized tree (XML for Appium).
    async fn ui_tree(&self) -> Result<String, DriverError>;

    /// Click the element matched by `selector`. `Ok(false)` when it could not be clicked.
    async fn click(&self, selector: &Selector) -> Result<bool, DriverError>;

    /// Type into the element matched by `target`, or the focused element when `None`.
    async fn type_text(&self, target: Option<&Selector>, text: &str)
    -> Result<bool, DriverError>;

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    async fn swipe(
        &self,
        from: Coordinates,
        to: Coordinates,
        duration: Duration,
    ) -> Result<(), DriverError>;

    async fn element_exists(&self, selector: &Selector) -> Result<bool, DriverError>;

    /// Close the session. A no-op when none is open.
    async fn quit(&self) -> Result<(), DriverError>;
}
