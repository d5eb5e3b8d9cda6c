//! Shared application state for the server.

use std::sync::Arc;

use pilot::controller::RunSettings;
use pilot::io::config::RunnerConfig;
use pilot::io::driver::AutomationDriver;
use pilot::io::gemini::GeminiOracle;
use pilot::io::webdriver::WebDriverDriver;
use pilot::registry::{DriverFactory, RunRegistry};

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RunRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<RunRegistry>) -> Self {
        Self { registry }
    }

    /// Wire the WebDriver and Gemini adapters from config.
    pub fn from_config(cfg: &RunnerConfig) -> anyhow::Result<Self> {
        let driver_cfg = cfg.driver.clone();
        let drivers: DriverFactory = Arc::new(move || {
            let driver = WebDriverDriver::new(driver_cfg.clone())?;
            Ok(Arc::new(driver) as Arc<dyn AutomationDriver>)
        });
        let oracle = GeminiOracle::from_env(cfg.oracle.clone())?;
        let registry = RunRegistry::new(drivers, Arc::new(oracle), RunSettings::from(cfg));
        Ok(Self::new(Arc::new(registry)))
    }
}
