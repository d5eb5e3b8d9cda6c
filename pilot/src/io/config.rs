//! Pilot configuration stored as TOML (default `pilot.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Conventional config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pilot.toml";

/// Whether navigation asks the oracle to verify a step before analyzing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPolicy {
    /// Go straight to analysis on every observation.
    #[default]
    Skip,
    /// Verify first; a `completed` verdict advances the step without acting.
    BeforeAnalyze,
}

/// Pilot configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values documented on [`RunnerConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum retained history entries per run.
    pub history_limit: usize,

    /// Consecutive failed actions allowed on one step before the run fails.
    pub max_retries: u32,

    /// Global ceiling on observation cycles per run (0 disables it).
    pub max_steps: u32,

    /// History entries handed to the oracle when analyzing a screen.
    pub analysis_history: usize,

    /// History entries handed to the oracle when classifying a user message.
    pub intent_history: usize,

    /// `wait` duration when the decision does not carry one.
    pub default_wait_secs: u64,

    /// Swipe duration when the decision does not carry one.
    pub swipe_duration_ms: u64,

    /// Upper bound between re-checks while a run is paused.
    pub pause_recheck_ms: u64,

    /// How long a restart waits for the previous loop to exit.
    pub drain_timeout_secs: u64,

    /// Per-run event channel capacity.
    pub event_buffer: usize,

    pub verify: VerifyPolicy,

    /// When set, finished runs are archived under this directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,

    pub driver: DriverConfig,

    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Base URL of the Appium / WebDriver server.
    pub server_url: String,
    pub platform_name: String,
    pub automation_name: String,
    /// How long element lookups keep polling.
    pub element_timeout_secs: u64,
    /// How long the server waits for the app's first activity.
    pub app_wait_duration_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:4723".to_string(),
            platform_name: "Android".to_string(),
            automation_name: "UiAutomator2".to_string(),
            element_timeout_secs: 10,
            app_wait_duration_ms: 30_000,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of the Gemini API.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key. The key itself is never stored.
    pub api_key_env: String,
    /// UI tree characters sent with each analysis request.
    pub ui_tree_char_limit: usize,
    pub request_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            ui_tree_char_limit: 8_000,
            request_timeout_secs: 120,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            max_retries: 3,
            max_steps: 30,
            analysis_history: 10,
            intent_history: 5,
            default_wait_secs: 2,
            swipe_duration_ms: 500,
            pause_recheck_ms: 500,
            drain_timeout_secs: 10,
            event_buffer: 256,
            verify: VerifyPolicy::Skip,
            archive_dir: None,
            driver: DriverConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.pause_recheck_ms == 0 {
            return Err(anyhow!("pause_recheck_ms must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be > 0"));
        }
        if self.driver.server_url.trim().is_empty() {
            return Err(anyhow!("driver.server_url must be non-empty"));
        }
        if self.driver.request_timeout_secs == 0 {
            return Err(anyhow!("driver.request_timeout_secs must be > 0"));
        }
        if self.oracle.model.trim().is_empty() {
            return Err(anyhow!("oracle.model must be non-empty"));
        }
        if self.oracle.api_key_env.trim().is_empty() {
            return Err(anyhow!("oracle.api_key_env must be non-empty"));
        }
        if self.oracle.request_timeout_secs == 0 {
            return Err(anyhow!("oracle.request_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    ///
    /// `PILOT_APPIUM_URL` (or the older `APPIUM_SERVER_URL`) replaces the
    /// driver URL and `PILOT_ORACLE_MODEL` replaces the model.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = non_empty("PILOT_APPIUM_URL").or_else(|| non_empty("APPIUM_SERVER_URL"))
        {
            self.driver.server_url = url;
        }
        if let Some(model) = non_empty("PILOT_ORACLE_MODEL") {
            self.oracle.model = model;
        }
    }

    pub fn default_wait(&self) -> Duration {
        Duration::from_secs(self.default_wait_secs)
    }

    pub fn swipe_duration(&self) -> Duration {
        Duration::from_millis(self.swipe_duration_ms)
    }

    pub fn pause_recheck(&self) -> Duration {
        Duration::from_millis(self.pause_recheck_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Load config from a TOML file and apply environment overrides.
///
/// If the file is missing, starts from `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let mut cfg = read_config_file(path)?;
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg.validate()?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        return Ok(RunnerConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
