//! Command-line front end for a single test run.
//!
//! `pilot run` drives one app against one goal, prints the run's events and
//! reads free-text commands ("pause", "change the goal to ...") from stdin.
//! Ctrl-C stops the run. The exit code reflects the final status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pilot::controller::{RunController, RunRequest, RunSettings};
use pilot::core::event::RunEvent;
use pilot::exit_codes;
use pilot::io::config::{DEFAULT_CONFIG_FILE, RunnerConfig, load_config, write_config};
use pilot::io::gemini::GeminiOracle;
use pilot::io::webdriver::WebDriverDriver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

const PRINTER_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "pilot",
    version,
    about = "Autonomous mobile app test agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent against an app until the goal is reached or the run ends.
    Run {
        /// Application artifact handed to the automation server (e.g. an APK path).
        #[arg(long)]
        app: String,
        /// Natural-language test goal.
        #[arg(long)]
        goal: String,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Print events as JSON lines instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Write a default config file.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    pilot::logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            app,
            goal,
            config,
            json,
        } => cmd_run(app, goal, &config, json).await,
        Command::InitConfig { path, force } => {
            cmd_init_config(&path, force)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RunnerConfig::default())?;
    println!("{}", path.display());
    Ok(())
}

async fn cmd_run(app: String, goal: String, config: &Path, json: bool) -> Result<i32> {
    if goal.trim().is_empty() {
        bail!("--goal must be non-empty");
    }
    let cfg = load_config(config)?;
    let driver = WebDriverDriver::new(cfg.driver.clone()).context("build driver client")?;
    let oracle = GeminiOracle::from_env(cfg.oracle.clone()).context("build oracle client")?;
    let run = RunController::new(
        RunRequest { app, goal },
        Arc::new(driver),
        Arc::new(oracle),
        RunSettings::from(&cfg),
    );
    info!(run_id = %run.run_id(), "run created");

    let printer = tokio::spawn(print_events(run.subscribe(), json));
    let commands = tokio::spawn(read_commands(run.clone()));
    let interrupt = tokio::spawn({
        let run = run.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(run_id = %run.run_id(), "interrupted");
                run.stop();
            }
        }
    });

    run.launch();
    let status = run.wait().await;

    commands.abort();
    interrupt.abort();
    drop(run);
    // The printer ends once the controller and its emitter are gone.
    if tokio::time::timeout(PRINTER_GRACE, printer).await.is_err() {
        warn!("event printer did not finish");
    }
    Ok(exit_codes::for_status(status))
}

/// Forward each non-empty stdin line to the run as a user message.
async fn read_commands(run: Arc<RunController>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        run.handle_message(message).await;
    }
}

async fn print_events(mut rx: broadcast::Receiver<RunEvent>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let line = if json {
                    serde_json::to_string(&event).ok()
                } else {
                    render(&event)
                };
                if let Some(line) = line {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// One human-readable line per event. Screenshots are not printed.
fn render(event: &RunEvent) -> Option<String> {
    let line = match event {
        RunEvent::Status { message } => format!("[status] {message}"),
        RunEvent::Error { message } => format!("[error] {message}"),
        RunEvent::Warning { message } => format!("[warning] {message}"),
        RunEvent::Plan { tasks, message } => {
            let steps: Vec<String> = tasks
                .iter()
                .enumerate()
                .map(|(i, task)| format!("  {}. {task}", i + 1))
                .collect();
            format!("[plan] {message}\n{}", steps.join("\n"))
        }
        RunEvent::Screenshot { .. } => return None,
        RunEvent::ActionPlan { action, reason, .. } => format!("[action] {action}: {reason}"),
        RunEvent::TaskComplete { message } | RunEvent::ActionExecuted { message } => {
            format!("  {message}")
        }
        RunEvent::ChatResponse { message, sender } => format!("[{sender}] {message}"),
        RunEvent::Complete { status, message } => format!("[complete] {status}: {message}"),
    };
    Some(line)
}
