//! HTTP front end for running and steering test runs.
//!
//! Clients start a run with `POST /api/test`, follow it over SSE at
//! `/api/test/{run_id}/events` and steer it with free-text messages.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use pilot::io::config::{DEFAULT_CONFIG_FILE, load_config};
use tracing::info;

use crate::state::AppState;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "pilot-server")]
#[command(about = "HTTP and SSE server for autonomous app test runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Runner config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pilot::logging::init_with("warn,pilot=info,pilot_server=info");

    let args = Args::parse();
    let cfg = load_config(&args.config)?;
    info!(
        config = %args.config.display(),
        driver = %cfg.driver.server_url,
        model = %cfg.oracle.model,
        "starting pilot-server"
    );

    let state = AppState::from_config(&cfg)?;
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(REAP_INTERVAL);
        loop {
            sweep.tick().await;
            let reaped = registry.reap_finished();
            if reaped > 0 {
                info!(reaped, "reaped finished runs");
            }
        }
    });
    let app = routes::app(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
