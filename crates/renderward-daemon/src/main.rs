//! renderward-daemon - long-running host for a sandboxed renderer
//!
//! Launches the renderer under the supervisor, serves clients on the
//! manager pipe and forwards their `render` requests to it.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::HostConfig;

#[derive(Parser)]
#[command(name = "renderward-daemon")]
#[command(version, about = "Host a supervised renderer for local clients")]
struct Args {
    /// JSON configuration file (defaults to RENDERWARD_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the manager pipe name
    #[arg(short, long)]
    pipe: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("renderward=info".parse()?))
        .init();

    let args = Args::parse();
    tracing::info!("renderward-daemon starting");

    let mut config = HostConfig::load(args.config.as_deref())?;
    if let Some(pipe) = args.pipe {
        config.manager.pipe_name = pipe;
    }
    tracing::info!(
        pipe = %config.manager.pipe_name,
        mode = ?config.bridge.mode,
        renderer = %config.renderer.executable.display(),
        "configuration loaded"
    );

    server::run(config).await
}
