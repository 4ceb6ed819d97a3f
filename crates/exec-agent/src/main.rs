mod cli;
mod config;
mod dispatch;
mod logging;
mod reaper;
mod supervise;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let _audit_guard = logging::setup(&args.audit_dir, args.log_to_stderr)?;

    let config = Arc::new(config::Config::load_or_default(&args.config)?);
    reaper::install();

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    tracing::info!(
        listen_addr = %args.listen_addr,
        log_dir = %config.log_dir.display(),
        "execution agent listening"
    );

    tokio::spawn(dispatch::serve(listener, Arc::clone(&config)));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
