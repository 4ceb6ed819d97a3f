use std::path::Path;

use anyhow::Context;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Daemon-level observability: a daily-rolled JSON audit file, plus a
/// compact stderr layer when the operator asks for one. Returns the
/// guard that keeps the non-blocking audit writer flushing.
pub(crate) fn setup(
    audit_dir: &Path,
    log_to_stderr: bool,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(audit_dir)
        .with_context(|| format!("creating audit directory {}", audit_dir.display()))?;
    let (audit_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(audit_dir, "agent.log"));

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let audit_layer = fmt::layer()
        .json()
        .with_target(false)
        .with_writer(audit_writer);
    let stderr_layer = log_to_stderr.then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(audit_layer)
        .with(stderr_layer)
        .init();

    Ok(guard)
}
