//! A single process-wide subscriber combining a console layer and a
//! daily-rotating file layer, so every component
//! (listener, session handlers, pool, workers) logs through one sink
//! without any component touching a file handle directly.
//!
//! Console output uses `tracing_subscriber::fmt()` (env filter, no target,
//! thread ids, ANSI gated on `atty`); a second `tracing_appender::rolling::
//! daily` layer mirrors it to a rotating file. The single non-blocking
//! writer thread `tracing-appender` spins up is the one background flush
//! point every producer funnels through, without hand-rolled channel
//! plumbing.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global subscriber. The returned [`WorkerGuard`] must be
/// held for the lifetime of the process — dropping it flushes and stops
/// the background file-writer thread, so `main` keeps it bound until exit.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    std::fs::create_dir_all(&config.log_path)?;
    let file_appender = tracing_appender::rolling::daily(&config.log_path, "whisper-streaming-server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr));

    let file_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Retention window for rotated log files: rotated daily, 30-day
/// retention. `tracing-appender` rotates but never prunes, so the prune
/// step is a plain directory sweep run once at startup.
const LOG_RETENTION_DAYS: u64 = 30;

/// Deletes files under `log_path` whose modified time is older than
/// [`LOG_RETENTION_DAYS`]. Best-effort: a file that can't be stat'd or
/// removed is skipped and logged, not fatal to startup.
pub async fn prune_old_logs(log_path: &str) {
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(LOG_RETENTION_DAYS * 86_400));
    let Some(cutoff) = cutoff else { return };

    let mut entries = match tokio::fs::read_dir(log_path).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %log_path, error = %e, "could not scan log directory for retention pruning");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if modified < cutoff {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to prune expired log file");
            } else {
                tracing::debug!(path = %path.display(), "pruned expired log file");
            }
        }
    }
}
