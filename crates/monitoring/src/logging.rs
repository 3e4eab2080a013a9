//! Logging configuration and initialization for gateway services.
//!
//! Console logging by default; set `LOG_DIR` to add a daily-rotating file
//! layer. The filter comes from `RUST_LOG`/`LOG_LEVEL` with an info default.

use std::env;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialize global logging. Returns the file-writer guard which must be
/// kept alive for the life of the process when file logging is enabled.
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    let filter = env_filter();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter);

    match env::var("LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let prefix = env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| "gateway".to_string());
            let appender = rolling::daily(&dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(env_filter());

            tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
            Ok(Some(guard))
        }
        _ => {
            tracing_subscriber::registry()
                .with(console_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
            Ok(None)
        }
    }
}

fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    EnvFilter::new(level)
}
