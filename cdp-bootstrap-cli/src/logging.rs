use std::env;
use std::path::PathBuf;

use tracing::{warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_DIR_ENV: &str = "CDP_BOOTSTRAP_LOG_DIR";

fn level_from_env() -> Level {
    env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO)
}

pub fn log_dir() -> PathBuf {
    if let Ok(custom_dir) = env::var(LOG_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cdp-bootstrap")
            .join("logs")
    }
}

/// Stderr plus a daily rolling file. Keep the guard alive for the whole run.
pub fn init_logging(verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { Level::DEBUG } else { level_from_env() };
    let log_dir = log_dir();

    let file_layer = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "cdp-bootstrap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
                guard,
            ))
        }
        Err(_) => None,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    match file_layer {
        Some((layer, guard)) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            warn!(dir = %log_dir.display(), "Failed to create log directory, logging to stderr only");
            None
        }
    }
}
