//! Logging setup: human-readable stderr plus a daily-rotated file under
//! `<storage root>/logs/`.
//!
//! Level comes from `RUST_LOG` (default `info`). `VERIMEZK_DEBUG_LOG=1`
//! forces `debug`, which includes per-poll status lines.

use pairing_core::StorageConfig;
use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "VERIMEZK_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "verimezk-pair.log";

/// Installs the global subscriber. Keep the guard alive until exit or
/// buffered file output is lost.
pub fn init(storage: &StorageConfig) -> Option<WorkerGuard> {
    let filter = if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let logs_dir = storage.logs_dir();
    let (file_layer, guard) = match fs_err::create_dir_all(&logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        // Logging to stderr alone is fine when the root is read-only.
        Err(_) => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}
