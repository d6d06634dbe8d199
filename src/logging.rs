//! Process-wide log setup for the HTTP service.
//!
//! Output goes to stdout and, when the data directory is writable, to a file
//! rolled over each day. Every call site writes through the `backend_*`
//! helpers under the `backend` target, so one filter directive covers
//! request handlers, database calls and vendor clients alike.

use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};


static INIT_LOGGING: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn resolve_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("voiceviz")
        .join("logs")
}

fn build_file_appender() -> Option<(RollingFileAppender, PathBuf)> {
    let log_dir = resolve_log_dir();
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "[backend][WARN] Failed to create log directory {}: {}",
            log_dir.display(),
            err
        );
        return None;
    }

    Some((RollingFileAppender::new(Rotation::DAILY, &log_dir, "backend.log"), log_dir))
}

pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let (file_layer, log_dir) = if let Some((appender, dir)) = build_file_appender() {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(non_blocking);
            LOG_GUARD.set(guard).ok();
            (Some(layer), Some(dir))
        } else {
            (None, None)
        };

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| {
                EnvFilter::try_new(
                    std::env::var("VOICEVIZ_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
                )
            })
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .with_timer(UtcTime::rfc_3339());

        let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);
        let installed = if let Some(file_layer) = file_layer {
            registry.with(file_layer).try_init()
        } else {
            registry.try_init()
        };
        if installed.is_err() {
            // A subscriber was already set by the embedding process (tests, mostly).
            return;
        }

        match log_dir {
            Some(dir) => backend_info(format!(
                "Structured logging initialized. Backend logs will be rotated daily under {}",
                dir.display()
            )),
            None => backend_warn("Structured logging initialized without file sink (using stdout only)"),
        }
    });
}

pub fn backend_info(message: impl AsRef<str>) {
    info!(target: "backend", "{}", message.as_ref());
}

pub fn backend_warn(message: impl AsRef<str>) {
    warn!(target: "backend", "{}", message.as_ref());
}

pub fn backend_error(message: impl AsRef<str>) {
    error!(target: "backend", "{}", message.as_ref());
}

/// Cut `text` to at most `max` characters, on a char boundary.
pub fn truncate_for_log(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
