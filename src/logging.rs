//! Structured logging with rotation and run correlation.
//!
//! Console output plus a daily-rotated file behind a non-blocking writer.
//! LOG_FORMAT=json switches both sinks to flattened JSON lines. Every run
//! carries a UUID so restarts can be correlated across log files.
//!
//! Environment: LOG_FORMAT, LOG_DIR (default ./logs), RUN_ID, RUST_LOG.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const LOG_FILE_PREFIX: &str = "mispricing_bot.log";
const DEFAULT_FILTER: &str = "info,cross_market_arbitrage=info,hyper=warn,reqwest=warn";

/// Current run id: RUN_ID env var when parseable, otherwise fresh.
pub fn run_id() -> Uuid {
    std::env::var("RUN_ID")
        .ok()
        .and_then(|s| Uuid::parse_str(&s).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize logging. The returned guard must live for the program
/// lifetime so the non-blocking writer flushes on exit.
pub fn init_logging() -> WorkerGuard {
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory {log_dir}: {e}");
    }
    let (file_writer, guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX),
    );

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(io::stdout)
                    .with_ansi(false)
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_filter(env_filter()),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_filter(env_filter()),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(io::stdout)
                    .with_target(false)
                    .with_ansi(true)
                    .compact()
                    .with_filter(env_filter()),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .compact()
                    .with_filter(env_filter()),
            )
            .init();
    }

    tracing::info!(run_id = %run_id(), json, log_dir = %log_dir, "Logging initialized");
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_run_id_is_honored() {
        let fixed = Uuid::new_v4();
        std::env::set_var("RUN_ID", fixed.to_string());
        assert_eq!(run_id(), fixed);
        std::env::remove_var("RUN_ID");
        assert_ne!(run_id(), run_id());
    }

    #[test]
    fn garbage_run_id_falls_back_to_fresh() {
        std::env::set_var("RUN_ID", "not-a-uuid");
        let a = run_id();
        let b = run_id();
        assert_ne!(a, b);
        std::env::remove_var("RUN_ID");
    }
}
