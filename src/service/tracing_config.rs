use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Console-only subscriber for tests and local runs.
///
/// Safe to call more than once; later calls are no-ops.
pub fn setup_local_tracing() -> AppResult<()> {
    // load .env so RUST_LOG can live there
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_test_writer();
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter("info"))
        .try_init();
    Ok(())
}

/// Writes to stdout and to an hourly rolling file under `log_dir`.
///
/// The returned guard flushes the file writer on drop and must be held for the
/// life of the process.
pub fn setup_tracing<P: AsRef<Path>>(log_dir: P, verbose: u8) -> AppResult<WorkerGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(log_dir, "wirenet.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    let default_directive = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_directive))
        .try_init()
        .map_err(|e| AppError::TracingError(e.to_string()))?;

    Ok(worker_guard)
}
