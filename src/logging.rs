// ============================================
// logging.rs - Console + per-run log file
// ============================================
//
// Every run writes a log file next to the EXE:
//
//   logs/<COMPUTERNAME>_<yymmdd_HHMMSS>.log
//
// so when a classroom machine misbehaves the operator can bring the
// USB stick back and read what happened. The file gets everything from
// DEBUG up; the console only shows INFO and up (or what RUST_LOG says).
//
// RunLog is a handle, not a global: it owns the appender's worker guard
// (dropping it flushes the file) and the subscriber guard.
// ============================================

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::subscriber::DefaultGuard;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

use crate::error::{DeployError, DeployResult};

pub struct RunLog {
    log_file: PathBuf,
    _subscriber: DefaultGuard,
    _worker: WorkerGuard,
}

impl RunLog {
    /// Create the log file under `logs_dir` and start logging to it.
    pub fn init(logs_dir: &Path, host: &str) -> DeployResult<RunLog> {
        fs::create_dir_all(logs_dir).map_err(|e| DeployError::fs("create", logs_dir, e))?;

        let now = chrono::Local::now().naive_local();
        let log_file = logs_dir.join(log_file_name(host, now));
        let file = File::create(&log_file).map_err(|e| DeployError::fs("create", &log_file, e))?;
        let (writer, worker) = tracing_appender::non_blocking(file);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .with_filter(LevelFilter::DEBUG);

        let console_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let console_layer = fmt::layer()
            .without_time()
            .with_target(false)
            .compact()
            .with_filter(console_filter);

        let subscriber = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer);

        Ok(RunLog {
            log_file,
            _subscriber: tracing::subscriber::set_default(subscriber),
            _worker: worker,
        })
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }
}

/// `<host>_<yymmdd_HHMMSS>.log`
pub fn log_file_name(host: &str, at: NaiveDateTime) -> String {
    format!("{}_{}.log", host, at.format("%y%m%d_%H%M%S"))
}
