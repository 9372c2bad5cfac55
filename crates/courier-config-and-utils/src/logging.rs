//! Logging initialization for the client.
//!
//! Every component logs through `tracing` macros and never decides where
//! output goes. This module installs the subscriber once at startup:
//! - Structured JSONL appended to `~/.courier/logs/courier.jsonl`
//! - Log level from `RUST_LOG` or the configured default
//! - Optional compact stderr output for foreground runs
//!
//! Send-queue operations run inside spans (`send_event` and its
//! `upload_attachments` / `encrypt` / `transmit` children), so the JSON
//! lines carry the span list and form the hierarchical operation log.

use crate::{CoreError, CoreResult, Paths};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom log file path.
    /// Defaults to `~/.courier/logs/courier.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Append-only file writer shared by every log line.
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl LogFileWriter {
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let result = guard.write(buf);
        // Flush per line so `tail -f` sees complete records
        guard.flush()?;
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize logging into `paths.log_file()`, echoing to stderr.
///
/// ```ignore
/// init_logging("info", &paths)?;
/// tracing::info!("client started");
/// ```
pub fn init_logging(level: &str, paths: &Paths) -> CoreResult<()> {
    init_with_config(LogConfig {
        default_level: level.into(),
        log_path: Some(paths.log_file()),
        also_stderr: true,
    })
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_with_config(config: LogConfig) -> CoreResult<()> {
    let log_path = match config.log_path.clone() {
        Some(path) => path,
        None => Paths::new()?.log_file(),
    };

    // The span list turns the JSON lines into the operation tree
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(LogFileWriter::new(&log_path)?)
        .with_filter(level_filter(&config.default_level));

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_filter(level_filter(&config.default_level))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| CoreError::Logging(e.to_string()))?;

    tracing::debug!(log_path = %log_path.display(), "Logging initialized");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn level_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
