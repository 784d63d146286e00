//! Per-execution task logging.
//!
//! Each crawl invocation gets its own [`TaskLogger`], created through a
//! [`TaskLoggerFactory`]. Handlers treat factory failures as non-fatal and
//! fall back to [`NoopTaskLogger`], so a broken log directory never fails a
//! crawl.
//!
//! | Sink | Output |
//! |------|--------|
//! | [`FileTaskLogger`] | `<dir>/<site>_<project>_<code>/<log_id>.log` |
//! | [`ConsoleTaskLogger`] | `tracing` events tagged with the crawl |
//! | [`NoopTaskLogger`] | nothing |

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::models::CrawlKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A log sink scoped to one crawl execution.
pub trait TaskLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, error: Option<&anyhow::Error>);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, None);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, None);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message, None);
    }

    fn error(&self, message: &str, error: Option<&anyhow::Error>) {
        self.log(LogLevel::Error, message, error);
    }
}

/// Creates the logger for one execution.
pub trait TaskLoggerFactory: Send + Sync {
    fn create(&self, key: &CrawlKey, log_id: &str) -> Result<Arc<dyn TaskLogger>>;
}

/// Discards everything.
pub struct NoopTaskLogger;

impl TaskLogger for NoopTaskLogger {
    fn log(&self, _level: LogLevel, _message: &str, _error: Option<&anyhow::Error>) {}
}

/// Emits `tracing` events carrying the crawl label.
pub struct ConsoleTaskLogger {
    label: String,
}

impl ConsoleTaskLogger {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl TaskLogger for ConsoleTaskLogger {
    fn log(&self, level: LogLevel, message: &str, error: Option<&anyhow::Error>) {
        let crawl = self.label.as_str();
        match (level, error) {
            (LogLevel::Debug, _) => tracing::debug!(crawl, "{}", message),
            (LogLevel::Info, _) => tracing::info!(crawl, "{}", message),
            (LogLevel::Warn, None) => tracing::warn!(crawl, "{}", message),
            (LogLevel::Warn, Some(e)) => tracing::warn!(crawl, error = %format!("{:#}", e), "{}", message),
            (LogLevel::Error, None) => tracing::error!(crawl, "{}", message),
            (LogLevel::Error, Some(e)) => {
                tracing::error!(crawl, error = %format!("{:#}", e), "{}", message)
            }
        }
    }
}

/// Appends timestamped lines to a file.
pub struct FileTaskLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileTaskLogger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open task log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskLogger for FileTaskLogger {
    fn log(&self, level: LogLevel, message: &str, error: Option<&anyhow::Error>) {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let line = match error {
            Some(e) => format!("{} [{}] {}: {:#}\n", ts, level, message, e),
            None => format!("{} [{}] {}\n", ts, level, message),
        };
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(path = %self.path.display(), "task log write failed: {}", e);
            }
        }
    }
}

/// Opens a [`FileTaskLogger`] per execution under a root directory.
pub struct FileLoggerFactory {
    dir: PathBuf,
}

impl FileLoggerFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TaskLoggerFactory for FileLoggerFactory {
    fn create(&self, key: &CrawlKey, log_id: &str) -> Result<Arc<dyn TaskLogger>> {
        let path = self
            .dir
            .join(key.local_code())
            .join(format!("{}.log", log_id));
        Ok(Arc::new(FileTaskLogger::open(&path)?))
    }
}

pub struct ConsoleLoggerFactory;

impl TaskLoggerFactory for ConsoleLoggerFactory {
    fn create(&self, key: &CrawlKey, _log_id: &str) -> Result<Arc<dyn TaskLogger>> {
        Ok(Arc::new(ConsoleTaskLogger::new(key.local_code())))
    }
}

pub struct NoopLoggerFactory;

impl TaskLoggerFactory for NoopLoggerFactory {
    fn create(&self, _key: &CrawlKey, _log_id: &str) -> Result<Arc<dyn TaskLogger>> {
        Ok(Arc::new(NoopTaskLogger))
    }
}

/// File logs when `[logging].dir` is set, console otherwise.
pub fn factory_from_config(config: &Config) -> Arc<dyn TaskLoggerFactory> {
    match &config.logging.dir {
        Some(dir) => Arc::new(FileLoggerFactory::new(dir.clone())),
        None => Arc::new(ConsoleLoggerFactory),
    }
}
