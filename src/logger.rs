//! Leveled console logger with an optional JSON-lines file sink.
//!
//! Console output is what the operator watches during a run: info is cyan,
//! warnings yellow, errors red, debug uncolored. When `log.path` is set the
//! same entries are appended to the file as JSON lines for later inspection.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Parse a level name. `fatal` maps onto `Error`.
    pub fn parse(value: &str) -> Option<Level> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" | "fatal" => Some(Level::Error),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

pub struct ConsoleLogger {
    level: Level,
    sink: Option<Mutex<File>>,
}

impl ConsoleLogger {
    /// Create a logger. When `log_path` is given its parent directories are
    /// created and entries are appended to the file.
    pub fn new(level: Level, log_path: Option<&Path>) -> Result<ConsoleLogger> {
        let sink = match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("failed to create directory for logs: {}", parent.display())
                        })?;
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };

        Ok(ConsoleLogger { level, sink })
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn log(&self, level: Level, message: &str) {
        if level < self.level {
            return;
        }

        match level {
            Level::Debug => println!("{message}"),
            Level::Info => println!("{}", message.cyan()),
            Level::Warn => println!("{}", message.yellow()),
            Level::Error => eprintln!("{}", message.red()),
        }

        if let Some(ref sink) = self.sink {
            let entry = serde_json::json!({
                "ts": chrono::Local::now().to_rfc3339(),
                "level": level.name(),
                "msg": message,
            });
            if let Ok(mut file) = sink.lock() {
                let _ = writeln!(file, "{entry}");
            }
        }
    }
}
