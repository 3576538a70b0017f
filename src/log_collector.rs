//! Disk-backed backend for the `log` facade.
//!
//! # Architecture
//!
//! ```text
//! log::info!() / log::info!(target: "stage", ..)
//!     |
//! [LogCollector] (never blocks the caller)
//!     | (crossbeam unbounded channel)
//!     v
//! [persister thread]
//!     |-- logs/full/<ts>_full.log      every record
//!     `-- logs/stages/<ts>_stages.log  stage records only
//! ```
//!
//! The persister is an OS thread rather than a tokio task so records logged
//! from any runtime, or from no runtime at all, still reach disk.

use chrono::Local;
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Records logged under this target also go to the stage log.
pub const STAGE_TARGET: &str = "stage";

enum LogMessage {
    Line(LogLine),
    /// Flush marker; the persister acknowledges once everything before it is on disk
    Flush(Sender<()>),
}

/// Get the default logs path relative to the current working directory: ./logs
pub fn get_default_logs_path() -> io::Result<PathBuf> {
    Ok(std::env::current_dir()?.join("logs"))
}

/// A log record ready to be written.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub level: Level,
    pub is_stage: bool,
    /// HH:MM:SS.mmm
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: Level, message: String) -> Self {
        LogLine {
            message,
            level,
            is_stage: false,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    pub fn stage(level: Level, message: String) -> Self {
        LogLine {
            is_stage: true,
            ..LogLine::new(level, message)
        }
    }

    fn format(&self) -> String {
        format!("[{}] [{}] {}\n", self.timestamp, self.level, self.message)
    }
}

#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    full_log: PathBuf,
    stage_log: PathBuf,
}

impl LogCollector {
    /// Create `full/` and `stages/` under `log_dir`, open this session's log
    /// files and start the persister thread.
    pub fn new(log_dir: &Path) -> io::Result<Self> {
        let full_dir = log_dir.join("full");
        let stage_dir = log_dir.join("stages");
        std::fs::create_dir_all(&full_dir)?;
        std::fs::create_dir_all(&stage_dir)?;

        let session = Local::now().format("%Y%m%d_%H%M%S%.3f");
        let full_log = full_dir.join(format!("{}_full.log", session));
        let stage_log = stage_dir.join(format!("{}_stages.log", session));
        let mut full = open_append(&full_log)?;
        let mut stages = open_append(&stage_log)?;

        let (tx, rx) = unbounded::<LogMessage>();
        std::thread::Builder::new()
            .name("log-persister".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let formatted = line.format();
                            let _ = full.write_all(formatted.as_bytes());
                            if line.is_stage {
                                let _ = stages.write_all(formatted.as_bytes());
                            }
                        }
                        LogMessage::Flush(ack) => {
                            let _ = full.flush();
                            let _ = stages.flush();
                            let _ = ack.send(());
                        }
                    }
                }
            })?;

        Ok(LogCollector {
            tx,
            full_log,
            stage_log,
        })
    }

    pub fn full_log_path(&self) -> &Path {
        &self.full_log
    }

    pub fn stage_log_path(&self) -> &Path {
        &self.stage_log
    }

    /// Queue a line for the persister. Never blocks.
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Block until every line queued before this call has been written.
    pub fn wait_for_empty(&self) -> io::Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(LogMessage::Flush(ack_tx))
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        ack_rx
            .recv()
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        if record.target() == STAGE_TARGET {
            self.log_line(LogLine::stage(record.level(), message));
        } else {
            self.log_line(LogLine::new(record.level(), message));
        }
    }

    fn flush(&self) {
        let _ = self.wait_for_empty();
    }
}

/// Install `collector` as the global logger.
pub fn install(collector: LogCollector, level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(collector))?;
    log::set_max_level(level);
    Ok(())
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
