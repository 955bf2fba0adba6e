//! Append-only event sinks for pipeline records.
//!
//! Each record is one line: `<RFC 3339 timestamp> | <JSON object>`. The file
//! sink flushes after every write so an interrupted run leaves a readable
//! partial log.

use crate::core::error::FuzzyflowError;
use crate::core::time;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait EventSink {
    fn log(&mut self, record: Value) -> Result<(), FuzzyflowError>;
}

pub fn format_line(ts: &str, record: &Value) -> Result<String, FuzzyflowError> {
    Ok(format!("{} | {}", ts, serde_json::to_string(record)?))
}

/// Log file sink rooted at `<logdir>/run_<run_id>/run_<run_id>.log`.
#[derive(Debug)]
pub struct FileSink {
    run_dir: PathBuf,
    log_path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn create(logdir: &Path, run_id: &str) -> Result<Self, FuzzyflowError> {
        let run_dir = logdir.join(format!("run_{}", run_id));
        fs::create_dir_all(&run_dir)?;
        let log_path = run_dir.join(format!("run_{}.log", run_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        Ok(Self {
            run_dir,
            log_path,
            file,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl EventSink for FileSink {
    fn log(&mut self, record: Value) -> Result<(), FuzzyflowError> {
        let line = format_line(&time::now_iso(), &record)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// In-memory sink, mostly for tests and dry tooling.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<Value>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records carrying the given `step` description, in emission order.
    pub fn for_step(&self, step: &str) -> Vec<&Value> {
        self.records
            .iter()
            .filter(|r| r.get("step").and_then(Value::as_str) == Some(step))
            .collect()
    }

    /// Records carrying the given `event` name.
    pub fn events(&self, event: &str) -> Vec<&Value> {
        self.records
            .iter()
            .filter(|r| r.get("event").and_then(Value::as_str) == Some(event))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn log(&mut self, record: Value) -> Result<(), FuzzyflowError> {
        self.records.push(record);
        Ok(())
    }
}
