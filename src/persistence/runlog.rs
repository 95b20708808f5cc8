//! Append-only per-stage run log
//!
//! `<log_root>/<stage>_runlog.jsonl`: one JSON object per unit followed by
//! one `summary` object per batch.

use crate::core::{
    error::Result,
    mode::ProcessingMode,
    state::{StageResult, UnitRecord},
    unit::UnitOutcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One line of a stage run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "lowercase")]
pub enum RunLogEntry {
    Unit {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        stage: String,
        mode: ProcessingMode,
        key: String,
        status: String,
        exit_code: Option<i32>,
        elapsed_ms: u64,
        message: Option<String>,
    },
    Summary {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        stage: String,
        mode: ProcessingMode,
        completed: usize,
        failed: usize,
        skipped: usize,
        peak_concurrency: usize,
        elapsed_ms: u64,
        input_missing: Option<String>,
        interrupted: bool,
    },
}

/// Path of a stage's run log
pub fn runlog_path(log_root: &Path, stage_id: &str) -> PathBuf {
    log_root.join(format!("{}_runlog.jsonl", stage_id))
}

/// Writer for one stage's run log during one run
pub struct StageRunLog {
    path: PathBuf,
    file: File,
    run_id: Uuid,
    stage: String,
    mode: ProcessingMode,
}

impl StageRunLog {
    /// Open (creating directories as needed) in append mode
    pub fn open(log_root: &Path, stage_id: &str, run_id: Uuid, mode: ProcessingMode) -> Result<Self> {
        std::fs::create_dir_all(log_root)?;
        let path = runlog_path(log_root, stage_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            run_id,
            stage: stage_id.to_string(),
            mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one unit's outcome
    pub fn append_unit(&mut self, record: &UnitRecord) -> Result<()> {
        let (exit_code, message) = match &record.outcome {
            UnitOutcome::Failed { exit_code, error } => (*exit_code, Some(error.clone())),
            UnitOutcome::Completed => (Some(0), None),
            UnitOutcome::Skipped => (None, Some("outputs already present".to_string())),
        };
        self.append(&RunLogEntry::Unit {
            timestamp: Utc::now(),
            run_id: self.run_id,
            stage: self.stage.clone(),
            mode: self.mode,
            key: record.key.clone(),
            status: record.outcome.label().to_string(),
            exit_code,
            elapsed_ms: record.elapsed.as_millis() as u64,
            message,
        })
    }

    /// Append the stage aggregate
    pub fn append_summary(&mut self, result: &StageResult, interrupted: bool) -> Result<()> {
        self.append(&RunLogEntry::Summary {
            timestamp: Utc::now(),
            run_id: self.run_id,
            stage: self.stage.clone(),
            mode: self.mode,
            completed: result.completed,
            failed: result.failed,
            skipped: result.skipped,
            peak_concurrency: result.peak_concurrency,
            elapsed_ms: result.elapsed.as_millis() as u64,
            input_missing: result.input_missing.clone(),
            interrupted,
        })
    }

    fn append(&mut self, entry: &RunLogEntry) -> Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::from)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Read every entry of a run log
pub fn read_runlog(path: &Path) -> Result<Vec<RunLogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line).map_err(std::io::Error::from)?);
    }
    Ok(entries)
}
