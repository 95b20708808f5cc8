//! Execution results: per unit, per stage, per run

use crate::core::mode::ProcessingMode;
use crate::core::unit::UnitOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Every stage finished without failed units
    Completed,
    /// At least one stage reported failed units
    Failed,
    /// An external termination request stopped the run
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ExecutionStatus::Running,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Pending,
        }
    }
}

/// Outcome of one unit, as recorded in the stage result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    pub key: String,
    pub outcome: UnitOutcome,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Aggregate result of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage identifier
    pub stage_id: String,

    /// Mode the stage ran with after correction
    pub effective_mode: ProcessingMode,

    /// Stage was disabled by configuration; nothing was enumerated
    pub disabled: bool,

    /// Why enumeration produced no units, if it did not
    pub input_missing: Option<String>,

    /// Per-unit records in dispatch order
    pub units: Vec<UnitRecord>,

    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Highest number of simultaneously live processes
    pub peak_concurrency: usize,

    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl StageResult {
    /// Empty result for a stage about to run
    pub fn new(stage_id: impl Into<String>, effective_mode: ProcessingMode) -> Self {
        Self {
            stage_id: stage_id.into(),
            effective_mode,
            disabled: false,
            input_missing: None,
            units: Vec::new(),
            completed: 0,
            failed: 0,
            skipped: 0,
            peak_concurrency: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Marker result for a stage whose enable flag is off
    pub fn disabled(stage_id: impl Into<String>, effective_mode: ProcessingMode) -> Self {
        Self {
            disabled: true,
            ..Self::new(stage_id, effective_mode)
        }
    }

    /// Record one unit and update the counts
    pub fn record(&mut self, record: UnitRecord) {
        match record.outcome {
            UnitOutcome::Skipped => self.skipped += 1,
            UnitOutcome::Completed => self.completed += 1,
            UnitOutcome::Failed { .. } => self.failed += 1,
        }
        self.units.push(record);
    }

    /// Number of units actually dispatched
    pub fn dispatched(&self) -> usize {
        self.completed + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Keys of failed units
    pub fn failed_keys(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| u.outcome.is_failed())
            .map(|u| u.key.as_str())
            .collect()
    }
}

/// Aggregate result of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Unique run ID
    pub run_id: Uuid,

    pub pipeline_name: String,

    pub status: ExecutionStatus,

    /// Stage results in execution order
    pub stages: Vec<StageResult>,

    /// Stage whose failures stopped the run
    pub halted_after: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl PipelineResult {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            status: ExecutionStatus::Pending,
            stages: Vec::new(),
            halted_after: None,
            started_at: Utc::now(),
            completed_at: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Mark the run as started
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Utc::now();
    }

    /// Close the run with a terminal status
    pub fn finish(&mut self, status: ExecutionStatus, elapsed: Duration) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.elapsed = elapsed;
    }

    pub fn total_completed(&self) -> usize {
        self.stages.iter().map(|s| s.completed).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.stages.iter().map(|s| s.skipped).sum()
    }

    /// Whether any stage reported failures
    pub fn has_failures(&self) -> bool {
        self.stages.iter().any(StageResult::has_failures)
    }

    /// Stage result by ID
    pub fn stage(&self, id: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage_id == id)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
