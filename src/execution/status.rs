//! Completeness check without dispatching anything

use crate::core::{
    config::Configuration,
    error::{PipelineError, Result},
    mode::ProcessingMode,
    Pipeline,
};
use crate::execution::enumerator;
use serde::Serialize;

/// Pending keys listed per stage
pub const PENDING_SAMPLE: usize = 10;

/// How far a stage's outputs are from complete
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage_id: String,
    pub effective_mode: ProcessingMode,
    pub disabled: bool,
    pub input_missing: Option<String>,
    pub total: usize,
    pub complete: usize,
    /// First pending keys in dispatch order
    pub pending_keys: Vec<String>,
}

impl StageStatus {
    pub fn pending(&self) -> usize {
        self.total - self.complete
    }
}

/// Enumerate every stage and check which units are already done
pub fn completion_status(pipeline: &Pipeline, config: &Configuration) -> Result<Vec<StageStatus>> {
    let mut statuses = Vec::with_capacity(pipeline.stages.len());

    for stage in &pipeline.stages {
        let mode = stage.effective_mode(config.mode);
        let mut status = StageStatus {
            stage_id: stage.id.clone(),
            effective_mode: mode,
            disabled: !stage.is_enabled(config),
            input_missing: None,
            total: 0,
            complete: 0,
            pending_keys: Vec::new(),
        };

        if !status.disabled {
            match enumerator::enumerate(stage, config, mode) {
                Ok(units) => {
                    status.total = units.len();
                    for unit in &units {
                        if unit.is_complete(config.completion_markers) {
                            status.complete += 1;
                        } else if status.pending_keys.len() < PENDING_SAMPLE {
                            status.pending_keys.push(unit.key.clone());
                        }
                    }
                }
                Err(PipelineError::InputNotFound { reason, .. }) => {
                    status.input_missing = Some(reason);
                }
                Err(e) => return Err(e),
            }
        }

        statuses.push(status);
    }

    Ok(statuses)
}
