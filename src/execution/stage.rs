//! Runs one pipeline stage

use crate::core::{
    config::Configuration,
    error::{PipelineError, Result},
    stage::Stage,
    state::{StageResult, UnitRecord},
};
use crate::execution::command::{InvocationBuilder, UnitLauncher};
use crate::execution::engine::EventHandlers;
use crate::execution::enumerator;
use crate::execution::orchestrator::JobOrchestrator;
use crate::persistence::runlog::StageRunLog;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Drives one stage: mode, enable flag, enumeration, dispatch, run log
pub struct StageController<L> {
    launcher: Arc<L>,
    events: EventHandlers,
    run_id: Uuid,
}

impl<L: UnitLauncher + 'static> StageController<L> {
    pub fn new(launcher: Arc<L>, events: EventHandlers, run_id: Uuid) -> Self {
        Self {
            launcher,
            events,
            run_id,
        }
    }

    /// Run a stage to completion
    ///
    /// Unit failures are counted in the result. Errors are limited to
    /// configuration problems, log I/O and interruption.
    pub async fn run(
        &self,
        stage: &Stage,
        config: &Configuration,
        cancel: &CancellationToken,
    ) -> Result<StageResult> {
        let mode = stage.effective_mode(config.mode);

        if !stage.is_enabled(config) {
            info!("Stage '{}' disabled, skipping", stage.id);
            return Ok(StageResult::disabled(&stage.id, mode));
        }

        if let Some(rule) = stage.applied_rule(config.mode) {
            info!(
                "Stage '{}' runs in {} mode instead of {}{}",
                stage.id,
                mode,
                config.mode,
                rule.reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );
        }

        let started = Instant::now();
        let mut result = StageResult::new(&stage.id, mode);
        let mut runlog = StageRunLog::open(&config.log_root, &stage.id, self.run_id, mode)?;

        let units = match enumerator::enumerate(stage, config, mode) {
            Ok(units) => units,
            Err(PipelineError::InputNotFound { reason, .. }) => {
                warn!("No work units for stage '{}': {}", stage.id, reason);
                result.input_missing = Some(reason);
                result.elapsed = started.elapsed();
                runlog.append_summary(&result, false)?;
                return Ok(result);
            }
            Err(e) => return Err(e),
        };

        if stage.outputs.for_mode(mode).is_empty() {
            warn!(
                "Stage '{}' declares no outputs for {} mode; its units are never skipped",
                stage.id, mode
            );
        }

        // Shared scratch lives exactly as long as this batch
        let scratch = if stage.scratch {
            Some(create_scratch(config, &stage.id)?)
        } else {
            None
        };

        let builder = InvocationBuilder::new(stage, config, mode)
            .with_scratch(scratch.as_ref().map(TempDir::path));

        let orchestrator = JobOrchestrator::new(self.launcher.clone(), config.concurrency)
            .with_force(config.force)
            .with_completion_markers(config.completion_markers)
            .with_kill_grace(config.kill_grace)
            .with_timeout(stage.timeout)
            .with_events(self.events.clone());

        // Each record reaches the run log as soon as its unit settles
        let mut settled: Vec<UnitRecord> = Vec::new();
        let mut log_error: Option<PipelineError> = None;
        let outcome = orchestrator
            .run(
                &stage.id,
                &units,
                |unit| builder.build(unit),
                |record: &UnitRecord| {
                    if log_error.is_none() {
                        if let Err(e) = runlog.append_unit(record) {
                            warn!("Failed to write run log for '{}': {}", stage.id, e);
                            log_error = Some(e);
                        }
                    }
                    settled.push(record.clone());
                },
                cancel,
            )
            .await;

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                for record in settled {
                    result.record(record);
                }
                result.elapsed = started.elapsed();
                if let Err(log_err) = runlog.append_summary(&result, true) {
                    warn!("Failed to write run log for '{}': {}", stage.id, log_err);
                }
                return Err(e);
            }
        };
        if let Some(e) = log_error {
            return Err(e);
        }

        for record in report.records {
            result.record(record);
        }
        result.peak_concurrency = report.peak_concurrency;
        result.elapsed = started.elapsed();
        runlog.append_summary(&result, false)?;

        if let Some(dir) = scratch {
            if let Err(e) = dir.close() {
                warn!("Failed to remove scratch for '{}': {}", stage.id, e);
            }
        }

        info!(
            "Stage '{}' finished: {} completed, {} failed, {} skipped",
            stage.id, result.completed, result.failed, result.skipped
        );
        Ok(result)
    }
}

fn create_scratch(config: &Configuration, stage_id: &str) -> Result<TempDir> {
    std::fs::create_dir_all(&config.scratch_root)?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-", stage_id))
        .tempdir_in(&config.scratch_root)?;
    info!("Scratch for '{}' at {}", stage_id, dir.path().display());
    Ok(dir)
}
