//! Main execution engine - sequences the stages of a pipeline run

use crate::core::{
    config::Configuration,
    error::{PipelineError, Result},
    mode::ProcessingMode,
    state::{ExecutionStatus, PipelineResult, StageResult},
    unit::UnitOutcome,
    Pipeline,
};
use crate::execution::command::UnitLauncher;
use crate::execution::stage::StageController;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline_name: String,
    },
    StageStarted {
        stage_id: String,
        effective_mode: ProcessingMode,
    },
    StageDisabled {
        stage_id: String,
    },
    BatchStarted {
        stage_id: String,
        units: usize,
    },
    UnitSkipped {
        stage_id: String,
        key: String,
    },
    UnitStarted {
        stage_id: String,
        key: String,
    },
    UnitFinished {
        stage_id: String,
        key: String,
        outcome: UnitOutcome,
    },
    StageFinished {
        stage_id: String,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    PipelineCompleted {
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Shared list of event handlers
#[derive(Clone, Default)]
pub struct EventHandlers(Arc<Mutex<Vec<EventHandler>>>);

impl EventHandlers {
    pub async fn add(&self, handler: EventHandler) {
        self.0.lock().await.push(handler);
    }

    /// Emit an event to all handlers
    pub async fn emit(&self, event: ExecutionEvent) {
        let handlers = self.0.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

/// Sequences stages and applies the continuation policy
pub struct PipelineController<L> {
    launcher: Arc<L>,
    event_handlers: EventHandlers,
}

impl<L: UnitLauncher + 'static> PipelineController<L> {
    pub fn new(launcher: L) -> Self {
        Self::with_launcher(Arc::new(launcher))
    }

    pub fn with_launcher(launcher: Arc<L>) -> Self {
        Self {
            launcher,
            event_handlers: EventHandlers::default(),
        }
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.add(Arc::new(handler)).await;
    }

    /// Run every stage in declared order
    ///
    /// Under the stop-on-failure policy the run halts after the first stage
    /// with failed units. An interruption ends the run with status
    /// `Cancelled`; stages finished before it are kept in the result.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        config: &Configuration,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let mut result = PipelineResult::new(&pipeline.name);
        result.start();
        let continue_on_failure = pipeline.continues_on_failure(config);

        info!(
            "Starting pipeline {} ({}) in {} mode",
            pipeline.name, result.run_id, config.mode
        );
        self.event_handlers
            .emit(ExecutionEvent::PipelineStarted {
                run_id: result.run_id,
                pipeline_name: pipeline.name.clone(),
            })
            .await;

        let controller = StageController::new(
            self.launcher.clone(),
            self.event_handlers.clone(),
            result.run_id,
        );

        let mut status = ExecutionStatus::Completed;
        for (position, stage) in pipeline.stages.iter().enumerate() {
            if !stage.is_enabled(config) {
                self.event_handlers
                    .emit(ExecutionEvent::StageDisabled {
                        stage_id: stage.id.clone(),
                    })
                    .await;
                result
                    .stages
                    .push(StageResult::disabled(&stage.id, stage.effective_mode(config.mode)));
                continue;
            }

            self.event_handlers
                .emit(ExecutionEvent::StageStarted {
                    stage_id: stage.id.clone(),
                    effective_mode: stage.effective_mode(config.mode),
                })
                .await;

            let stage_result = match controller.run(stage, config, cancel).await {
                Ok(stage_result) => stage_result,
                Err(PipelineError::Interrupted { stage }) => {
                    warn!("Pipeline {} interrupted during stage '{}'", pipeline.name, stage);
                    status = ExecutionStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    error!("Stage '{}' aborted: {}", stage.id, e);
                    result.finish(ExecutionStatus::Failed, started.elapsed());
                    self.event_handlers
                        .emit(ExecutionEvent::PipelineCompleted {
                            run_id: result.run_id,
                            status: ExecutionStatus::Failed,
                        })
                        .await;
                    return Err(e);
                }
            };

            self.event_handlers
                .emit(ExecutionEvent::StageFinished {
                    stage_id: stage.id.clone(),
                    completed: stage_result.completed,
                    failed: stage_result.failed,
                    skipped: stage_result.skipped,
                })
                .await;

            let failed = stage_result.has_failures();
            result.stages.push(stage_result);

            if failed {
                status = ExecutionStatus::Failed;
                let remaining = pipeline.stages.len() - position - 1;
                if !continue_on_failure && remaining > 0 {
                    warn!(
                        "Stage '{}' reported failures; halting before {} remaining stage(s)",
                        stage.id, remaining
                    );
                    result.halted_after = Some(stage.id.clone());
                    break;
                }
            }
        }

        result.finish(status, started.elapsed());
        info!(
            "Pipeline execution finished: {} - {:?} in {:?}",
            pipeline.name, status, result.elapsed
        );
        self.event_handlers
            .emit(ExecutionEvent::PipelineCompleted {
                run_id: result.run_id,
                status,
            })
            .await;

        Ok(result)
    }
}
