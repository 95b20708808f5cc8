//! Bounded-concurrency dispatch of one batch
//!
//! Units are dispatched in order. A semaphore with `ceiling` permits bounds
//! the number of live child processes; the dispatch loop awaits a permit,
//! and the permit is released when the slot task has reaped its child.
//! Every record is handed to the caller's sink the moment it lands, so a
//! run log stays current even when the batch never finishes. Cancelling the
//! token stops dispatch, kills every live child and turns the call into
//! [`PipelineError::Interrupted`].

use crate::core::{
    error::{PipelineError, Result},
    state::UnitRecord,
    unit::{UnitOutcome, WorkUnit},
};
use crate::execution::command::{Invocation, ProcessExit, UnitLauncher};
use crate::execution::engine::{EventHandlers, ExecutionEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-unit records of a batch plus the concurrency it reached
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Records in dispatch order
    pub records: Vec<UnitRecord>,

    /// Highest number of simultaneously live slots
    pub peak_concurrency: usize,
}

impl BatchReport {
    /// Number of units that were actually launched
    pub fn dispatched(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome != UnitOutcome::Skipped)
            .count()
    }
}

/// Live-slot accounting shared by the slots of one batch
#[derive(Debug, Default)]
struct SlotGauge {
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// One dispatched unit; dropping it frees the concurrency slot
struct JobSlot {
    key: String,
    started: Instant,
    gauge: Arc<SlotGauge>,
    _permit: OwnedSemaphorePermit,
}

impl JobSlot {
    fn open(key: String, permit: OwnedSemaphorePermit, gauge: Arc<SlotGauge>) -> Self {
        let live = gauge.live.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(live, Ordering::SeqCst);
        Self {
            key,
            started: Instant::now(),
            gauge,
            _permit: permit,
        }
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.gauge.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a finished slot task hands back to the control loop
struct SlotReport {
    position: usize,
    record: UnitRecord,
}

/// Records of one batch by dispatch position
struct Ledger<S> {
    records: Vec<Option<UnitRecord>>,
    sink: S,
}

impl<S: FnMut(&UnitRecord)> Ledger<S> {
    fn new(len: usize, sink: S) -> Self {
        Self {
            records: vec![None; len],
            sink,
        }
    }

    fn settle(&mut self, position: usize, record: UnitRecord) {
        (self.sink)(&record);
        self.records[position] = Some(record);
    }

    fn into_records(self) -> Vec<UnitRecord> {
        self.records.into_iter().flatten().collect()
    }
}

/// Dispatches batches of work units against a concurrency ceiling
pub struct JobOrchestrator<L> {
    launcher: Arc<L>,
    ceiling: usize,
    force: bool,
    completion_markers: bool,
    kill_grace: Duration,
    timeout: Option<Duration>,
    events: EventHandlers,
}

impl<L: UnitLauncher + 'static> JobOrchestrator<L> {
    /// Orchestrator allowing at most `ceiling` live processes (minimum 1)
    pub fn new(launcher: Arc<L>, ceiling: usize) -> Self {
        Self {
            launcher,
            ceiling: ceiling.max(1),
            force: false,
            completion_markers: false,
            kill_grace: Duration::from_secs(5),
            timeout: None,
            events: EventHandlers::default(),
        }
    }

    /// Dispatch units even when their outputs are already present
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Require and write completion markers
    pub fn with_completion_markers(mut self, enabled: bool) -> Self {
        self.completion_markers = enabled;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Per-unit timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: EventHandlers) -> Self {
        self.events = events;
        self
    }

    /// Run one batch
    ///
    /// `sink` sees each record as soon as its unit is skipped or reaped. A
    /// failed unit never stops its siblings. The only error returned is
    /// `Interrupted`, after every live child has been killed, reaped and
    /// passed to `sink`.
    pub async fn run<F, S>(
        &self,
        stage_id: &str,
        batch: &[WorkUnit],
        command: F,
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<BatchReport>
    where
        F: Fn(&WorkUnit) -> Result<Invocation>,
        S: FnMut(&UnitRecord),
    {
        let semaphore = Arc::new(Semaphore::new(self.ceiling));
        let gauge = Arc::new(SlotGauge::default());
        // Slot tasks observe a child token so cancelling them never
        // cancels the caller's token
        let slot_cancel = cancel.child_token();
        let mut slots: JoinSet<SlotReport> = JoinSet::new();
        let mut positions: HashMap<tokio::task::Id, (usize, String)> = HashMap::new();
        let mut ledger = Ledger::new(batch.len(), sink);

        info!(
            "Dispatching {} units of stage '{}' (ceiling {})",
            batch.len(),
            stage_id,
            self.ceiling
        );
        self.events
            .emit(ExecutionEvent::BatchStarted {
                stage_id: stage_id.to_string(),
                units: batch.len(),
            })
            .await;

        for (position, unit) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(self
                    .interrupt(stage_id, &mut slots, &slot_cancel, &mut positions, &mut ledger)
                    .await);
            }

            if !self.force && already_complete(unit, self.completion_markers).await {
                debug!("Unit '{}' already complete, skipping", unit.key);
                ledger.settle(
                    position,
                    UnitRecord {
                        key: unit.key.clone(),
                        outcome: UnitOutcome::Skipped,
                        elapsed: Duration::ZERO,
                    },
                );
                self.events
                    .emit(ExecutionEvent::UnitSkipped {
                        stage_id: stage_id.to_string(),
                        key: unit.key.clone(),
                    })
                    .await;
                continue;
            }

            let invocation = match command(unit) {
                Ok(invocation) => invocation,
                Err(e) => {
                    warn!("Cannot build command for unit '{}': {}", unit.key, e);
                    let record = UnitRecord {
                        key: unit.key.clone(),
                        outcome: UnitOutcome::Failed {
                            exit_code: None,
                            error: e.to_string(),
                        },
                        elapsed: Duration::ZERO,
                    };
                    self.finish_unit(stage_id, position, record, &mut ledger)
                        .await;
                    continue;
                }
            };

            // Wait for a free slot, reaping finished ones meanwhile
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(self
                            .interrupt(stage_id, &mut slots, &slot_cancel, &mut positions, &mut ledger)
                            .await);
                    }
                    Some(joined) = slots.join_next_with_id(), if !slots.is_empty() => {
                        self.collect(stage_id, joined, &mut positions, &mut ledger).await;
                    }
                    permit = semaphore.clone().acquire_owned() => {
                        match permit {
                            Ok(permit) => break permit,
                            Err(_) => {
                                return Err(self
                                    .interrupt(stage_id, &mut slots, &slot_cancel, &mut positions, &mut ledger)
                                    .await);
                            }
                        }
                    }
                }
            };

            let slot = JobSlot::open(unit.key.clone(), permit, gauge.clone());
            info!("Starting unit '{}' of stage '{}'", unit.key, stage_id);
            self.events
                .emit(ExecutionEvent::UnitStarted {
                    stage_id: stage_id.to_string(),
                    key: unit.key.clone(),
                })
                .await;

            let launcher = self.launcher.clone();
            let token = slot_cancel.clone();
            let timeout = self.timeout;
            let grace = self.kill_grace;
            let marker = self
                .completion_markers
                .then(|| unit.marker_path())
                .flatten();

            let handle = slots.spawn(async move {
                let exit = launcher.launch(&invocation, timeout, &token, grace).await;
                let elapsed = slot.started.elapsed();
                let outcome = outcome_for(exit);
                if outcome == UnitOutcome::Completed {
                    write_marker(&slot.key, marker).await;
                }
                let record = UnitRecord {
                    key: slot.key.clone(),
                    outcome,
                    elapsed,
                };
                drop(slot);
                SlotReport { position, record }
            });
            positions.insert(handle.id(), (position, unit.key.clone()));
        }

        // Drain
        while !slots.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self
                        .interrupt(stage_id, &mut slots, &slot_cancel, &mut positions, &mut ledger)
                        .await);
                }
                Some(joined) = slots.join_next_with_id() => {
                    self.collect(stage_id, joined, &mut positions, &mut ledger).await;
                }
            }
        }

        let records = ledger.into_records();
        let peak_concurrency = gauge.peak.load(Ordering::SeqCst);
        debug!(
            "Stage '{}' batch drained, peak concurrency {}",
            stage_id, peak_concurrency
        );

        Ok(BatchReport {
            records,
            peak_concurrency,
        })
    }

    async fn collect<S: FnMut(&UnitRecord)>(
        &self,
        stage_id: &str,
        joined: std::result::Result<(tokio::task::Id, SlotReport), JoinError>,
        positions: &mut HashMap<tokio::task::Id, (usize, String)>,
        ledger: &mut Ledger<S>,
    ) {
        let (position, record) = match joined {
            Ok((id, report)) => {
                positions.remove(&id);
                (report.position, report.record)
            }
            Err(e) => {
                let Some((position, key)) = positions.remove(&e.id()) else {
                    warn!("Lost track of a slot task: {}", e);
                    return;
                };
                let error = if e.is_cancelled() {
                    "interrupted".to_string()
                } else {
                    format!("slot task panicked: {}", e)
                };
                let record = UnitRecord {
                    key,
                    outcome: UnitOutcome::Failed {
                        exit_code: None,
                        error,
                    },
                    elapsed: Duration::ZERO,
                };
                (position, record)
            }
        };
        self.finish_unit(stage_id, position, record, ledger).await;
    }

    async fn finish_unit<S: FnMut(&UnitRecord)>(
        &self,
        stage_id: &str,
        position: usize,
        record: UnitRecord,
        ledger: &mut Ledger<S>,
    ) {
        match &record.outcome {
            UnitOutcome::Failed { error, .. } => {
                warn!("Unit '{}' of stage '{}' failed: {}", record.key, stage_id, error)
            }
            _ => info!(
                "Unit '{}' of stage '{}' completed in {:?}",
                record.key, stage_id, record.elapsed
            ),
        }
        self.events
            .emit(ExecutionEvent::UnitFinished {
                stage_id: stage_id.to_string(),
                key: record.key.clone(),
                outcome: record.outcome.clone(),
            })
            .await;
        ledger.settle(position, record);
    }

    /// Kill every live slot, record how each ended and build the interruption error
    async fn interrupt<S: FnMut(&UnitRecord)>(
        &self,
        stage_id: &str,
        slots: &mut JoinSet<SlotReport>,
        slot_cancel: &CancellationToken,
        positions: &mut HashMap<tokio::task::Id, (usize, String)>,
        ledger: &mut Ledger<S>,
    ) -> PipelineError {
        warn!(
            "Interrupt received, terminating {} live units of stage '{}'",
            slots.len(),
            stage_id
        );
        slot_cancel.cancel();

        // Each slot waits at most kill_grace for its child
        let bound = self.kill_grace + Duration::from_secs(1);
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            match tokio::time::timeout_at(deadline, slots.join_next_with_id()).await {
                Ok(Some(joined)) => self.collect(stage_id, joined, positions, ledger).await,
                Ok(None) => break,
                Err(_) => {
                    // Dropping a launch kills its process group
                    slots.abort_all();
                    while let Some(joined) = slots.join_next_with_id().await {
                        self.collect(stage_id, joined, positions, ledger).await;
                    }
                    break;
                }
            }
        }

        PipelineError::Interrupted {
            stage: stage_id.to_string(),
        }
    }
}

fn outcome_for(exit: ProcessExit) -> UnitOutcome {
    match exit {
        ProcessExit::Exited(0) => UnitOutcome::Completed,
        ProcessExit::Exited(code) => UnitOutcome::Failed {
            exit_code: Some(code),
            error: format!("exited with code {}", code),
        },
        ProcessExit::TimedOut(limit) => UnitOutcome::Failed {
            exit_code: None,
            error: format!("timed out after {:?}", limit),
        },
        ProcessExit::Cancelled => UnitOutcome::Failed {
            exit_code: None,
            error: "interrupted".to_string(),
        },
        ProcessExit::LaunchFailed(error) => UnitOutcome::Failed {
            exit_code: None,
            error,
        },
    }
}

/// Completion check on the blocking pool; output roots may be network mounts
async fn already_complete(unit: &WorkUnit, require_marker: bool) -> bool {
    let unit = unit.clone();
    tokio::task::spawn_blocking(move || unit.is_complete(require_marker))
        .await
        .unwrap_or(false)
}

async fn write_marker(key: &str, marker: Option<PathBuf>) {
    let Some(marker) = marker else {
        return;
    };
    if let Err(e) = tokio::fs::write(&marker, chrono::Utc::now().to_rfc3339()).await {
        warn!(
            "Unit '{}' succeeded but marker {} could not be written: {}",
            key,
            marker.display(),
            e
        );
    }
}
