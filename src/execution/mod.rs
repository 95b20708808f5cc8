//! Pipeline execution: enumeration, dispatch, stage and pipeline control

pub mod command;
pub mod engine;
pub mod enumerator;
pub mod orchestrator;
pub mod process_group;
pub mod stage;
pub mod status;

pub use command::{Invocation, InvocationBuilder, ProcessExit, ProcessLauncher, UnitLauncher};
pub use engine::{EventHandler, EventHandlers, ExecutionEvent, PipelineController};
pub use orchestrator::{BatchReport, JobOrchestrator};
pub use stage::StageController;
pub use status::{completion_status, StageStatus};
