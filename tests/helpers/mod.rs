//! Test utility functions for hyperpipe scenarios

#![allow(dead_code)]

use hyperpipe::core::config::{parse_override, ConfigResolver, RawLayer};
use hyperpipe::core::definition::PipelineDefinition;
use hyperpipe::core::{Configuration, Pipeline, PipelineResult, StageResult};
use hyperpipe::execution::{ExecutionEvent, PipelineController, ProcessLauncher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Records its unit under `$STATE`, keeps a live-process count, then writes
/// every declared output
pub const TRACKED_SCRIPT: &str = r#"
mkdir -p "$STATE/running"
tag="$HYPERPIPE_STAGE-$HYPERPIPE_UNIT_KEY"
touch "$STATE/running/$tag"
ls "$STATE/running" | wc -l >> "$STATE/samples"
echo "$HYPERPIPE_STAGE/$HYPERPIPE_UNIT_KEY" >> "$STATE/dispatched"
sleep 0.2
rm -f "$STATE/running/$tag"
IFS=:
for f in $HYPERPIPE_OUTPUTS; do
  mkdir -p "$(dirname "$f")"
  echo "$HYPERPIPE_MODE" > "$f"
done
"#;

/// A temporary tree with `data/`, `out/`, `logs/`, `work/` and `state/`
pub struct Workspace {
    root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["data", "out", "logs", "work", "state"] {
            std::fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        Self { root }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    pub fn data(&self) -> PathBuf {
        self.path("data")
    }

    pub fn out(&self) -> PathBuf {
        self.path("out")
    }

    pub fn logs(&self) -> PathBuf {
        self.path("logs")
    }

    pub fn work(&self) -> PathBuf {
        self.path("work")
    }

    pub fn state(&self) -> PathBuf {
        self.path("state")
    }

    /// Create `sub-01_bold.nii` .. `sub-NN_bold.nii` and return their keys
    pub fn subjects(&self, count: usize) -> Vec<String> {
        (1..=count)
            .map(|i| {
                let key = format!("sub-{:02}", i);
                std::fs::write(self.data().join(format!("{}_bold.nii", key)), b"bold").unwrap();
                key
            })
            .collect()
    }

    /// Override layer pointing every root into the workspace
    pub fn overrides(&self, extra: &[(&str, &str)]) -> RawLayer {
        let roots = [
            ("output_root", self.out()),
            ("log_root", self.logs()),
            ("scratch_root", self.work()),
            ("data_root", self.data()),
            ("state_root", self.state()),
        ];
        let mut layer: RawLayer = roots
            .iter()
            .map(|(key, path)| parse_override(key, &path.display().to_string()))
            .collect();
        layer.insert("kill_grace_secs".to_string(), serde_yaml::Value::from(1u64));
        layer.extend(extra.iter().map(|(key, value)| parse_override(key, value)));
        layer
    }

    /// Resolve a configuration for the pipeline with the workspace roots
    pub fn configure(&self, pipeline: &Pipeline, extra: &[(&str, &str)]) -> Configuration {
        ConfigResolver::new()
            .with_overrides(self.overrides(extra))
            .resolve(pipeline)
            .unwrap()
    }

    /// Lines of a file under `state/`, empty if it was never written
    pub fn state_lines(&self, name: &str) -> Vec<String> {
        read_lines(&self.state().join(name))
    }

    /// Highest live-process count any unit observed
    pub fn peak_sample(&self) -> usize {
        self.state_lines("samples")
            .iter()
            .filter_map(|line| line.trim().parse().ok())
            .max()
            .unwrap_or(0)
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.out().join(name)
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// argv of a shell command as a YAML flow sequence
pub fn sh(script: &str) -> String {
    format!(
        "[\"sh\", \"-c\", {}]",
        serde_json::to_string(script).unwrap()
    )
}

/// A glob stage over the workspace subjects that runs `script`
pub fn subject_stage(id: &str, script: &str) -> String {
    format!(
        r#"
  - id: "{id}"
    source: {{ glob: "{{{{ data_root }}}}/*_bold.nii" }}
    outputs:
      always: ["{{{{ output_root }}}}/{id}/{{{{ key }}}}.npy"]
    env: {{ STATE: "{{{{ state_root }}}}" }}
    command: {command}
"#,
        id = id,
        command = sh(script)
    )
}

pub fn pipeline_from_yaml(yaml: &str) -> Pipeline {
    PipelineDefinition::from_yaml(yaml).unwrap().to_pipeline()
}

/// A pipeline of tracked subject stages
pub fn tracked_pipeline(stage_ids: &[&str]) -> Pipeline {
    let stages: String = stage_ids
        .iter()
        .map(|id| subject_stage(id, TRACKED_SCRIPT))
        .collect();
    pipeline_from_yaml(&format!("name: \"scenario\"\nstages:{}", stages))
}

/// Create the output directory of every stage before a run
pub fn prepare_outputs(ws: &Workspace, stage_ids: &[&str]) {
    for id in stage_ids {
        std::fs::create_dir_all(ws.out().join(id)).unwrap();
    }
}

/// Events captured by a controller's handler
pub type EventLog = Arc<Mutex<Vec<ExecutionEvent>>>;

pub async fn recording_controller() -> (PipelineController<ProcessLauncher>, EventLog) {
    let controller = PipelineController::new(ProcessLauncher::new());
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    controller
        .add_event_handler(move |event| sink.lock().unwrap().push(event))
        .await;
    (controller, events)
}

/// Run to completion with a token nobody cancels
pub async fn run_pipeline(pipeline: &Pipeline, config: &Configuration) -> PipelineResult {
    let controller = PipelineController::new(ProcessLauncher::new());
    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(60), controller.run(pipeline, config, &cancel))
        .await
        .expect("pipeline did not finish within a minute")
        .unwrap()
}

/// Keys of `UnitStarted` events for a stage, in emission order
pub fn started_keys(events: &EventLog, stage_id: &str) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::UnitStarted { stage_id: id, key } if id == stage_id => {
                Some(key.clone())
            }
            _ => None,
        })
        .collect()
}

pub fn stage<'a>(result: &'a PipelineResult, stage_id: &str) -> &'a StageResult {
    result
        .stage(stage_id)
        .unwrap_or_else(|| panic!("stage '{}' has no result", stage_id))
}

pub fn assert_counts(result: &StageResult, completed: usize, failed: usize, skipped: usize) {
    assert_eq!(
        (result.completed, result.failed, result.skipped),
        (completed, failed, skipped),
        "stage '{}' counts (completed, failed, skipped)",
        result.stage_id
    );
}

/// Whether a process with this pid is still running; a zombie awaiting its
/// reaper counts as dead
pub fn process_alive(pid: &str) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        return !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z'));
    }
    std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {} 2>/dev/null", pid)])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
