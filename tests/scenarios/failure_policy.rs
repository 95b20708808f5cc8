//! Test: Failure Policy - fail-soft batches, stop-on-failure and continuation

use crate::helpers::*;
use hyperpipe::core::{ExecutionStatus, UnitOutcome};
use hyperpipe::persistence::runlog::{read_runlog, runlog_path, RunLogEntry};

/// Fails sub-03 with exit code 3, behaves like the tracked script otherwise
const FAIL_THIRD: &str = r#"
echo "$HYPERPIPE_STAGE/$HYPERPIPE_UNIT_KEY" >> "$STATE/dispatched"
if [ "$HYPERPIPE_UNIT_KEY" = "sub-03" ]; then
  echo "singular matrix" >&2
  exit 3
fi
mkdir -p "$(dirname "$HYPERPIPE_OUTPUT")"
echo ok > "$HYPERPIPE_OUTPUT"
"#;

fn failing_then_tracked(continue_on_failure: Option<bool>) -> hyperpipe::core::Pipeline {
    let header = match continue_on_failure {
        Some(value) => format!("name: \"policy\"\ncontinue_on_failure: {}\nstages:", value),
        None => "name: \"policy\"\nstages:".to_string(),
    };
    pipeline_from_yaml(&format!(
        "{}{}{}",
        header,
        subject_stage("connectomes", FAIL_THIRD),
        subject_stage("hyperalignment", TRACKED_SCRIPT)
    ))
}

#[tokio::test]
async fn test_failed_unit_does_not_stop_siblings() {
    let ws = Workspace::new();
    ws.subjects(5);
    let pipeline = failing_then_tracked(None);
    let config = ws.configure(&pipeline, &[("concurrency", "2")]);

    let result = run_pipeline(&pipeline, &config).await;

    let connectomes = stage(&result, "connectomes");
    assert_counts(connectomes, 4, 1, 0);
    assert_eq!(connectomes.failed_keys(), vec!["sub-03"]);
    let failed = connectomes.units.iter().find(|r| r.key == "sub-03").unwrap();
    assert_eq!(
        failed.outcome,
        UnitOutcome::Failed {
            exit_code: Some(3),
            error: "exited with code 3".to_string()
        }
    );

    // The run log carries every unit and the summary
    let entries = read_runlog(&runlog_path(&ws.logs(), "connectomes")).unwrap();
    assert_eq!(entries.len(), 6);
    match entries.last().unwrap() {
        RunLogEntry::Summary {
            completed,
            failed,
            interrupted,
            ..
        } => {
            assert_eq!((*completed, *failed, *interrupted), (4, 1, false));
        }
        other => panic!("expected summary, got {:?}", other),
    }

    let log = std::fs::read_to_string(ws.logs().join("connectomes").join("sub-03.log")).unwrap();
    assert!(log.contains("singular matrix"));
}

#[tokio::test]
async fn test_stop_on_failure_halts_later_stages() {
    let ws = Workspace::new();
    ws.subjects(4);
    let pipeline = failing_then_tracked(None);
    let config = ws.configure(&pipeline, &[]);

    let result = run_pipeline(&pipeline, &config).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.halted_after.as_deref(), Some("connectomes"));
    assert_eq!(result.stages.len(), 1);
    assert!(result.stage("hyperalignment").is_none());
    assert!(!ws
        .state_lines("dispatched")
        .iter()
        .any(|line| line.starts_with("hyperalignment/")));
}

#[tokio::test]
async fn test_continue_on_failure_override() {
    let ws = Workspace::new();
    ws.subjects(4);
    let pipeline = failing_then_tracked(None);
    let config = ws.configure(&pipeline, &[("continue_on_failure", "true")]);

    let result = run_pipeline(&pipeline, &config).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.halted_after.is_none());
    assert_counts(stage(&result, "connectomes"), 3, 1, 0);
    assert_counts(stage(&result, "hyperalignment"), 4, 0, 0);
}

/// The pipeline file's own policy applies when no layer above the
/// fallback sets one
#[tokio::test]
async fn test_pipeline_declared_continuation() {
    let ws = Workspace::new();
    ws.subjects(4);
    let pipeline = failing_then_tracked(Some(true));

    let config = ws.configure(&pipeline, &[]);
    let result = run_pipeline(&pipeline, &config).await;
    assert!(result.stage("hyperalignment").is_some());

    let ws = Workspace::new();
    ws.subjects(4);
    let config = ws.configure(&pipeline, &[("continue_on_failure", "false")]);
    let result = run_pipeline(&pipeline, &config).await;
    assert_eq!(result.halted_after.as_deref(), Some("connectomes"));
}

#[tokio::test]
async fn test_unit_timeout_is_a_failure() {
    let ws = Workspace::new();
    ws.subjects(2);
    let yaml = format!(
        r#"
name: "timeouts"
stages:
  - id: "slow"
    source: {{ glob: "{{{{ data_root }}}}/*_bold.nii" }}
    outputs:
      always: ["{{{{ output_root }}}}/{{{{ key }}}}.npy"]
    timeout_secs: 1
    command: {}
"#,
        sh("exec sleep 30")
    );
    let pipeline = pipeline_from_yaml(&yaml);
    let config = ws.configure(&pipeline, &[]);

    let started = std::time::Instant::now();
    let result = run_pipeline(&pipeline, &config).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(15));
    let slow = stage(&result, "slow");
    assert_counts(slow, 0, 2, 0);
    for record in &slow.units {
        match &record.outcome {
            UnitOutcome::Failed { exit_code, error } => {
                assert!(exit_code.is_none());
                assert!(error.contains("timed out"), "{}", error);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_missing_program_fails_units() {
    let ws = Workspace::new();
    ws.subjects(2);
    let yaml = r#"
name: "missing"
stages:
  - id: "fit"
    source: { glob: "{{ data_root }}/*_bold.nii" }
    outputs:
      always: ["{{ output_root }}/{{ key }}.npy"]
    command: ["/nonexistent/hyperalign", "{{ input }}"]
"#;
    let pipeline = pipeline_from_yaml(yaml);
    let config = ws.configure(&pipeline, &[]);

    let result = run_pipeline(&pipeline, &config).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_counts(stage(&result, "fit"), 0, 2, 0);
}
