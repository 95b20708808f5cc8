//! Test: Dispatch - ceiling, order, unit logs and per-unit environment

use crate::helpers::*;
use hyperpipe::core::ProcessingMode;
use tokio_util::sync::CancellationToken;

/// Ten units with no outputs under a ceiling of three
#[tokio::test]
async fn test_ten_units_ceiling_three() {
    let ws = Workspace::new();
    let keys = ws.subjects(10);
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[("concurrency", "3")]);

    let (controller, events) = recording_controller().await;
    let result = controller
        .run(&pipeline, &config, &CancellationToken::new())
        .await
        .unwrap();

    let stage_result = stage(&result, "connectomes");
    assert_counts(stage_result, 10, 0, 0);
    assert_eq!(stage_result.effective_mode, ProcessingMode::Both);
    assert_eq!(stage_result.peak_concurrency, 3);
    assert!(ws.peak_sample() <= 3, "observed {} live units", ws.peak_sample());
    assert_eq!(ws.state_lines("dispatched").len(), 10);

    // Dispatch follows enumeration order
    assert_eq!(started_keys(&events, "connectomes"), keys);

    for key in &keys {
        let output = ws.output(&format!("connectomes/{}.npy", key));
        assert_eq!(std::fs::read_to_string(output).unwrap().trim(), "both");
    }
}

#[tokio::test]
async fn test_ceiling_of_one_serializes_units() {
    let ws = Workspace::new();
    ws.subjects(4);
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[("concurrency", "1")]);

    let result = run_pipeline(&pipeline, &config).await;

    assert_counts(stage(&result, "connectomes"), 4, 0, 0);
    assert_eq!(stage(&result, "connectomes").peak_concurrency, 1);
    assert_eq!(ws.peak_sample(), 1);
}

/// Child stdout and stderr land in the unit's own log file
#[tokio::test]
async fn test_unit_logs_capture_output() {
    let ws = Workspace::new();
    ws.subjects(2);
    let yaml = format!(
        "name: \"logs\"\nstages:{}",
        subject_stage(
            "connectomes",
            r#"echo "fitting $HYPERPIPE_UNIT_KEY"; echo "warning from $HYPERPIPE_UNIT_KEY" >&2; mkdir -p "$(dirname "$HYPERPIPE_OUTPUT")"; echo ok > "$HYPERPIPE_OUTPUT""#
        )
    );
    let pipeline = pipeline_from_yaml(&yaml);
    let config = ws.configure(&pipeline, &[]);

    let result = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&result, "connectomes"), 2, 0, 0);

    let log = std::fs::read_to_string(ws.logs().join("connectomes").join("sub-02.log")).unwrap();
    assert!(log.contains("fitting sub-02"));
    assert!(log.contains("warning from sub-02"));
    assert!(!log.contains("sub-01"));
}

/// Range units get padded keys, their index and the stage env
#[tokio::test]
async fn test_range_stage_environment() {
    let ws = Workspace::new();
    let yaml = format!(
        r#"
name: "parcels"
stages:
  - id: "hyperalignment"
    source: {{ range: {{ start: 1, end: "{{{{ parcels }}}}", pad: 3 }} }}
    outputs:
      always: ["{{{{ output_root }}}}/parcel_{{{{ key }}}}.txt"]
    env: {{ ATLAS: "glasser-{{{{ parcels }}}}" }}
    command: {}
"#,
        sh(r#"echo "$HYPERPIPE_UNIT_INDEX $ATLAS $HYPERPIPE_MODE" > "$HYPERPIPE_OUTPUT""#)
    );
    let pipeline = pipeline_from_yaml(&yaml);
    let config = ws.configure(&pipeline, &[("parcels", "4"), ("mode", "full")]);

    let result = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&result, "hyperalignment"), 4, 0, 0);

    let content = std::fs::read_to_string(ws.output("parcel_003.txt")).unwrap();
    assert_eq!(content.trim(), "3 glasser-4 full");
    assert!(!ws.output("parcel_005.txt").exists());
}

/// A shared scratch directory exists during the batch and is gone after it
#[tokio::test]
async fn test_scratch_lives_for_one_batch() {
    let ws = Workspace::new();
    ws.subjects(3);
    let yaml = format!(
        r#"
name: "scratch"
stages:
  - id: "fit"
    source: {{ glob: "{{{{ data_root }}}}/*_bold.nii" }}
    outputs:
      always: ["{{{{ output_root }}}}/{{{{ key }}}}.npy"]
    scratch: true
    command: {}
"#,
        sh(r#"test -d "$HYPERPIPE_SCRATCH" && touch "$HYPERPIPE_SCRATCH/$HYPERPIPE_UNIT_KEY" && echo "$HYPERPIPE_SCRATCH" > "$HYPERPIPE_OUTPUT""#)
    );
    let pipeline = pipeline_from_yaml(&yaml);
    let config = ws.configure(&pipeline, &[]);

    let result = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&result, "fit"), 3, 0, 0);

    // Every unit saw the same directory, under scratch_root
    let seen: Vec<String> = ["sub-01", "sub-02", "sub-03"]
        .iter()
        .map(|key| {
            std::fs::read_to_string(ws.output(&format!("{}.npy", key)))
                .unwrap()
                .trim()
                .to_string()
        })
        .collect();
    assert!(seen.iter().all(|dir| dir == &seen[0]));
    assert!(seen[0].starts_with(&ws.work().display().to_string()));

    assert_eq!(std::fs::read_dir(ws.work()).unwrap().count(), 0);
}
