//! Test: Resumability - skip-if-present, idempotent reruns, force and markers

use crate::helpers::*;

fn write_outputs(ws: &Workspace, stage_id: &str, keys: &[String], content: &[u8]) {
    prepare_outputs(ws, &[stage_id]);
    for key in keys {
        std::fs::write(ws.output(&format!("{}/{}.npy", stage_id, key)), content).unwrap();
    }
}

#[tokio::test]
async fn test_all_outputs_present_dispatches_nothing() {
    let ws = Workspace::new();
    let keys = ws.subjects(10);
    write_outputs(&ws, "connectomes", &keys, b"done");
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[("concurrency", "3")]);

    let result = run_pipeline(&pipeline, &config).await;

    let stage_result = stage(&result, "connectomes");
    assert_counts(stage_result, 0, 0, 10);
    assert_eq!(stage_result.dispatched(), 0);
    assert_eq!(stage_result.peak_concurrency, 0);
    assert!(ws.state_lines("dispatched").is_empty());
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let ws = Workspace::new();
    ws.subjects(5);
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[("concurrency", "2")]);

    let first = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&first, "connectomes"), 5, 0, 0);

    let second = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&second, "connectomes"), 0, 0, 5);
    assert_eq!(ws.state_lines("dispatched").len(), 5);
}

#[tokio::test]
async fn test_force_redispatches_every_unit() {
    let ws = Workspace::new();
    let keys = ws.subjects(4);
    write_outputs(&ws, "connectomes", &keys, b"stale");
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[("force", "true")]);

    let result = run_pipeline(&pipeline, &config).await;

    assert_counts(stage(&result, "connectomes"), 4, 0, 0);
    assert_eq!(ws.state_lines("dispatched").len(), 4);
    let refreshed = std::fs::read_to_string(ws.output("connectomes/sub-01.npy")).unwrap();
    assert_eq!(refreshed.trim(), "both");
}

/// A zero-length output is what an interrupted writer leaves behind
#[tokio::test]
async fn test_empty_output_is_not_complete() {
    let ws = Workspace::new();
    let keys = ws.subjects(3);
    write_outputs(&ws, "connectomes", &keys[..1], b"");
    write_outputs(&ws, "connectomes", &keys[1..], b"done");
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[]);

    let result = run_pipeline(&pipeline, &config).await;

    assert_counts(stage(&result, "connectomes"), 1, 0, 2);
    assert_eq!(ws.state_lines("dispatched"), vec!["connectomes/sub-01"]);
}

#[tokio::test]
async fn test_completion_markers_gate_skipping() {
    let ws = Workspace::new();
    let keys = ws.subjects(3);
    write_outputs(&ws, "connectomes", &keys, b"unverified");
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[("completion_markers", "true")]);

    // Outputs without markers are redone
    let first = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&first, "connectomes"), 3, 0, 0);
    for key in &keys {
        assert!(ws.output(&format!("connectomes/.{}.npy.done", key)).exists());
    }

    let second = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&second, "connectomes"), 0, 0, 3);
}
