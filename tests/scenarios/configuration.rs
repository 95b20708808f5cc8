//! Test: Configuration - layers from the command line and the defaults file

use crate::helpers::*;
use hyperpipe::cli::{Cli, Command};
use hyperpipe::core::{Layer, PipelineError, ProcessingMode};
use hyperpipe::execution::completion_status;

fn run_args(ws: &Workspace, defaults: &std::path::Path, extra: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "hyperpipe".into(),
        "run".into(),
        "-f".into(),
        "pipeline.yaml".into(),
        "--defaults".into(),
        defaults.display().to_string(),
    ];
    for (key, path) in [
        ("output_root", ws.out()),
        ("log_root", ws.logs()),
        ("scratch_root", ws.work()),
        ("state_root", ws.state()),
    ] {
        args.push("--set".into());
        args.push(format!("{}={}", key, path.display()));
    }
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

/// Command line beats the defaults file, which beats the built-in fallbacks
#[tokio::test]
async fn test_layers_drive_a_run() {
    let ws = Workspace::new();
    ws.subjects(4);
    let defaults = ws.path("defaults.yaml");
    std::fs::write(
        &defaults,
        format!(
            "concurrency: 6\ndata_root: {}\nstages:\n  aligned: false\n",
            ws.data().display()
        ),
    )
    .unwrap();

    let cli = Cli::try_parse_from(run_args(&ws, &defaults, &["-j", "2", "--mode", "union"])).unwrap();
    let Command::Run(cmd) = cli.command else {
        panic!("expected run");
    };

    let pipeline = tracked_pipeline(&["connectomes", "aligned"]);
    let config = cmd.config.resolver().unwrap().resolve(&pipeline).unwrap();

    assert_eq!(config.concurrency, 2);
    assert_eq!(config.layer_of("concurrency"), Some(Layer::Override));
    assert_eq!(config.variable("data_root"), Some(ws.data().display().to_string().as_str()));
    assert_eq!(config.layer_of("data_root"), Some(Layer::DefaultsFile));
    assert_eq!(config.mode, ProcessingMode::Both);
    assert_eq!(config.layer_of("parcels"), Some(Layer::Fallback));
    assert!(!config.stage_enabled("aligned"));

    let result = run_pipeline(&pipeline, &config).await;
    assert_counts(stage(&result, "connectomes"), 4, 0, 0);
    assert!(stage(&result, "connectomes").peak_concurrency <= 2);
    assert!(stage(&result, "aligned").disabled);
}

#[test]
fn test_missing_parameter_names_stage() {
    let ws = Workspace::new();
    let pipeline = tracked_pipeline(&["connectomes"]);

    // data_root comes from nowhere
    let mut overrides = ws.overrides(&[]);
    overrides.remove("data_root");
    let err = hyperpipe::ConfigResolver::new()
        .with_overrides(overrides)
        .resolve(&pipeline)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)));
    let message = err.to_string();
    assert!(message.contains("data_root"), "{}", message);
    assert!(message.contains("connectomes"), "{}", message);
}

/// The status check enumerates without dispatching
#[test]
fn test_status_reports_pending_units() {
    let ws = Workspace::new();
    let keys = ws.subjects(5);
    prepare_outputs(&ws, &["connectomes"]);
    for key in &keys[..2] {
        std::fs::write(ws.output(&format!("connectomes/{}.npy", key)), b"done").unwrap();
    }
    let pipeline = tracked_pipeline(&["connectomes"]);
    let config = ws.configure(&pipeline, &[]);

    let statuses = completion_status(&pipeline, &config).unwrap();

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].total, 5);
    assert_eq!(statuses[0].complete, 2);
    assert_eq!(statuses[0].pending_keys, vec!["sub-03", "sub-04", "sub-05"]);
    assert!(ws.state_lines("dispatched").is_empty());
}
