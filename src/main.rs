mod cli;
mod core;
mod execution;
mod persistence;

use anyhow::{Context, Result};
use cli::commands::{ConfigCommand, HistoryCommand, RunCommand, StatusCommand, ValidateCommand};
use cli::output::*;
use cli::{Cli, Command};
use crate::core::definition::PipelineDefinition;
use crate::core::{Configuration, ExecutionStatus, Pipeline, PipelineResult};
use execution::{completion_status, PipelineController, ProcessLauncher};
use persistence::{create_summary, InMemoryPersistence, PersistenceBackend, RunSummary};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after an external interruption
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    // Execute command
    let code = match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Config(cmd) => show_config(cmd)?,
        Command::Status(cmd) => show_status(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_pipeline(file: &str) -> Result<Pipeline> {
    let definition = PipelineDefinition::from_file(file)
        .with_context(|| format!("Failed to load pipeline definition {}", file))?;
    Ok(definition.to_pipeline())
}

/// Resolve the configuration, printing the error instead of failing
fn resolve_config(
    pipeline: &Pipeline,
    args: &cli::commands::ConfigArgs,
) -> Result<Option<Configuration>> {
    match args.resolver()?.resolve(pipeline) {
        Ok(config) => Ok(Some(config)),
        Err(e) => {
            println!("{} {}", CROSS, style(e).red());
            Ok(None)
        }
    }
}

/// Cancel the token on ctrl-c or SIGTERM
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        warn!("Termination requested; stopping live units");
        cancel.cancel();
    });
}

async fn open_history(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    #[cfg(feature = "sqlite")]
    {
        if !no_history {
            return Ok(Arc::new(persistence::SqliteRunStore::with_default_path().await?));
        }
    }
    #[cfg(not(feature = "sqlite"))]
    let _ = no_history;
    Ok(Arc::new(InMemoryPersistence::new()))
}

async fn run_pipeline(cmd: &RunCommand) -> Result<i32> {
    let pipeline = load_pipeline(&cmd.file)?;
    println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());
    if let Some(description) = &pipeline.description {
        println!("  {}", style(description).dim());
    }

    let Some(config) = resolve_config(&pipeline, &cmd.config)? else {
        return Ok(1);
    };

    let store = open_history(cmd.no_history).await?;

    let controller = PipelineController::new(ProcessLauncher::new());

    // Console output: progress for the current batch, one line per notable event
    if !cmd.json {
        let progress = create_progress_bar();
        controller
            .add_event_handler(move |event| {
                if let Some(line) = format_execution_event(&event) {
                    progress.suspend(|| println!("{}", line));
                }
                update_progress(&progress, &event);
            })
            .await;
    }

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    println!();
    let result = match controller.run(&pipeline, &config, &cancel).await {
        Ok(result) => result,
        Err(e) => {
            error!("Pipeline {} aborted: {}", pipeline.name, e);
            println!(
                "\n{} {} {}",
                CROSS,
                style(&pipeline.name).bold(),
                style("aborted").red()
            );
            return Ok(1);
        }
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\n{}", format_report(&result, &not_run(&pipeline, &config, &result)));
    }

    if !cmd.no_history {
        let summary = create_summary(&result);
        store.save_run(&summary).await?;
        println!(
            "{} Run saved to history (ID: {})",
            INFO,
            style(&summary.run_id.to_string()[..8]).dim()
        );
    }

    Ok(match result.status {
        ExecutionStatus::Cancelled => {
            println!("{} {} {}", WARN, style(&pipeline.name).bold(), style("interrupted").yellow());
            EXIT_INTERRUPTED
        }
        _ if result.has_failures() => {
            println!("{} {} {}", CROSS, style(&pipeline.name).bold(), style("had failures").red());
            1
        }
        _ => {
            println!(
                "{} {} completed {}",
                CHECK,
                style(&pipeline.name).bold(),
                style("successfully").green()
            );
            0
        }
    })
}

/// Enabled stages that never got a result
fn not_run(pipeline: &Pipeline, config: &Configuration, result: &PipelineResult) -> Vec<String> {
    pipeline
        .enabled_stages(config)
        .filter(|stage| result.stage(&stage.id).is_none())
        .map(|stage| stage.id.clone())
        .collect()
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<i32> {
    println!("{} Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Name: {}", style(&definition.name).bold());
            println!("  Stages: {}", style(definition.stages.len()).cyan());
            let pipeline = definition.to_pipeline();
            for stage in &pipeline.stages {
                let params: Vec<&str> = stage.required_parameters().iter().map(String::as_str).collect();
                println!(
                    "    {} {}",
                    style(&stage.id).cyan(),
                    style(format!("requires: {}", params.join(", "))).dim()
                );
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&definition)?;
                println!("\n{}", json);
            }
            Ok(0)
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(1)
        }
    }
}

fn show_config(cmd: &ConfigCommand) -> Result<i32> {
    let pipeline = load_pipeline(&cmd.file)?;
    let Some(config) = resolve_config(&pipeline, &cmd.config)? else {
        return Ok(1);
    };

    if cmd.json {
        let entries: Vec<_> = config
            .describe()
            .into_iter()
            .map(|(key, value, layer)| serde_json::json!({ "key": key, "value": value, "layer": layer }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }

    println!("{} Configuration for {}:", INFO, style(&pipeline.name).bold());
    println!("{}", format_configuration(&config));
    println!("\n{} Stages:", INFO);
    for stage in &pipeline.stages {
        let enabled = if stage.is_enabled(&config) {
            style("enabled").green()
        } else {
            style("disabled").dim()
        };
        let mode = stage.effective_mode(config.mode);
        let corrected = match stage.applied_rule(config.mode) {
            Some(rule) => format!(
                " (corrected from {}{})",
                config.mode,
                rule.reason
                    .as_deref()
                    .map(|r| format!(": {}", r))
                    .unwrap_or_default()
            ),
            None => String::new(),
        };
        println!("  {:<28} {} {}{}", stage.id, enabled, mode, style(corrected).dim());
    }
    Ok(0)
}

fn show_status(cmd: &StatusCommand) -> Result<i32> {
    let pipeline = load_pipeline(&cmd.file)?;
    let Some(config) = resolve_config(&pipeline, &cmd.config)? else {
        return Ok(1);
    };

    let statuses = completion_status(&pipeline, &config)
        .with_context(|| format!("Failed to check {}", pipeline.name))?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(0);
    }

    println!("{} Completion status for {} ({} mode):", INFO, style(&pipeline.name).bold(), config.mode);
    for status in &statuses {
        println!("{}", format_stage_status(status));
    }
    Ok(0)
}

async fn show_history(cmd: &HistoryCommand) -> Result<i32> {
    let store = open_history(false).await?;

    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary, cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(0);
    }

    let runs = store.list_runs(cmd.pipeline.as_deref(), cmd.limit).await?;

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(0);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(0);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(0)
}

fn print_run_details(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
    }
    if let Some(duration) = summary.duration() {
        println!("  Duration: {}", style(format_duration(duration)).dim());
    }
    println!(
        "  Units: {} completed, {} failed, {} skipped across {} stage(s)",
        style(summary.completed_units).green(),
        style(summary.failed_units).red(),
        summary.skipped_units,
        summary.stages_run
    );
    if let Some(stage) = &summary.halted_after {
        println!("  Halted after: {}", style(stage).yellow());
    }

    Ok(())
}
