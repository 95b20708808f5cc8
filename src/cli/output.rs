//! CLI output formatting

use crate::{
    core::{config::Configuration, ExecutionStatus, PipelineResult, StageResult},
    execution::{ExecutionEvent, StageStatus},
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Progress bar for one batch at a time
pub fn create_progress_bar() -> ProgressBar {
    let progress = ProgressBar::new(0);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress
}

/// Drive a progress bar from execution events
pub fn update_progress(progress: &ProgressBar, event: &ExecutionEvent) {
    match event {
        ExecutionEvent::BatchStarted { stage_id, units } => {
            progress.reset();
            progress.set_length(*units as u64);
            progress.set_message(stage_id.clone());
            progress.enable_steady_tick(Duration::from_millis(100));
        }
        ExecutionEvent::UnitSkipped { .. } | ExecutionEvent::UnitFinished { .. } => {
            progress.inc(1);
        }
        ExecutionEvent::StageFinished { .. } => progress.finish_and_clear(),
        _ => {}
    }
}

/// Horizontal rule spanning the terminal width
pub fn separator() -> String {
    let width = term_size::dimensions_stdout()
        .map(|(w, _)| w)
        .unwrap_or(80)
        .min(100);
    "─".repeat(width)
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format an execution event for display, if it is worth a line
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline_name,
        } => Some(format!(
            "{} Starting pipeline {} ({})",
            ROCKET,
            style(pipeline_name).bold(),
            style(&run_id.to_string()[..8]).dim()
        )),
        ExecutionEvent::StageStarted {
            stage_id,
            effective_mode,
        } => Some(format!(
            "{} {} ({} mode)",
            SPINNER,
            style(stage_id).cyan(),
            effective_mode
        )),
        ExecutionEvent::StageDisabled { stage_id } => Some(format!(
            "{} {} disabled",
            INFO,
            style(stage_id).dim()
        )),
        ExecutionEvent::UnitFinished {
            stage_id,
            key,
            outcome,
        } if outcome.is_failed() => {
            let detail = match outcome {
                crate::core::UnitOutcome::Failed { error, .. } => error.as_str(),
                _ => "",
            };
            Some(format!(
                "{} {}/{}: {}",
                CROSS,
                style(stage_id).red(),
                style(key).red(),
                style(detail).dim()
            ))
        }
        ExecutionEvent::StageFinished {
            stage_id,
            completed,
            failed,
            skipped,
        } => {
            let icon = if *failed > 0 { CROSS } else { CHECK };
            Some(format!(
                "{} {}: {} completed, {} failed, {} skipped",
                icon,
                style(stage_id).bold(),
                style(completed).green(),
                style(failed).red(),
                style(skipped).dim()
            ))
        }
        _ => None,
    }
}

/// Final aggregate report
pub fn format_report(result: &PipelineResult, not_run: &[String]) -> String {
    let mut lines = vec![separator()];
    lines.push(format!(
        "{} {} - {}",
        INFO,
        style(&result.pipeline_name).bold(),
        format_status(result.status)
    ));
    lines.push(format!(
        "  {:<28} {:>6} {:>10} {:>7} {:>8} {:>6} {:>10}",
        "stage", "mode", "completed", "failed", "skipped", "peak", "elapsed"
    ));
    for stage in &result.stages {
        lines.push(format_stage_row(stage));
    }
    for stage_id in not_run {
        lines.push(format!("  {:<28} {}", stage_id, style("not run").dim()));
    }
    lines.push(format!(
        "  {:<28} {:>6} {:>10} {:>7} {:>8} {:>6} {:>10}",
        style("total").bold(),
        "",
        result.total_completed(),
        result.total_failed(),
        result.total_skipped(),
        "",
        format_duration(result.elapsed)
    ));
    if let Some(stage) = &result.halted_after {
        lines.push(format!(
            "{} Halted after '{}' (stop-on-failure)",
            WARN,
            style(stage).yellow()
        ));
    }
    for stage in result.stages.iter().filter(|s| s.has_failures()) {
        let keys = stage.failed_keys();
        let shown: Vec<&str> = keys.iter().take(10).copied().collect();
        let more = keys.len().saturating_sub(shown.len());
        lines.push(format!(
            "{} {} failed units: {}{}",
            CROSS,
            style(&stage.stage_id).red(),
            shown.join(", "),
            if more > 0 {
                format!(" (+{} more)", more)
            } else {
                String::new()
            }
        ));
    }
    lines.push(separator());
    lines.join("\n")
}

fn format_stage_row(stage: &StageResult) -> String {
    if stage.disabled {
        return format!("  {:<28} {}", stage.stage_id, style("disabled").dim());
    }
    let row = format!(
        "  {:<28} {:>6} {:>10} {:>7} {:>8} {:>6} {:>10}",
        stage.stage_id,
        stage.effective_mode.as_str(),
        stage.completed,
        stage.failed,
        stage.skipped,
        stage.peak_concurrency,
        format_duration(stage.elapsed)
    );
    match &stage.input_missing {
        Some(reason) => format!("{}\n    {} {}", row, WARN, style(reason).dim()),
        None => row,
    }
}

/// Resolved configuration with provenance
pub fn format_configuration(config: &Configuration) -> String {
    config
        .describe()
        .into_iter()
        .map(|(key, value, layer)| {
            format!(
                "  {:<28} {:<40} {}",
                style(key).cyan(),
                value,
                style(format!("({})", layer)).dim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per stage of the completeness check
pub fn format_stage_status(status: &StageStatus) -> String {
    if status.disabled {
        return format!("  {} {}", style(&status.stage_id).dim(), style("disabled").dim());
    }
    if let Some(reason) = &status.input_missing {
        return format!("  {} {} {}", WARN, style(&status.stage_id).yellow(), reason);
    }
    let icon = if status.pending() == 0 { CHECK } else { SPINNER };
    let mut line = format!(
        "  {}{} ({} mode): {}/{} complete",
        icon,
        style(&status.stage_id).bold(),
        status.effective_mode,
        style(status.complete).green(),
        status.total
    );
    if !status.pending_keys.is_empty() {
        let more = status.pending().saturating_sub(status.pending_keys.len());
        line.push_str(&format!(
            "\n      pending: {}{}",
            status.pending_keys.join(", "),
            if more > 0 {
                format!(" (+{} more)", more)
            } else {
                String::new()
            }
        ));
    }
    line
}

/// Format a run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} - {} completed, {} failed, {} skipped - {}",
        status_icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.completed_units,
        summary.failed_units,
        summary.skipped_units,
        style(summary.started_at.format("%Y-%m-%d %H:%M")).dim()
    )
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
