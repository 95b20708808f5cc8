//! Work unit discovery
//!
//! A stage's source is either a glob over one directory or a closed integer
//! range. Units come back in a deterministic order (lexicographic file names,
//! ascending integers) because dispatch order follows it.

use crate::core::{
    config::Configuration,
    definition::RangeBound,
    error::{PipelineError, Result},
    mode::ProcessingMode,
    stage::{Stage, UnitSource},
    template,
    unit::WorkUnit,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Variables visible to a unit's templates
///
/// The configuration variables plus `stage`, `mode` (the effective mode),
/// `key`, `index` and `input`.
pub fn unit_variables(
    base: &HashMap<String, String>,
    stage_id: &str,
    mode: ProcessingMode,
    key: &str,
    index: Option<u64>,
    input: Option<&Path>,
) -> HashMap<String, String> {
    let mut vars = base.clone();
    vars.insert("stage".to_string(), stage_id.to_string());
    vars.insert("mode".to_string(), mode.as_str().to_string());
    vars.insert("key".to_string(), key.to_string());
    vars.insert(
        "index".to_string(),
        index.map(|i| i.to_string()).unwrap_or_default(),
    );
    vars.insert(
        "input".to_string(),
        input.map(|p| p.display().to_string()).unwrap_or_default(),
    );
    vars
}

/// Enumerate the work units of a stage under its effective mode
///
/// Returns `InputNotFound` when nothing is found or the range is empty;
/// callers treat that as a logged, non-fatal condition. Two units that
/// render the same output path are a configuration error.
pub fn enumerate(
    stage: &Stage,
    config: &Configuration,
    mode: ProcessingMode,
) -> Result<Vec<WorkUnit>> {
    let base = config.template_variables();
    let mut source_vars = base.clone();
    source_vars.insert("stage".to_string(), stage.id.clone());
    source_vars.insert("mode".to_string(), mode.as_str().to_string());

    let discovered = match &stage.source {
        UnitSource::Glob(pattern) => {
            let pattern = template::render(pattern, &source_vars)?;
            discover_files(&stage.id, &pattern)?
        }
        UnitSource::Range { start, end, pad } => {
            let start = resolve_bound(&stage.id, start, &source_vars)?;
            let end = resolve_bound(&stage.id, end, &source_vars)?;
            numbered_range(&stage.id, start, end, *pad)?
        }
    };

    let templates = stage.outputs.for_mode(mode);
    let mut seen_outputs = HashSet::new();
    let mut units = Vec::with_capacity(discovered.len());

    for (key, index, input) in discovered {
        let vars = unit_variables(&base, &stage.id, mode, &key, index, input.as_deref());
        let mut outputs = Vec::with_capacity(templates.len());
        for output in &templates {
            let path = PathBuf::from(template::render(output, &vars)?);
            if !seen_outputs.insert(path.clone()) {
                return Err(PipelineError::config(format!(
                    "stage '{}' renders output '{}' for more than one unit",
                    stage.id,
                    path.display()
                )));
            }
            outputs.push(path);
        }

        units.push(WorkUnit {
            key,
            index,
            input,
            outputs,
        });
    }

    debug!("Stage '{}' enumerated {} units", stage.id, units.len());
    Ok(units)
}

type Discovered = (String, Option<u64>, Option<PathBuf>);

fn discover_files(stage_id: &str, pattern: &str) -> Result<Vec<Discovered>> {
    let path = Path::new(pattern);
    let file_pattern = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let matcher = key_regex(&file_pattern)?;

    let entries = std::fs::read_dir(&dir).map_err(|e| PipelineError::InputNotFound {
        stage: stage_id.to_string(),
        reason: format!("cannot read directory {}: {}", dir.display(), e),
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut seen_keys = HashSet::new();
    let mut discovered = Vec::new();
    for name in names {
        let Some(caps) = matcher.captures(&name) else {
            continue;
        };
        let key = caps[1].to_string();
        // First input in lexicographic order wins
        if seen_keys.insert(key.clone()) {
            discovered.push((key, None, Some(dir.join(&name))));
        }
    }

    if discovered.is_empty() {
        return Err(PipelineError::InputNotFound {
            stage: stage_id.to_string(),
            reason: format!("no files match '{}'", pattern),
        });
    }

    Ok(discovered)
}

/// Regex for a file-name glob; the first `*` captures the unit key
fn key_regex(file_pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    let mut captured = false;
    for c in file_pattern.chars() {
        match c {
            '*' if !captured => {
                regex.push_str("(.+?)");
                captured = true;
            }
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    if !captured {
        return Err(PipelineError::config(format!(
            "glob '{}' has no '*' to derive unit keys from",
            file_pattern
        )));
    }

    Regex::new(&regex).map_err(|e| PipelineError::config(format!("invalid glob '{}': {}", file_pattern, e)))
}

fn resolve_bound(
    stage_id: &str,
    bound: &RangeBound,
    vars: &HashMap<String, String>,
) -> Result<i64> {
    match bound {
        RangeBound::Fixed(value) => Ok(*value),
        RangeBound::Template(text) => {
            let rendered = template::render(text, vars)?;
            rendered.trim().parse().map_err(|_| {
                PipelineError::config(format!(
                    "stage '{}' range bound '{}' is not an integer (got '{}')",
                    stage_id, text, rendered
                ))
            })
        }
    }
}

fn numbered_range(stage_id: &str, start: i64, end: i64, pad: usize) -> Result<Vec<Discovered>> {
    if end < start {
        return Err(PipelineError::InputNotFound {
            stage: stage_id.to_string(),
            reason: format!("invalid range {}..={} (end < start)", start, end),
        });
    }
    if start < 0 {
        return Err(PipelineError::config(format!(
            "stage '{}' range must not start below zero (got {})",
            stage_id, start
        )));
    }

    Ok((start as u64..=end as u64)
        .map(|i| (format!("{:0width$}", i, width = pad), Some(i), None))
        .collect())
}
