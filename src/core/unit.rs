//! Work units and their completion predicate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One independently processable item of a stage
///
/// Created by the enumerator at stage start and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Unit key (subject identifier or padded partition index)
    pub key: String,

    /// Integer index for range-derived units
    pub index: Option<u64>,

    /// Input file for glob-derived units
    pub input: Option<PathBuf>,

    /// Expected output descriptors
    pub outputs: Vec<PathBuf>,
}

impl WorkUnit {
    /// Check whether the unit's outputs are already in place
    ///
    /// Every output must exist and be non-empty. With `require_marker`, the
    /// completion marker written after a successful exit must exist too.
    pub fn is_complete(&self, require_marker: bool) -> bool {
        if self.outputs.is_empty() {
            return false;
        }
        if !self.outputs.iter().all(|p| output_present(p)) {
            return false;
        }
        if require_marker {
            return self.marker_path().is_some_and(|m| m.exists());
        }
        true
    }

    /// Sidecar marker next to the first output: `.<name>.done`
    pub fn marker_path(&self) -> Option<PathBuf> {
        let first = self.outputs.first()?;
        let name = first.file_name()?.to_string_lossy();
        let parent = first.parent().unwrap_or_else(|| Path::new(""));
        Some(parent.join(format!(".{}.done", name)))
    }
}

/// An output counts as present if it is a non-empty file or a directory with entries
pub fn output_present(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len() > 0,
        Ok(meta) if meta.is_dir() => std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false),
        _ => false,
    }
}

/// Outcome of one unit in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UnitOutcome {
    /// Outputs already present; not dispatched
    Skipped,
    /// External command exited with code 0
    Completed,
    /// External command failed, timed out or could not be spawned
    Failed {
        exit_code: Option<i32>,
        error: String,
    },
}

impl UnitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Skipped => "skipped",
            UnitOutcome::Completed => "completed",
            UnitOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}
