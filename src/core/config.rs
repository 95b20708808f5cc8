//! Layered configuration resolution
//!
//! Three layers feed one immutable [`Configuration`]:
//!
//! 1. explicit runtime overrides (`--set`, `--jobs`, `--mode`, ...)
//! 2. the persisted defaults file (YAML)
//! 3. hard-coded fallbacks
//!
//! Each parameter takes its whole value from the highest layer that supplies
//! it. Resolution is pure: it only reads the maps it is given.

use crate::core::error::{PipelineError, Result};
use crate::core::mode::ProcessingMode;
use crate::core::Pipeline;
use serde::Serialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// A flat map of parameter name to raw value
pub type RawLayer = BTreeMap<String, Value>;

/// Prefix of per-stage enable flags (`stages.<id>`)
pub const STAGE_FLAG_PREFIX: &str = "stages.";

/// Which layer a parameter was resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Override,
    DefaultsFile,
    Fallback,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Override => "override",
            Layer::DefaultsFile => "defaults file",
            Layer::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Hard-coded fallback values
pub fn builtin_fallbacks() -> RawLayer {
    let mut layer = RawLayer::new();
    layer.insert("concurrency".into(), Value::from(24u64));
    layer.insert("mode".into(), Value::from("both"));
    layer.insert("output_root".into(), Value::from("../data/connectomes"));
    layer.insert("log_root".into(), Value::from("../data/connectomes/logs"));
    layer.insert("scratch_root".into(), Value::from("work"));
    layer.insert("parcels".into(), Value::from(360u64));
    layer.insert("force".into(), Value::from(false));
    layer.insert("continue_on_failure".into(), Value::from(false));
    layer.insert("completion_markers".into(), Value::from(false));
    layer.insert("kill_grace_secs".into(), Value::from(5u64));
    layer
}

/// Default location of the persisted defaults file
pub fn default_defaults_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hyperpipe").join("defaults.yaml"))
}

/// Read a defaults file into a flat layer
pub fn load_defaults_file<P: AsRef<Path>>(path: P) -> Result<RawLayer> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!(
            "cannot read defaults file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_defaults(&content)
        .map_err(|e| PipelineError::config(format!("{} ({})", e, path.display())))
}

/// Parse defaults YAML, flattening nested mappings with `.`
pub fn parse_defaults(yaml: &str) -> Result<RawLayer> {
    let value: Value = serde_yaml::from_str(yaml)
        .map_err(|e| PipelineError::config(format!("invalid defaults YAML: {}", e)))?;

    let mut layer = RawLayer::new();
    match value {
        Value::Null => {}
        Value::Mapping(_) => flatten_into("", &value, &mut layer),
        _ => return Err(PipelineError::config("defaults file must be a YAML mapping")),
    }
    Ok(layer)
}

fn flatten_into(prefix: &str, value: &Value, out: &mut RawLayer) {
    match value {
        Value::Mapping(map) => {
            for (key, nested) in map {
                let key = match key {
                    Value::String(s) => s.clone(),
                    other => scalar_to_string(other).unwrap_or_default(),
                };
                let full_key = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&full_key, nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Parse a `--set key=value` override, reading the value as a YAML scalar
pub fn parse_override(key: &str, raw: &str) -> (String, Value) {
    let value = serde_yaml::from_str::<Value>(raw)
        .ok()
        .filter(|v| !matches!(v, Value::Mapping(_) | Value::Sequence(_) | Value::Null))
        .unwrap_or_else(|| Value::String(raw.to_string()));
    (key.trim().to_string(), value)
}

/// Merges the three layers into a [`Configuration`]
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    overrides: RawLayer,
    defaults: RawLayer,
    fallbacks: RawLayer,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver with built-in fallbacks and empty upper layers
    pub fn new() -> Self {
        Self {
            overrides: RawLayer::new(),
            defaults: RawLayer::new(),
            fallbacks: builtin_fallbacks(),
        }
    }

    pub fn with_overrides(mut self, overrides: RawLayer) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_defaults(mut self, defaults: RawLayer) -> Self {
        self.defaults = defaults;
        self
    }

    /// Resolve the configuration for a pipeline
    ///
    /// Fails when an enabled stage references a parameter that no layer supplies.
    pub fn resolve(&self, pipeline: &Pipeline) -> Result<Configuration> {
        let merged = self.merge();
        let config = Configuration::from_merged(merged)?;

        for key in config.stage_flags.keys() {
            if pipeline.stage(key).is_none() {
                warn!("Enable flag for unknown stage '{}' ignored", key);
            }
        }

        for stage in pipeline.stages.iter().filter(|s| s.is_enabled(&config)) {
            for name in stage.required_parameters() {
                if !config.variables.contains_key(name) {
                    return Err(PipelineError::config(format!(
                        "parameter '{}' required by stage '{}' has no value \
                         (set it with --set {}=... or in the defaults file)",
                        name, stage.id, name
                    )));
                }
            }
        }

        debug!("Resolved {} configuration parameters", config.provenance.len());
        Ok(config)
    }

    fn merge(&self) -> BTreeMap<String, (Value, Layer)> {
        let mut merged = BTreeMap::new();
        let layers = [
            (&self.fallbacks, Layer::Fallback),
            (&self.defaults, Layer::DefaultsFile),
            (&self.overrides, Layer::Override),
        ];
        // Later layers replace earlier ones wholesale
        for (layer, origin) in layers {
            for (key, value) in layer {
                if value.is_null() {
                    continue;
                }
                merged.insert(key.clone(), (value.clone(), origin));
            }
        }
        merged
    }
}

/// Immutable, fully resolved run configuration
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Maximum number of live external processes per batch
    pub concurrency: usize,

    /// Pipeline-wide processing mode
    pub mode: ProcessingMode,

    /// Root of stage outputs
    pub output_root: PathBuf,

    /// Root of stage and unit logs
    pub log_root: PathBuf,

    /// Parent of per-batch scratch directories
    pub scratch_root: PathBuf,

    /// Re-dispatch units whose outputs already exist
    pub force: bool,

    /// Keep running later stages after a stage reports failures
    pub continue_on_failure: bool,

    /// Require a completion marker in addition to non-empty outputs
    pub completion_markers: bool,

    /// How long to wait for a killed child to exit
    pub kill_grace: Duration,

    stage_flags: BTreeMap<String, bool>,
    variables: BTreeMap<String, String>,
    provenance: BTreeMap<String, Layer>,
}

impl Configuration {
    fn from_merged(merged: BTreeMap<String, (Value, Layer)>) -> Result<Self> {
        let mut stage_flags = BTreeMap::new();
        let mut variables = BTreeMap::new();
        let mut provenance = BTreeMap::new();

        for (key, (value, layer)) in &merged {
            provenance.insert(key.clone(), *layer);
            if let Some(stage_id) = key.strip_prefix(STAGE_FLAG_PREFIX) {
                stage_flags.insert(stage_id.to_string(), as_bool(key, value)?);
                continue;
            }
            let text = scalar_to_string(value).ok_or_else(|| {
                PipelineError::config(format!("parameter '{}' must be a scalar value", key))
            })?;
            variables.insert(key.clone(), text);
        }

        let get = |key: &str| -> Result<&Value> {
            merged
                .get(key)
                .map(|(value, _)| value)
                .ok_or_else(|| PipelineError::config(format!("parameter '{}' has no value", key)))
        };

        let concurrency = as_u64("concurrency", get("concurrency")?)?;
        if concurrency == 0 {
            return Err(PipelineError::config("concurrency must be at least 1"));
        }

        let mode = get("mode")?
            .as_str()
            .ok_or_else(|| PipelineError::config("mode must be a string"))?
            .parse::<ProcessingMode>()
            .map_err(PipelineError::config)?;
        // Templates see the canonical name, not an alias
        variables.insert("mode".to_string(), mode.as_str().to_string());

        Ok(Configuration {
            concurrency: concurrency as usize,
            mode,
            output_root: as_path("output_root", get("output_root")?)?,
            log_root: as_path("log_root", get("log_root")?)?,
            scratch_root: as_path("scratch_root", get("scratch_root")?)?,
            force: as_bool("force", get("force")?)?,
            continue_on_failure: as_bool("continue_on_failure", get("continue_on_failure")?)?,
            completion_markers: as_bool("completion_markers", get("completion_markers")?)?,
            kill_grace: Duration::from_secs(as_u64("kill_grace_secs", get("kill_grace_secs")?)?),
            stage_flags,
            variables,
            provenance,
        })
    }

    /// Whether a stage is enabled (stages default to enabled)
    pub fn stage_enabled(&self, stage_id: &str) -> bool {
        self.stage_flags.get(stage_id).copied().unwrap_or(true)
    }

    /// String value of a parameter or template variable
    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    /// Variables available to templates
    pub fn template_variables(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Layer a parameter was resolved from
    pub fn layer_of(&self, key: &str) -> Option<Layer> {
        self.provenance.get(key).copied()
    }

    /// Every resolved parameter with its value and origin
    pub fn describe(&self) -> Vec<(String, String, Layer)> {
        self.provenance
            .iter()
            .map(|(key, layer)| {
                let value = match key.strip_prefix(STAGE_FLAG_PREFIX) {
                    Some(stage) => self.stage_enabled(stage).to_string(),
                    None => self.variables.get(key).cloned().unwrap_or_default(),
                };
                (key.clone(), value, *layer)
            })
            .collect()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_bool(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(PipelineError::config(format!(
                "parameter '{}' must be a boolean, got '{}'",
                key, s
            ))),
        },
        _ => Err(PipelineError::config(format!(
            "parameter '{}' must be a boolean",
            key
        ))),
    }
}

fn as_u64(key: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        PipelineError::config(format!(
            "parameter '{}' must be a non-negative integer",
            key
        ))
    })
}

fn as_path(key: &str, value: &Value) -> Result<PathBuf> {
    scalar_to_string(value)
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| PipelineError::config(format!("parameter '{}' must be a path", key)))
}
