//! Pipeline domain model

use crate::core::{
    config::{Configuration, Layer},
    definition::PipelineDefinition,
    stage::Stage,
};

/// An ordered list of stages plus the pipeline's continuation default
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Optional description
    pub description: Option<String>,

    /// Stages in execution order
    pub stages: Vec<Stage>,

    /// Continuation default declared by the pipeline file
    pub continue_on_failure: Option<bool>,
}

impl Pipeline {
    /// Create a pipeline from its definition
    pub fn from_definition(definition: &PipelineDefinition) -> Self {
        Pipeline {
            name: definition.name.clone(),
            description: definition.description.clone(),
            stages: definition.stages.iter().map(Stage::from_config).collect(),
            continue_on_failure: definition.continue_on_failure,
        }
    }

    /// Get a stage by ID
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Stages enabled under the configuration, in order
    pub fn enabled_stages<'a>(&'a self, config: &'a Configuration) -> impl Iterator<Item = &'a Stage> {
        self.stages.iter().filter(move |s| s.is_enabled(config))
    }

    /// Continuation policy for a run
    ///
    /// An explicit override or defaults-file value wins; otherwise the
    /// pipeline file's own setting, then the fallback.
    pub fn continues_on_failure(&self, config: &Configuration) -> bool {
        match config.layer_of("continue_on_failure") {
            Some(Layer::Override) | Some(Layer::DefaultsFile) => config.continue_on_failure,
            _ => self
                .continue_on_failure
                .unwrap_or(config.continue_on_failure),
        }
    }
}
