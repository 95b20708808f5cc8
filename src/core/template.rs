//! `{{ name }}` placeholder rendering for paths and command templates

use crate::core::error::{PipelineError, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Names of all placeholders referenced by a template
pub fn placeholders(template: &str) -> BTreeSet<String> {
    placeholder_regex()
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitute every placeholder; an unknown name is a configuration error
pub fn render(template: &str, variables: &HashMap<String, String>) -> Result<String> {
    let mut missing = None;
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures<'_>| {
        match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(PipelineError::config(format!(
            "template '{}' references unknown parameter '{}'",
            template, name
        ))),
        None => Ok(rendered.into_owned()),
    }
}
