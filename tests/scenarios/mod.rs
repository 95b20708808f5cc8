//! Scenario-based tests for hyperpipe

mod configuration;
mod dispatch;
mod failure_policy;
mod history;
mod resumability;
