// portflow/src/config.rs

use crate::error::{PipelineError, PipelineResult};
use std::env;
use std::num::NonZeroUsize;

pub const MAX_PARALLEL_STEPS_VAR: &str = "PORTFLOW_MAX_PARALLEL_STEPS";
pub const BASE_URI_VAR: &str = "PORTFLOW_BASE_URI";

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
  /// Upper bound on concurrently executing atomic steps. Compound steps never hold a slot
  /// while their children run.
  pub max_parallel_steps: usize,
  /// Base against which relative hrefs of document bindings, loads and stores resolve.
  pub base_uri: Option<String>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      max_parallel_steps: std::thread::available_parallelism().map_or(4, NonZeroUsize::get),
      base_uri: None,
    }
  }
}

impl PipelineConfig {
  /// Defaults overridden by `PORTFLOW_MAX_PARALLEL_STEPS` and `PORTFLOW_BASE_URI`.
  pub fn from_env() -> PipelineResult<Self> {
    let get_env = |var_name: &str| env::var(var_name).ok().filter(|value| !value.trim().is_empty());

    let mut config = Self::default();
    if let Some(value) = get_env(MAX_PARALLEL_STEPS_VAR) {
      config.max_parallel_steps = value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|parsed| *parsed > 0)
        .ok_or_else(|| PipelineError::Configuration {
          message: format!("Invalid {} value '{}': expected a positive integer", MAX_PARALLEL_STEPS_VAR, value),
        })?;
    }
    if let Some(value) = get_env(BASE_URI_VAR) {
      config.base_uri = Some(value);
    }

    tracing::debug!(config = ?config, "Pipeline configuration loaded.");
    Ok(config)
  }

  pub fn with_max_parallel_steps(mut self, max_parallel_steps: usize) -> Self {
    self.max_parallel_steps = max_parallel_steps.max(1);
    self
  }

  pub fn with_base_uri(mut self, base_uri: impl Into<String>) -> Self {
    self.base_uri = Some(base_uri.into());
    self
  }
}
