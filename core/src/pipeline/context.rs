// portflow/src/pipeline/context.rs

//! Capabilities shared by a whole run, and the per-task context passed explicitly down
//! every call that needs it.

use crate::config::PipelineConfig;
use crate::document::{DocumentEngine, TreeEngine};
use crate::error::{PipelineError, PipelineResult};
use crate::io::{FileResolver, InputResolver, OutputResolver};
use crate::library::StepLibrary;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct ContextInner {
  engine: Arc<dyn DocumentEngine>,
  input_resolver: Arc<dyn InputResolver>,
  output_resolver: Arc<dyn OutputResolver>,
  library: StepLibrary,
  config: PipelineConfig,
  step_permits: Arc<Semaphore>,
}

/// The external collaborators of a run: document engine, resource resolvers, the library
/// of declared step types and the configuration. Cloning is cheap.
#[derive(Clone)]
pub struct PipelineContext {
  inner: Arc<ContextInner>,
}

impl PipelineContext {
  pub fn builder() -> PipelineContextBuilder {
    PipelineContextBuilder::default()
  }

  pub fn engine(&self) -> &Arc<dyn DocumentEngine> {
    &self.inner.engine
  }

  pub fn input_resolver(&self) -> &Arc<dyn InputResolver> {
    &self.inner.input_resolver
  }

  pub fn output_resolver(&self) -> &Arc<dyn OutputResolver> {
    &self.inner.output_resolver
  }

  pub fn library(&self) -> &StepLibrary {
    &self.inner.library
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.inner.config
  }

  pub fn base_uri(&self) -> Option<&str> {
    self.inner.config.base_uri.as_deref()
  }

  /// Waits for a free atomic-step slot.
  pub(crate) async fn acquire_step_permit(&self) -> PipelineResult<OwnedSemaphorePermit> {
    Arc::clone(&self.inner.step_permits)
      .acquire_owned()
      .await
      .map_err(|_| PipelineError::Internal("Step permit semaphore closed".to_string()))
  }
}

impl Default for PipelineContext {
  fn default() -> Self {
    PipelineContextBuilder::default().build()
  }
}

impl fmt::Debug for PipelineContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PipelineContext")
      .field("config", &self.inner.config)
      .field("library", &self.inner.library.step_types().count())
      .finish()
  }
}

#[derive(Default)]
pub struct PipelineContextBuilder {
  engine: Option<Arc<dyn DocumentEngine>>,
  input_resolver: Option<Arc<dyn InputResolver>>,
  output_resolver: Option<Arc<dyn OutputResolver>>,
  library: Option<StepLibrary>,
  config: Option<PipelineConfig>,
}

impl PipelineContextBuilder {
  pub fn engine(mut self, engine: Arc<dyn DocumentEngine>) -> Self {
    self.engine = Some(engine);
    self
  }

  pub fn input_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
    self.input_resolver = Some(resolver);
    self
  }

  pub fn output_resolver(mut self, resolver: Arc<dyn OutputResolver>) -> Self {
    self.output_resolver = Some(resolver);
    self
  }

  /// Uses `resolver` for both directions.
  pub fn resolver<R: InputResolver + OutputResolver + Clone>(self, resolver: R) -> Self {
    self
      .input_resolver(Arc::new(resolver.clone()))
      .output_resolver(Arc::new(resolver))
  }

  pub fn library(mut self, library: StepLibrary) -> Self {
    self.library = Some(library);
    self
  }

  pub fn config(mut self, config: PipelineConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Unset collaborators default to the tree engine, file resolvers, the built-in step
  /// library and the default configuration.
  pub fn build(self) -> PipelineContext {
    let config = self.config.unwrap_or_default();
    let step_permits = Arc::new(Semaphore::new(config.max_parallel_steps.max(1)));
    PipelineContext {
      inner: Arc::new(ContextInner {
        engine: self.engine.unwrap_or_else(|| Arc::new(TreeEngine::new())),
        input_resolver: self.input_resolver.unwrap_or_else(|| Arc::new(FileResolver)),
        output_resolver: self.output_resolver.unwrap_or_else(|| Arc::new(FileResolver)),
        library: self.library.unwrap_or_else(StepLibrary::core),
        config,
        step_permits,
      }),
    }
  }
}

/// Per-task state that a thread-local would otherwise carry: the iteration a step runs in
/// and the path of enclosing steps (for diagnostics).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskContext {
  pub position: usize,
  pub size: usize,
  pub path: Vec<String>,
}

impl Default for TaskContext {
  fn default() -> Self {
    Self::root()
  }
}

impl TaskContext {
  pub fn root() -> Self {
    Self {
      position: 1,
      size: 1,
      path: Vec::new(),
    }
  }

  /// The context of the children of `step_name`.
  pub fn enter(&self, step_name: &str) -> Self {
    let mut path = self.path.clone();
    path.push(step_name.to_string());
    Self {
      position: self.position,
      size: self.size,
      path,
    }
  }

  /// The context of one iteration of a for-each or viewport.
  pub fn iteration(&self, position: usize, size: usize) -> Self {
    Self {
      position,
      size,
      path: self.path.clone(),
    }
  }

  pub fn path_string(&self) -> String {
    self.path.join("/")
  }
}
