// portflow/src/pipeline/definition.rs

//! Contains [`Pipeline`], a root step ready to run: the step tree, the context it runs
//! with, and whatever the caller supplies on its ports, options and parameters.

use super::context::PipelineContext;
use crate::core::binding::PortBinding;
use crate::core::port::PortReference;
use crate::core::qname::QName;
use crate::core::step::Step;
use crate::document::Document;
use crate::environment::{Environment, EnvironmentPort};
use crate::error::PipelineResult;
use tracing::{event, instrument, Level};

/// A root step plus its run context.
///
/// ```ignore
/// let outcome = Pipeline::new(step, PipelineContext::default())
///   .with_input("source", vec![document])
///   .with_option("mode", "fast")
///   .run()
///   .await?;
/// let result = outcome.read_nodes("result")?;
/// ```
#[derive(Clone, Debug)]
pub struct Pipeline {
  step: Step,
  context: PipelineContext,
}

impl Pipeline {
  /// Unnamed steps of the tree get names from their position, see
  /// [`Step::with_implicit_names`].
  pub fn new(step: Step, context: PipelineContext) -> Self {
    Self {
      step: step.with_implicit_names(),
      context,
    }
  }

  /// Sets an option of the root step to a literal value.
  pub fn with_option(mut self, name: impl Into<QName>, value: impl Into<String>) -> Self {
    self.step = self.step.set_option(name, value);
    self
  }

  /// Sets a parameter of the root step to a literal value.
  pub fn with_param(mut self, name: impl Into<QName>, value: impl Into<String>) -> Self {
    self.step = self.step.set_parameter(name, value);
    self
  }

  /// Feeds `documents`, in order, to the input port `port_name` of the root step,
  /// replacing its bindings.
  ///
  /// # Panics
  /// Panics if the root step declares no such port.
  pub fn with_input(mut self, port_name: &str, documents: Vec<Document>) -> Self {
    let Some(port) = self.step.get_port(port_name) else {
      panic!(
        "Portflow setup error: Port '{}' not declared on pipeline '{}'.",
        port_name,
        self.step.name()
      );
    };
    let bindings = if documents.is_empty() {
      vec![PortBinding::Empty]
    } else {
      documents.into_iter().map(PortBinding::inline).collect()
    };
    let port = port.clone().with_bindings(bindings);
    self.step = self.step.with_port(port);
    self
  }

  pub fn step(&self) -> &Step {
    &self.step
  }

  pub fn context(&self) -> &PipelineContext {
    &self.context
  }

  /// Validates the step tree, then runs it.
  #[instrument(name = "Pipeline::run", skip_all, fields(pipeline = %self.step.name()), err(Display))]
  pub async fn run(&self) -> PipelineResult<PipelineOutcome> {
    event!(Level::INFO, step_type = %self.step.step_type(), "Running pipeline.");
    let environment = crate::run(&self.step, &self.context).await?;
    event!(Level::INFO, "Pipeline completed.");
    Ok(PipelineOutcome {
      step: self.step.clone(),
      environment,
    })
  }
}

/// What a run left behind: the environment following the root step.
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
  step: Step,
  environment: Environment,
}

impl PipelineOutcome {
  pub fn environment(&self) -> &Environment {
    &self.environment
  }

  /// Reads the port `port_name` of the root step.
  pub fn read_nodes(&self, port_name: &str) -> PipelineResult<Vec<Document>> {
    self.environment.read_nodes(&self.step.port_reference(port_name))
  }

  /// Reads any port the run left readable.
  pub fn read_port(&self, reference: &PortReference) -> PipelineResult<Vec<Document>> {
    self.environment.read_nodes(reference)
  }

  /// The environment port the root step's primary output resolved to, if any.
  pub fn default_readable_port(&self) -> Option<&EnvironmentPort> {
    self.environment.default_readable_port()
  }
}
