// portflow/src/core/processor.rs

//! The step invocation protocol.
//!
//! Every step is run through a [`StepProcessor`]: `run(step, environment) -> environment`.
//! The environment passed in is the *caller's* environment (what the previous sibling left
//! behind); the returned one is what the next sibling sees.
//!
//! Leaf steps usually implement the narrower [`AtomicProcessor`] and are wrapped in
//! [`AtomicStep`], which takes care of the environment bookkeeping around the body:
//! entering the step scope, writing the produced documents, and re-designating the
//! default readable port.

use crate::core::port::PortReference;
use crate::core::step::Step;
use crate::document::Document;
use crate::environment::Environment;
use crate::error::PipelineResult;
use crate::pipeline::context::TaskContext;
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{event, instrument, Level};

/// Compound and leaf behavior are told apart by this tag, not by downcasting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
  /// A leaf step: reads its inputs, writes its outputs.
  Atomic,
  /// A built-in compound step running a subpipeline (group, for-each, choose, ...).
  Compound,
  /// A declared pipeline. Renaming an instance keeps the declared name as its internal name.
  Pipeline,
}

/// Whether a step touches resources outside the document flow (files, network).
///
/// Used by the subpipeline scheduler to order siblings that have no document
/// dependency between them. Both default to `true`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalResources {
  pub read: bool,
  pub write: bool,
}

impl ExternalResources {
  pub const NONE: ExternalResources = ExternalResources {
    read: false,
    write: false,
  };

  pub fn new(read: bool, write: bool) -> Self {
    Self { read, write }
  }
}

impl Default for ExternalResources {
  fn default() -> Self {
    Self {
      read: true,
      write: true,
    }
  }
}

#[async_trait]
pub trait StepProcessor: Send + Sync + 'static {
  fn kind(&self) -> ProcessorKind;

  fn external_resources(&self) -> ExternalResources {
    ExternalResources::default()
  }

  /// Runs `step` against the caller's `environment` and returns the environment its
  /// following sibling sees.
  async fn run(&self, step: &Step, environment: Environment, task: &TaskContext) -> PipelineResult<Environment>;
}

/// Documents produced by an atomic step body, keyed by output port name.
#[derive(Clone, Debug, Default)]
pub struct StepOutput {
  documents: IndexMap<String, Vec<Document>>,
}

impl StepOutput {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends `documents` to whatever was already written to `port_name`.
  pub fn write(&mut self, port_name: impl Into<String>, documents: impl IntoIterator<Item = Document>) {
    self.documents.entry(port_name.into()).or_default().extend(documents);
  }

  pub fn with(mut self, port_name: impl Into<String>, documents: impl IntoIterator<Item = Document>) -> Self {
    self.write(port_name, documents);
    self
  }

  pub fn get(&self, port_name: &str) -> Option<&[Document]> {
    self.documents.get(port_name).map(Vec::as_slice)
  }

  pub fn into_documents(self) -> impl Iterator<Item = (String, Vec<Document>)> {
    self.documents.into_iter()
  }
}

/// The body of a leaf step.
#[async_trait]
pub trait AtomicProcessor: Send + Sync + 'static {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::default()
  }

  /// `environment` is the step's own scope: its input ports, options and parameters are
  /// resolved and readable.
  async fn execute(&self, step: &Step, environment: &Environment, task: &TaskContext) -> PipelineResult<StepOutput>;
}

/// Adapts an [`AtomicProcessor`] to the [`StepProcessor`] protocol.
pub struct AtomicStep<P>(pub P);

#[async_trait]
impl<P: AtomicProcessor> StepProcessor for AtomicStep<P> {
  fn kind(&self) -> ProcessorKind {
    ProcessorKind::Atomic
  }

  fn external_resources(&self) -> ExternalResources {
    self.0.external_resources()
  }

  #[instrument(name = "AtomicStep::run", skip_all, fields(step = %step.name(), step_type = %step.step_type()), err(Display))]
  async fn run(&self, step: &Step, environment: Environment, task: &TaskContext) -> PipelineResult<Environment> {
    let step_environment = environment.new_following_step_environment(step, task)?;
    event!(Level::TRACE, "Executing step body.");
    let mut output = self.0.execute(step, &step_environment, task).await?;

    // Declared outputs the body left untouched are closed with an empty sequence so they
    // never fall back to the input.
    for port in step.output_ports() {
      if output.get(port.port_name()).is_none() {
        output.write(port.port_name(), Vec::new());
      }
    }

    let mut result = step_environment;
    for (port_name, documents) in output.into_documents() {
      let reference = PortReference::new(step.name(), port_name);
      result = result.write_nodes(&reference, documents)?;
    }
    let source = result.clone();
    result.setup_output_ports(step, &source)
  }
}
