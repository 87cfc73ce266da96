// portflow/src/lib.rs

//! Portflow: a concurrent execution engine for declarative document pipelines.
//!
//! A pipeline is a tree of [`Step`]s connected through named ports carrying ordered
//! sequences of [`Document`]s. Portflow takes a fully built step tree and:
//!  - resolves every port binding (pipes to other steps, inline documents, external
//!    documents, empty sequences) against an immutable, scope-chained [`Environment`];
//!  - evaluates options, variables and parameters in declaration order;
//!  - works out which siblings of a subpipeline depend on each other (explicit pipes,
//!    implicit default-readable wiring, external resource ordering) and runs independent
//!    siblings in parallel on the tokio runtime;
//!  - provides the built-in compound steps (group, for-each, choose, viewport) and a few
//!    atomic ones (identity, sink, load, store).
//!
//! Parsing pipeline documents is left to the caller; a [`StepLibrary`] holds declared
//! step types for instantiation.

pub mod config;
pub mod core;
pub mod document;
pub mod environment;
pub mod error;
pub mod io;
pub mod library;
pub mod pipeline;
pub mod steps;

// --- Re-exports for the Public API ---

pub use crate::config::PipelineConfig;
pub use crate::core::{
  AtomicProcessor, ExternalResources, Location, Port, PortBinding, PortKind, PortReference, ProcessorKind, QName,
  Step, StepOutput, StepProcessor, Variable,
};
pub use crate::document::{Document, DocumentEngine, Item, TreeEngine};
pub use crate::environment::{Environment, EnvironmentPort};
pub use crate::error::{EvaluationError, PipelineError, PipelineResult, ResolutionError, StructuralError};
pub use crate::io::{FileResolver, InputResolver, MemoryResolver, OutputResolver};
pub use crate::library::StepLibrary;
pub use crate::pipeline::{Pipeline, PipelineContext, PipelineOutcome, TaskContext};

use tracing::{event, instrument, Level};

/// Validates `pipeline`, then runs it in an empty environment and returns the
/// environment following it.
#[instrument(name = "portflow::run", skip_all, fields(pipeline = %pipeline.name()), err(Display))]
pub async fn run(pipeline: &Step, context: &PipelineContext) -> PipelineResult<Environment> {
  pipeline.validate()?;
  event!(Level::DEBUG, step_type = %pipeline.step_type(), "Pipeline validated.");
  let environment = Environment::new(pipeline, context);
  pipeline.processor().run(pipeline, environment, &TaskContext::root()).await
}
