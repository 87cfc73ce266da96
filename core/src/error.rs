// portflow/src/error.rs

//! Error taxonomy of the engine.
//!
//! - [`StructuralError`]: the step graph itself is invalid. Detected while declaring or
//!   validating steps, before anything runs.
//! - [`ResolutionError`]: a port or step type that should exist does not. For a validated
//!   pipeline this points at a defect in whatever built the step tree.
//! - [`EvaluationError`]: a query, a variable or a binding produced something unusable at run time.
//! - [`PipelineError`]: the top-level error, wrapping the above plus external resource and
//!   step-body failures.

use crate::core::location::Location;
use crate::core::port::PortReference;
use crate::core::qname::QName;
use anyhow::Error as AnyhowError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
  #[error("Step '{step_name}' depends on itself through its sibling bindings")]
  CyclicDependency { step_name: String },

  #[error("Step #{position} in the subpipeline of '{parent}' has no name")]
  UnnamedStep { parent: String, position: usize },

  #[error("Duplicate step name '{step_name}' in the subpipeline of '{parent}'")]
  DuplicateStepName { parent: String, step_name: String },

  #[error("Variable '{variable}' declared twice on step '{step_name}'")]
  DuplicateVariable { step_name: String, variable: QName },

  #[error("Input port '{port_name}' of step '{step_name}' is not primary and has no binding")]
  UnboundInputPort { step_name: String, port_name: String },

  #[error("Output port '{port_name}' of step '{step_name}' is not primary and has no binding")]
  UnconnectedOutputPort { step_name: String, port_name: String },

  #[error("Step '{step_name}' has several {kind} ports and none of them is marked primary")]
  AmbiguousPrimaryPort { step_name: String, kind: String },
}

#[derive(Debug, Error)]
pub enum ResolutionError {
  #[error("No such port: {reference} (available ports: {available})")]
  NoSuchPort { reference: PortReference, available: String },

  #[error("Port {reference} is bound to itself")]
  SelfReference { reference: PortReference },

  #[error("No declared step type {step_type}")]
  NoSuchStepType { step_type: QName },

  #[error("No port '{port_name}' declared on step '{step_name}'")]
  NoSuchDeclaredPort { step_name: String, port_name: String },
}

#[derive(Debug, Error)]
pub enum EvaluationError {
  #[error("Error while evaluating query '{query}' ({location}). Source: {source}")]
  Query {
    query: String,
    location: Location,
    #[source]
    source: AnyhowError,
  },

  #[error("Error while evaluating variable '{variable}' of step '{step_name}' ({location}). Source: {source}")]
  Variable {
    variable: QName,
    step_name: String,
    location: Location,
    #[source]
    source: Box<EvaluationError>,
  },

  #[error("No value for required variable '{variable}' of step '{step_name}' ({location})")]
  MissingRequiredValue {
    variable: QName,
    step_name: String,
    location: Location,
  },

  #[error("Expected exactly one node from {origin}, got {count} ({location})")]
  NotExactlyOneNode {
    origin: String,
    count: usize,
    location: Location,
  },

  #[error("Query '{query}' returned {count} items where at most one was expected ({location})")]
  TooManyItems {
    query: String,
    count: usize,
    location: Location,
  },

  #[error("Query '{query}' selected a non-node item on port {reference} ({location})")]
  NonNodeSelection {
    query: String,
    reference: PortReference,
    location: Location,
  },

  #[error("Parameter '{variable}' set on step '{step_name}' which has no parameters port ({location})")]
  NoParametersPort {
    variable: QName,
    step_name: String,
    location: Location,
  },

  #[error("No branch of step '{step_name}' was selected")]
  NoBranchSelected { step_name: String },

  #[error("Invalid parameter element: {message}")]
  InvalidParameter { message: String },

  #[error("Step '{step_name}' cannot process a matched {kind} node ({location})")]
  UnsupportedMatch {
    step_name: String,
    kind: String,
    location: Location,
  },
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Structural(#[from] StructuralError),

  #[error(transparent)]
  Resolution(#[from] ResolutionError),

  #[error(transparent)]
  Evaluation(#[from] EvaluationError),

  #[error("Cannot access external resource '{href}' ({location}). Source: {source}")]
  ExternalResource {
    href: String,
    location: Location,
    #[source]
    source: AnyhowError,
  },

  #[error("Step '{step_name}' failed. Source: {source}")]
  StepFailure {
    step_name: String,
    #[source]
    source: AnyhowError,
  },

  #[error("Configuration error: {message}")]
  Configuration { message: String },

  #[error("Internal pipeline error: {0}")]
  Internal(String),
}

impl PipelineError {
  /// Wraps a step-body failure, keeping engine errors untouched when the body already
  /// produced one.
  pub fn step_failure(step_name: impl Into<String>, err: AnyhowError) -> Self {
    match err.downcast::<PipelineError>() {
      Ok(pipeline_err) => pipeline_err,
      Err(source) => PipelineError::StepFailure {
        step_name: step_name.into(),
        source,
      },
    }
  }

  pub fn is_structural(&self) -> bool {
    matches!(self, PipelineError::Structural(_))
  }
}

pub type PipelineResult<T, E = PipelineError> = std::result::Result<T, E>;
