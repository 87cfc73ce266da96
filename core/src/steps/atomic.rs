// portflow/src/steps/atomic.rs

//! Built-in leaf steps: identity, sink, load and store.

use crate::core::port::names::{RESULT, SOURCE};
use crate::core::processor::{AtomicProcessor, ExternalResources, StepOutput};
use crate::core::qname::QName;
use crate::core::step::Step;
use crate::environment::{Environment, ExternalDocument};
use crate::error::{EvaluationError, PipelineError, PipelineResult};
use crate::io::resolve_uri;
use crate::pipeline::context::TaskContext;
use anyhow::Context as _;
use async_trait::async_trait;
use std::io::Write;
use tracing::{event, Level};

pub(crate) const HREF: &str = "href";

/// Copies `source` to `result`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

#[async_trait]
impl AtomicProcessor for Identity {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::NONE
  }

  async fn execute(&self, step: &Step, environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    let documents = environment.read_nodes(&step.port_reference(SOURCE))?;
    event!(Level::TRACE, step = %step.name(), count = documents.len(), "Identity copy.");
    Ok(StepOutput::new().with(RESULT, documents))
  }
}

/// Reads `source` and discards it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sink;

#[async_trait]
impl AtomicProcessor for Sink {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::NONE
  }

  async fn execute(&self, step: &Step, environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    // Reading surfaces binding failures even though nothing is kept.
    let discarded = environment.read_nodes(&step.port_reference(SOURCE))?;
    event!(Level::TRACE, step = %step.name(), count = discarded.len(), "Documents discarded.");
    Ok(StepOutput::new())
  }
}

/// Parses the resource at the `href` option onto `result`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Load;

#[async_trait]
impl AtomicProcessor for Load {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::new(true, false)
  }

  async fn execute(&self, step: &Step, environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    let href = required_option(step, environment, HREF)?;
    let document = ExternalDocument::new(href, step.location(), environment.context()).load()?;
    Ok(StepOutput::new().with(RESULT, [document]))
  }
}

/// Serializes the single `source` document to the `href` option and reports the
/// resolved URI as a `c:result` document.
#[derive(Debug, Default, Clone, Copy)]
pub struct Store;

#[async_trait]
impl AtomicProcessor for Store {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::new(false, true)
  }

  async fn execute(&self, step: &Step, environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    let href = required_option(step, environment, HREF)?;
    let document = environment.read_node(&step.port_reference(SOURCE))?;
    let base = environment.base_uri();
    let context = environment.context();

    let store = || -> anyhow::Result<String> {
      let bytes = context.engine().serialize(&document)?;
      let mut output = context.output_resolver().resolve_output(href, base)?;
      output
        .write_all(&bytes)
        .and_then(|_| output.flush())
        .with_context(|| format!("Cannot write '{}'", href))?;
      Ok(resolve_uri(href, base).map(String::from).unwrap_or_else(|_| href.to_string()))
    };
    let stored = store().map_err(|source| PipelineError::ExternalResource {
      href: href.to_string(),
      location: step.location().clone(),
      source,
    })?;
    event!(Level::DEBUG, step = %step.name(), href = %stored, "Document stored.");
    Ok(StepOutput::new().with(RESULT, [Environment::new_result_element(&stored)]))
  }
}

fn required_option<'a>(step: &Step, environment: &'a Environment, name: &str) -> PipelineResult<&'a str> {
  let name = QName::local(name);
  environment.get_variable(&name).ok_or_else(|| {
    EvaluationError::MissingRequiredValue {
      location: step.get_variable(&name).map(|variable| variable.location().clone()).unwrap_or_else(|| step.location().clone()),
      variable: name,
      step_name: step.name().to_string(),
    }
    .into()
  })
}
