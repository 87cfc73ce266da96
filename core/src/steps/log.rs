// portflow/src/steps/log.rs

//! `p:log` support: after a compound step ran, the documents of each logged output port
//! are serialized, concatenated, to the log's href.

use crate::core::step::Step;
use crate::environment::Environment;
use crate::error::{PipelineError, PipelineResult};
use anyhow::Context as _;
use std::io::Write;
use tracing::{event, Level};

/// Writes every log declared on `step`, reading its ports from `environment`.
pub fn write_logs(step: &Step, environment: &Environment) -> PipelineResult<()> {
  for log in step.logs() {
    let documents = environment.read_nodes(&step.port_reference(&log.port))?;
    event!(Level::DEBUG, step = %step.name(), port = %log.port, href = %log.href, count = documents.len(), "Writing log.");
    let context = environment.context();
    let write = || -> anyhow::Result<()> {
      let mut output = context.output_resolver().resolve_output(&log.href, environment.base_uri())?;
      for document in &documents {
        let bytes = context.engine().serialize(document)?;
        output.write_all(&bytes).with_context(|| format!("Cannot write '{}'", log.href))?;
      }
      output.flush()?;
      Ok(())
    };
    write().map_err(|source| PipelineError::ExternalResource {
      href: log.href.clone(),
      location: step.location().clone(),
      source,
    })?;
  }
  Ok(())
}
