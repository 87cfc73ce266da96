// portflow/src/environment/binding.rs

//! Bindings resolved against an environment.

use super::definition::Environment;
use super::port::EnvironmentPort;
use crate::core::binding::PortBinding;
use crate::core::location::Location;
use crate::core::port::PortReference;
use crate::document::Document;
use crate::error::{PipelineError, PipelineResult, ResolutionError};
use crate::io::resolve_uri;
use crate::pipeline::context::PipelineContext;
use anyhow::Context as _;
use once_cell::sync::OnceCell;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{event, Level};

/// A document loaded through the input resolver the first time it is read.
#[derive(Clone)]
pub struct ExternalDocument {
  href: String,
  location: Location,
  context: PipelineContext,
  loaded: Arc<OnceCell<Document>>,
}

impl ExternalDocument {
  pub(crate) fn new(href: &str, location: &Location, context: &PipelineContext) -> Self {
    Self {
      href: href.to_string(),
      location: location.clone(),
      context: context.clone(),
      loaded: Arc::new(OnceCell::new()),
    }
  }

  pub fn href(&self) -> &str {
    &self.href
  }

  fn base(&self) -> Option<&str> {
    self.location.system_id.as_deref().or_else(|| self.context.base_uri())
  }

  pub(crate) fn load(&self) -> PipelineResult<Document> {
    self
      .loaded
      .get_or_try_init(|| {
        event!(Level::DEBUG, href = %self.href, "Loading external document.");
        let base = self.base();
        let load = || -> anyhow::Result<Document> {
          let mut input = self.context.input_resolver().resolve_input(&self.href, base)?;
          let mut bytes = Vec::new();
          input
            .read_to_end(&mut bytes)
            .with_context(|| format!("Cannot read '{}'", self.href))?;
          let system_id = resolve_uri(&self.href, base).ok().map(String::from);
          self.context.engine().parse(&bytes, system_id.as_deref())
        };
        load().map_err(|source| PipelineError::ExternalResource {
          href: self.href.clone(),
          location: self.location.clone(),
          source,
        })
      })
      .cloned()
  }
}

/// A [`PortBinding`] resolved against an [`Environment`]. Construction never reads
/// anything; [`ResolvedBinding::read_nodes`] does.
#[derive(Clone)]
pub enum ResolvedBinding {
  /// Another environment port.
  Port(EnvironmentPort),
  /// Literal documents: an inline binding, or documents written by a step.
  Documents(Arc<Vec<Document>>),
  External(ExternalDocument),
  Empty,
  /// A pipe to a port the environment did not have. Fails when read.
  Missing { reference: PortReference, available: String },
  /// A pipe from a port to itself. Fails when read.
  SelfReference(PortReference),
}

impl ResolvedBinding {
  /// Resolves `binding`, declared on the port `owner`, against `environment`.
  pub fn resolve(binding: &PortBinding, owner: &PortReference, environment: &Environment) -> Self {
    match binding {
      PortBinding::Pipe(reference) if reference == owner => ResolvedBinding::SelfReference(reference.clone()),
      PortBinding::Pipe(reference) => match environment.ports().get(reference) {
        Some(port) => ResolvedBinding::Port(port.clone()),
        None => {
          event!(Level::TRACE, reference = %reference, "Pipe to unknown port, deferring failure to read.");
          ResolvedBinding::Missing {
            reference: reference.clone(),
            available: environment.available_ports(),
          }
        }
      },
      PortBinding::Inline(document) => ResolvedBinding::Documents(Arc::new(vec![document.clone()])),
      PortBinding::External { href, location } => {
        ResolvedBinding::External(ExternalDocument::new(href, location, environment.context()))
      }
      PortBinding::Empty => ResolvedBinding::Empty,
    }
  }

  pub fn documents(documents: Vec<Document>) -> Self {
    ResolvedBinding::Documents(Arc::new(documents))
  }

  pub fn read_nodes(&self) -> PipelineResult<Vec<Document>> {
    match self {
      ResolvedBinding::Port(port) => port.read_nodes(),
      ResolvedBinding::Documents(documents) => Ok(documents.as_ref().clone()),
      ResolvedBinding::External(external) => external.load().map(|document| vec![document]),
      ResolvedBinding::Empty => Ok(Vec::new()),
      ResolvedBinding::Missing { reference, available } => Err(
        ResolutionError::NoSuchPort {
          reference: reference.clone(),
          available: available.clone(),
        }
        .into(),
      ),
      ResolvedBinding::SelfReference(reference) => Err(
        ResolutionError::SelfReference {
          reference: reference.clone(),
        }
        .into(),
      ),
    }
  }
}

impl fmt::Debug for ResolvedBinding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResolvedBinding::Port(port) => write!(f, "Port({})", port.reference()),
      ResolvedBinding::Documents(documents) => write!(f, "Documents({})", documents.len()),
      ResolvedBinding::External(external) => write!(f, "External({})", external.href),
      ResolvedBinding::Empty => f.write_str("Empty"),
      ResolvedBinding::Missing { reference, .. } => write!(f, "Missing({})", reference),
      ResolvedBinding::SelfReference(reference) => write!(f, "SelfReference({})", reference),
    }
  }
}
