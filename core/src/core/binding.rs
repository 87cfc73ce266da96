// portflow/src/core/binding.rs

//! Declared port bindings: where a port reads its documents from.
//!
//! A `PortBinding` is only a declaration. It becomes readable once resolved against an
//! [`Environment`](crate::environment::Environment), see
//! [`ResolvedBinding`](crate::environment::ResolvedBinding).

use super::location::Location;
use super::port::PortReference;
use crate::document::Document;
use std::fmt;

#[derive(Clone, Debug)]
pub enum PortBinding {
  /// Reads everything written to another port.
  Pipe(PortReference),
  /// An already-built document.
  Inline(Document),
  /// A document fetched (and parsed) through the input resolver on first read.
  External { href: String, location: Location },
  /// The empty sequence.
  Empty,
}

impl PortBinding {
  pub fn pipe(step_name: impl Into<String>, port_name: impl Into<String>) -> Self {
    PortBinding::Pipe(PortReference::new(step_name, port_name))
  }

  pub fn inline(document: Document) -> Self {
    PortBinding::Inline(document)
  }

  pub fn external(href: impl Into<String>) -> Self {
    PortBinding::External {
      href: href.into(),
      location: Location::unknown(),
    }
  }

  pub fn external_at(href: impl Into<String>, location: Location) -> Self {
    PortBinding::External {
      href: href.into(),
      location,
    }
  }

  pub fn pipe_reference(&self) -> Option<&PortReference> {
    match self {
      PortBinding::Pipe(reference) => Some(reference),
      _ => None,
    }
  }

  pub fn is_external(&self) -> bool {
    matches!(self, PortBinding::External { .. })
  }
}

impl fmt::Display for PortBinding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PortBinding::Pipe(reference) => write!(f, "pipe[{}]", reference),
      PortBinding::Inline(_) => f.write_str("inline"),
      PortBinding::External { href, .. } => write!(f, "document[{}]", href),
      PortBinding::Empty => f.write_str("empty"),
    }
  }
}
