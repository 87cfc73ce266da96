// portflow/src/environment/port.rs

//! The runtime realization of a declared port.

use super::binding::ResolvedBinding;
use super::definition::Environment;
use crate::core::port::{Port, PortReference};
use crate::core::qname::QName;
use crate::document::{Document, QueryContext};
use crate::error::{EvaluationError, PipelineResult};
use crate::pipeline::context::PipelineContext;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{event, Level};

/// What a port `select` is evaluated with.
struct PortSelect {
  query: String,
  context: PipelineContext,
  variables: HashMap<QName, String>,
}

struct PortInner {
  declared_port: Port,
  producers: Vec<ResolvedBinding>,
  select: Option<Arc<PortSelect>>,
  nodes: OnceCell<Vec<Document>>,
}

/// A declared [`Port`] together with the producers it reads from, in binding order.
///
/// Immutable: [`EnvironmentPort::pipe`] and [`EnvironmentPort::write_nodes`] return a new
/// port with one more producer. The documents of a port are computed on first read and
/// cached, so every reader of one port value observes the same sequence.
#[derive(Clone)]
pub struct EnvironmentPort {
  inner: Arc<PortInner>,
}

impl EnvironmentPort {
  /// Resolves every binding of `port` against `environment`.
  pub fn new(port: &Port, environment: &Environment) -> Self {
    let producers = port
      .bindings()
      .iter()
      .map(|binding| ResolvedBinding::resolve(binding, port.reference(), environment))
      .collect();
    let select = port.select_query().map(|query| {
      Arc::new(PortSelect {
        query: query.to_string(),
        context: environment.context().clone(),
        variables: environment.variables(),
      })
    });
    Self::from_parts(port.clone(), producers, select)
  }

  /// A port with no producer at all. Reading it yields the empty sequence.
  pub fn unbound(port: &Port) -> Self {
    Self::from_parts(port.clone(), Vec::new(), None)
  }

  fn from_parts(declared_port: Port, producers: Vec<ResolvedBinding>, select: Option<Arc<PortSelect>>) -> Self {
    Self {
      inner: Arc::new(PortInner {
        declared_port,
        producers,
        select,
        nodes: OnceCell::new(),
      }),
    }
  }

  fn with_producer(&self, producer: ResolvedBinding) -> Self {
    let mut producers = self.inner.producers.clone();
    producers.push(producer);
    Self::from_parts(self.inner.declared_port.clone(), producers, self.inner.select.clone())
  }

  /// This port, additionally reading everything `other` yields.
  pub fn pipe(&self, other: &EnvironmentPort) -> Self {
    event!(Level::TRACE, port = %self.reference(), from = %other.reference(), "Piping port.");
    self.with_producer(ResolvedBinding::Port(other.clone()))
  }

  /// This port, additionally yielding `documents`.
  pub fn write_nodes(&self, documents: Vec<Document>) -> Self {
    event!(Level::TRACE, port = %self.reference(), count = documents.len(), "Writing documents to port.");
    self.with_producer(ResolvedBinding::documents(documents))
  }

  pub fn declared_port(&self) -> &Port {
    &self.inner.declared_port
  }

  pub fn reference(&self) -> &PortReference {
    self.inner.declared_port.reference()
  }

  pub fn producers(&self) -> &[ResolvedBinding] {
    &self.inner.producers
  }

  /// Whether nothing feeds this port yet.
  pub fn is_unbound(&self) -> bool {
    self.inner.producers.is_empty()
  }

  pub fn ptr_eq(&self, other: &EnvironmentPort) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// The documents of every producer in order, filtered through the port `select` when
  /// there is one.
  pub fn read_nodes(&self) -> PipelineResult<Vec<Document>> {
    self.inner.nodes.get_or_try_init(|| self.materialize()).cloned()
  }

  fn materialize(&self) -> PipelineResult<Vec<Document>> {
    let mut documents = Vec::new();
    for producer in &self.inner.producers {
      documents.extend(producer.read_nodes()?);
    }
    match &self.inner.select {
      Some(select) => self.apply_select(select, documents),
      None => Ok(documents),
    }
  }

  fn apply_select(&self, select: &PortSelect, documents: Vec<Document>) -> PipelineResult<Vec<Document>> {
    let mut selected = Vec::new();
    for document in documents {
      let query_context = QueryContext::new(Some(document)).with_variables(select.variables.clone());
      let items = select
        .context
        .engine()
        .evaluate_query(&select.query, &query_context)
        .map_err(|source| EvaluationError::Query {
          query: select.query.clone(),
          location: self.inner.declared_port.location().clone(),
          source,
        })?;
      for item in items {
        let node = item.as_node().ok_or_else(|| EvaluationError::NonNodeSelection {
          query: select.query.clone(),
          reference: self.reference().clone(),
          location: self.inner.declared_port.location().clone(),
        })?;
        selected.push(node.as_document());
      }
    }
    event!(Level::TRACE, port = %self.reference(), count = selected.len(), "Port select applied.");
    Ok(selected)
  }
}

impl fmt::Debug for EnvironmentPort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EnvironmentPort")
      .field("reference", self.reference())
      .field("producers", &self.inner.producers)
      .finish()
  }
}

impl fmt::Display for EnvironmentPort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.reference())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::port::Port;

  #[test]
  fn unbound_port_reads_empty_sequence() {
    let port = EnvironmentPort::unbound(&Port::output("result").with_step_name("s"));
    assert!(port.is_unbound());
    assert!(port.read_nodes().unwrap().is_empty());
  }

  #[test]
  fn writes_and_pipes_append_in_order() {
    let a = Document::simple("a", "");
    let b = Document::simple("b", "");
    let upstream = EnvironmentPort::unbound(&Port::output("result").with_step_name("up")).write_nodes(vec![a.clone()]);
    let port = EnvironmentPort::unbound(&Port::input("source").with_step_name("down"))
      .pipe(&upstream)
      .write_nodes(vec![b.clone()]);
    assert_eq!(port.read_nodes().unwrap(), vec![a.clone(), b]);
    // The upstream value itself is unchanged.
    assert_eq!(upstream.read_nodes().unwrap(), vec![a]);
  }

  #[test]
  fn select_filters_each_document() {
    let context = PipelineContext::default();
    let environment = Environment::new(&crate::steps::group().named("root"), &context);
    let doc = crate::document::TreeEngine::new()
      .parse_str("<list><item>1</item><item>2</item></list>")
      .unwrap();
    let port = Port::input("source")
      .with_step_name("s")
      .select("/list/item")
      .bind(crate::core::binding::PortBinding::inline(doc));
    let nodes = EnvironmentPort::new(&port, &environment).read_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(Document::is_document));
    assert_eq!(nodes[1].string_value(), "2");
  }
}
