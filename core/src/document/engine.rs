// portflow/src/document/engine.rs

//! The narrow interface through which the engine parses, serializes and queries documents.

use super::builder::DocumentBuilder;
use super::node::Document;
use crate::core::qname::QName;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;

/// A query result item.
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
  Node(Document),
  String(String),
  Number(f64),
  Boolean(bool),
}

impl Item {
  pub fn as_node(&self) -> Option<&Document> {
    match self {
      Item::Node(node) => Some(node),
      _ => None,
    }
  }

  pub fn string_value(&self) -> String {
    match self {
      Item::Node(node) => node.string_value(),
      Item::String(value) => value.clone(),
      Item::Number(value) => format_number(*value),
      Item::Boolean(value) => value.to_string(),
    }
  }
}

impl fmt::Display for Item {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.string_value())
  }
}

pub(crate) fn format_number(value: f64) -> String {
  if value.is_nan() {
    "NaN".to_string()
  } else if value.is_infinite() {
    if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
  } else if value.fract() == 0.0 && value.abs() < 1e15 {
    format!("{}", value as i64)
  } else {
    value.to_string()
  }
}

/// Effective boolean value of a sequence: empty is false, a leading node is true, a single
/// atomic value is judged by its own rules.
pub fn effective_boolean_value(items: &[Item]) -> bool {
  match items.first() {
    None => false,
    Some(Item::Node(_)) => true,
    Some(Item::Boolean(value)) => *value,
    Some(Item::String(value)) => !value.is_empty(),
    Some(Item::Number(value)) => *value != 0.0 && !value.is_nan(),
  }
}

/// Everything a query may see besides its text. Passed explicitly on every evaluation.
#[derive(Clone, Debug)]
pub struct QueryContext {
  pub node: Option<Document>,
  pub variables: HashMap<QName, String>,
  pub position: usize,
  pub size: usize,
}

impl Default for QueryContext {
  fn default() -> Self {
    Self {
      node: None,
      variables: HashMap::new(),
      position: 1,
      size: 1,
    }
  }
}

impl QueryContext {
  pub fn new(node: Option<Document>) -> Self {
    Self {
      node,
      ..Self::default()
    }
  }

  pub fn with_variables(mut self, variables: HashMap<QName, String>) -> Self {
    self.variables = variables;
    self
  }

  pub fn with_iteration(mut self, position: usize, size: usize) -> Self {
    self.position = position;
    self.size = size;
    self
  }
}

pub trait DocumentEngine: Send + Sync + 'static {
  /// Parses `input`. `system_id` becomes the base URI of the returned document.
  fn parse(&self, input: &[u8], system_id: Option<&str>) -> Result<Document>;

  fn serialize(&self, document: &Document) -> Result<Vec<u8>>;

  fn evaluate_query(&self, query: &str, context: &QueryContext) -> Result<Vec<Item>>;

  fn new_builder(&self) -> DocumentBuilder {
    DocumentBuilder::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn numbers_render_as_query_strings() {
    assert_eq!(Item::Number(3.0).string_value(), "3");
    assert_eq!(Item::Number(2.5).string_value(), "2.5");
    assert_eq!(Item::Number(f64::NAN).string_value(), "NaN");
    assert_eq!(Item::Number(f64::INFINITY).string_value(), "Infinity");
    assert_eq!(Item::Number(f64::NEG_INFINITY).string_value(), "-Infinity");
  }
}
