// portflow/src/document/builder.rs

//! Push-style construction of documents.

use super::node::{Attribute, Document};
use crate::core::qname::QName;
use anyhow::{anyhow, Result};

enum Frame {
  Document { base_uri: Option<String> },
  Element { name: QName, attributes: Vec<Attribute> },
}

struct OpenNode {
  frame: Frame,
  children: Vec<Document>,
}

/// Builds a [`Document`] from a stream of start/end events.
///
/// Misuse (closing something that is not open, an attribute outside an element start) is
/// recorded and reported by [`DocumentBuilder::build`].
#[derive(Default)]
pub struct DocumentBuilder {
  stack: Vec<OpenNode>,
  roots: Vec<Document>,
  error: Option<String>,
}

impl DocumentBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  fn fail(&mut self, message: String) {
    if self.error.is_none() {
      self.error = Some(message);
    }
  }

  fn push_node(&mut self, node: Document) {
    match self.stack.last_mut() {
      Some(open) => open.children.push(node),
      None => self.roots.push(node),
    }
  }

  pub fn start_document(&mut self, base_uri: Option<String>) -> &mut Self {
    self.stack.push(OpenNode {
      frame: Frame::Document { base_uri },
      children: Vec::new(),
    });
    self
  }

  pub fn end_document(&mut self) -> &mut Self {
    match self.stack.pop() {
      Some(OpenNode {
        frame: Frame::Document { base_uri },
        children,
      }) => {
        let node = Document::document_with_base(children, base_uri);
        self.push_node(node);
      }
      Some(other) => {
        self.stack.push(other);
        self.fail("end_document while an element is open".to_string());
      }
      None => self.fail("end_document without start_document".to_string()),
    }
    self
  }

  pub fn start_element(&mut self, name: impl Into<QName>) -> &mut Self {
    self.stack.push(OpenNode {
      frame: Frame::Element {
        name: name.into(),
        attributes: Vec::new(),
      },
      children: Vec::new(),
    });
    self
  }

  /// Adds an attribute to the element opened last. Must come before any child.
  pub fn attribute(&mut self, name: impl Into<QName>, value: impl Into<String>) -> &mut Self {
    let name = name.into();
    match self.stack.last_mut() {
      Some(OpenNode {
        frame: Frame::Element { attributes, .. },
        children,
      }) if children.is_empty() => attributes.push(Attribute::new(name, value)),
      _ => self.fail(format!("attribute '{}' outside of an element start", name)),
    }
    self
  }

  pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
    let text = text.into();
    if !text.is_empty() {
      self.push_node(Document::text(text));
    }
    self
  }

  /// Appends an existing node as a child of the current node.
  pub fn node(&mut self, node: Document) -> &mut Self {
    self.push_node(node);
    self
  }

  pub fn end_element(&mut self) -> &mut Self {
    match self.stack.pop() {
      Some(OpenNode {
        frame: Frame::Element { name, attributes },
        children,
      }) => {
        let node = Document::element(name, attributes, children);
        self.push_node(node);
      }
      Some(other) => {
        self.stack.push(other);
        self.fail("end_element while no element is open".to_string());
      }
      None => self.fail("end_element without start_element".to_string()),
    }
    self
  }

  /// The built document. Top-level nodes built without an enclosing `start_document` are
  /// wrapped in a document node.
  pub fn build(&mut self) -> Result<Document> {
    if let Some(error) = self.error.take() {
      return Err(anyhow!("Invalid document construction: {}", error));
    }
    if !self.stack.is_empty() {
      return Err(anyhow!("Invalid document construction: {} unclosed node(s)", self.stack.len()));
    }
    let mut roots = std::mem::take(&mut self.roots);
    if roots.len() == 1 && roots[0].is_document() {
      return Ok(roots.remove(0));
    }
    Ok(Document::document(roots))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_nested_elements() {
    let doc = DocumentBuilder::new()
      .start_document(None)
      .start_element("a")
      .attribute("x", "1")
      .start_element("b")
      .text("hi")
      .end_element()
      .end_element()
      .end_document()
      .build()
      .unwrap();
    assert_eq!(doc.to_string(), "<a x=\"1\"><b>hi</b></a>");
  }

  #[test]
  fn reports_unbalanced_events() {
    assert!(DocumentBuilder::new().start_element("a").build().is_err());
    assert!(DocumentBuilder::new().end_element().build().is_err());
  }
}
