// portflow/src/document/node.rs

//! The immutable document tree flowing through ports.

use crate::core::qname::QName;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
  pub name: QName,
  pub value: String,
}

impl Attribute {
  pub fn new(name: impl Into<QName>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
  Document { base_uri: Option<String> },
  Element { name: QName, attributes: Vec<Attribute> },
  Attribute(Attribute),
  Text(String),
}

struct Node {
  kind: NodeKind,
  children: Vec<Document>,
}

/// A shared handle on an immutable node: a document, an element, an attribute or a text
/// node. Cloning is cheap.
///
/// Equality is structural (names, attributes in order, text, children); base URIs are not
/// compared. [`Document::ptr_eq`] tests node identity.
#[derive(Clone)]
pub struct Document(Arc<Node>);

impl Document {
  fn from_parts(kind: NodeKind, children: Vec<Document>) -> Self {
    Document(Arc::new(Node { kind, children }))
  }

  /// A document node. Attribute children are dropped.
  pub fn document(children: Vec<Document>) -> Self {
    Self::document_with_base(children, None)
  }

  pub fn document_with_base(children: Vec<Document>, base_uri: Option<String>) -> Self {
    let children = children.into_iter().filter(|child| !child.is_attribute()).collect();
    Self::from_parts(NodeKind::Document { base_uri }, children)
  }

  pub fn element(name: impl Into<QName>, attributes: Vec<Attribute>, children: Vec<Document>) -> Self {
    let children = children
      .into_iter()
      .flat_map(|child| {
        // A document child contributes its content.
        if child.is_document() {
          child.children().to_vec()
        } else {
          vec![child]
        }
      })
      .filter(|child| !child.is_attribute())
      .collect();
    Self::from_parts(
      NodeKind::Element {
        name: name.into(),
        attributes,
      },
      children,
    )
  }

  pub fn text(text: impl Into<String>) -> Self {
    Self::from_parts(NodeKind::Text(text.into()), Vec::new())
  }

  pub fn attribute(name: impl Into<QName>, value: impl Into<String>) -> Self {
    Self::from_parts(NodeKind::Attribute(Attribute::new(name, value)), Vec::new())
  }

  /// A document whose single child is an element named `name` containing `text`.
  pub fn simple(name: impl Into<QName>, text: impl Into<String>) -> Self {
    let text = text.into();
    let children = if text.is_empty() {
      Vec::new()
    } else {
      vec![Document::text(text)]
    };
    Document::document(vec![Document::element(name, Vec::new(), children)])
  }

  pub fn kind(&self) -> &NodeKind {
    &self.0.kind
  }

  pub fn is_document(&self) -> bool {
    matches!(self.0.kind, NodeKind::Document { .. })
  }

  pub fn is_element(&self) -> bool {
    matches!(self.0.kind, NodeKind::Element { .. })
  }

  pub fn is_attribute(&self) -> bool {
    matches!(self.0.kind, NodeKind::Attribute(_))
  }

  pub fn is_text(&self) -> bool {
    matches!(self.0.kind, NodeKind::Text(_))
  }

  /// Element or attribute name.
  pub fn name(&self) -> Option<&QName> {
    match &self.0.kind {
      NodeKind::Element { name, .. } => Some(name),
      NodeKind::Attribute(attribute) => Some(&attribute.name),
      _ => None,
    }
  }

  pub fn attributes(&self) -> &[Attribute] {
    match &self.0.kind {
      NodeKind::Element { attributes, .. } => attributes,
      _ => &[],
    }
  }

  /// Value of the attribute with the given name. A bare local name matches attributes in
  /// no namespace.
  pub fn attribute_value(&self, name: impl Into<QName>) -> Option<&str> {
    let name = name.into();
    self
      .attributes()
      .iter()
      .find(|attribute| attribute.name == name)
      .map(|attribute| attribute.value.as_str())
  }

  pub fn children(&self) -> &[Document] {
    &self.0.children
  }

  /// The first element child.
  pub fn document_element(&self) -> Option<&Document> {
    self.0.children.iter().find(|child| child.is_element())
  }

  pub fn base_uri(&self) -> Option<&str> {
    match &self.0.kind {
      NodeKind::Document { base_uri } => base_uri.as_deref(),
      _ => None,
    }
  }

  /// Concatenated descendant text, or the attribute value.
  pub fn string_value(&self) -> String {
    match &self.0.kind {
      NodeKind::Text(text) => text.clone(),
      NodeKind::Attribute(attribute) => attribute.value.clone(),
      _ => {
        let mut value = String::new();
        self.collect_text(&mut value);
        value
      }
    }
  }

  fn collect_text(&self, into: &mut String) {
    for child in &self.0.children {
      match &child.0.kind {
        NodeKind::Text(text) => into.push_str(text),
        _ => child.collect_text(into),
      }
    }
  }

  /// Wraps the node into a document node, unless it already is one.
  pub fn as_document(&self) -> Document {
    if self.is_document() {
      self.clone()
    } else {
      Document::document(vec![self.clone()])
    }
  }

  /// The same node with other children.
  pub fn with_children(&self, children: Vec<Document>) -> Document {
    match &self.0.kind {
      NodeKind::Element { name, attributes } => Document::element(name.clone(), attributes.clone(), children),
      NodeKind::Document { base_uri } => Document::document_with_base(children, base_uri.clone()),
      _ => self.clone(),
    }
  }

  /// Node identity.
  pub fn ptr_eq(&self, other: &Document) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  pub(crate) fn identity(&self) -> usize {
    Arc::as_ptr(&self.0) as usize
  }
}

impl PartialEq for Document {
  fn eq(&self, other: &Self) -> bool {
    if self.ptr_eq(other) {
      return true;
    }
    let same_kind = match (&self.0.kind, &other.0.kind) {
      (NodeKind::Document { .. }, NodeKind::Document { .. }) => true,
      (
        NodeKind::Element { name, attributes },
        NodeKind::Element {
          name: other_name,
          attributes: other_attributes,
        },
      ) => name == other_name && attributes == other_attributes,
      (NodeKind::Attribute(a), NodeKind::Attribute(b)) => a == b,
      (NodeKind::Text(a), NodeKind::Text(b)) => a == b,
      _ => false,
    };
    same_kind && self.0.children == other.0.children
  }
}

impl Eq for Document {}

impl fmt::Display for Document {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.0.kind {
      NodeKind::Document { .. } => {
        for child in &self.0.children {
          write!(f, "{}", child)?;
        }
        Ok(())
      }
      NodeKind::Element { name, attributes } => {
        write!(f, "<{}", name.lexical())?;
        for attribute in attributes {
          write!(f, " {}=\"{}\"", attribute.name.lexical(), attribute.value)?;
        }
        if self.0.children.is_empty() {
          return f.write_str("/>");
        }
        f.write_str(">")?;
        for child in &self.0.children {
          write!(f, "{}", child)?;
        }
        write!(f, "</{}>", name.lexical())
      }
      NodeKind::Attribute(attribute) => write!(f, "{}=\"{}\"", attribute.name.lexical(), attribute.value),
      NodeKind::Text(text) => f.write_str(text),
    }
  }
}

impl fmt::Debug for Document {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Document({})", self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn structural_equality_ignores_identity() {
    let a = Document::simple("a", "x");
    let b = Document::simple("a", "x");
    assert_eq!(a, b);
    assert!(!a.ptr_eq(&b));
    assert_ne!(a, Document::simple("a", "y"));
  }

  #[test]
  fn string_value_concatenates_descendant_text() {
    let doc = Document::document(vec![Document::element(
      "a",
      vec![Attribute::new("id", "1")],
      vec![Document::text("x"), Document::element("b", Vec::new(), vec![Document::text("y")])],
    )]);
    assert_eq!(doc.string_value(), "xy");
    assert_eq!(doc.document_element().and_then(|a| a.attribute_value("id")), Some("1"));
    assert_eq!(doc.to_string(), "<a id=\"1\">x<b>y</b></a>");
  }
}
