// portflow/src/document/tree.rs

//! The default [`DocumentEngine`]: XML through `quick-xml`, queries through
//! [`CompiledQuery`].

use super::engine::{DocumentEngine, Item, QueryContext};
use super::node::{Attribute, Document, NodeKind};
use super::query::CompiledQuery;
use crate::core::qname::QName;
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Parses XML into [`Document`] trees and evaluates the path language of
/// [`crate::document::query`]. Compiled queries are cached by text.
///
/// Whitespace-only text nodes are dropped on parse.
#[derive(Default)]
pub struct TreeEngine {
  queries: Mutex<HashMap<String, Arc<CompiledQuery>>>,
}

impl TreeEngine {
  pub fn new() -> Self {
    Self::default()
  }

  fn compiled(&self, query: &str) -> Result<Arc<CompiledQuery>> {
    if let Some(compiled) = self.queries.lock().get(query) {
      return Ok(Arc::clone(compiled));
    }
    let compiled = Arc::new(CompiledQuery::compile(query).with_context(|| format!("Invalid query '{}'", query))?);
    self.queries.lock().insert(query.to_string(), Arc::clone(&compiled));
    Ok(compiled)
  }

  /// Convenience for tests and callers holding XML text.
  pub fn parse_str(&self, xml: &str) -> Result<Document> {
    self.parse(xml.as_bytes(), None)
  }

  pub fn serialize_to_string(&self, document: &Document) -> Result<String> {
    Ok(String::from_utf8(self.serialize(document)?)?)
  }
}

impl DocumentEngine for TreeEngine {
  fn parse(&self, input: &[u8], system_id: Option<&str>) -> Result<Document> {
    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();
    let mut scopes = NamespaceScopes::new();
    let mut stack: Vec<(QName, Vec<Attribute>, Vec<Document>)> = Vec::new();
    let mut roots: Vec<Document> = Vec::new();

    fn push(stack: &mut [(QName, Vec<Attribute>, Vec<Document>)], roots: &mut Vec<Document>, node: Document) {
      match stack.last_mut() {
        Some((_, _, children)) => children.push(node),
        None => roots.push(node),
      }
    }

    loop {
      let event = reader
        .read_event_into(&mut buf)
        .with_context(|| format!("XML error at byte {}", reader.buffer_position()))?;
      match event {
        Event::Start(start) => {
          let (name, attributes) = scopes.open(&start)?;
          stack.push((name, attributes, Vec::new()));
        }
        Event::Empty(start) => {
          let (name, attributes) = scopes.open(&start)?;
          scopes.close();
          push(&mut stack, &mut roots, Document::element(name, attributes, Vec::new()));
        }
        Event::End(_) => {
          let (name, attributes, children) = stack.pop().ok_or_else(|| anyhow!("Unbalanced end tag"))?;
          scopes.close();
          push(&mut stack, &mut roots, Document::element(name, attributes, children));
        }
        Event::Text(text) => {
          let text = text.unescape()?;
          if !text.trim().is_empty() {
            push(&mut stack, &mut roots, Document::text(text.into_owned()));
          }
        }
        Event::CData(data) => {
          let text = String::from_utf8(data.into_inner().into_owned())?;
          push(&mut stack, &mut roots, Document::text(text));
        }
        Event::Eof => break,
        // Declarations, comments, processing instructions and doctypes are not kept.
        _ => {}
      }
      buf.clear();
    }

    if !stack.is_empty() {
      bail!("Unexpected end of input: {} unclosed element(s)", stack.len());
    }
    if roots.iter().filter(|node| node.is_element()).count() != 1 {
      bail!("Expected exactly one document element");
    }
    event!(Level::TRACE, system_id = ?system_id, "Parsed document.");
    Ok(Document::document_with_base(roots, system_id.map(str::to_string)))
  }

  fn serialize(&self, document: &Document) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    let mut scopes = vec![HashMap::from([(String::new(), String::new())])];
    write_node(&mut writer, document, &mut scopes)?;
    Ok(writer.into_inner())
  }

  fn evaluate_query(&self, query: &str, context: &QueryContext) -> Result<Vec<Item>> {
    self
      .compiled(query)?
      .evaluate(context)
      .with_context(|| format!("Failed to evaluate query '{}'", query))
  }
}

/// In-scope prefix bindings while parsing.
struct NamespaceScopes {
  scopes: Vec<HashMap<String, String>>,
}

impl NamespaceScopes {
  fn new() -> Self {
    let mut root = HashMap::new();
    root.insert("xml".to_string(), XML_NAMESPACE.to_string());
    Self { scopes: vec![root] }
  }

  fn resolve(&self, prefix: &str) -> Option<&str> {
    self
      .scopes
      .iter()
      .rev()
      .find_map(|scope| scope.get(prefix))
      .map(String::as_str)
  }

  fn qname(&self, raw: &str, is_attribute: bool) -> Result<QName> {
    match raw.split_once(':') {
      Some((prefix, local)) => {
        let namespace = self
          .resolve(prefix)
          .ok_or_else(|| anyhow!("Unbound namespace prefix '{}' in '{}'", prefix, raw))?;
        Ok(QName::with_prefix(namespace, prefix, local))
      }
      None if is_attribute => Ok(QName::local(raw)),
      None => match self.resolve("") {
        Some(namespace) if !namespace.is_empty() => Ok(QName::new(namespace, raw)),
        _ => Ok(QName::local(raw)),
      },
    }
  }

  /// Pushes the bindings declared on `start` and resolves its name and attributes.
  fn open(&mut self, start: &BytesStart<'_>) -> Result<(QName, Vec<Attribute>)> {
    let mut declared = HashMap::new();
    let mut raw_attributes = Vec::new();
    for attribute in start.attributes() {
      let attribute = attribute?;
      let key = std::str::from_utf8(attribute.key.as_ref())?.to_string();
      let value = attribute.unescape_value()?.into_owned();
      if key == "xmlns" {
        declared.insert(String::new(), value);
      } else if let Some(prefix) = key.strip_prefix("xmlns:") {
        declared.insert(prefix.to_string(), value);
      } else {
        raw_attributes.push((key, value));
      }
    }
    self.scopes.push(declared);

    let name = self.qname(std::str::from_utf8(start.name().as_ref())?, false)?;
    let attributes = raw_attributes
      .into_iter()
      .map(|(key, value)| Ok(Attribute::new(self.qname(&key, true)?, value)))
      .collect::<Result<Vec<_>>>()?;
    Ok((name, attributes))
  }

  fn close(&mut self) {
    self.scopes.pop();
  }
}

/// Writes `node`, declaring whatever prefixes its names need that are not in scope yet.
fn write_node(writer: &mut Writer<Vec<u8>>, node: &Document, scopes: &mut Vec<HashMap<String, String>>) -> Result<()> {
  match node.kind() {
    NodeKind::Document { .. } => {
      for child in node.children() {
        write_node(writer, child, scopes)?;
      }
    }
    NodeKind::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
    NodeKind::Attribute(attribute) => bail!("Cannot serialize a standalone attribute node '{}'", attribute.name),
    NodeKind::Element { name, attributes } => {
      let in_scope = |scopes: &Vec<HashMap<String, String>>, prefix: &str| -> Option<String> {
        scopes.iter().rev().find_map(|scope| scope.get(prefix)).cloned()
      };

      let mut declarations: HashMap<String, String> = HashMap::new();
      let mut need = |prefix: &str, namespace: &str, scopes: &Vec<HashMap<String, String>>| {
        if prefix == "xml" {
          return;
        }
        let current = declarations.get(prefix).cloned().or_else(|| in_scope(scopes, prefix));
        if current.as_deref() != Some(namespace) {
          declarations.insert(prefix.to_string(), namespace.to_string());
        }
      };

      let element_prefix = name.prefix().unwrap_or("").to_string();
      need(&element_prefix, name.namespace().unwrap_or(""), scopes);

      let mut generated = 0;
      let mut attribute_names = Vec::with_capacity(attributes.len());
      for attribute in attributes {
        let lexical = match (attribute.name.namespace(), attribute.name.prefix()) {
          (None, _) => attribute.name.local_name().to_string(),
          (Some(namespace), Some(prefix)) if !prefix.is_empty() => {
            need(prefix, namespace, scopes);
            attribute.name.lexical()
          }
          (Some(namespace), _) => {
            generated += 1;
            let prefix = format!("ns{}", generated);
            need(&prefix, namespace, scopes);
            format!("{}:{}", prefix, attribute.name.local_name())
          }
        };
        attribute_names.push(lexical);
      }

      let tag = if element_prefix.is_empty() {
        name.local_name().to_string()
      } else {
        format!("{}:{}", element_prefix, name.local_name())
      };
      let mut start = BytesStart::new(tag.clone());
      let mut ordered: Vec<_> = declarations.iter().collect();
      ordered.sort();
      for (prefix, namespace) in ordered {
        let key = if prefix.is_empty() {
          "xmlns".to_string()
        } else {
          format!("xmlns:{}", prefix)
        };
        start.push_attribute((key.as_str(), namespace.as_str()));
      }
      for (lexical, attribute) in attribute_names.iter().zip(attributes) {
        start.push_attribute((lexical.as_str(), attribute.value.as_str()));
      }

      if node.children().is_empty() {
        writer.write_event(Event::Empty(start))?;
      } else {
        writer.write_event(Event::Start(start))?;
        scopes.push(declarations);
        for child in node.children() {
          write_node(writer, child, scopes)?;
        }
        scopes.pop();
        writer.write_event(Event::End(BytesEnd::new(tag)))?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::qname::XPROC_STEP_NAMESPACE;

  #[test]
  fn parse_and_serialize_keep_structure() {
    let engine = TreeEngine::new();
    let doc = engine
      .parse_str("<?xml version=\"1.0\"?>\n<a x=\"1 &amp; 2\">\n  <b>text</b>\n  <c/>\n</a>")
      .unwrap();
    assert_eq!(
      engine.serialize_to_string(&doc).unwrap(),
      "<a x=\"1 &amp; 2\"><b>text</b><c/></a>"
    );
    assert_eq!(doc, engine.parse_str("<a x='1 &amp; 2'><b>text</b><c></c></a>").unwrap());
  }

  #[test]
  fn namespaces_are_resolved_and_redeclared() {
    let engine = TreeEngine::new();
    let doc = engine
      .parse_str(&format!("<c:result xmlns:c=\"{}\">ok</c:result>", XPROC_STEP_NAMESPACE))
      .unwrap();
    let root = doc.document_element().unwrap();
    assert_eq!(root.name(), Some(&QName::xproc_step("result")));

    let built = Document::document(vec![Document::element(
      QName::xproc_step("param"),
      vec![Attribute::new("name", "x")],
      Vec::new(),
    )]);
    assert_eq!(
      engine.serialize_to_string(&built).unwrap(),
      format!("<c:param xmlns:c=\"{}\" name=\"x\"/>", XPROC_STEP_NAMESPACE)
    );
  }

  #[test]
  fn malformed_input_is_an_error() {
    let engine = TreeEngine::new();
    assert!(engine.parse_str("<a><b></a>").is_err());
    assert!(engine.parse_str("<p:a/>").is_err());
    assert!(engine.parse_str("").is_err());
  }

  #[test]
  fn queries_are_cached() {
    let engine = TreeEngine::new();
    let doc = engine.parse_str("<a><b/><b/></a>").unwrap();
    let context = QueryContext::new(Some(doc));
    assert_eq!(engine.evaluate_query("count(//b)", &context).unwrap(), vec![Item::Number(2.0)]);
    assert_eq!(engine.evaluate_query("count(//b)", &context).unwrap(), vec![Item::Number(2.0)]);
    assert_eq!(engine.queries.lock().len(), 1);
  }
}
