// portflow/src/core/qname.rs

//! Qualified names for step types, variables and document nodes.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

pub const XPROC_NAMESPACE: &str = "http://www.w3.org/ns/xproc";
pub const XPROC_STEP_NAMESPACE: &str = "http://www.w3.org/ns/xproc-step";

/// A namespace-qualified name.
///
/// Equality, ordering and hashing only consider the namespace URI and the local name.
/// The prefix is kept for display and serialization.
#[derive(Clone, Debug)]
pub struct QName {
  namespace: Option<String>,
  local: String,
  prefix: Option<String>,
}

impl QName {
  /// A name in no namespace.
  pub fn local(local: impl Into<String>) -> Self {
    Self {
      namespace: None,
      local: local.into(),
      prefix: None,
    }
  }

  pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
    Self {
      namespace: Some(namespace.into()),
      local: local.into(),
      prefix: None,
    }
  }

  pub fn with_prefix(namespace: impl Into<String>, prefix: impl Into<String>, local: impl Into<String>) -> Self {
    Self {
      namespace: Some(namespace.into()),
      local: local.into(),
      prefix: Some(prefix.into()),
    }
  }

  /// A name in the pipeline language namespace (`p:` prefix).
  pub fn xproc(local: impl Into<String>) -> Self {
    Self::with_prefix(XPROC_NAMESPACE, "p", local)
  }

  /// A name in the step vocabulary namespace (`c:` prefix).
  pub fn xproc_step(local: impl Into<String>) -> Self {
    Self::with_prefix(XPROC_STEP_NAMESPACE, "c", local)
  }

  pub fn namespace(&self) -> Option<&str> {
    self.namespace.as_deref()
  }

  pub fn local_name(&self) -> &str {
    &self.local
  }

  pub fn prefix(&self) -> Option<&str> {
    self.prefix.as_deref()
  }

  /// `prefix:local` when a prefix is known, the bare local name otherwise.
  pub fn lexical(&self) -> String {
    match &self.prefix {
      Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, self.local),
      _ => self.local.clone(),
    }
  }
}

impl PartialEq for QName {
  fn eq(&self, other: &Self) -> bool {
    self.namespace == other.namespace && self.local == other.local
  }
}

impl Eq for QName {}

impl Hash for QName {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.namespace.hash(state);
    self.local.hash(state);
  }
}

impl PartialOrd for QName {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QName {
  fn cmp(&self, other: &Self) -> Ordering {
    (&self.namespace, &self.local).cmp(&(&other.namespace, &other.local))
  }
}

impl fmt::Display for QName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (&self.prefix, &self.namespace) {
      (Some(_), _) => f.write_str(&self.lexical()),
      (None, Some(namespace)) => write!(f, "{{{}}}{}", namespace, self.local),
      (None, None) => f.write_str(&self.local),
    }
  }
}

impl From<&str> for QName {
  fn from(local: &str) -> Self {
    QName::local(local)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn prefix_does_not_take_part_in_equality() {
    let a = QName::with_prefix(XPROC_NAMESPACE, "p", "identity");
    let b = QName::with_prefix(XPROC_NAMESPACE, "xproc", "identity");
    assert_eq!(a, b);
    let set: HashSet<QName> = [a, b].into_iter().collect();
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn display_prefers_prefix() {
    assert_eq!(QName::xproc("store").to_string(), "p:store");
    assert_eq!(QName::new("urn:x", "y").to_string(), "{urn:x}y");
    assert_eq!(QName::local("href").to_string(), "href");
  }
}
