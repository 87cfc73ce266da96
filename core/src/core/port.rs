// portflow/src/core/port.rs

//! Port declarations and the `(step, port)` references used to address them.

use super::binding::PortBinding;
use super::location::Location;
use std::fmt;

/// Well-known port names.
pub mod names {
  pub const SOURCE: &str = "source";
  pub const RESULT: &str = "result";
  pub const PARAMETERS: &str = "parameters";
  pub const XPATH_CONTEXT: &str = "xpath-context";
  pub const ITERATION_SOURCE: &str = "iteration-source";
  pub const CURRENT: &str = "current";
}

/// Identifies a port: the owning step's name plus the port's name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortReference {
  pub step_name: String,
  pub port_name: String,
}

impl PortReference {
  pub fn new(step_name: impl Into<String>, port_name: impl Into<String>) -> Self {
    Self {
      step_name: step_name.into(),
      port_name: port_name.into(),
    }
  }

  pub fn with_step_name(&self, step_name: impl Into<String>) -> Self {
    Self {
      step_name: step_name.into(),
      port_name: self.port_name.clone(),
    }
  }
}

impl fmt::Display for PortReference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.step_name, self.port_name)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortKind {
  Input,
  Output,
  Parameter,
}

impl fmt::Display for PortKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      PortKind::Input => "input",
      PortKind::Output => "output",
      PortKind::Parameter => "parameter",
    })
  }
}

/// A declared port. Immutable: every setter returns a new value.
///
/// `primary` and `sequence` are tri-state: `None` means the attribute was not written,
/// which matters for primary-port inference (see [`crate::core::step::Step::is_primary`]).
#[derive(Clone, Debug)]
pub struct Port {
  reference: PortReference,
  kind: PortKind,
  primary: Option<bool>,
  sequence: Option<bool>,
  select: Option<String>,
  bindings: Vec<PortBinding>,
  location: Location,
}

impl Port {
  pub fn new(port_name: impl Into<String>, kind: PortKind) -> Self {
    Self {
      reference: PortReference::new("", port_name),
      kind,
      primary: None,
      sequence: None,
      select: None,
      bindings: Vec::new(),
      location: Location::unknown(),
    }
  }

  pub fn input(port_name: impl Into<String>) -> Self {
    Self::new(port_name, PortKind::Input)
  }

  pub fn output(port_name: impl Into<String>) -> Self {
    Self::new(port_name, PortKind::Output)
  }

  pub fn parameter(port_name: impl Into<String>) -> Self {
    Self::new(port_name, PortKind::Parameter)
  }

  pub fn primary(mut self, primary: bool) -> Self {
    self.primary = Some(primary);
    self
  }

  pub fn sequence(mut self, sequence: bool) -> Self {
    self.sequence = Some(sequence);
    self
  }

  pub fn select(mut self, select: impl Into<String>) -> Self {
    self.select = Some(select.into());
    self
  }

  pub fn without_select(mut self) -> Self {
    self.select = None;
    self
  }

  pub fn at(mut self, location: Location) -> Self {
    self.location = location;
    self
  }

  pub fn with_step_name(mut self, step_name: impl Into<String>) -> Self {
    self.reference = self.reference.with_step_name(step_name);
    self
  }

  pub fn with_bindings(mut self, bindings: Vec<PortBinding>) -> Self {
    self.bindings = bindings;
    self
  }

  pub fn bind(mut self, binding: PortBinding) -> Self {
    self.bindings.push(binding);
    self
  }

  /// Replaces the bindings with a single pipe from `step_name/port_name`.
  pub fn pipe(self, step_name: impl Into<String>, port_name: impl Into<String>) -> Self {
    self.with_bindings(vec![PortBinding::pipe(step_name, port_name)])
  }

  pub fn reference(&self) -> &PortReference {
    &self.reference
  }

  pub fn step_name(&self) -> &str {
    &self.reference.step_name
  }

  pub fn port_name(&self) -> &str {
    &self.reference.port_name
  }

  pub fn kind(&self) -> PortKind {
    self.kind
  }

  /// Parameter ports are input ports too.
  pub fn is_input(&self) -> bool {
    matches!(self.kind, PortKind::Input | PortKind::Parameter)
  }

  pub fn is_output(&self) -> bool {
    self.kind == PortKind::Output
  }

  pub fn is_parameter(&self) -> bool {
    self.kind == PortKind::Parameter
  }

  /// Explicitly declared primary.
  pub fn is_primary(&self) -> bool {
    self.primary == Some(true)
  }

  /// Explicitly declared not primary.
  pub fn is_not_primary(&self) -> bool {
    self.primary == Some(false)
  }

  pub fn primary_flag(&self) -> Option<bool> {
    self.primary
  }

  pub fn is_sequence(&self) -> bool {
    self.sequence == Some(true)
  }

  pub fn select_query(&self) -> Option<&str> {
    self.select.as_deref()
  }

  pub fn bindings(&self) -> &[PortBinding] {
    &self.bindings
  }

  pub fn location(&self) -> &Location {
    &self.location
  }
}

impl fmt::Display for Port {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-port({})", self.kind, self.reference)
  }
}
