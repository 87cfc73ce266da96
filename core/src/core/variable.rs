// portflow/src/core/variable.rs

//! Options, variables and parameters declared on a step.

use super::binding::PortBinding;
use super::location::Location;
use super::qname::QName;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariableKind {
  Option,
  Variable,
  Parameter,
}

/// A named value declaration.
///
/// Resolution order at run time: a literal `value` wins, then `select` is evaluated, and a
/// declaration with neither contributes nothing unless it is `required`.
#[derive(Clone, Debug)]
pub struct Variable {
  name: QName,
  kind: VariableKind,
  select: Option<String>,
  value: Option<String>,
  required: bool,
  binding: Option<PortBinding>,
  location: Location,
}

impl Variable {
  fn new(name: QName, kind: VariableKind) -> Self {
    Self {
      name,
      kind,
      select: None,
      value: None,
      required: false,
      binding: None,
      location: Location::unknown(),
    }
  }

  pub fn option(name: impl Into<QName>) -> Self {
    Self::new(name.into(), VariableKind::Option)
  }

  pub fn variable(name: impl Into<QName>) -> Self {
    Self::new(name.into(), VariableKind::Variable)
  }

  pub fn parameter(name: impl Into<QName>) -> Self {
    Self::new(name.into(), VariableKind::Parameter)
  }

  pub fn select(mut self, select: impl Into<String>) -> Self {
    self.select = Some(select.into());
    self
  }

  pub fn set_select(mut self, select: Option<String>) -> Self {
    self.select = select;
    self
  }

  pub fn value(mut self, value: impl Into<String>) -> Self {
    self.value = Some(value.into());
    self
  }

  pub fn set_value(mut self, value: Option<String>) -> Self {
    self.value = value;
    self
  }

  pub fn required(mut self, required: bool) -> Self {
    self.required = required;
    self
  }

  /// Binds the query context of `select` to a port instead of the step's XPath-context port.
  pub fn bind(mut self, binding: PortBinding) -> Self {
    self.binding = Some(binding);
    self
  }

  pub fn set_binding(mut self, binding: Option<PortBinding>) -> Self {
    self.binding = binding;
    self
  }

  pub fn at(mut self, location: Location) -> Self {
    self.location = location;
    self
  }

  pub fn name(&self) -> &QName {
    &self.name
  }

  pub fn kind(&self) -> VariableKind {
    self.kind
  }

  pub fn is_option(&self) -> bool {
    self.kind == VariableKind::Option
  }

  pub fn is_variable(&self) -> bool {
    self.kind == VariableKind::Variable
  }

  pub fn is_parameter(&self) -> bool {
    self.kind == VariableKind::Parameter
  }

  pub fn select_query(&self) -> Option<&str> {
    self.select.as_deref()
  }

  pub fn literal_value(&self) -> Option<&str> {
    self.value.as_deref()
  }

  pub fn is_required(&self) -> bool {
    self.required
  }

  pub fn binding(&self) -> Option<&PortBinding> {
    self.binding.as_ref()
  }

  pub fn location(&self) -> &Location {
    &self.location
  }
}

impl fmt::Display for Variable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self.kind {
      VariableKind::Option => "option",
      VariableKind::Variable => "variable",
      VariableKind::Parameter => "param",
    };
    write!(f, "{}[{}]", kind, self.name)
  }
}
