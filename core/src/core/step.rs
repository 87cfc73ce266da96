// portflow/src/core/step.rs

//! Defines [`Step`], an immutable node of the pipeline graph.
//!
//! A step carries its identity (name, declared type), the processor implementing its
//! behavior, its declared ports, options, variables and parameters and, when compound, the
//! ordered list of child steps forming its subpipeline.
//!
//! Steps are values: every builder method consumes the step and returns a new one, sharing
//! nothing mutable with the original. The dependency analysis of a compound step's
//! subpipeline is computed at most once per step value and cached.

use crate::core::binding::PortBinding;
use crate::core::location::Location;
use crate::core::port::{names, Port, PortKind, PortReference};
use crate::core::processor::{AtomicProcessor, AtomicStep, ExternalResources, ProcessorKind, StepProcessor};
use crate::core::qname::QName;
use crate::core::variable::Variable;
use crate::error::{PipelineResult, StructuralError};
use crate::pipeline::dependencies::SubpipelineDependencies;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{event, Level};

/// A `p:log` declaration: after the step ran, the documents on `port` are serialized to `href`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepLog {
  pub port: String,
  pub href: String,
}

#[derive(Clone)]
struct StepInner {
  step_type: QName,
  name: Option<String>,
  internal_name: Option<String>,
  processor: Arc<dyn StepProcessor>,
  ports: IndexMap<String, Port>,
  variables: IndexMap<QName, Variable>,
  parameters: IndexMap<QName, Variable>,
  subpipeline: Vec<Step>,
  logs: Vec<StepLog>,
  location: Location,
  dependencies: OnceCell<Result<Arc<SubpipelineDependencies>, StructuralError>>,
}

/// An immutable pipeline graph node. Cloning is cheap.
#[derive(Clone)]
pub struct Step {
  inner: Arc<StepInner>,
}

impl Step {
  pub fn new(step_type: QName, processor: Arc<dyn StepProcessor>) -> Self {
    Self {
      inner: Arc::new(StepInner {
        step_type,
        name: None,
        internal_name: None,
        processor,
        ports: IndexMap::new(),
        variables: IndexMap::new(),
        parameters: IndexMap::new(),
        subpipeline: Vec::new(),
        logs: Vec::new(),
        location: Location::unknown(),
        dependencies: OnceCell::new(),
      }),
    }
  }

  /// A leaf step whose body is `processor`.
  pub fn atomic<P: AtomicProcessor>(step_type: QName, processor: P) -> Self {
    Self::new(step_type, Arc::new(AtomicStep(processor)))
  }

  /// Applies `edit` to a private copy of this step. The cached dependency analysis is
  /// dropped since the edit may change the subpipeline or its bindings.
  fn edit(self, edit: impl FnOnce(&mut StepInner)) -> Self {
    let mut inner = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| (*shared).clone());
    edit(&mut inner);
    inner.dependencies = OnceCell::new();
    Self { inner: Arc::new(inner) }
  }

  // --- Builders ---

  /// Renames the step and every port it declares.
  ///
  /// Renaming a declared pipeline keeps its former name as the internal name, so that its
  /// subpipeline can keep addressing the pipeline's own ports by the declared name.
  pub fn named(self, name: impl Into<String>) -> Self {
    let name = name.into();
    self.edit(|inner| {
      if inner.processor.kind() == ProcessorKind::Pipeline && inner.internal_name.is_none() {
        if let Some(previous) = inner.name.take() {
          if previous != name {
            inner.internal_name = Some(previous);
          }
        }
      }
      inner.ports = inner
        .ports
        .drain(..)
        .map(|(port_name, port)| (port_name, port.with_step_name(name.clone())))
        .collect();
      inner.name = Some(name);
    })
  }

  pub fn at(self, location: Location) -> Self {
    self.edit(|inner| inner.location = location)
  }

  /// Declares (or redeclares) a port.
  pub fn with_port(self, port: Port) -> Self {
    self.edit(|inner| {
      let step_name = inner.name.clone().unwrap_or_default();
      let port = port.with_step_name(step_name);
      inner.ports.insert(port.port_name().to_string(), port);
    })
  }

  pub fn with_ports(self, ports: impl IntoIterator<Item = Port>) -> Self {
    ports.into_iter().fold(self, Step::with_port)
  }

  /// Appends a binding to a declared port.
  ///
  /// # Panics
  /// Panics if no port named `port_name` is declared on this step.
  pub fn bind(self, port_name: &str, binding: PortBinding) -> Self {
    self.ensure_port_exists(port_name);
    self.edit(|inner| {
      if let Some(port) = inner.ports.get_mut(port_name) {
        *port = port.clone().bind(binding);
      }
    })
  }

  /// Replaces the bindings of a declared port with a single pipe from `step_name/port`.
  ///
  /// # Panics
  /// Panics if no port named `port_name` is declared on this step.
  pub fn pipe(self, port_name: &str, from_step: impl Into<String>, from_port: impl Into<String>) -> Self {
    self.ensure_port_exists(port_name);
    let binding = PortBinding::pipe(from_step, from_port);
    self.edit(|inner| {
      if let Some(port) = inner.ports.get_mut(port_name) {
        *port = port.clone().with_bindings(vec![binding]);
      }
    })
  }

  /// Declares an option, a variable or a parameter.
  pub fn declare_variable(self, variable: Variable) -> PipelineResult<Self> {
    let duplicate = if variable.is_parameter() {
      self.inner.parameters.contains_key(variable.name())
    } else {
      self.inner.variables.contains_key(variable.name())
    };
    if duplicate {
      return Err(
        StructuralError::DuplicateVariable {
          step_name: self.name().to_string(),
          variable: variable.name().clone(),
        }
        .into(),
      );
    }
    Ok(self.with_variable(variable))
  }

  /// Declares or redeclares an option, a variable or a parameter.
  pub fn with_variable(self, variable: Variable) -> Self {
    self.edit(|inner| {
      if variable.is_parameter() {
        inner.parameters.insert(variable.name().clone(), variable);
      } else {
        inner.variables.insert(variable.name().clone(), variable);
      }
    })
  }

  /// Sets the literal value of an option, declaring it if needed.
  pub fn set_option(self, name: impl Into<QName>, value: impl Into<String>) -> Self {
    let name = name.into();
    let value = value.into();
    self.edit(|inner| {
      let option = match inner.variables.get(&name) {
        Some(existing) => existing.clone().set_select(None).value(value),
        None => Variable::option(name.clone()).value(value),
      };
      inner.variables.insert(name, option);
    })
  }

  /// Sets the literal value of a parameter, declaring it if needed.
  pub fn set_parameter(self, name: impl Into<QName>, value: impl Into<String>) -> Self {
    let name = name.into();
    let value = value.into();
    self.edit(|inner| {
      let parameter = match inner.parameters.get(&name) {
        Some(existing) => existing.clone().set_select(None).value(value),
        None => Variable::parameter(name.clone()).value(value),
      };
      inner.parameters.insert(name, parameter);
    })
  }

  pub fn with_subpipeline(self, steps: Vec<Step>) -> Self {
    self.edit(|inner| inner.subpipeline = steps)
  }

  pub fn add_step(self, step: Step) -> Self {
    self.edit(|inner| inner.subpipeline.push(step))
  }

  pub fn with_log(self, port: impl Into<String>, href: impl Into<String>) -> Self {
    let log = StepLog {
      port: port.into(),
      href: href.into(),
    };
    self.edit(|inner| inner.logs.push(log))
  }

  /// Gives every unnamed step in the tree a name derived from its position: `!1` for the
  /// root, `!1.2` for its second child and so on. Explicit names are kept.
  pub fn with_implicit_names(self) -> Self {
    self.assign_implicit_names("!1")
  }

  fn assign_implicit_names(self, path: &str) -> Self {
    let named = if self.inner.name.is_none() {
      self.named(path)
    } else {
      self
    };
    if named.inner.subpipeline.is_empty() {
      return named;
    }
    let children = named
      .inner
      .subpipeline
      .iter()
      .enumerate()
      .map(|(index, child)| child.clone().assign_implicit_names(&format!("{}.{}", path, index + 1)))
      .collect();
    named.with_subpipeline(children)
  }

  fn ensure_port_exists(&self, port_name: &str) {
    if !self.inner.ports.contains_key(port_name) {
      panic!(
        "Portflow setup error: Port '{}' not declared on step '{}' ({}).",
        port_name,
        self.name(),
        self.inner.step_type
      );
    }
  }

  // --- Accessors ---

  pub fn step_type(&self) -> &QName {
    &self.inner.step_type
  }

  /// The step name, or the empty string for a step that was never named.
  pub fn name(&self) -> &str {
    self.inner.name.as_deref().unwrap_or("")
  }

  pub fn has_name(&self) -> bool {
    self.inner.name.is_some()
  }

  pub fn internal_name(&self) -> Option<&str> {
    self.inner.internal_name.as_deref()
  }

  pub fn processor(&self) -> &Arc<dyn StepProcessor> {
    &self.inner.processor
  }

  pub fn kind(&self) -> ProcessorKind {
    self.inner.processor.kind()
  }

  pub fn is_compound(&self) -> bool {
    self.kind() != ProcessorKind::Atomic
  }

  pub fn external_resources(&self) -> ExternalResources {
    self.inner.processor.external_resources()
  }

  /// Whether the step reads resources outside the document flow: its processor says so, or
  /// one of its input ports is bound to an external document.
  pub fn reads_external_resources(&self) -> bool {
    self.external_resources().read
      || self
        .input_ports()
        .any(|port| port.bindings().iter().any(PortBinding::is_external))
  }

  pub fn writes_external_resources(&self) -> bool {
    self.external_resources().write
  }

  pub fn location(&self) -> &Location {
    &self.inner.location
  }

  pub fn ports(&self) -> impl Iterator<Item = &Port> {
    self.inner.ports.values()
  }

  pub fn get_port(&self, port_name: &str) -> Option<&Port> {
    self.inner.ports.get(port_name)
  }

  pub fn port_reference(&self, port_name: &str) -> PortReference {
    PortReference::new(self.name(), port_name)
  }

  /// Input and parameter ports, in declaration order.
  pub fn input_ports(&self) -> impl Iterator<Item = &Port> {
    self.ports().filter(|port| port.is_input())
  }

  pub fn output_ports(&self) -> impl Iterator<Item = &Port> {
    self.ports().filter(|port| port.is_output())
  }

  pub fn parameter_ports(&self) -> impl Iterator<Item = &Port> {
    self.ports().filter(|port| port.is_parameter())
  }

  pub fn variables(&self) -> impl Iterator<Item = &Variable> {
    self.inner.variables.values()
  }

  pub fn parameters(&self) -> impl Iterator<Item = &Variable> {
    self.inner.parameters.values()
  }

  pub fn get_variable(&self, name: &QName) -> Option<&Variable> {
    self.inner.variables.get(name)
  }

  pub fn subpipeline(&self) -> &[Step] {
    &self.inner.subpipeline
  }

  pub fn logs(&self) -> &[StepLog] {
    &self.inner.logs
  }

  // --- Primary ports ---

  fn port_group(&self, kind: PortKind) -> impl Iterator<Item = &Port> {
    self.ports().filter(move |port| port.kind() == kind)
  }

  /// Whether `port` is the effective primary port of its group.
  ///
  /// Within a group (inputs, outputs, parameters), a port is primary when it is the only
  /// port of the group and not marked `primary=false`, or when it is explicitly marked
  /// `primary=true`.
  pub fn is_primary(&self, port: &Port) -> bool {
    if port.is_not_primary() {
      return false;
    }
    port.is_primary() || self.port_group(port.kind()).count() == 1
  }

  fn primary_port(&self, kind: PortKind) -> Option<&Port> {
    self.port_group(kind).find(|port| self.is_primary(port))
  }

  pub fn primary_input_port(&self) -> Option<&Port> {
    self.primary_port(PortKind::Input)
  }

  pub fn primary_output_port(&self) -> Option<&Port> {
    self.primary_port(PortKind::Output)
  }

  pub fn primary_parameter_port(&self) -> Option<&Port> {
    self.primary_port(PortKind::Parameter)
  }

  /// The port supplying the context node of option and variable queries: an input port
  /// named `xpath-context`, or the primary input port when there is none.
  pub fn xpath_context_port(&self) -> Option<&Port> {
    self
      .port_group(PortKind::Input)
      .find(|port| port.port_name() == names::XPATH_CONTEXT)
      .or_else(|| self.primary_input_port())
  }

  pub fn is_xpath_context_port(&self, port: &Port) -> bool {
    self
      .xpath_context_port()
      .map_or(false, |context| context.port_name() == port.port_name() && port.kind() == PortKind::Input)
  }

  // --- Subpipeline analysis and validation ---

  /// The dependency analysis of this step's subpipeline, computed once per step value.
  pub fn subpipeline_dependencies(&self) -> PipelineResult<Arc<SubpipelineDependencies>> {
    self
      .inner
      .dependencies
      .get_or_init(|| {
        event!(Level::TRACE, step = %self.name(), "Computing subpipeline dependencies.");
        SubpipelineDependencies::compute(self.name(), &self.inner.subpipeline).map(Arc::new)
      })
      .clone()
      .map_err(Into::into)
  }

  /// Declaration-time checks of this step: every step of its subpipeline has a unique
  /// name, and there is no cyclic dependency.
  pub fn check_declared(&self) -> PipelineResult<()> {
    let mut seen = HashSet::new();
    for (index, child) in self.inner.subpipeline.iter().enumerate() {
      if !child.has_name() {
        return Err(
          StructuralError::UnnamedStep {
            parent: self.name().to_string(),
            position: index + 1,
          }
          .into(),
        );
      }
      if !seen.insert(child.name()) {
        return Err(
          StructuralError::DuplicateStepName {
            parent: self.name().to_string(),
            step_name: child.name().to_string(),
          }
          .into(),
        );
      }
    }
    self.subpipeline_dependencies().map(|_| ())
  }

  /// Instance-level checks of this step's ports.
  pub fn check_instance(&self) -> PipelineResult<()> {
    for kind in [PortKind::Input, PortKind::Output, PortKind::Parameter] {
      let group: Vec<&Port> = self.port_group(kind).collect();
      let unmarked = group.iter().filter(|port| port.primary_flag().is_none()).count();
      let explicit = group.iter().any(|port| port.is_primary());
      if group.len() >= 2 && !explicit && unmarked >= 2 {
        return Err(
          StructuralError::AmbiguousPrimaryPort {
            step_name: self.name().to_string(),
            kind: kind.to_string(),
          }
          .into(),
        );
      }
    }

    for port in self.port_group(PortKind::Input) {
      if port.bindings().is_empty() && !self.is_primary(port) && !self.is_xpath_context_port(port) {
        return Err(
          StructuralError::UnboundInputPort {
            step_name: self.name().to_string(),
            port_name: port.port_name().to_string(),
          }
          .into(),
        );
      }
    }

    if self.is_compound() {
      for port in self.output_ports() {
        if port.bindings().is_empty() && !self.is_primary(port) {
          return Err(
            StructuralError::UnconnectedOutputPort {
              step_name: self.name().to_string(),
              port_name: port.port_name().to_string(),
            }
            .into(),
          );
        }
      }
    }
    Ok(())
  }

  /// Runs both checks over the whole step tree.
  pub fn validate(&self) -> PipelineResult<()> {
    self.check_declared()?;
    self.check_instance()?;
    for child in &self.inner.subpipeline {
      child.validate()?;
    }
    Ok(())
  }
}

impl fmt::Debug for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Step")
      .field("type", &self.inner.step_type)
      .field("name", &self.inner.name)
      .field("internal_name", &self.inner.internal_name)
      .field("kind", &self.kind())
      .field("ports", &self.inner.ports.keys().collect::<Vec<_>>())
      .field("variables", &self.inner.variables.keys().collect::<Vec<_>>())
      .field("parameters", &self.inner.parameters.keys().collect::<Vec<_>>())
      .field("subpipeline", &self.inner.subpipeline.len())
      .finish()
  }
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.inner.step_type, self.name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::steps;

  fn identity() -> Step {
    Step::atomic(QName::xproc("identity"), steps::Identity)
  }

  #[test]
  fn single_unmarked_port_is_primary() {
    let step = identity().with_port(Port::input("source")).named("id");
    let source = step.get_port("source").unwrap();
    assert!(step.is_primary(source));
    assert_eq!(step.primary_input_port().map(Port::port_name), Some("source"));
    assert_eq!(step.xpath_context_port().map(Port::port_name), Some("source"));
    assert!(step.check_instance().is_ok());
  }

  #[test]
  fn two_unmarked_ports_are_ambiguous() {
    let step = identity()
      .named("id")
      .with_port(Port::input("a").pipe("x", "result"))
      .with_port(Port::input("b").pipe("x", "result"));
    assert!(step.primary_input_port().is_none());
    let err = step.check_instance().unwrap_err();
    assert!(matches!(
      err,
      crate::error::PipelineError::Structural(StructuralError::AmbiguousPrimaryPort { .. })
    ));
  }

  #[test]
  fn explicit_primary_wins_and_not_primary_is_excluded() {
    let step = identity()
      .named("id")
      .with_port(Port::input("a").primary(false).pipe("x", "result"))
      .with_port(Port::input("b").primary(true));
    assert_eq!(step.primary_input_port().map(Port::port_name), Some("b"));

    let step = identity()
      .named("id")
      .with_port(Port::input("a").pipe("x", "result"))
      .with_port(Port::input("b").primary(true));
    assert_eq!(step.primary_input_port().map(Port::port_name), Some("b"));
    assert!(step.check_instance().is_ok());
  }

  #[test]
  fn unmarked_port_beside_a_non_primary_one_is_not_primary() {
    let step = identity()
      .named("id")
      .with_port(Port::input("a").primary(false).pipe("x", "result"))
      .with_port(Port::input("b"));
    assert!(!step.is_primary(step.get_port("b").unwrap()));
    assert!(step.primary_input_port().is_none());
    assert!(step.xpath_context_port().is_none());
    let err = step.check_instance().unwrap_err();
    assert!(matches!(
      err,
      crate::error::PipelineError::Structural(StructuralError::UnboundInputPort { ref port_name, .. }) if port_name == "b"
    ));
  }

  #[test]
  fn single_port_marked_not_primary_is_not_primary() {
    let step = identity().with_port(Port::input("source").primary(false)).named("id");
    assert!(step.primary_input_port().is_none());
  }

  #[test]
  fn renaming_cascades_to_ports() {
    let step = identity().with_port(Port::input("source")).named("first").named("second");
    assert_eq!(step.get_port("source").unwrap().step_name(), "second");
    assert_eq!(step.internal_name(), None);
  }

  #[test]
  fn implicit_names_follow_tree_position() {
    let group = steps::group().add_step(identity()).add_step(identity().named("kept"));
    let root = steps::group().add_step(identity()).add_step(group).with_implicit_names();
    assert_eq!(root.name(), "!1");
    assert_eq!(root.subpipeline()[0].name(), "!1.1");
    assert_eq!(root.subpipeline()[1].name(), "!1.2");
    assert_eq!(root.subpipeline()[1].subpipeline()[0].name(), "!1.2.1");
    assert_eq!(root.subpipeline()[1].subpipeline()[1].name(), "kept");
  }

  #[test]
  fn duplicate_variable_is_rejected() {
    let step = identity().named("id").declare_variable(Variable::option("x")).unwrap();
    assert!(step.declare_variable(Variable::option("x")).is_err());
  }

  #[test]
  #[should_panic(expected = "Portflow setup error")]
  fn binding_an_undeclared_port_panics() {
    let _ = identity().named("id").bind("nope", PortBinding::Empty);
  }
}
