// portflow/src/environment/definition.rs

//! Defines [`Environment`], the immutable scope threaded through step invocations.

use super::port::EnvironmentPort;
use crate::core::binding::PortBinding;
use crate::core::location::Location;
use crate::core::port::{names, Port, PortReference};
use crate::core::qname::QName;
use crate::core::step::Step;
use crate::core::variable::Variable;
use crate::document::{Document, Item, QueryContext};
use crate::error::{EvaluationError, PipelineResult, ResolutionError};
use crate::pipeline::context::{PipelineContext, TaskContext};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Everything a step sees: the ports readable so far, the variables in scope and the
/// three designated ports (default readable, default parameters, XPath context).
///
/// Never mutated. Every operation returns a new environment sharing the untouched maps
/// with this one, so cloning and deriving environments is cheap.
#[derive(Clone)]
pub struct Environment {
  pipeline: Step,
  context: PipelineContext,
  ports: Arc<HashMap<PortReference, EnvironmentPort>>,
  default_readable_port: Option<EnvironmentPort>,
  default_parameters_port: Option<EnvironmentPort>,
  xpath_context_port: Option<EnvironmentPort>,
  inherited_variables: Arc<HashMap<QName, String>>,
  local_variables: Arc<HashMap<QName, String>>,
}

impl Environment {
  /// The empty environment of a run of `pipeline`.
  pub fn new(pipeline: &Step, context: &PipelineContext) -> Self {
    Self {
      pipeline: pipeline.clone(),
      context: context.clone(),
      ports: Arc::new(HashMap::new()),
      default_readable_port: None,
      default_parameters_port: None,
      xpath_context_port: None,
      inherited_variables: Arc::new(HashMap::new()),
      local_variables: Arc::new(HashMap::new()),
    }
  }

  // --- Scope chaining ---

  /// The environment `step` runs in: its input ports resolved against this (the caller's)
  /// environment, the designated ports re-pointed at the step's own ports and its options,
  /// variables and parameters evaluated.
  #[instrument(name = "Environment::new_following_step_environment", skip_all, fields(step = %step.name()), err(Display))]
  pub fn new_following_step_environment(&self, step: &Step, task: &TaskContext) -> PipelineResult<Environment> {
    self.enter_step(step, task, true)
  }

  /// Same as [`Environment::new_following_step_environment`], leaving the variables of
  /// `step` unevaluated when `evaluate_variables` is false. Iterating steps evaluate them
  /// once per iteration instead.
  pub(crate) fn enter_step(&self, step: &Step, task: &TaskContext, evaluate_variables: bool) -> PipelineResult<Environment> {
    let mut environment = self.setup_input_ports(step);
    environment = environment.set_primary_input_port_as_default_readable_port(step)?;
    environment = environment.set_xpath_context_port_of(step)?;
    environment = environment.set_default_parameters_port_of(step)?;
    if evaluate_variables {
      environment = environment.setup_variables(step, task)?;
      environment = environment.set_default_parameters_port_of(step)?;
    }
    Ok(environment.setup_step_alias(step))
  }

  /// The environment of the first child of a compound step: this scope's local variables
  /// become inherited and the local scope starts empty.
  pub fn new_child_step_environment(&self) -> Environment {
    let mut inherited = self.inherited_variables.as_ref().clone();
    inherited.extend(self.local_variables.iter().map(|(name, value)| (name.clone(), value.clone())));
    Environment {
      inherited_variables: Arc::new(inherited),
      local_variables: Arc::new(HashMap::new()),
      ..self.clone()
    }
  }

  fn setup_input_ports(&self, step: &Step) -> Environment {
    let mut new_ports = Vec::new();
    for port in step.input_ports() {
      let mut environment_port = EnvironmentPort::new(port, self);
      if port.port_name() == names::XPATH_CONTEXT && port.bindings().is_empty() {
        if let Some(xpath_context_port) = &self.xpath_context_port {
          event!(Level::TRACE, port = %port.reference(), "Piping XPath context port.");
          environment_port = environment_port.pipe(xpath_context_port);
        }
      }
      if port.is_parameter() {
        if let Some(parameters_port) = &self.default_parameters_port {
          environment_port = environment_port.pipe(parameters_port);
        }
      }
      new_ports.push(environment_port);
    }
    for port in step.output_ports() {
      if port.bindings().is_empty() {
        new_ports.push(EnvironmentPort::new(port, self));
      }
    }
    self.add_ports(new_ports)
  }

  fn set_primary_input_port_as_default_readable_port(&self, step: &Step) -> PipelineResult<Environment> {
    let Some(primary_input_port) = step.primary_input_port() else {
      return Ok(self.clone());
    };
    let environment_port = self.get_environment_port(primary_input_port.reference())?;
    let environment_port = match &self.default_readable_port {
      Some(default_readable_port) if environment_port.is_unbound() => environment_port.pipe(default_readable_port),
      _ => environment_port.clone(),
    };
    event!(Level::TRACE, port = %environment_port.reference(), "Primary input port is the default readable port.");
    Ok(self.set_default_readable_port(environment_port))
  }

  fn set_xpath_context_port_of(&self, step: &Step) -> PipelineResult<Environment> {
    match step.xpath_context_port() {
      Some(port) => {
        let environment_port = self.get_environment_port(port.reference())?.clone();
        Ok(self.set_xpath_context_port(environment_port))
      }
      None => Ok(self.clone()),
    }
  }

  fn set_default_parameters_port_of(&self, step: &Step) -> PipelineResult<Environment> {
    match step.primary_parameter_port() {
      Some(port) => {
        let environment_port = self.get_environment_port(port.reference())?.clone();
        Ok(self.set_default_parameters_port(environment_port))
      }
      None => Ok(self.clone()),
    }
  }

  /// Makes the input ports of a renamed pipeline instance readable under the name the
  /// pipeline was declared with.
  fn setup_step_alias(&self, step: &Step) -> Environment {
    let Some(internal_name) = step.internal_name() else {
      return self.clone();
    };
    event!(Level::TRACE, step = %step.name(), internal_name, "Aliasing step ports.");
    let mut environment = self.clone();
    for port in step.input_ports() {
      let internal_port = port
        .clone()
        .with_step_name(internal_name)
        .with_bindings(vec![PortBinding::Pipe(port.reference().clone())]);
      let environment_port = EnvironmentPort::new(&internal_port, &environment);
      environment = environment.add_port(environment_port);
    }
    environment
  }

  /// Adds the output ports of `step` that are not readable yet, resolved against `source`,
  /// then makes the primary output port the default readable port (fed by the default
  /// readable port of `source` when it has no producer) and the XPath context port.
  pub fn setup_output_ports(&self, step: &Step, source: &Environment) -> PipelineResult<Environment> {
    let new_ports: Vec<EnvironmentPort> = step
      .output_ports()
      .filter(|port| !self.ports.contains_key(port.reference()))
      .map(|port| EnvironmentPort::new(port, source))
      .collect();
    let mut result = self.add_ports(new_ports);

    if let Some(primary_output_port) = step.primary_output_port() {
      let environment_port = result.get_environment_port(primary_output_port.reference())?;
      let environment_port = match &source.default_readable_port {
        Some(default_readable_port) if environment_port.is_unbound() => environment_port.pipe(default_readable_port),
        _ => environment_port.clone(),
      };
      event!(Level::TRACE, port = %environment_port.reference(), "Primary output port is the default readable port.");
      result = result.set_default_readable_port(environment_port);
    }

    Ok(match result.default_readable_port.clone() {
      Some(port) => result.set_xpath_context_port(port),
      None => result,
    })
  }

  // --- Ports ---

  /// Adds (or replaces) ports, keyed by their reference.
  pub fn add_ports(&self, ports: impl IntoIterator<Item = EnvironmentPort>) -> Environment {
    let mut ports = ports.into_iter().peekable();
    if ports.peek().is_none() {
      return self.clone();
    }
    let mut new_ports = self.ports.as_ref().clone();
    for port in ports {
      new_ports.insert(port.reference().clone(), port);
    }
    Environment {
      ports: Arc::new(new_ports),
      ..self.clone()
    }
  }

  pub fn add_port(&self, port: EnvironmentPort) -> Environment {
    self.add_ports(std::iter::once(port))
  }

  fn ensure_port(&self, port: &EnvironmentPort) -> Environment {
    match self.ports.get(port.reference()) {
      Some(existing) if existing.ptr_eq(port) => self.clone(),
      _ => self.add_port(port.clone()),
    }
  }

  /// Designates the default readable port. The port is added to the environment when it
  /// is not already there.
  pub fn set_default_readable_port(&self, port: EnvironmentPort) -> Environment {
    Environment {
      default_readable_port: Some(port.clone()),
      ..self.ensure_port(&port)
    }
  }

  pub fn set_default_parameters_port(&self, port: EnvironmentPort) -> Environment {
    Environment {
      default_parameters_port: Some(port.clone()),
      ..self.ensure_port(&port)
    }
  }

  pub fn set_xpath_context_port(&self, port: EnvironmentPort) -> Environment {
    Environment {
      xpath_context_port: Some(port.clone()),
      ..self.ensure_port(&port)
    }
  }

  pub fn get_environment_port(&self, reference: &PortReference) -> PipelineResult<&EnvironmentPort> {
    self.ports.get(reference).ok_or_else(|| {
      ResolutionError::NoSuchPort {
        reference: reference.clone(),
        available: self.available_ports(),
      }
      .into()
    })
  }

  pub fn read_nodes(&self, reference: &PortReference) -> PipelineResult<Vec<Document>> {
    self.get_environment_port(reference)?.read_nodes()
  }

  /// Reads a port that must carry exactly one document.
  pub fn read_node(&self, reference: &PortReference) -> PipelineResult<Document> {
    let mut documents = self.read_nodes(reference)?;
    if documents.len() != 1 {
      return Err(
        EvaluationError::NotExactlyOneNode {
          origin: format!("port {}", reference),
          count: documents.len(),
          location: Location::unknown(),
        }
        .into(),
      );
    }
    Ok(documents.remove(0))
  }

  /// Appends `documents` to the port `reference`.
  pub fn write_nodes(&self, reference: &PortReference, documents: Vec<Document>) -> PipelineResult<Environment> {
    let port = self.get_environment_port(reference)?.write_nodes(documents);
    let mut result = self.add_port(port.clone());
    // Keep the designated ports pointing at the latest value of the port.
    if self.default_readable_port.as_ref().map_or(false, |p| p.reference() == reference) {
      result.default_readable_port = Some(port.clone());
    }
    if self.default_parameters_port.as_ref().map_or(false, |p| p.reference() == reference) {
      result.default_parameters_port = Some(port.clone());
    }
    if self.xpath_context_port.as_ref().map_or(false, |p| p.reference() == reference) {
      result.xpath_context_port = Some(port);
    }
    Ok(result)
  }

  pub fn ports(&self) -> &HashMap<PortReference, EnvironmentPort> {
    &self.ports
  }

  /// Every readable port declared as an output port.
  pub fn output_ports(&self) -> impl Iterator<Item = &EnvironmentPort> {
    self.ports.values().filter(|port| port.declared_port().is_output())
  }

  pub fn default_readable_port(&self) -> Option<&EnvironmentPort> {
    self.default_readable_port.as_ref()
  }

  pub fn default_parameters_port(&self) -> Option<&EnvironmentPort> {
    self.default_parameters_port.as_ref()
  }

  pub fn xpath_context_port(&self) -> Option<&EnvironmentPort> {
    self.xpath_context_port.as_ref()
  }

  pub(crate) fn available_ports(&self) -> String {
    let mut references: Vec<String> = self.ports.keys().map(ToString::to_string).collect();
    references.sort();
    references.join(", ")
  }

  // --- Variables ---

  /// Merges `variables` into the local scope.
  pub fn set_local_variables(&self, variables: HashMap<QName, String>) -> Environment {
    if variables.is_empty() {
      return self.clone();
    }
    let mut local = self.local_variables.as_ref().clone();
    local.extend(variables);
    Environment {
      local_variables: Arc::new(local),
      ..self.clone()
    }
  }

  /// The value of `name`: the local scope first, then the inherited one.
  pub fn get_variable(&self, name: &QName) -> Option<&str> {
    self
      .local_variables
      .get(name)
      .or_else(|| self.inherited_variables.get(name))
      .map(String::as_str)
  }

  pub fn get_variable_or<'a>(&'a self, name: &QName, default_value: &'a str) -> &'a str {
    self.get_variable(name).unwrap_or(default_value)
  }

  /// Every visible variable, local values shadowing inherited ones.
  pub fn variables(&self) -> HashMap<QName, String> {
    let mut variables = self.inherited_variables.as_ref().clone();
    variables.extend(self.local_variables.iter().map(|(name, value)| (name.clone(), value.clone())));
    variables
  }

  pub fn local_variables(&self) -> &HashMap<QName, String> {
    &self.local_variables
  }

  pub fn inherited_variables(&self) -> &HashMap<QName, String> {
    &self.inherited_variables
  }

  // --- Queries ---

  /// The context node of option and variable queries: the first document of the XPath
  /// context port, or an empty document.
  ///
  /// When evaluating a variable (`p:variable`, not an option), more than one document on
  /// the context port is an error.
  pub fn xpath_context_node(&self, for_variable: Option<&Variable>) -> PipelineResult<Document> {
    let Some(port) = &self.xpath_context_port else {
      return Ok(Document::document(Vec::new()));
    };
    let mut documents = port.read_nodes()?;
    if let Some(variable) = for_variable {
      if variable.is_variable() && documents.len() > 1 {
        return Err(
          EvaluationError::NotExactlyOneNode {
            origin: format!("XPath context port {}", port.reference()),
            count: documents.len(),
            location: variable.location().clone(),
          }
          .into(),
        );
      }
    }
    if documents.is_empty() {
      Ok(Document::document(Vec::new()))
    } else {
      Ok(documents.swap_remove(0))
    }
  }

  /// Evaluates `query` against the XPath context node with every visible variable bound.
  pub fn evaluate_query(&self, query: &str, task: &TaskContext) -> PipelineResult<Vec<Item>> {
    let node = self.xpath_context_node(None)?;
    self.evaluate_query_on(query, Some(node), self.pipeline.location(), task)
  }

  /// Evaluates `query` against an explicit context node.
  pub fn evaluate_query_on(
    &self,
    query: &str,
    node: Option<Document>,
    location: &Location,
    task: &TaskContext,
  ) -> PipelineResult<Vec<Item>> {
    self.evaluate_with_variables(query, node, self.variables(), location, task)
  }

  pub(crate) fn evaluate_with_variables(
    &self,
    query: &str,
    node: Option<Document>,
    variables: HashMap<QName, String>,
    location: &Location,
    task: &TaskContext,
  ) -> PipelineResult<Vec<Item>> {
    let query_context = QueryContext::new(node)
      .with_variables(variables)
      .with_iteration(task.position, task.size);
    self
      .context
      .engine()
      .evaluate_query(query, &query_context)
      .map_err(|source| {
        EvaluationError::Query {
          query: query.to_string(),
          location: location.clone(),
          source,
        }
        .into()
      })
  }

  // --- Accessors ---

  pub fn pipeline(&self) -> &Step {
    &self.pipeline
  }

  pub fn context(&self) -> &PipelineContext {
    &self.context
  }

  /// The base of relative hrefs: the configured base URI, or the system id of the
  /// pipeline.
  pub fn base_uri(&self) -> Option<&str> {
    self
      .context
      .base_uri()
      .or_else(|| self.pipeline.location().system_id.as_deref())
  }

  /// Resolves the bindings of `port` against this environment.
  pub fn new_environment_port(&self, port: &Port) -> EnvironmentPort {
    EnvironmentPort::new(port, self)
  }
}

impl fmt::Debug for Environment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut ports: Vec<String> = self.ports.keys().map(ToString::to_string).collect();
    ports.sort();
    f.debug_struct("Environment")
      .field("pipeline", &self.pipeline.name())
      .field("ports", &ports)
      .field("default_readable_port", &self.default_readable_port.as_ref().map(EnvironmentPort::reference))
      .field(
        "default_parameters_port",
        &self.default_parameters_port.as_ref().map(EnvironmentPort::reference),
      )
      .field("xpath_context_port", &self.xpath_context_port.as_ref().map(EnvironmentPort::reference))
      .field("inherited_variables", &self.inherited_variables)
      .field("local_variables", &self.local_variables)
      .finish()
  }
}
