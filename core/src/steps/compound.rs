// portflow/src/steps/compound.rs

//! Built-in compound steps: group (and declared pipelines), for-each, choose and viewport.

use super::log::write_logs;
use crate::core::binding::PortBinding;
use crate::core::port::names::{CURRENT, ITERATION_SOURCE, RESULT, SOURCE};
use crate::core::port::Port;
use crate::core::processor::{ProcessorKind, StepProcessor};
use crate::core::qname::QName;
use crate::core::step::Step;
use crate::document::{Document, Item};
use crate::environment::{Environment, EnvironmentPort};
use crate::error::{EvaluationError, PipelineResult, ResolutionError};
use crate::pipeline::context::TaskContext;
use crate::pipeline::dependencies::SubpipelineDependencies;
use crate::pipeline::execution::{run_steps, run_subpipeline};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use tracing::{event, instrument, Level};

pub(crate) const TEST: &str = "test";
pub(crate) const MATCH: &str = "match";

/// Runs its subpipeline once. Used for `p:group`, `p:when`, `p:otherwise` and declared
/// pipelines.
pub struct Group {
  kind: ProcessorKind,
}

impl Group {
  pub fn compound() -> Self {
    Self {
      kind: ProcessorKind::Compound,
    }
  }

  pub fn pipeline() -> Self {
    Self {
      kind: ProcessorKind::Pipeline,
    }
  }
}

#[async_trait]
impl StepProcessor for Group {
  fn kind(&self) -> ProcessorKind {
    self.kind
  }

  #[instrument(name = "Group::run", skip_all, fields(step = %step.name()), err(Display))]
  async fn run(&self, step: &Step, environment: Environment, task: &TaskContext) -> PipelineResult<Environment> {
    let step_environment = environment.new_following_step_environment(step, task)?;
    let result = run_subpipeline(step, &step_environment, task).await?;
    let result = step_environment.setup_output_ports(step, &result)?;
    write_logs(step, &result)?;
    Ok(result)
  }
}

/// Runs its subpipeline once per document of `iteration-source`, sequentially, and
/// concatenates what each iteration left on the output ports.
pub struct ForEach;

#[async_trait]
impl StepProcessor for ForEach {
  fn kind(&self) -> ProcessorKind {
    ProcessorKind::Compound
  }

  #[instrument(name = "ForEach::run", skip_all, fields(step = %step.name()), err(Display))]
  async fn run(&self, step: &Step, environment: Environment, task: &TaskContext) -> PipelineResult<Environment> {
    // Options and variables may depend on the current document: evaluated per iteration.
    let step_environment = environment.enter_step(step, task, false)?;
    let documents = step_environment.read_nodes(&step.port_reference(ITERATION_SOURCE))?;
    let dependencies = step.subpipeline_dependencies()?;
    let size = documents.len();
    event!(Level::DEBUG, iterations = size, "Iterating.");

    let mut collected: IndexMap<String, Vec<Document>> = step
      .output_ports()
      .map(|port| (port.port_name().to_string(), Vec::new()))
      .collect();
    for (index, document) in documents.into_iter().enumerate() {
      let iteration_task = task.enter(step.name()).iteration(index + 1, size);
      let iteration_environment = iteration_environment(step, &step_environment, document, &iteration_task)?;
      let result = run_steps(step.subpipeline(), &dependencies, &iteration_environment, &iteration_task).await?;
      let wired = iteration_environment.setup_output_ports(step, &result)?;
      for port in step.output_ports() {
        let documents = wired.read_nodes(port.reference())?;
        collected.entry(port.port_name().to_string()).or_default().extend(documents);
      }
    }

    let result_ports: Vec<EnvironmentPort> = step
      .output_ports()
      .map(|port| {
        let documents = collected.shift_remove(port.port_name()).unwrap_or_default();
        EnvironmentPort::unbound(port).write_nodes(documents)
      })
      .collect();
    let result = step_environment.add_ports(result_ports);
    let result = result.setup_output_ports(step, &result)?;
    write_logs(step, &result)?;
    Ok(result)
  }
}

/// Runs the first branch (`when` or `otherwise`) whose test holds, and exposes the
/// branch's output ports under its own output port names.
pub struct Choose;

#[async_trait]
impl StepProcessor for Choose {
  fn kind(&self) -> ProcessorKind {
    ProcessorKind::Compound
  }

  #[instrument(name = "Choose::run", skip_all, fields(step = %step.name()), err(Display))]
  async fn run(&self, step: &Step, environment: Environment, task: &TaskContext) -> PipelineResult<Environment> {
    let step_environment = environment.new_following_step_environment(step, task)?;
    let branch_task = task.enter(step.name());
    let branch_scope = step_environment.new_child_step_environment();

    let mut selected = None;
    for branch in step.subpipeline() {
      if branch_holds(branch, &branch_scope, &branch_task)? {
        selected = Some(branch);
        break;
      }
    }
    let Some(branch) = selected else {
      return Err(
        EvaluationError::NoBranchSelected {
          step_name: step.name().to_string(),
        }
        .into(),
      );
    };
    event!(Level::DEBUG, branch = %branch.name(), "Branch selected.");

    let branches = std::slice::from_ref(branch);
    let dependencies = SubpipelineDependencies::compute(step.name(), branches)?;
    let branch_result = run_steps(branches, &dependencies, &step_environment, &branch_task).await?;

    let wired: Vec<EnvironmentPort> = step
      .output_ports()
      .map(|port| {
        if !port.bindings().is_empty() {
          return EnvironmentPort::new(port, &branch_result);
        }
        let unbound = EnvironmentPort::unbound(port);
        match branch_result.ports().get(&branch.port_reference(port.port_name())) {
          Some(branch_port) => unbound.pipe(branch_port),
          None => unbound,
        }
      })
      .collect();
    let result = step_environment.add_ports(wired).setup_output_ports(step, &branch_result)?;
    write_logs(step, &result)?;
    Ok(result)
  }
}

/// Whether `branch` is the one to run. A branch without a `test` option is an
/// `otherwise` and always holds.
fn branch_holds(branch: &Step, scope: &Environment, task: &TaskContext) -> PipelineResult<bool> {
  let test = QName::local(TEST);
  if branch.get_variable(&test).is_none() {
    return Ok(true);
  }
  let branch_environment = scope.new_following_step_environment(branch, task)?;
  let holds = branch_environment.get_variable(&test) == Some("true");
  event!(Level::TRACE, branch = %branch.name(), holds, "Branch test evaluated.");
  Ok(holds)
}

/// Runs its subpipeline once per node of the single `source` document matched by the
/// `match` pattern, and replaces each matched node by what that run produced.
pub struct Viewport;

#[async_trait]
impl StepProcessor for Viewport {
  fn kind(&self) -> ProcessorKind {
    ProcessorKind::Compound
  }

  #[instrument(name = "Viewport::run", skip_all, fields(step = %step.name()), err(Display))]
  async fn run(&self, step: &Step, environment: Environment, task: &TaskContext) -> PipelineResult<Environment> {
    let step_environment = environment.new_following_step_environment(step, task)?;
    let source = step_environment.read_node(&step.port_reference(SOURCE))?;
    let pattern = step_environment.get_variable_or(&QName::local(MATCH), "/");
    let query = if pattern.starts_with('/') {
      pattern.to_string()
    } else {
      format!("//{}", pattern)
    };

    let items = step_environment.evaluate_query_on(&query, Some(source.clone()), step.location(), task)?;
    let mut targets = HashSet::new();
    for item in &items {
      let kind = match item {
        Item::Node(node) if node.is_document() || node.is_element() => {
          targets.insert(node.identity());
          continue;
        }
        Item::Node(node) if node.is_attribute() => "attribute",
        Item::Node(_) => "text",
        _ => "atomic",
      };
      return Err(
        EvaluationError::UnsupportedMatch {
          step_name: step.name().to_string(),
          kind: kind.to_string(),
          location: step.location().clone(),
        }
        .into(),
      );
    }

    let mut matches = Vec::new();
    collect_outermost(&source, &targets, &mut matches);
    let size = matches.len();
    event!(Level::DEBUG, matches = size, "Viewport matches collected.");

    let dependencies = step.subpipeline_dependencies()?;
    let mut replacements: HashMap<usize, Vec<Document>> = HashMap::with_capacity(size);
    for (index, node) in matches.iter().enumerate() {
      let iteration_task = task.enter(step.name()).iteration(index + 1, size);
      let iteration_environment = iteration_environment(step, &step_environment, node.as_document(), &iteration_task)?;
      let result = run_steps(step.subpipeline(), &dependencies, &iteration_environment, &iteration_task).await?;
      let wired = iteration_environment.setup_output_ports(step, &result)?;
      let produced = match wired.default_readable_port() {
        Some(port) => port.read_nodes()?,
        None => Vec::new(),
      };
      replacements.insert(node.identity(), produced);
    }

    let rebuilt = as_single_document(replace_matches(&source, &replacements));
    let result_port = step.get_port(RESULT).ok_or_else(|| ResolutionError::NoSuchDeclaredPort {
      step_name: step.name().to_string(),
      port_name: RESULT.to_string(),
    })?;
    let result = step_environment.add_port(EnvironmentPort::unbound(result_port).write_nodes(vec![rebuilt]));
    let result = result.setup_output_ports(step, &result)?;
    write_logs(step, &result)?;
    Ok(result)
  }
}

/// The scope of one iteration: a child scope of the step in which `current` is readable
/// as `<step>/current`, is the default readable and XPath context port, and the step's
/// options and variables are evaluated against it.
fn iteration_environment(
  step: &Step,
  step_environment: &Environment,
  current: Document,
  task: &TaskContext,
) -> PipelineResult<Environment> {
  let current_port = Port::input(CURRENT)
    .with_step_name(step.name())
    .at(step.location().clone())
    .bind(PortBinding::inline(current));
  let scope = step_environment.new_child_step_environment();
  let current_port = scope.new_environment_port(&current_port);
  scope
    .add_port(current_port.clone())
    .set_default_readable_port(current_port.clone())
    .set_xpath_context_port(current_port)
    .setup_variables(step, task)
}

fn collect_outermost(node: &Document, targets: &HashSet<usize>, matches: &mut Vec<Document>) {
  if targets.contains(&node.identity()) {
    matches.push(node.clone());
    return;
  }
  for child in node.children() {
    collect_outermost(child, targets, matches);
  }
}

fn replace_matches(node: &Document, replacements: &HashMap<usize, Vec<Document>>) -> Vec<Document> {
  if let Some(produced) = replacements.get(&node.identity()) {
    return produced.clone();
  }
  if node.children().is_empty() {
    return vec![node.clone()];
  }
  let children = node
    .children()
    .iter()
    .flat_map(|child| replace_matches(child, replacements))
    .flat_map(|replaced| {
      if replaced.is_document() {
        replaced.children().to_vec()
      } else {
        vec![replaced]
      }
    })
    .collect();
  vec![node.with_children(children)]
}

fn as_single_document(mut nodes: Vec<Document>) -> Document {
  if nodes.len() == 1 && nodes[0].is_document() {
    return nodes.remove(0);
  }
  let children = nodes
    .into_iter()
    .flat_map(|node| {
      if node.is_document() {
        node.children().to_vec()
      } else {
        vec![node]
      }
    })
    .collect();
  Document::document(children)
}
