// portflow/src/pipeline/dependencies.rs

//! Which siblings of a subpipeline must complete before each one may start.
//!
//! A step depends on:
//! - the most recent preceding sibling writing external resources, when it reads
//!   external resources itself;
//! - the most recent preceding sibling with a primary output port, when its primary (or
//!   XPath context) input port has no binding and thus reads the default readable port;
//! - every sibling its port and variable bindings pipe from, wherever it sits in the list.
//!
//! Pipes to steps outside the list are not dependencies: those ports are already readable
//! when the subpipeline starts.

use crate::core::step::Step;
use crate::error::StructuralError;
use std::collections::HashMap;
use tracing::{event, Level};

/// Per sibling (by index), the siblings it depends on, in the order they were found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpipelineDependencies {
  dependencies: Vec<Vec<usize>>,
}

impl SubpipelineDependencies {
  /// Computes the dependencies of `steps`, the subpipeline of `parent_name`, and rejects
  /// cyclic ones.
  pub fn compute(parent_name: &str, steps: &[Step]) -> Result<Self, StructuralError> {
    let by_name: HashMap<&str, usize> = steps
      .iter()
      .enumerate()
      .filter(|(_, step)| step.has_name())
      .map(|(index, step)| (step.name(), index))
      .collect();

    let mut last_write_step: Option<usize> = None;
    let mut default_readable_port_step: Option<usize> = None;
    let mut dependencies = Vec::with_capacity(steps.len());

    for (index, step) in steps.iter().enumerate() {
      let mut step_dependencies = Vec::new();

      if let Some(writer) = last_write_step {
        if step.reads_external_resources() {
          event!(Level::TRACE, step = %step.name(), writer = %steps[writer].name(), "Ordered after external resource writer.");
          step_dependencies.push(writer);
        }
      }

      for port in step.input_ports() {
        let implicit = port.bindings().is_empty() && (step.is_primary(port) || step.is_xpath_context_port(port));
        match default_readable_port_step {
          Some(previous) if implicit => step_dependencies.push(previous),
          _ => step_dependencies.extend(
            port
              .bindings()
              .iter()
              .filter_map(|binding| binding.pipe_reference())
              .filter_map(|reference| by_name.get(reference.step_name.as_str()).copied()),
          ),
        }
      }

      for variable in step.variables().chain(step.parameters()) {
        if let Some(reference) = variable.binding().and_then(|binding| binding.pipe_reference()) {
          if let Some(dependency) = by_name.get(reference.step_name.as_str()) {
            step_dependencies.push(*dependency);
          }
        }
      }

      event!(Level::TRACE, step = %step.name(), dependencies = ?step_dependencies, "Step dependencies computed.");
      dependencies.push(step_dependencies);

      if step.writes_external_resources() {
        last_write_step = Some(index);
      }
      if step.primary_output_port().is_some() {
        default_readable_port_step = Some(index);
      }
    }

    let computed = Self { dependencies };
    computed.check_cycles(parent_name, steps)?;
    Ok(computed)
  }

  /// Depth-first walk over the dependency graph; reaching a step that is still on the
  /// walk stack means a cycle.
  fn check_cycles(&self, parent_name: &str, steps: &[Step]) -> Result<(), StructuralError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
      Unvisited,
      OnStack,
      Done,
    }

    fn visit(index: usize, graph: &[Vec<usize>], marks: &mut [Mark]) -> Option<usize> {
      marks[index] = Mark::OnStack;
      for &dependency in &graph[index] {
        match marks[dependency] {
          Mark::OnStack => return Some(dependency),
          Mark::Unvisited => {
            if let Some(cyclic) = visit(dependency, graph, marks) {
              return Some(cyclic);
            }
          }
          Mark::Done => {}
        }
      }
      marks[index] = Mark::Done;
      None
    }

    let mut marks = vec![Mark::Unvisited; self.dependencies.len()];
    for index in 0..self.dependencies.len() {
      if marks[index] == Mark::Unvisited {
        if let Some(cyclic) = visit(index, &self.dependencies, &mut marks) {
          event!(Level::DEBUG, parent = parent_name, step = %steps[cyclic].name(), "Cyclic subpipeline dependency.");
          return Err(StructuralError::CyclicDependency {
            step_name: steps[cyclic].name().to_string(),
          });
        }
      }
    }
    Ok(())
  }

  /// The siblings the step at `index` depends on.
  pub fn of(&self, index: usize) -> &[usize] {
    self.dependencies.get(index).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn len(&self) -> usize {
    self.dependencies.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dependencies.is_empty()
  }
}
