// portflow/src/pipeline/execution.rs

//! The subpipeline runner: executes the children of a compound step, in parallel wherever
//! their dependencies allow.
//!
//! Every sibling becomes one task of a [`JoinSet`]. A task first awaits the result
//! environments of the siblings it depends on (shared futures, so several dependents can
//! await one sibling), folds their output ports into its input environment, then runs its
//! step. Atomic steps additionally wait for a step permit, bounding how many leaf bodies
//! execute at once. The first failure is kept, every other task is aborted, and the
//! failure is returned as is.

use super::context::TaskContext;
use super::dependencies::SubpipelineDependencies;
use crate::core::processor::ProcessorKind;
use crate::core::step::Step;
use crate::environment::{Environment, EnvironmentPort};
use crate::error::{PipelineError, PipelineResult};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{event, info_span, instrument, Instrument, Level};

/// A sibling did not produce a result. The actual error is in the run's error slot.
#[derive(Clone, Copy, Debug)]
struct StepFailed;

type StepFuture = Shared<BoxFuture<'static, Result<Environment, StepFailed>>>;

/// Keeps the first error reported by any sibling.
#[derive(Clone, Default)]
struct FirstError(Arc<Mutex<Option<PipelineError>>>);

impl FirstError {
  fn record(&self, err: PipelineError) {
    let mut slot = self.0.lock();
    if slot.is_none() {
      event!(Level::ERROR, error = %err, "Step failed, cancelling its siblings.");
      *slot = Some(err);
    } else {
      event!(Level::DEBUG, error = %err, "Further step failure ignored.");
    }
  }

  fn is_set(&self) -> bool {
    self.0.lock().is_some()
  }

  fn take(&self) -> Option<PipelineError> {
    self.0.lock().take()
  }
}

/// Runs the subpipeline of `step` in the environment `step` itself runs in.
pub async fn run_subpipeline(step: &Step, environment: &Environment, task: &TaskContext) -> PipelineResult<Environment> {
  let dependencies = step.subpipeline_dependencies()?;
  run_steps(step.subpipeline(), &dependencies, environment, &task.enter(step.name())).await
}

/// Runs the sibling list `steps` in a child scope of `environment`.
///
/// The returned environment is the result of the last step in list order (the child
/// scope itself for an empty list), plus every output port of the other results it does
/// not already have.
#[instrument(name = "run_steps", skip_all, fields(path = %task.path_string(), num_steps = steps.len()), err(Display))]
pub async fn run_steps(
  steps: &[Step],
  dependencies: &SubpipelineDependencies,
  environment: &Environment,
  task: &TaskContext,
) -> PipelineResult<Environment> {
  let initial = environment.new_child_step_environment();
  if steps.is_empty() {
    return Ok(initial);
  }
  let parameters_port = environment.default_parameters_port().cloned();
  let first_error = FirstError::default();

  let mut futures: Vec<Option<StepFuture>> = vec![None; steps.len()];
  for index in 0..steps.len() {
    step_future(
      index,
      steps,
      dependencies,
      &initial,
      parameters_port.as_ref(),
      &first_error,
      task,
      &mut futures,
    );
  }

  let mut join_set = JoinSet::new();
  for (index, future) in futures.into_iter().enumerate() {
    if let Some(future) = future {
      join_set.spawn(async move { (index, future.await) });
    }
  }

  let mut results: Vec<Option<Environment>> = vec![None; steps.len()];
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((index, Ok(result))) => results[index] = Some(result),
      Ok((_, Err(StepFailed))) => {
        join_set.abort_all();
        break;
      }
      Err(join_error) if join_error.is_cancelled() => {}
      Err(join_error) => {
        first_error.record(PipelineError::Internal(format!("Step task failed: {}", join_error)));
        join_set.abort_all();
        break;
      }
    }
  }
  drop(join_set);

  if let Some(err) = first_error.take() {
    return Err(err);
  }

  let results: Vec<Environment> = results.into_iter().flatten().collect();
  if results.len() != steps.len() {
    return Err(PipelineError::Internal(format!(
      "{} of {} steps produced no result",
      steps.len() - results.len(),
      steps.len()
    )));
  }

  let mut result = results.last().cloned().unwrap_or(initial);
  for intermediate in &results {
    let missing: Vec<EnvironmentPort> = intermediate
      .output_ports()
      .filter(|port| !result.ports().contains_key(port.reference()))
      .cloned()
      .collect();
    result = result.add_ports(missing);
  }
  event!(Level::DEBUG, "Subpipeline completed.");
  Ok(result)
}

/// Builds (once) the future of the step at `index`, after the futures of its
/// dependencies. The dependency graph is acyclic, so the recursion ends.
#[allow(clippy::too_many_arguments)]
fn step_future(
  index: usize,
  steps: &[Step],
  dependencies: &SubpipelineDependencies,
  initial: &Environment,
  parameters_port: Option<&EnvironmentPort>,
  first_error: &FirstError,
  task: &TaskContext,
  futures: &mut [Option<StepFuture>],
) -> StepFuture {
  if let Some(existing) = &futures[index] {
    return existing.clone();
  }

  let dependency_futures: Vec<StepFuture> = dependencies
    .of(index)
    .iter()
    .map(|&dependency| {
      step_future(
        dependency,
        steps,
        dependencies,
        initial,
        parameters_port,
        first_error,
        task,
        futures,
      )
    })
    .collect();

  let step = steps[index].clone();
  let span = info_span!("step", step = %step.name(), step_type = %step.step_type(), index);
  let initial = initial.clone();
  let parameters_port = parameters_port.cloned();
  let first_error = first_error.clone();
  let task = task.clone();

  let future = async move {
    let mut input = initial;
    for dependency in dependency_futures {
      let dependency_result = dependency.await?;
      input = inherit(input, &dependency_result, parameters_port.as_ref());
    }
    if first_error.is_set() {
      event!(Level::DEBUG, "Sibling already failed, not running.");
      return Err(StepFailed);
    }

    let _permit = match step.kind() {
      ProcessorKind::Atomic => match input.context().acquire_step_permit().await {
        Ok(permit) => Some(permit),
        Err(err) => {
          first_error.record(err);
          return Err(StepFailed);
        }
      },
      ProcessorKind::Compound | ProcessorKind::Pipeline => None,
    };

    event!(Level::DEBUG, "Running step.");
    match step.processor().run(&step, input, &task).await {
      Ok(result) => {
        event!(Level::TRACE, "Step completed.");
        Ok(result)
      }
      Err(err) => {
        first_error.record(err);
        Err(StepFailed)
      }
    }
  }
  .instrument(span)
  .boxed()
  .shared();

  futures[index] = Some(future.clone());
  future
}

/// The input environment of a step after `dependency` completed: its output ports become
/// readable and its designated ports carry over.
fn inherit(input: Environment, dependency: &Environment, parameters_port: Option<&EnvironmentPort>) -> Environment {
  let mut input = input.add_ports(dependency.output_ports().cloned());
  if let Some(port) = dependency.default_readable_port() {
    input = input.set_default_readable_port(port.clone());
  }
  if let Some(port) = parameters_port {
    input = input.set_default_parameters_port(port.clone());
  }
  if let Some(port) = dependency.xpath_context_port() {
    input = input.set_xpath_context_port(port.clone());
  }
  input
}
