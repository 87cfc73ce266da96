// portflow/src/library.rs

//! Defines [`StepLibrary`], the declared step types of a run keyed by their type name.
//!
//! A library maps a [`QName`] to a template [`Step`]. Instantiating a type clones the
//! template under a new name; declared pipelines remember the name they were declared
//! with (see [`Step::named`]).

use crate::core::qname::QName;
use crate::core::step::Step;
use crate::error::{PipelineResult, ResolutionError};
use crate::steps;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Declared step types. Immutable and cheap to clone; `declare` and `import` return a new
/// library.
#[derive(Clone, Default)]
pub struct StepLibrary {
  steps: Arc<IndexMap<QName, Step>>,
}

impl StepLibrary {
  pub fn new() -> Self {
    Self::default()
  }

  /// The built-in step types.
  pub fn core() -> Self {
    let built_ins = [
      steps::identity(),
      steps::sink(),
      steps::load(),
      steps::store(),
      steps::group(),
      steps::for_each(),
      steps::choose(),
      steps::otherwise(),
      steps::viewport(),
    ];
    let steps = built_ins
      .into_iter()
      .map(|step| (step.step_type().clone(), step))
      .collect();
    Self { steps: Arc::new(steps) }
  }

  /// Declares `step` under its type name, replacing a previous declaration. The
  /// declaration checks (unique sibling names, no cyclic dependency) run here, once.
  #[instrument(name = "StepLibrary::declare", skip_all, fields(step_type = %step.step_type()), err(Display))]
  pub fn declare(self, step: Step) -> PipelineResult<Self> {
    step.check_declared()?;
    event!(Level::DEBUG, "Step type declared.");
    let mut steps = Arc::try_unwrap(self.steps).unwrap_or_else(|shared| (*shared).clone());
    steps.insert(step.step_type().clone(), step);
    Ok(Self { steps: Arc::new(steps) })
  }

  /// Adds the declarations of `other` this library does not have. Local declarations win.
  pub fn import(self, other: &StepLibrary) -> Self {
    let mut steps = Arc::try_unwrap(self.steps).unwrap_or_else(|shared| (*shared).clone());
    for (step_type, step) in other.steps.iter() {
      if steps.contains_key(step_type) {
        event!(Level::TRACE, step_type = %step_type, "Imported declaration shadowed by a local one.");
        continue;
      }
      steps.insert(step_type.clone(), step.clone());
    }
    Self { steps: Arc::new(steps) }
  }

  /// A copy of the declaration of `step_type`, named `name`.
  pub fn instantiate(&self, step_type: &QName, name: impl Into<String>) -> PipelineResult<Step> {
    let declared = self.get(step_type).ok_or_else(|| ResolutionError::NoSuchStepType {
      step_type: step_type.clone(),
    })?;
    Ok(declared.clone().named(name))
  }

  pub fn get(&self, step_type: &QName) -> Option<&Step> {
    self.steps.get(step_type)
  }

  pub fn contains(&self, step_type: &QName) -> bool {
    self.steps.contains_key(step_type)
  }

  /// Declared type names, in declaration order.
  pub fn step_types(&self) -> impl Iterator<Item = &QName> {
    self.steps.keys()
  }
}

impl fmt::Debug for StepLibrary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.steps.keys()).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{PipelineError, StructuralError};

  #[test]
  fn core_library_knows_the_built_ins() {
    let library = StepLibrary::core();
    for local in ["identity", "sink", "load", "store", "group", "for-each", "choose", "viewport"] {
      assert!(library.contains(&QName::xproc(local)), "missing {}", local);
    }
    let step = library.instantiate(&QName::xproc("identity"), "copy").unwrap();
    assert_eq!(step.name(), "copy");
    assert_eq!(step.get_port("source").unwrap().step_name(), "copy");
  }

  #[test]
  fn unknown_type_is_a_resolution_error() {
    let err = StepLibrary::new().instantiate(&QName::local("nope"), "x").unwrap_err();
    assert!(matches!(err, PipelineError::Resolution(ResolutionError::NoSuchStepType { .. })));
  }

  #[test]
  fn instantiated_pipeline_keeps_its_declared_name() {
    let step_type = QName::new("urn:test", "main");
    let library = StepLibrary::new()
      .declare(steps::pipeline(step_type.clone()).named("main"))
      .unwrap();
    let instance = library.instantiate(&step_type, "call").unwrap();
    assert_eq!(instance.name(), "call");
    assert_eq!(instance.internal_name(), Some("main"));
  }

  #[test]
  fn declaring_a_cyclic_pipeline_fails() {
    let cyclic = steps::group()
      .named("g")
      .add_step(steps::identity().named("a").pipe("source", "b", "result"))
      .add_step(steps::identity().named("b").pipe("source", "a", "result"));
    let err = StepLibrary::new().declare(cyclic).unwrap_err();
    assert!(matches!(err, PipelineError::Structural(StructuralError::CyclicDependency { .. })));
  }

  #[test]
  fn local_declarations_win_on_import() {
    let local = StepLibrary::new().declare(steps::group().named("mine")).unwrap();
    let merged = local.import(&StepLibrary::core());
    assert!(merged.contains(&QName::xproc("identity")));
    assert_eq!(merged.get(&QName::xproc("group")).map(Step::name), Some("mine"));
    assert_eq!(merged.step_types().next(), Some(&QName::xproc("group")));
  }
}
