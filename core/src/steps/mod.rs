// portflow/src/steps/mod.rs

//! Built-in step types, and constructors returning ready-to-name step templates.
//!
//! ```ignore
//! let pipeline = steps::pipeline(QName::new("urn:example", "main"))
//!   .named("main")
//!   .add_step(steps::identity().named("copy"))
//!   .add_step(steps::store().named("save").set_option("href", "out.xml"));
//! ```

pub mod atomic;
pub mod compound;
pub mod log;

pub use atomic::{Identity, Load, Sink, Store};
pub use compound::{Choose, ForEach, Group, Viewport};
pub use log::write_logs;

use crate::core::port::names::{ITERATION_SOURCE, PARAMETERS, RESULT, SOURCE, XPATH_CONTEXT};
use crate::core::port::Port;
use crate::core::qname::QName;
use crate::core::step::Step;
use crate::core::variable::Variable;
use std::sync::Arc;

/// `p:identity`: `source` (sequence) to `result` (sequence).
pub fn identity() -> Step {
  Step::atomic(QName::xproc("identity"), Identity).with_ports([
    Port::input(SOURCE).sequence(true),
    Port::output(RESULT).sequence(true),
  ])
}

/// `p:sink`: a sequence input and no output.
pub fn sink() -> Step {
  Step::atomic(QName::xproc("sink"), Sink).with_port(Port::input(SOURCE).sequence(true))
}

/// `p:load`: the required `href` option names the document to read.
pub fn load() -> Step {
  Step::atomic(QName::xproc("load"), Load)
    .with_port(Port::output(RESULT))
    .with_variable(Variable::option(atomic::HREF).required(true))
}

/// `p:store`: writes its single `source` document to the required `href` option.
pub fn store() -> Step {
  Step::atomic(QName::xproc("store"), Store)
    .with_ports([Port::input(SOURCE), Port::output(RESULT).primary(true)])
    .with_variable(Variable::option(atomic::HREF).required(true))
}

/// `p:group`. Output ports are declared by the caller.
pub fn group() -> Step {
  Step::new(QName::xproc("group"), Arc::new(Group::compound()))
}

/// A declared pipeline of type `step_type`, with the conventional `source`, `parameters`
/// and `result` ports.
pub fn pipeline(step_type: impl Into<QName>) -> Step {
  Step::new(step_type.into(), Arc::new(Group::pipeline())).with_ports([
    Port::input(SOURCE).primary(true).sequence(true),
    Port::parameter(PARAMETERS).primary(true),
    Port::output(RESULT).primary(true).sequence(true),
  ])
}

/// `p:for-each`: iterates over `iteration-source`. Output ports are declared by the caller;
/// each one collects what every iteration produced.
pub fn for_each() -> Step {
  Step::new(QName::xproc("for-each"), Arc::new(ForEach))
    .with_port(Port::input(ITERATION_SOURCE).primary(true).sequence(true))
}

/// `p:choose`. Branches are added with [`Step::add_step`], in evaluation order; output
/// ports are declared by the caller and fed by the same-named ports of the selected branch.
pub fn choose() -> Step {
  Step::new(QName::xproc("choose"), Arc::new(Choose)).with_port(Port::input(XPATH_CONTEXT).primary(false))
}

/// `p:when`: selected when the effective boolean value of `test`, evaluated against the
/// XPath context, is true.
pub fn when(test: impl AsRef<str>) -> Step {
  Step::new(QName::xproc("when"), Arc::new(Group::compound()))
    .with_port(Port::input(XPATH_CONTEXT).primary(false))
    .with_variable(Variable::option(compound::TEST).select(format!("boolean({})", test.as_ref())))
}

/// `p:otherwise`: always selected when reached.
pub fn otherwise() -> Step {
  Step::new(QName::xproc("otherwise"), Arc::new(Group::compound()))
}

/// `p:viewport`: the required `match` option selects the nodes of `source` to rewrite.
pub fn viewport() -> Step {
  Step::new(QName::xproc("viewport"), Arc::new(Viewport))
    .with_ports([Port::input(SOURCE).primary(true), Port::output(RESULT).primary(true)])
    .with_variable(Variable::option(compound::MATCH).required(true))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::binding::PortBinding;
  use crate::document::{Document, TreeEngine};
  use crate::environment::Environment;
  use crate::error::{EvaluationError, PipelineError};
  use crate::io::MemoryResolver;
  use crate::pipeline::context::{PipelineContext, TaskContext};

  fn context_with(resolver: MemoryResolver) -> PipelineContext {
    PipelineContext::builder()
      .resolver(resolver)
      .config(crate::config::PipelineConfig::default().with_base_uri("mem:/work/"))
      .build()
  }

  async fn run(step: &Step, context: &PipelineContext) -> Result<Environment, PipelineError> {
    let environment = Environment::new(step, context);
    step.processor().run(step, environment, &TaskContext::root()).await
  }

  fn parse(xml: &str) -> Document {
    TreeEngine::new().parse_str(xml).unwrap()
  }

  #[tokio::test]
  async fn store_then_load_round_trips_through_the_resolver() {
    let resolver = MemoryResolver::new();
    let context = context_with(resolver.clone());
    let store = store()
      .named("save")
      .bind(SOURCE, PortBinding::inline(parse("<a>1</a>")))
      .set_option("href", "out.xml");
    let result = run(&store, &context).await.unwrap();
    let report = result.read_node(&store.port_reference(RESULT)).unwrap();
    assert_eq!(report.string_value(), "mem:/work/out.xml");
    assert_eq!(resolver.get_string("mem:/work/out.xml").as_deref(), Some("<a>1</a>"));

    let load = load().named("read").set_option("href", "out.xml");
    let result = run(&load, &context).await.unwrap();
    assert_eq!(result.read_nodes(&load.port_reference(RESULT)).unwrap(), vec![parse("<a>1</a>")]);
  }

  #[tokio::test]
  async fn load_of_a_missing_resource_is_an_external_resource_error() {
    let context = context_with(MemoryResolver::new());
    let load = load().named("read").set_option("href", "nothing.xml");
    let err = run(&load, &context).await.unwrap_err();
    assert!(matches!(err, PipelineError::ExternalResource { ref href, .. } if href == "nothing.xml"));
  }

  #[tokio::test]
  async fn store_requires_exactly_one_document() {
    let context = context_with(MemoryResolver::new());
    let store = store()
      .named("save")
      .bind(SOURCE, PortBinding::Empty)
      .set_option("href", "out.xml");
    let err = run(&store, &context).await.unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Evaluation(EvaluationError::NotExactlyOneNode { count: 0, .. })
    ));
  }

  #[tokio::test]
  async fn sink_discards_and_leaves_the_default_readable_port_alone() {
    let context = PipelineContext::default();
    let sink = sink().named("drop").bind(SOURCE, PortBinding::inline(parse("<a/>")));
    let result = run(&sink, &context).await.unwrap();
    assert_eq!(
      result.default_readable_port().map(|port| port.reference().clone()),
      Some(sink.port_reference(SOURCE))
    );
  }

  #[test]
  fn constructors_declare_unambiguous_ports() {
    for step in [
      identity(),
      sink(),
      load(),
      store(),
      group(),
      pipeline(QName::local("main")),
      for_each(),
      choose(),
      when("true()"),
      otherwise(),
      viewport(),
    ] {
      let step = step.named("s");
      assert!(step.check_instance().is_ok(), "{:?}", step);
    }
  }
}
