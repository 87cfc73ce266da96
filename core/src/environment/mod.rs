// portflow/src/environment/mod.rs

//! The runtime scope of a run: resolved ports and variables, derived step by step.
//!
//! An [`Environment`] maps port references to [`EnvironmentPort`]s, each one a declared
//! port plus the [`ResolvedBinding`]s feeding it, and carries the variables in scope.
//! Entering a step, entering a subpipeline and writing documents all produce new
//! environments; nothing is updated in place, so environments can be handed to concurrently
//! running steps freely.

pub mod binding;
pub mod definition;
pub mod port;
pub mod variables;

pub use binding::{ExternalDocument, ResolvedBinding};
pub use definition::Environment;
pub use port::EnvironmentPort;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::binding::PortBinding;
  use crate::core::port::{Port, PortReference};
  use crate::core::qname::QName;
  use crate::core::variable::Variable;
  use crate::document::Document;
  use crate::error::{PipelineError, ResolutionError};
  use crate::pipeline::context::{PipelineContext, TaskContext};
  use crate::steps;

  fn root() -> Environment {
    Environment::new(&steps::group().named("root"), &PipelineContext::default())
  }

  #[test]
  fn child_scope_shadows_without_touching_the_parent() {
    let x = QName::local("x");
    let task = TaskContext::root();
    let outer_step = steps::group()
      .named("outer")
      .declare_variable(Variable::variable("x").value("outer"))
      .unwrap();
    let outer = root().new_following_step_environment(&outer_step, &task).unwrap();
    let child_scope = outer.new_child_step_environment();
    assert_eq!(child_scope.get_variable(&x), Some("outer"));
    assert!(child_scope.local_variables().is_empty());

    let inner_step = steps::group()
      .named("inner")
      .declare_variable(Variable::variable("x").value("inner"))
      .unwrap();
    let inner = child_scope.new_following_step_environment(&inner_step, &task).unwrap();
    assert_eq!(inner.get_variable(&x), Some("inner"));
    assert_eq!(inner.new_child_step_environment().get_variable(&x), Some("inner"));

    assert_eq!(outer.get_variable(&x), Some("outer"));
    assert_eq!(child_scope.get_variable(&x), Some("outer"));
    assert_eq!(child_scope.get_variable_or(&QName::local("y"), "none"), "none");
  }

  #[test]
  fn unbound_primary_input_reads_the_default_readable_port() {
    let task = TaskContext::root();
    let doc = Document::simple("a", "");
    let first = steps::identity().named("first").bind("source", PortBinding::inline(doc.clone()));
    let second = steps::identity().named("second");

    let environment = root();
    let first_environment = environment.new_following_step_environment(&first, &task).unwrap();
    let first_result = first_environment
      .write_nodes(&first.port_reference("result"), vec![doc.clone()])
      .unwrap()
      .setup_output_ports(&first, &first_environment)
      .unwrap();
    assert_eq!(
      first_result.default_readable_port().map(|port| port.reference().clone()),
      Some(PortReference::new("first", "result"))
    );

    let second_environment = first_result.new_following_step_environment(&second, &task).unwrap();
    assert_eq!(second_environment.read_nodes(&second.port_reference("source")).unwrap(), vec![doc]);
  }

  #[test]
  fn unknown_port_lists_what_is_available() {
    let environment = root().add_port(EnvironmentPort::unbound(&Port::output("result").with_step_name("a")));
    let err = environment.read_nodes(&PortReference::new("b", "result")).unwrap_err();
    match err {
      PipelineError::Resolution(ResolutionError::NoSuchPort { available, .. }) => assert_eq!(available, "a/result"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn pipe_to_a_missing_port_fails_only_when_read() {
    let port = Port::input("source").with_step_name("s").pipe("nowhere", "result");
    let environment_port = root().new_environment_port(&port);
    assert!(matches!(
      environment_port.read_nodes(),
      Err(PipelineError::Resolution(ResolutionError::NoSuchPort { .. }))
    ));
  }

  #[test]
  fn pipe_from_a_port_to_itself_fails_when_read() {
    let port = Port::input("source").with_step_name("s").pipe("s", "source");
    let environment_port = root().new_environment_port(&port);
    match environment_port.read_nodes() {
      Err(PipelineError::Resolution(ResolutionError::SelfReference { reference })) => {
        assert_eq!(reference, PortReference::new("s", "source"))
      }
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn designated_ports_are_always_in_the_port_map() {
    let port = EnvironmentPort::unbound(&Port::output("result").with_step_name("a"));
    let environment = root().set_default_readable_port(port.clone());
    assert!(environment.ports().contains_key(port.reference()));
    let written = environment.write_nodes(port.reference(), vec![Document::simple("x", "")]).unwrap();
    let readable = written.default_readable_port().unwrap();
    assert!(readable.ptr_eq(written.get_environment_port(port.reference()).unwrap()));
    assert_eq!(readable.read_nodes().unwrap().len(), 1);
  }
}
