// portflow/src/environment/variables.rs

//! Evaluation of options, variables and parameters, and the `c:param` / `c:result`
//! vocabulary.

use super::binding::ResolvedBinding;
use super::definition::Environment;
use crate::core::port::PortReference;
use crate::core::qname::QName;
use crate::core::step::Step;
use crate::core::variable::Variable;
use crate::document::{Attribute, Document, NodeKind};
use crate::error::{EvaluationError, PipelineError, PipelineResult};
use crate::pipeline::context::TaskContext;
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{event, instrument, Level};

const PARAM_NAME: &str = "name";
const PARAM_NAMESPACE: &str = "namespace";
const PARAM_VALUE: &str = "value";

impl Environment {
  /// Evaluates the options, variables and parameters of `step`, in declaration order.
  ///
  /// Options and variables land in the local scope, each one visible to the queries of
  /// the following ones. Parameters become `c:param` documents appended, in one write, to
  /// the default parameters port.
  #[instrument(name = "Environment::setup_variables", skip_all, fields(step = %step.name()), err(Display))]
  pub(crate) fn setup_variables(&self, step: &Step, task: &TaskContext) -> PipelineResult<Environment> {
    let mut all_variables = self.variables();
    let mut new_local_variables = HashMap::new();
    let mut parameter_nodes = Vec::new();

    for variable in step.variables().chain(step.parameters()) {
      let value = self
        .evaluate_variable(step, variable, &all_variables, task)
        .map_err(|err| wrap_variable_error(step, variable, err))?;
      let Some(value) = value else {
        event!(Level::TRACE, variable = %variable.name(), "No value, variable left unbound.");
        continue;
      };
      event!(Level::TRACE, variable = %variable.name(), value = %value, "Variable evaluated.");

      if variable.is_parameter() {
        if self.default_parameters_port().is_none() {
          return Err(
            EvaluationError::NoParametersPort {
              variable: variable.name().clone(),
              step_name: step.name().to_string(),
              location: variable.location().clone(),
            }
            .into(),
          );
        }
        parameter_nodes.push(Self::new_parameter_element(variable.name(), &value));
      } else {
        all_variables.insert(variable.name().clone(), value.clone());
        new_local_variables.insert(variable.name().clone(), value);
      }
    }

    let mut environment = self.clone();
    if let Some(parameters_port) = self.default_parameters_port() {
      if !parameter_nodes.is_empty() {
        let reference = parameters_port.reference().clone();
        environment = environment.write_nodes(&reference, parameter_nodes)?;
      }
    }
    Ok(environment.set_local_variables(new_local_variables))
  }

  fn evaluate_variable(
    &self,
    step: &Step,
    variable: &Variable,
    visible: &HashMap<QName, String>,
    task: &TaskContext,
  ) -> PipelineResult<Option<String>> {
    if let Some(value) = variable.literal_value() {
      return Ok(Some(value.to_string()));
    }
    let Some(select) = variable.select_query() else {
      if variable.is_required() {
        return Err(
          EvaluationError::MissingRequiredValue {
            variable: variable.name().clone(),
            step_name: step.name().to_string(),
            location: variable.location().clone(),
          }
          .into(),
        );
      }
      return Ok(None);
    };

    let context_node = match variable.binding() {
      Some(binding) => {
        let owner = PortReference::new(step.name(), format!("${}", variable.name()));
        let mut nodes = ResolvedBinding::resolve(binding, &owner, self).read_nodes()?;
        if nodes.len() != 1 {
          return Err(
            EvaluationError::NotExactlyOneNode {
              origin: format!("the binding of '{}'", variable.name()),
              count: nodes.len(),
              location: variable.location().clone(),
            }
            .into(),
          );
        }
        nodes.remove(0)
      }
      None => self.xpath_context_node(Some(variable))?,
    };

    let items = self.evaluate_with_variables(select, Some(context_node), visible.clone(), variable.location(), task)?;
    match items.len() {
      0 if variable.is_required() => Err(
        EvaluationError::MissingRequiredValue {
          variable: variable.name().clone(),
          step_name: step.name().to_string(),
          location: variable.location().clone(),
        }
        .into(),
      ),
      0 => Ok(None),
      1 => Ok(Some(items[0].string_value())),
      count => Err(
        EvaluationError::TooManyItems {
          query: select.to_string(),
          count,
          location: variable.location().clone(),
        }
        .into(),
      ),
    }
  }

  /// Reads the `c:param` documents of a parameter port into a name to value map, in
  /// document order. A later parameter of the same name wins.
  pub fn read_parameters(&self, reference: &PortReference) -> PipelineResult<IndexMap<QName, String>> {
    let mut parameters = IndexMap::new();
    for document in self.read_nodes(reference)? {
      collect_parameters(&document, &mut parameters)?;
    }
    Ok(parameters)
  }

  /// `<c:param name="..." value="...">value</c:param>`, with a `namespace` attribute when
  /// `name` has one.
  pub fn new_parameter_element(name: &QName, value: &str) -> Document {
    let mut attributes = vec![Attribute::new(PARAM_NAME, name.local_name())];
    if let Some(namespace) = name.namespace() {
      attributes.push(Attribute::new(PARAM_NAMESPACE, namespace));
    }
    attributes.push(Attribute::new(PARAM_VALUE, value));
    let children = if value.is_empty() {
      Vec::new()
    } else {
      vec![Document::text(value)]
    };
    Document::document(vec![Document::element(QName::xproc_step("param"), attributes, children)])
  }

  /// `<c:result>value</c:result>`.
  pub fn new_result_element(value: &str) -> Document {
    Document::simple(QName::xproc_step("result"), value)
  }
}

fn collect_parameters(node: &Document, parameters: &mut IndexMap<QName, String>) -> PipelineResult<()> {
  if let NodeKind::Element { attributes, .. } = node.kind() {
    if let Some(name) = node.attribute_value(PARAM_NAME) {
      let foreign = attributes.iter().find(|attribute| {
        attribute.name.namespace().is_some()
          || ![PARAM_NAME, PARAM_NAMESPACE, PARAM_VALUE].contains(&attribute.name.local_name())
      });
      if let Some(foreign) = foreign {
        return Err(
          EvaluationError::InvalidParameter {
            message: format!("unexpected attribute '{}' on parameter '{}'", foreign.name, name),
          }
          .into(),
        );
      }
      let namespace = node.attribute_value(PARAM_NAMESPACE).filter(|namespace| !namespace.is_empty());
      let qname = match namespace {
        Some(namespace) => {
          let local = name.rsplit(':').next().unwrap_or(name);
          QName::new(namespace, local)
        }
        None if name.contains(':') => {
          return Err(
            EvaluationError::InvalidParameter {
              message: format!("prefixed parameter name '{}' without a namespace", name),
            }
            .into(),
          );
        }
        None => QName::local(name),
      };
      let value = node.attribute_value(PARAM_VALUE).unwrap_or_default().to_string();
      parameters.insert(qname, value);
    }
  }
  for child in node.children() {
    collect_parameters(child, parameters)?;
  }
  Ok(())
}

fn wrap_variable_error(step: &Step, variable: &Variable, err: PipelineError) -> PipelineError {
  match err {
    PipelineError::Evaluation(source) => EvaluationError::Variable {
      variable: variable.name().clone(),
      step_name: step.name().to_string(),
      location: variable.location().clone(),
      source: Box::new(source),
    }
    .into(),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::binding::PortBinding;
  use crate::core::port::Port;
  use crate::document::TreeEngine;
  use crate::pipeline::context::PipelineContext;
  use crate::steps;

  fn root_environment() -> Environment {
    Environment::new(&steps::group().named("root"), &PipelineContext::default())
  }

  #[test]
  fn literal_values_and_selects_populate_the_local_scope() {
    let doc = TreeEngine::new().parse_str("<config mode='fast'/>").unwrap();
    let step = steps::identity()
      .named("id")
      .bind("source", PortBinding::inline(doc))
      .declare_variable(Variable::option("literal").value("1"))
      .unwrap()
      .declare_variable(Variable::option("mode").select("/config/@mode"))
      .unwrap()
      .declare_variable(Variable::variable("both").select("concat($literal, '-', $mode)"))
      .unwrap();
    let environment = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap();
    assert_eq!(environment.get_variable(&QName::local("literal")), Some("1"));
    assert_eq!(environment.get_variable(&QName::local("mode")), Some("fast"));
    assert_eq!(environment.get_variable(&QName::local("both")), Some("1-fast"));
  }

  #[test]
  fn missing_required_value_is_reported_with_its_variable() {
    let step = steps::identity()
      .named("id")
      .declare_variable(Variable::option("needed").required(true))
      .unwrap();
    let err = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap_err();
    match err {
      PipelineError::Evaluation(EvaluationError::Variable { variable, source, .. }) => {
        assert_eq!(variable, QName::local("needed"));
        assert!(matches!(*source, EvaluationError::MissingRequiredValue { .. }));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn required_select_yielding_nothing_is_reported() {
    let doc = TreeEngine::new().parse_str("<config/>").unwrap();
    let step = steps::identity()
      .named("id")
      .bind("source", PortBinding::inline(doc))
      .declare_variable(Variable::option("needed").required(true).select("/config/@missing"))
      .unwrap();
    let err = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Evaluation(EvaluationError::Variable { ref variable, ref source, .. })
        if *variable == QName::local("needed") && matches!(**source, EvaluationError::MissingRequiredValue { .. })
    ));
  }

  #[test]
  fn optional_select_yielding_nothing_stays_unbound() {
    let doc = TreeEngine::new().parse_str("<config/>").unwrap();
    let step = steps::identity()
      .named("id")
      .bind("source", PortBinding::inline(doc))
      .declare_variable(Variable::option("maybe").select("/config/@missing"))
      .unwrap();
    let environment = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap();
    assert_eq!(environment.get_variable(&QName::local("maybe")), None);
  }

  #[test]
  fn select_yielding_several_items_is_rejected() {
    let doc = TreeEngine::new().parse_str("<list><item>1</item><item>2</item></list>").unwrap();
    let step = steps::identity()
      .named("id")
      .bind("source", PortBinding::inline(doc))
      .declare_variable(Variable::variable("items").select("/list/item"))
      .unwrap();
    let err = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Evaluation(EvaluationError::Variable { ref source, .. })
        if matches!(**source, EvaluationError::TooManyItems { count: 2, .. })
    ));
  }

  #[test]
  fn optional_without_value_contributes_nothing() {
    let step = steps::identity()
      .named("id")
      .declare_variable(Variable::option("maybe"))
      .unwrap()
      .declare_variable(Variable::parameter("p"))
      .unwrap();
    let environment = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap();
    assert_eq!(environment.get_variable(&QName::local("maybe")), None);
  }

  #[test]
  fn variable_binding_must_yield_one_node() {
    let step = steps::identity()
      .named("id")
      .declare_variable(Variable::option("x").select("string(.)").bind(PortBinding::Empty))
      .unwrap();
    let err = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Evaluation(EvaluationError::Variable { ref source, .. })
        if matches!(**source, EvaluationError::NotExactlyOneNode { count: 0, .. })
    ));
  }

  #[test]
  fn parameters_are_written_to_the_parameter_port() {
    let step = steps::identity()
      .named("id")
      .with_port(Port::parameter("parameters").primary(true))
      .set_parameter("color", "blue")
      .set_parameter(QName::new("urn:x", "size"), "L");
    let environment = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap();
    let parameters = environment.read_parameters(&step.port_reference("parameters")).unwrap();
    assert_eq!(parameters.get(&QName::local("color")).map(String::as_str), Some("blue"));
    assert_eq!(parameters.get(&QName::new("urn:x", "size")).map(String::as_str), Some("L"));
    assert_eq!(environment.get_variable(&QName::local("color")), None);
  }

  #[test]
  fn parameter_without_parameter_port_fails() {
    let step = steps::identity().named("id").set_parameter("color", "blue");
    let err = root_environment()
      .new_following_step_environment(&step, &TaskContext::root())
      .unwrap_err();
    assert!(matches!(err, PipelineError::Evaluation(EvaluationError::NoParametersPort { .. })));
  }

  #[test]
  fn foreign_attributes_on_parameters_are_rejected() {
    let doc = TreeEngine::new()
      .parse_str("<c:param xmlns:c='http://www.w3.org/ns/xproc-step' name='a' value='1' extra='no'/>")
      .unwrap();
    let port = Port::parameter("parameters").with_step_name("s").bind(PortBinding::inline(doc));
    let environment = root_environment();
    let environment = environment.add_port(environment.new_environment_port(&port));
    let err = environment.read_parameters(port.reference()).unwrap_err();
    assert!(matches!(err, PipelineError::Evaluation(EvaluationError::InvalidParameter { .. })));
  }
}
