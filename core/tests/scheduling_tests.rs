// tests/scheduling_tests.rs
mod common;

use common::*;
use portflow::steps;
use portflow::{
  ExternalResources, MemoryResolver, Pipeline, PipelineError, PortBinding, QName, Step, StructuralError,
};
use serial_test::serial;
use std::time::{Duration, Instant};

fn main_pipeline() -> Step {
  steps::pipeline(QName::new("urn:portflow:test", "main")).named("main")
}

/// `a` feeds `b` and `c`, `d` reads `b` then `c`. `c` finishes long before `b`.
fn diamond(log: &ExecutionLog) -> Step {
  main_pipeline()
    .add_step(Recorder::new(log).delay_ms(20).step("a"))
    .add_step(Recorder::new(log).delay_ms(80).step("b").pipe("source", "a", "result"))
    .add_step(Recorder::new(log).delay_ms(30).step("c").pipe("source", "a", "result"))
    .add_step(
      Recorder::new(log)
        .step("d")
        .pipe("source", "b", "result")
        .bind("source", PortBinding::pipe("c", "result")),
    )
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_dependents_start_after_their_dependencies_finish() {
  setup_tracing();
  let log = ExecutionLog::new();
  let context = memory_context(&MemoryResolver::new(), 4);
  Pipeline::new(diamond(&log), context)
    .with_input("source", vec![parse("<in/>")])
    .run()
    .await
    .unwrap();

  assert!(log.finished_before("a", "b"));
  assert!(log.finished_before("a", "c"));
  assert!(log.finished_before("b", "d"));
  assert!(log.finished_before("c", "d"));
  assert!(log.overlapped("b", "c"), "independent siblings should run concurrently: {:?}", log.events());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_output_order_does_not_depend_on_timing() {
  setup_tracing();
  let expected = vec!["<in/>", "<a/>", "<b/>", "<in/>", "<a/>", "<c/>", "<d/>"];
  for _ in 0..3 {
    let log = ExecutionLog::new();
    let outcome = Pipeline::new(diamond(&log), memory_context(&MemoryResolver::new(), 4))
      .with_input("source", vec![parse("<in/>")])
      .run()
      .await
      .unwrap();
    assert_eq!(texts(&outcome.read_nodes("result").unwrap()), expected);
  }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_single_permit_serializes_atomic_steps() {
  setup_tracing();
  let log = ExecutionLog::new();
  Pipeline::new(diamond(&log), memory_context(&MemoryResolver::new(), 1))
    .with_input("source", vec![parse("<in/>")])
    .run()
    .await
    .unwrap();
  assert!(!log.overlapped("b", "c"));
  assert!(log.finished("d"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_external_reader_waits_for_preceding_writer() {
  setup_tracing();
  let log = ExecutionLog::new();
  let pipeline = main_pipeline()
    .add_step(
      Recorder::new(&log)
        .delay_ms(50)
        .resources(ExternalResources::new(false, true))
        .step("writer")
        .pipe("source", "main", "source"),
    )
    .add_step(
      Recorder::new(&log)
        .delay_ms(50)
        .resources(ExternalResources::NONE)
        .step("pure")
        .pipe("source", "main", "source"),
    )
    .add_step(
      Recorder::new(&log)
        .resources(ExternalResources::new(true, false))
        .step("reader")
        .pipe("source", "main", "source"),
    );
  Pipeline::new(pipeline, memory_context(&MemoryResolver::new(), 4))
    .with_input("source", vec![parse("<in/>")])
    .run()
    .await
    .unwrap();

  assert!(log.finished_before("writer", "reader"));
  assert!(log.overlapped("writer", "pure"), "pure step should not wait: {:?}", log.events());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_first_failure_cancels_running_siblings() {
  setup_tracing();
  let log = ExecutionLog::new();
  let pipeline = main_pipeline()
    .add_step(Recorder::new(&log).delay_ms(3000).step("slow").pipe("source", "main", "source"))
    .add_step(failing_step("bad", 20).pipe("source", "main", "source"))
    .add_step(Recorder::new(&log).step("after").pipe("source", "bad", "result"));

  let started = Instant::now();
  let err = Pipeline::new(pipeline, memory_context(&MemoryResolver::new(), 4))
    .with_input("source", vec![parse("<in/>")])
    .run()
    .await
    .unwrap_err();

  match err {
    PipelineError::StepFailure { step_name, .. } => assert_eq!(step_name, "bad"),
    other => panic!("Expected the failure of 'bad', got {:?}", other),
  }
  assert!(started.elapsed() < Duration::from_millis(2000));
  assert!(log.started("slow"));
  assert!(!log.finished("slow"));
  assert!(!log.started("after"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_cycle_is_rejected_before_anything_runs() {
  setup_tracing();
  reset_counters();
  let log = ExecutionLog::new();
  let pipeline = main_pipeline()
    .add_step(Recorder::new(&log).step("free").pipe("source", "main", "source"))
    .add_step(Recorder::new(&log).step("x").pipe("source", "z", "result"))
    .add_step(Recorder::new(&log).step("y").pipe("source", "x", "result"))
    .add_step(Recorder::new(&log).step("z").pipe("source", "y", "result"));

  let err = Pipeline::new(pipeline, memory_context(&MemoryResolver::new(), 4))
    .run()
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    PipelineError::Structural(StructuralError::CyclicDependency { ref step_name }) if ["x", "y", "z"].contains(&step_name.as_str())
  ));
  assert_eq!(executed_steps(), 0);
  assert!(log.events().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_duplicate_sibling_names_are_rejected() {
  setup_tracing();
  let log = ExecutionLog::new();
  let pipeline = main_pipeline()
    .add_step(Recorder::new(&log).step("twice"))
    .add_step(Recorder::new(&log).step("twice"));
  let err = Pipeline::new(pipeline, memory_context(&MemoryResolver::new(), 4))
    .run()
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Structural(StructuralError::DuplicateStepName { .. })
  ));
}
