// tests/common/mod.rs
#![allow(dead_code)] // Not every test file uses every helper.

use async_trait::async_trait;
use parking_lot::Mutex;
use portflow::{
  AtomicProcessor, Document, Environment, ExternalResources, PipelineConfig, PipelineContext, PipelineError,
  PipelineResult, Port, QName, Step, StepOutput, TaskContext, TreeEngine,
};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration;
use tracing::Level;

// --- Execution log shared by recording steps ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
  Start,
  End,
}

/// Start and end events of recording steps, in the order they happened.
#[derive(Clone, Default)]
pub struct ExecutionLog {
  events: Arc<Mutex<Vec<(String, Phase)>>>,
}

impl ExecutionLog {
  pub fn new() -> Self {
    Self::default()
  }

  fn record(&self, step_name: &str, phase: Phase) {
    self.events.lock().push((step_name.to_string(), phase));
  }

  pub fn events(&self) -> Vec<(String, Phase)> {
    self.events.lock().clone()
  }

  fn index_of(&self, step_name: &str, phase: Phase) -> Option<usize> {
    self
      .events
      .lock()
      .iter()
      .position(|(name, recorded)| name == step_name && *recorded == phase)
  }

  pub fn started(&self, step_name: &str) -> bool {
    self.index_of(step_name, Phase::Start).is_some()
  }

  pub fn finished(&self, step_name: &str) -> bool {
    self.index_of(step_name, Phase::End).is_some()
  }

  /// Whether `first` ended before `second` started.
  pub fn finished_before(&self, first: &str, second: &str) -> bool {
    match (self.index_of(first, Phase::End), self.index_of(second, Phase::Start)) {
      (Some(end), Some(start)) => end < start,
      _ => false,
    }
  }

  /// Whether both steps were running at the same time at some point.
  pub fn overlapped(&self, a: &str, b: &str) -> bool {
    let (Some(a_start), Some(a_end), Some(b_start), Some(b_end)) = (
      self.index_of(a, Phase::Start),
      self.index_of(a, Phase::End),
      self.index_of(b, Phase::Start),
      self.index_of(b, Phase::End),
    ) else {
      return false;
    };
    a_start < b_end && b_start < a_end
  }
}

// --- Recording and failing step bodies ---

/// Copies `source` to `result`, optionally followed by a `<step-name/>` marker document,
/// and logs its start and end.
#[derive(Clone)]
pub struct Recorder {
  log: ExecutionLog,
  delay: Duration,
  resources: ExternalResources,
  marking: bool,
}

impl Recorder {
  pub fn new(log: &ExecutionLog) -> Self {
    Self {
      log: log.clone(),
      delay: Duration::ZERO,
      resources: ExternalResources::NONE,
      marking: true,
    }
  }

  pub fn delay_ms(mut self, millis: u64) -> Self {
    self.delay = Duration::from_millis(millis);
    self
  }

  pub fn resources(mut self, resources: ExternalResources) -> Self {
    self.resources = resources;
    self
  }

  pub fn marking(mut self, marking: bool) -> Self {
    self.marking = marking;
    self
  }

  pub fn step(self, name: &str) -> Step {
    Step::atomic(QName::new("urn:portflow:test", "recorder"), self)
      .with_ports([Port::input("source").sequence(true), Port::output("result").sequence(true)])
      .named(name)
  }
}

#[async_trait]
impl AtomicProcessor for Recorder {
  fn external_resources(&self) -> ExternalResources {
    self.resources
  }

  async fn execute(&self, step: &Step, environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    STEP_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst);
    self.log.record(step.name(), Phase::Start);
    tracing::debug!(target: "test_steps", step = %step.name(), "recorder started");
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    let mut documents = environment.read_nodes(&step.port_reference("source"))?;
    if self.marking {
      documents.push(Document::simple(step.name(), ""));
    }
    self.log.record(step.name(), Phase::End);
    Ok(StepOutput::new().with("result", documents))
  }
}

/// Fails after `delay`.
pub struct Failing {
  delay: Duration,
}

#[async_trait]
impl AtomicProcessor for Failing {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::NONE
  }

  async fn execute(&self, step: &Step, _environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    STEP_EXEC_COUNTER.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    tracing::warn!(target: "test_steps", step = %step.name(), "failing on purpose");
    Err(PipelineError::step_failure(step.name(), anyhow::anyhow!("step {} failed on purpose", step.name())))
  }
}

pub fn failing_step(name: &str, delay_ms: u64) -> Step {
  Step::atomic(
    QName::new("urn:portflow:test", "failing"),
    Failing {
      delay: Duration::from_millis(delay_ms),
    },
  )
  .with_ports([Port::input("source").sequence(true), Port::output("result").sequence(true)])
  .named(name)
}

// --- Documents and contexts ---

pub fn parse(xml: &str) -> Document {
  TreeEngine::new().parse_str(xml).expect("test XML must parse")
}

/// Serializations of `documents`, for compact assertions.
pub fn texts(documents: &[Document]) -> Vec<String> {
  documents.iter().map(ToString::to_string).collect()
}

/// A context with room for `parallelism` concurrent atomic steps, reading and writing
/// through `resolver` relative to `mem:/work/`.
pub fn memory_context(resolver: &portflow::MemoryResolver, parallelism: usize) -> PipelineContext {
  PipelineContext::builder()
    .resolver(resolver.clone())
    .config(
      PipelineConfig::default()
        .with_max_parallel_steps(parallelism)
        .with_base_uri("mem:/work/"),
    )
    .build()
}

// --- Tracing setup (once per test binary) ---
use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init()
    .ok();
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}

// --- Global execution counter ---
pub static STEP_EXEC_COUNTER: Lazy<Arc<AtomicUsize>> = Lazy::new(|| Arc::new(AtomicUsize::new(0)));

pub fn reset_counters() {
  STEP_EXEC_COUNTER.store(0, Ordering::SeqCst);
}

pub fn executed_steps() -> usize {
  STEP_EXEC_COUNTER.load(Ordering::SeqCst)
}
