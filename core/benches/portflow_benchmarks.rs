use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use portflow::steps;
use portflow::{
  AtomicProcessor, Document, Environment, ExternalResources, MemoryResolver, Pipeline, PipelineConfig,
  PipelineContext, PipelineResult, Port, PortBinding, QName, Step, StepOutput, TaskContext,
};
use std::time::Duration;
use tokio::runtime::Runtime;

// --- Helper: asynchronous body with a fixed delay ---
struct Sleep {
  delay: Duration,
}

#[async_trait::async_trait]
impl AtomicProcessor for Sleep {
  fn external_resources(&self) -> ExternalResources {
    ExternalResources::NONE
  }

  async fn execute(&self, step: &Step, environment: &Environment, _task: &TaskContext) -> PipelineResult<StepOutput> {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    let documents = environment.read_nodes(&step.port_reference("source"))?;
    Ok(StepOutput::new().with("result", documents))
  }
}

fn sleep_step(name: &str, delay_micros: u64) -> Step {
  Step::atomic(
    QName::new("urn:portflow:bench", "sleep"),
    Sleep {
      delay: Duration::from_micros(delay_micros),
    },
  )
  .with_ports([Port::input("source").sequence(true), Port::output("result").sequence(true)])
  .named(name)
}

fn main_pipeline() -> Step {
  steps::pipeline(QName::new("urn:portflow:bench", "main")).named("main")
}

fn context(parallelism: usize) -> PipelineContext {
  PipelineContext::builder()
    .resolver(MemoryResolver::new())
    .config(PipelineConfig::default().with_max_parallel_steps(parallelism))
    .build()
}

fn input() -> Document {
  Document::simple("in", "payload")
}

// --- Benchmark Functions ---

/// Each step pipes from the previous one: no parallelism available.
fn bench_linear_chain(c: &mut Criterion) {
  let mut group = c.benchmark_group("LinearChain");
  let rt = Runtime::new().unwrap();

  for num_steps in [1usize, 10, 50] {
    let mut pipeline = main_pipeline();
    for i in 0..num_steps {
      let step = steps::identity().named(format!("step_{}", i));
      let step = match i {
        0 => step,
        _ => step.pipe("source", format!("step_{}", i - 1), "result"),
      };
      pipeline = pipeline.add_step(step);
    }
    let pipeline = Pipeline::new(pipeline, context(4)).with_input("source", vec![input()]);

    group.throughput(Throughput::Elements(num_steps as u64));
    group.bench_with_input(BenchmarkId::new("steps", num_steps), &pipeline, |b, pipeline| {
      b.to_async(&rt).iter(|| async { pipeline.run().await.unwrap() });
    });
  }
  group.finish();
}

/// Independent siblings sleeping concurrently, bounded by the step permits.
fn bench_wide_siblings(c: &mut Criterion) {
  let mut group = c.benchmark_group("WideSiblingsAsyncIO");
  group.sample_size(20);
  let rt = Runtime::new().unwrap();

  for num_steps in [4usize, 16] {
    for parallelism in [1usize, 4, 16] {
      let mut pipeline = main_pipeline();
      for i in 0..num_steps {
        pipeline = pipeline.add_step(
          sleep_step(&format!("sleep_{}", i), 200).bind("source", PortBinding::inline(input())),
        );
      }
      let pipeline = Pipeline::new(pipeline, context(parallelism));

      group.bench_with_input(
        BenchmarkId::new(format!("{}steps", num_steps), parallelism),
        &pipeline,
        |b, pipeline| {
          b.to_async(&rt).iter(|| async { pipeline.run().await.unwrap() });
        },
      );
    }
  }
  group.finish();
}

/// A for-each over `num_items` documents, each iteration copying the current one.
fn bench_for_each(c: &mut Criterion) {
  let mut group = c.benchmark_group("ForEach");
  let rt = Runtime::new().unwrap();

  for num_items in [10usize, 100] {
    let items: Vec<Document> = (0..num_items).map(|i| Document::simple("item", i.to_string())).collect();
    let for_each = steps::for_each()
      .named("loop")
      .with_port(Port::output("result").primary(true).sequence(true))
      .add_step(steps::identity().named("copy").pipe("source", "loop", "current"));
    let pipeline = Pipeline::new(main_pipeline().add_step(for_each), context(4)).with_input("source", items);

    group.throughput(Throughput::Elements(num_items as u64));
    group.bench_with_input(BenchmarkId::new("items", num_items), &pipeline, |b, pipeline| {
      b.to_async(&rt).iter(|| async { pipeline.run().await.unwrap() });
    });
  }
  group.finish();
}

criterion_group!(benches, bench_linear_chain, bench_wide_siblings, bench_for_each);
criterion_main!(benches);
