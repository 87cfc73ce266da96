// portflow/examples/basic_pipeline.rs

use portflow::steps;
use portflow::{
  MemoryResolver, Pipeline, PipelineConfig, PipelineContext, PipelineResult, Port, QName, StepLibrary, TreeEngine,
  Variable,
};
use tracing::info;

#[tokio::main]
async fn main() -> PipelineResult<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

  info!("--- Basic Pipeline Example ---");

  // 1. Resources live in memory, relative hrefs resolve against mem:/out/.
  let resolver = MemoryResolver::new();
  let context = PipelineContext::builder()
    .resolver(resolver.clone())
    .config(PipelineConfig::default().with_base_uri("mem:/out/"))
    .build();

  // 2. Every order is stored under its id, then routed by size.
  let library = StepLibrary::core();
  let for_each = library
    .instantiate(&QName::xproc("for-each"), "orders")?
    .with_port(Port::input("iteration-source").primary(true).sequence(true).select("//order"))
    .with_port(Port::output("result").primary(true).sequence(true))
    .declare_variable(Variable::variable("id").select("string(/order/@id)"))?
    .add_step(
      library
        .instantiate(&QName::xproc("store"), "save")?
        .pipe("source", "orders", "current")
        .with_variable(Variable::option("href").select("concat('order-', $id, '.xml')")),
    )
    .add_step(
      steps::choose()
        .named("route")
        .with_port(Port::output("result").primary(true).sequence(true))
        .pipe("xpath-context", "orders", "current")
        .add_step(
          steps::when("/order/@size = 'large'")
            .named("large")
            .with_port(Port::output("result").primary(true).sequence(true))
            .add_step(steps::identity().named("keep").pipe("source", "orders", "current")),
        )
        .add_step(
          steps::otherwise()
            .named("small")
            .with_port(Port::output("result").primary(true).sequence(true))
            .add_step(steps::sink().named("drop").pipe("source", "orders", "current"))
            .add_step(steps::identity().named("nothing").bind("source", portflow::PortBinding::Empty)),
        ),
    );
  let main = steps::pipeline(QName::new("urn:example", "orders"))
    .named("main")
    .add_step(for_each);

  // 3. Run it.
  let orders = TreeEngine::new()
    .parse_str(r#"<orders><order id="a" size="large"/><order id="b" size="small"/><order id="c" size="large"/></orders>"#)
    .map_err(|err| portflow::PipelineError::Internal(err.to_string()))?;
  let outcome = Pipeline::new(main, context).with_input("source", vec![orders]).run().await?;

  // 4. Inspect the results.
  for document in outcome.read_nodes("result")? {
    info!(order = %document, "Large order.");
  }
  for href in resolver.writes() {
    info!(href = %href, "Stored.");
  }
  Ok(())
}
