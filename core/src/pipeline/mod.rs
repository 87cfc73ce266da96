// portflow/src/pipeline/mod.rs

//! Running step trees: the run context, subpipeline dependency analysis, the concurrent
//! subpipeline runner and the runnable [`Pipeline`] wrapper.

pub mod context;
pub mod definition;
pub mod dependencies;
pub mod execution;

pub use context::{PipelineContext, PipelineContextBuilder, TaskContext};
pub use definition::{Pipeline, PipelineOutcome};
pub use dependencies::SubpipelineDependencies;
pub use execution::{run_steps, run_subpipeline};
