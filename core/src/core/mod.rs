// portflow/src/core/mod.rs

//! The pipeline graph model: steps, ports, bindings and variables.

pub mod binding;
pub mod location;
pub mod port;
pub mod processor;
pub mod qname;
pub mod step;
pub mod variable;

pub use binding::PortBinding;
pub use location::Location;
pub use port::{Port, PortKind, PortReference};
pub use processor::{AtomicProcessor, AtomicStep, ExternalResources, ProcessorKind, StepOutput, StepProcessor};
pub use qname::QName;
pub use step::{Step, StepLog};
pub use variable::{Variable, VariableKind};
