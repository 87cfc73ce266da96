// portflow/src/document/mod.rs

//! Documents flowing through ports, and the engine used to parse, serialize and query them.

pub mod builder;
pub mod engine;
pub mod node;
pub mod query;
pub mod tree;

pub use builder::DocumentBuilder;
pub use engine::{effective_boolean_value, DocumentEngine, Item, QueryContext};
pub use node::{Attribute, Document, NodeKind};
pub use tree::TreeEngine;
