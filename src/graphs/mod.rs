//! Graph compilation: IR + materialized instances → executable graph.

pub mod builder;
pub mod edges;

pub use builder::{CompiledNode, ExecutableGraph, GraphBuilder, NodeSpec};
pub use edges::EdgeDescriptor;
