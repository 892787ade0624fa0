//! Factory registry and lazy materialization of declared instances.

pub mod resolver;

pub use resolver::{
    ComponentFactory, FactorySet, HistoryFactory, Materialized, ProviderFactory, ProviderInstance,
    Registry, ToolFactory,
};
