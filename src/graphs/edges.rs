//! Compiled successor descriptors.

use rustc_hash::FxHashMap;

use crate::ir::model::NextIr;

/// The compiled form of a node's `next` field. Built once by the graph
/// builder from [`NextIr`]; the run loop dispatches on the variant without
/// ever re-parsing document shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeDescriptor {
    /// No successor: the branch ends here.
    Terminal,
    /// One unconditional successor.
    Single(String),
    /// Parallel fan-out: every successor runs concurrently, the run loop
    /// joins them all before proceeding.
    Fanout(Vec<String>),
    /// Conditional routing: the node's `route` output selects the
    /// successor, the `default` key is the fallback.
    Routes(FxHashMap<String, String>),
}

impl EdgeDescriptor {
    #[must_use]
    pub fn from_ir(next: &NextIr) -> Self {
        match next {
            NextIr::None => EdgeDescriptor::Terminal,
            NextIr::Single(target) => EdgeDescriptor::Single(target.clone()),
            NextIr::Fanout(targets) => EdgeDescriptor::Fanout(targets.clone()),
            NextIr::Routes(routes) => EdgeDescriptor::Routes(routes.clone()),
        }
    }

    /// Every node id this descriptor can reach.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            EdgeDescriptor::Terminal => Vec::new(),
            EdgeDescriptor::Single(target) => vec![target.as_str()],
            EdgeDescriptor::Fanout(targets) => targets.iter().map(String::as_str).collect(),
            EdgeDescriptor::Routes(routes) => routes.values().map(String::as_str).collect(),
        }
    }
}
