//! Compiles the IR into an [`ExecutableGraph`].
//!
//! For every node the builder materializes the backing component through the
//! registry, computes the effective input/output expression maps (component
//! maps as the base, node maps overriding per key), compiles the successor
//! descriptor, and assembles the policy stack outermost-first:
//!
//! ```text
//! permissions → cost → rate limit → retry → base executor
//! ```
//!
//! Masking, the remaining policy, applies on the event-bus emission path.
//! The stack is built once; per-run state lives in the run context.
//! Rate-limit buckets are interned here and shared by every run.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::{BuildError, ErrorKind};
use crate::graphs::edges::EdgeDescriptor;
use crate::ir::model::{
    ComponentIr, CostIr, GraphOutputIr, MapFailureMode, MaskingIr, NextIr, NodeIr, NodeKind,
    WorkflowIr,
};
use crate::policy::cost::CostGate;
use crate::policy::permissions::{PermissionGate, PermissionManager};
use crate::policy::rate_limit::{RateLimitGate, RateLimiterManager};
use crate::policy::retry::{RetryLayer, RetryPolicy};
use crate::registry::resolver::{permissions_from_config, Registry};
use crate::runtimes::executors::{ComponentExecutor, MapExecutor, NodeExecutor};
use crate::runtimes::history::HistoryBackend;
use crate::utils::collections::JsonMap;

/// Compiled, immutable description of one node.
#[derive(Debug)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    pub pointer: String,
    pub component_id: Option<String>,
    pub provider_id: Option<String>,
    pub tool_id: Option<String>,
    pub model: Option<String>,
    /// Effective input expressions (component base, node overrides).
    pub inputs: JsonMap,
    /// Effective output expressions (component base, node overrides).
    pub outputs: JsonMap,
    /// Literal fallbacks applied to inputs that resolve to null.
    pub defaults: JsonMap,
    /// Effective config (component base, node overrides).
    pub config: JsonMap,
    pub edge: EdgeDescriptor,
    pub required_permissions: Vec<String>,
}

/// A node spec plus its policy-wrapped executor.
#[derive(Clone)]
pub struct CompiledNode {
    pub spec: Arc<NodeSpec>,
    pub executor: Arc<dyn NodeExecutor>,
}

/// The compiled graph: everything a run needs except per-run state.
pub struct ExecutableGraph {
    pub name: Option<String>,
    pub entry: String,
    pub nodes: FxHashMap<String, CompiledNode>,
    pub outputs: Vec<GraphOutputIr>,
    pub histories: FxHashMap<String, Arc<dyn HistoryBackend>>,
    pub masking: MaskingIr,
    pub cost: CostIr,
    pub permissions: Arc<PermissionManager>,
    pub rate_limits: Arc<RateLimiterManager>,
}

impl std::fmt::Debug for ExecutableGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .field("masking", &self.masking)
            .field("cost", &self.cost)
            .finish()
    }
}

/// Builder from IR + registry to [`ExecutableGraph`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        ir: &WorkflowIr,
        registry: &Registry,
    ) -> Result<ExecutableGraph, BuildError> {
        if !ir.graph.nodes.contains_key(&ir.graph.entry) {
            return Err(BuildError::new(
                ErrorKind::GraphEntryNotFound,
                format!("graph entry '{}' does not exist", ir.graph.entry),
                "/graph/entry",
            ));
        }

        let permissions = Arc::new(PermissionManager::new(&ir.policies.permissions));
        let rate_limits = Arc::new(RateLimiterManager::new(&ir.policies.rate_limit));

        let mut histories = FxHashMap::default();
        for (id, record) in &ir.histories {
            histories.insert(id.clone(), registry.history(record)?);
        }

        let mut nodes = FxHashMap::default();
        for (id, node) in &ir.graph.nodes {
            let compiled = self.build_node(ir, node, registry, &permissions, &rate_limits)?;
            nodes.insert(id.clone(), compiled);
        }

        Ok(ExecutableGraph {
            name: ir.runtime.graph_name.clone(),
            entry: ir.graph.entry.clone(),
            nodes,
            outputs: ir.graph.outputs.clone(),
            histories,
            masking: ir.policies.masking.clone(),
            cost: ir.policies.cost,
            permissions,
            rate_limits,
        })
    }

    fn build_node(
        &self,
        ir: &WorkflowIr,
        node: &NodeIr,
        registry: &Registry,
        permissions: &Arc<PermissionManager>,
        rate_limits: &Arc<RateLimiterManager>,
    ) -> Result<CompiledNode, BuildError> {
        let component_meta: Option<&ComponentIr> = match &node.component {
            Some(component_id) => Some(ir.components.get(component_id).ok_or_else(|| {
                BuildError::new(
                    ErrorKind::NodeComponentNotFound,
                    format!(
                        "component '{component_id}' referenced by node '{}' is undefined",
                        node.id
                    ),
                    node.pointer.clone(),
                )
            })?),
            None => None,
        };

        let needs_component = matches!(
            node.kind,
            NodeKind::Llm | NodeKind::Tool | NodeKind::Router | NodeKind::Component
        );
        if needs_component && component_meta.is_none() {
            return Err(BuildError::new(
                ErrorKind::NodeType,
                format!("node '{}' of kind '{}' requires a component", node.id, node.kind),
                node.pointer.clone(),
            ));
        }

        let provider_id = component_meta.and_then(|c| c.provider.clone());
        if matches!(node.kind, NodeKind::Llm | NodeKind::Tool) {
            let Some(provider_id) = &provider_id else {
                return Err(BuildError::new(
                    ErrorKind::ProviderMissing,
                    format!("node '{}' requires a provider but none was resolved", node.id),
                    node.pointer.clone(),
                ));
            };
            registry.provider(ir, provider_id)?;
        }

        let tool_id = component_meta.and_then(|c| c.tool.clone());
        if node.kind == NodeKind::Tool {
            let Some(tool_id) = &tool_id else {
                return Err(BuildError::new(
                    ErrorKind::ComponentToolNotFound,
                    format!("node '{}' of kind 'tool' does not reference a tool", node.id),
                    node.pointer.clone(),
                ));
            };
            registry.tool(ir, tool_id)?;
        }

        if node.kind == NodeKind::Router {
            match &node.next {
                NextIr::Routes(routes) if routes.is_empty() => {
                    return Err(BuildError::new(
                        ErrorKind::RouterNoMatch,
                        format!("router node '{}' does not define any routes", node.id),
                        node.pointer.clone(),
                    ))
                }
                _ => {}
            }
        }

        let component = match component_meta {
            Some(meta) => Some(registry.component(ir, &meta.id)?),
            None => None,
        };

        let empty = JsonMap::new();
        let config = merge_maps(
            component_meta.map_or(&empty, |c| &c.config),
            &node.config,
        );
        let inputs = merge_maps(component_meta.map_or(&empty, |c| &c.inputs), &node.inputs);
        let outputs = merge_maps(component_meta.map_or(&empty, |c| &c.outputs), &node.outputs);
        let defaults = component_meta.map_or_else(JsonMap::new, |c| c.defaults.clone());

        let mut required = permissions_from_config(&config).map_err(|message| {
            BuildError::new(ErrorKind::PermType, message, node.pointer.clone())
        })?;
        if let Some(component) = &component {
            for permission in component.permissions() {
                if !required.contains(permission) {
                    required.push(permission.clone());
                }
            }
        }

        let model = config
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);

        let spec = Arc::new(NodeSpec {
            id: node.id.clone(),
            kind: node.kind,
            pointer: node.pointer.clone(),
            component_id: component_meta.map(|c| c.id.clone()),
            provider_id: provider_id.clone(),
            tool_id,
            model,
            inputs,
            outputs,
            defaults,
            config,
            edge: EdgeDescriptor::from_ir(&node.next),
            required_permissions: required.clone(),
        });

        let base: Arc<dyn NodeExecutor> = if node.kind == NodeKind::Map {
            self.build_map_executor(ir, node, &spec)?
        } else {
            Arc::new(ComponentExecutor {
                spec: Arc::clone(&spec),
                component,
            })
        };

        let retry_policy = ir
            .policies
            .retry
            .overrides
            .get(&node.id)
            .or(ir.policies.retry.default.as_ref())
            .map(RetryPolicy::from_ir);

        let mut executor: Arc<dyn NodeExecutor> = Arc::new(RetryLayer {
            node_id: node.id.clone(),
            policy: retry_policy,
            inner: base,
        });
        executor = Arc::new(RateLimitGate {
            node_id: node.id.clone(),
            provider_id,
            manager: Arc::clone(rate_limits),
            inner: executor,
        });
        if ir.policies.cost.per_run_tokens.is_some() {
            executor = Arc::new(CostGate {
                node_id: node.id.clone(),
                inner: executor,
            });
        }
        if !required.is_empty() {
            executor = Arc::new(PermissionGate {
                node_id: node.id.clone(),
                target: spec.component_id.clone().unwrap_or_else(|| node.id.clone()),
                required,
                manager: Arc::clone(permissions),
                inner: executor,
            });
        }

        Ok(CompiledNode { spec, executor })
    }

    fn build_map_executor(
        &self,
        ir: &WorkflowIr,
        node: &NodeIr,
        spec: &Arc<NodeSpec>,
    ) -> Result<Arc<dyn NodeExecutor>, BuildError> {
        let Some(body_id) = spec.config.get("body").and_then(Value::as_str) else {
            return Err(BuildError::new(
                ErrorKind::MapBodyMissing,
                format!("map node '{}' does not name a body node", node.id),
                node.pointer.clone(),
            ));
        };
        if !ir.graph.nodes.contains_key(body_id) {
            return Err(BuildError::new(
                ErrorKind::MapBodyMissing,
                format!("map node '{}' references unknown body '{body_id}'", node.id),
                node.pointer.clone(),
            ));
        }
        let concurrency = match spec.config.get("concurrency") {
            None | Some(Value::Null) => 1,
            Some(value) => value.as_u64().filter(|n| *n >= 1).ok_or_else(|| {
                BuildError::new(
                    ErrorKind::NodeType,
                    format!("map node '{}' concurrency must be an integer >= 1", node.id),
                    node.pointer.clone(),
                )
            })? as usize,
        };
        let ordered = spec
            .config
            .get("ordered")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let failure_tag = spec
            .config
            .get("failure_mode")
            .and_then(Value::as_str)
            .unwrap_or("fail_fast");
        let failure_mode = MapFailureMode::parse(failure_tag).ok_or_else(|| {
            BuildError::new(
                ErrorKind::NodeType,
                format!("map node '{}' has unsupported failure_mode '{failure_tag}'", node.id),
                node.pointer.clone(),
            )
        })?;
        let result_key = spec
            .config
            .get("result_key")
            .and_then(Value::as_str)
            .unwrap_or("results")
            .to_string();

        Ok(Arc::new(MapExecutor {
            spec: Arc::clone(spec),
            body_id: body_id.to_string(),
            collection: spec.config.get("collection").cloned().unwrap_or(Value::Null),
            concurrency,
            ordered,
            failure_mode,
            result_key,
        }))
    }
}

fn merge_maps(base: &JsonMap, overlay: &JsonMap) -> JsonMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
