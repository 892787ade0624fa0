//! Document → IR normalization.
//!
//! Consumes the raw mapping the host's loader produced, checks every
//! cross-reference, fills defaults, detects duplicates, and produces the
//! immutable [`WorkflowIr`] plus an ordered warning list. Warnings never
//! block; only referential or structural errors do, each tagged with a
//! stable [`ErrorKind`] and a json-pointer-like path to the offending field.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::collections::VecDeque;

use crate::errors::{ErrorKind, NormalizeError};
use crate::ir::model::{
    ComponentIr, CostIr, GraphIr, GraphOutputIr, HistoryIr, MaskingIr, NextIr, NodeIr, NodeKind,
    NormalizationWarning, PermissionsIr, PoliciesIr, ProviderIr, RateLimitAlgorithm,
    RateLimitPoliciesIr, RateLimitRuleIr, RetryPoliciesIr, RetryPolicyIr, RetryStrategy,
    RuntimeIr, ToolIr, WorkflowIr,
};
use crate::utils::collections::JsonMap;

/// The supported document format version.
pub const SUPPORTED_META_VERSION: u64 = 2;

/// The IR together with the warnings accumulated while producing it.
#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    pub ir: WorkflowIr,
    pub warnings: Vec<NormalizationWarning>,
}

/// Normalize a validated document into the runtime IR.
///
/// The input must already be syntactically valid (a nested
/// mapping/list/scalar tree); YAML parsing and schema validation happen in
/// the host before this point.
pub fn normalize_document(document: &Value) -> Result<NormalizeOutcome, NormalizeError> {
    let root = require_object(document, "/", "document")?;
    let mut warnings = Vec::new();

    let meta = normalize_meta(root.get("meta"))?;
    let providers = normalize_providers(root.get("providers"))?;
    let (runtime, default_provider) = normalize_runtime(root.get("runtime"), &providers)?;
    let tools = normalize_tools(root.get("tools"), &providers)?;
    let components = normalize_components(
        root.get("components"),
        &providers,
        &tools,
        default_provider.as_deref(),
        &mut warnings,
    )?;
    let graph_raw = match root.get("graph") {
        Some(value) => require_object(value, "/graph", "graph")?,
        None => {
            return Err(NormalizeError::new(
                ErrorKind::DocShape,
                "graph must be a mapping",
                "/graph",
            ))
        }
    };
    let graph = normalize_graph(graph_raw, &components, &mut warnings)?;
    let policies = normalize_policies(root.get("policies"))?;
    let mut histories = normalize_histories(root.get("histories"))?;
    merge_legacy_history(graph_raw, &mut histories, &mut warnings);

    Ok(NormalizeOutcome {
        ir: WorkflowIr {
            meta,
            runtime,
            providers,
            tools,
            components,
            graph,
            policies,
            histories,
        },
        warnings,
    })
}

fn normalize_meta(meta: Option<&Value>) -> Result<JsonMap, NormalizeError> {
    let empty = JsonMap::new();
    let meta = match meta {
        None | Some(Value::Null) => &empty,
        Some(value) => require_object(value, "/meta", "meta")?,
    };
    match meta.get("version").and_then(Value::as_u64) {
        Some(version) if version == SUPPORTED_META_VERSION => Ok(meta.clone()),
        Some(version) => Err(NormalizeError::new(
            ErrorKind::MetaVersionUnsupported,
            format!("meta.version {version} is not supported (expected {SUPPORTED_META_VERSION})"),
            "/meta/version",
        )),
        None => Err(NormalizeError::new(
            ErrorKind::MetaVersionUnsupported,
            format!("meta.version must be the integer {SUPPORTED_META_VERSION}"),
            "/meta/version",
        )),
    }
}

fn normalize_providers(
    providers: Option<&Value>,
) -> Result<FxHashMap<String, ProviderIr>, NormalizeError> {
    let entries = optional_array(providers, "/providers", "providers")?;
    let mut normalized = FxHashMap::default();
    for (idx, raw) in entries.iter().enumerate() {
        let pointer = format!("/providers/{idx}");
        let entry = require_object(raw, &pointer, "provider entry")?;
        let id = require_id(entry, &pointer)?;
        let type_name = require_str(entry, "type", &pointer)?;
        if normalized.contains_key(&id) {
            return Err(NormalizeError::new(
                ErrorKind::ProviderDup,
                format!("duplicate provider id '{id}'"),
                format!("{pointer}/id"),
            ));
        }
        normalized.insert(
            id.clone(),
            ProviderIr {
                id,
                type_name,
                config: optional_object(entry.get("config")),
            },
        );
    }
    Ok(normalized)
}

fn normalize_runtime(
    runtime: Option<&Value>,
    providers: &FxHashMap<String, ProviderIr>,
) -> Result<(RuntimeIr, Option<String>), NormalizeError> {
    let empty = JsonMap::new();
    let runtime = match runtime {
        None | Some(Value::Null) => &empty,
        Some(value) => require_object(value, "/runtime", "runtime")?,
    };
    let engine = match runtime.get("engine").and_then(Value::as_str) {
        Some(engine) => engine.to_string(),
        None => {
            return Err(NormalizeError::new(
                ErrorKind::DocShape,
                "runtime.engine must be a string",
                "/runtime/engine",
            ))
        }
    };
    let graph_name = runtime
        .get("graph_name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let defaults = optional_object(runtime.get("defaults"));
    let default_provider = defaults
        .get("provider")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(provider) = &default_provider {
        if !providers.contains_key(provider) {
            return Err(NormalizeError::new(
                ErrorKind::ComponentProviderNotFound,
                format!("default provider '{provider}' is not defined"),
                "/runtime/defaults/provider",
            ));
        }
    }
    Ok((
        RuntimeIr {
            engine,
            graph_name,
            defaults,
            default_provider: default_provider.clone(),
        },
        default_provider,
    ))
}

fn normalize_tools(
    tools: Option<&Value>,
    providers: &FxHashMap<String, ProviderIr>,
) -> Result<FxHashMap<String, ToolIr>, NormalizeError> {
    let entries = optional_array(tools, "/tools", "tools")?;
    let mut normalized = FxHashMap::default();
    for (idx, raw) in entries.iter().enumerate() {
        let pointer = format!("/tools/{idx}");
        let entry = require_object(raw, &pointer, "tool entry")?;
        let id = require_id(entry, &pointer)?;
        let type_name = require_str(entry, "type", &pointer)?;
        let provider = entry
            .get("provider")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(provider) = &provider {
            if !providers.contains_key(provider) {
                return Err(NormalizeError::new(
                    ErrorKind::ComponentProviderNotFound,
                    format!("tool '{id}' references undefined provider '{provider}'"),
                    format!("{pointer}/provider"),
                ));
            }
        }
        if normalized.contains_key(&id) {
            return Err(NormalizeError::new(
                ErrorKind::ToolDup,
                format!("duplicate tool id '{id}'"),
                format!("{pointer}/id"),
            ));
        }
        normalized.insert(
            id.clone(),
            ToolIr {
                id,
                type_name,
                provider,
                config: optional_object(entry.get("config")),
            },
        );
    }
    Ok(normalized)
}

fn normalize_components(
    components: Option<&Value>,
    providers: &FxHashMap<String, ProviderIr>,
    tools: &FxHashMap<String, ToolIr>,
    default_provider: Option<&str>,
    warnings: &mut Vec<NormalizationWarning>,
) -> Result<FxHashMap<String, ComponentIr>, NormalizeError> {
    let entries = optional_array(components, "/components", "components")?;
    let mut normalized = FxHashMap::default();
    for (idx, raw) in entries.iter().enumerate() {
        let pointer = format!("/components/{idx}");
        let entry = require_object(raw, &pointer, "component entry")?;
        let id = require_id(entry, &pointer)?;
        let type_name = require_str(entry, "type", &pointer)?;
        let provider = entry
            .get("provider")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| default_provider.map(str::to_string));
        if let Some(provider) = &provider {
            if !providers.contains_key(provider) {
                return Err(NormalizeError::new(
                    ErrorKind::ComponentProviderNotFound,
                    format!("component '{id}' references undefined provider '{provider}'"),
                    format!("{pointer}/provider"),
                ));
            }
        } else {
            warnings.push(NormalizationWarning::new(
                "WARN_COMPONENT_PROVIDER_UNSET",
                "component has no provider and no runtime default is set",
                pointer.clone(),
            ));
        }
        let tool = entry
            .get("tool")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(tool) = &tool {
            if !tools.contains_key(tool) {
                return Err(NormalizeError::new(
                    ErrorKind::ComponentToolNotFound,
                    format!("component '{id}' references undefined tool '{tool}'"),
                    format!("{pointer}/tool"),
                ));
            }
        }
        let inputs = match entry.get("inputs") {
            Some(Value::Object(map)) => map.clone(),
            _ => {
                warnings.push(NormalizationWarning::new(
                    "WARN_COMPONENT_INPUTS_DEFAULTED",
                    "component inputs missing; defaulting to an empty mapping",
                    pointer.clone(),
                ));
                JsonMap::new()
            }
        };
        let outputs = match entry.get("outputs") {
            Some(Value::Object(map)) => map.clone(),
            _ => {
                warnings.push(NormalizationWarning::new(
                    "WARN_COMPONENT_OUTPUTS_DEFAULTED",
                    "component outputs missing; defaulting to an empty mapping",
                    pointer.clone(),
                ));
                JsonMap::new()
            }
        };
        if normalized.contains_key(&id) {
            return Err(NormalizeError::new(
                ErrorKind::ComponentDup,
                format!("duplicate component id '{id}'"),
                format!("{pointer}/id"),
            ));
        }
        normalized.insert(
            id.clone(),
            ComponentIr {
                id,
                type_name,
                provider,
                tool,
                inputs,
                outputs,
                config: optional_object(entry.get("config")),
                defaults: optional_object(entry.get("defaults")),
            },
        );
    }
    Ok(normalized)
}

fn normalize_graph(
    graph: &JsonMap,
    components: &FxHashMap<String, ComponentIr>,
    warnings: &mut Vec<NormalizationWarning>,
) -> Result<GraphIr, NormalizeError> {
    let entry = graph
        .get("entry")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            NormalizeError::new(
                ErrorKind::GraphEntryNotFound,
                "graph.entry must reference a node id",
                "/graph/entry",
            )
        })?;

    let raw_nodes = match graph.get("nodes") {
        Some(Value::Array(nodes)) if !nodes.is_empty() => nodes,
        _ => {
            return Err(NormalizeError::new(
                ErrorKind::DocShape,
                "graph.nodes must be a non-empty list",
                "/graph/nodes",
            ))
        }
    };

    let mut nodes: FxHashMap<String, NodeIr> = FxHashMap::default();
    for (idx, raw) in raw_nodes.iter().enumerate() {
        let pointer = format!("/graph/nodes/{idx}");
        let entry_map = require_object(raw, &pointer, "graph node")?;
        let id = require_id(entry_map, &pointer)?;
        if nodes.contains_key(&id) {
            return Err(NormalizeError::new(
                ErrorKind::NodeDup,
                format!("duplicate node id '{id}'"),
                format!("{pointer}/id"),
            ));
        }
        if !is_snake_case(&id) {
            warnings.push(NormalizationWarning::new(
                "WARN_NODE_NAMING",
                format!("node id '{id}' is not snake_case; consider renaming"),
                format!("{pointer}/id"),
            ));
        }
        let kind_tag = entry_map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("component");
        let kind = NodeKind::parse(kind_tag).ok_or_else(|| {
            NormalizeError::new(
                ErrorKind::NodeType,
                format!("node '{id}' has unsupported kind '{kind_tag}'"),
                format!("{pointer}/type"),
            )
        })?;
        let component = entry_map
            .get("component")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(component) = &component {
            if !components.contains_key(component) {
                return Err(NormalizeError::new(
                    ErrorKind::NodeComponentNotFound,
                    format!("node '{id}' references undefined component '{component}'"),
                    format!("{pointer}/component"),
                ));
            }
        }
        let next = normalize_next(kind, entry_map.get("next"), &id, &pointer)?;
        nodes.insert(
            id.clone(),
            NodeIr {
                id,
                kind,
                component,
                inputs: optional_object(entry_map.get("inputs")),
                outputs: optional_object(entry_map.get("outputs")),
                config: optional_object(entry_map.get("config")),
                next,
                pointer,
            },
        );
    }

    if !nodes.contains_key(&entry) {
        return Err(NormalizeError::new(
            ErrorKind::GraphEntryNotFound,
            format!("graph entry '{entry}' does not match any defined node"),
            "/graph/entry",
        ));
    }

    for node in nodes.values() {
        for target in node.next.targets() {
            if !nodes.contains_key(target) {
                return Err(NormalizeError::new(
                    ErrorKind::EdgeEndpointInvalid,
                    format!("node '{}' references undefined target '{target}'", node.id),
                    format!("{}/next", node.pointer),
                ));
            }
        }
    }

    let outputs = normalize_graph_outputs(graph.get("outputs"), &nodes)?;
    warn_unreachable(&entry, &nodes, warnings);

    Ok(GraphIr {
        entry,
        nodes,
        outputs,
    })
}

fn normalize_next(
    kind: NodeKind,
    next: Option<&Value>,
    node_id: &str,
    pointer: &str,
) -> Result<NextIr, NormalizeError> {
    let next_pointer = format!("{pointer}/next");
    match kind {
        NodeKind::Router => match next {
            Some(Value::Object(routes)) => {
                let mut parsed = FxHashMap::default();
                for (route, target) in routes {
                    let Some(target) = target.as_str() else {
                        return Err(NormalizeError::new(
                            ErrorKind::DocShape,
                            format!("route '{route}' of router '{node_id}' must map to a node id"),
                            next_pointer,
                        ));
                    };
                    parsed.insert(route.clone(), target.to_string());
                }
                Ok(NextIr::Routes(parsed))
            }
            _ => Err(NormalizeError::new(
                ErrorKind::DocShape,
                format!("router node '{node_id}' requires a route mapping in next"),
                next_pointer,
            )),
        },
        NodeKind::Parallel => match next {
            Some(Value::Array(items)) => {
                let mut targets: Vec<String> = Vec::with_capacity(items.len());
                for item in items {
                    let Some(target) = item.as_str() else {
                        return Err(NormalizeError::new(
                            ErrorKind::DocShape,
                            format!("parallel node '{node_id}' next entries must be node ids"),
                            next_pointer,
                        ));
                    };
                    if !targets.iter().any(|t| t == target) {
                        targets.push(target.to_string());
                    }
                }
                Ok(NextIr::Fanout(targets))
            }
            _ => Err(NormalizeError::new(
                ErrorKind::DocShape,
                format!("parallel node '{node_id}' requires a list of successors in next"),
                next_pointer,
            )),
        },
        _ => match next {
            None | Some(Value::Null) => Ok(NextIr::None),
            Some(Value::String(target)) => Ok(NextIr::Single(target.clone())),
            Some(_) => Err(NormalizeError::new(
                ErrorKind::DocShape,
                format!("node '{node_id}' accepts a single successor or none in next"),
                next_pointer,
            )),
        },
    }
}

fn normalize_graph_outputs(
    outputs: Option<&Value>,
    nodes: &FxHashMap<String, NodeIr>,
) -> Result<Vec<GraphOutputIr>, NormalizeError> {
    let entries = optional_array(outputs, "/graph/outputs", "graph.outputs")?;
    let mut normalized = Vec::with_capacity(entries.len());
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for (idx, raw) in entries.iter().enumerate() {
        let pointer = format!("/graph/outputs/{idx}");
        let entry = require_object(raw, &pointer, "graph output")?;
        let key = require_str(entry, "key", &pointer)?;
        let node_id = require_str(entry, "node", &pointer)?;
        let output = require_str(entry, "output", &pointer)?;
        if !nodes.contains_key(&node_id) {
            return Err(NormalizeError::new(
                ErrorKind::EdgeEndpointInvalid,
                format!("graph output '{key}' references undefined node '{node_id}'"),
                format!("{pointer}/node"),
            ));
        }
        if !seen.insert(key.clone()) {
            return Err(NormalizeError::new(
                ErrorKind::OutputKeyCollision,
                format!("duplicate graph output key '{key}'"),
                format!("{pointer}/key"),
            ));
        }
        normalized.push(GraphOutputIr {
            key,
            node_id,
            output,
        });
    }
    Ok(normalized)
}

fn warn_unreachable(
    entry: &str,
    nodes: &FxHashMap<String, NodeIr>,
    warnings: &mut Vec<NormalizationWarning>,
) {
    let mut reachable: FxHashSet<&str> = FxHashSet::default();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(entry);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(node) = nodes.get(id) {
            for target in node.next.targets() {
                if !reachable.contains(target) {
                    queue.push_back(target);
                }
            }
            // Map bodies run through the map driver, not an edge.
            if node.kind == NodeKind::Map {
                if let Some(body) = node.config.get("body").and_then(Value::as_str) {
                    if !reachable.contains(body) {
                        queue.push_back(body);
                    }
                }
            }
        }
    }
    for node in nodes.values() {
        if !reachable.contains(node.id.as_str()) {
            warnings.push(NormalizationWarning::new(
                "WARN_GRAPH_NODE_UNREACHABLE",
                format!("node '{}' is not reachable from entry '{entry}'", node.id),
                node.pointer.clone(),
            ));
        }
    }
}

fn normalize_policies(policies: Option<&Value>) -> Result<PoliciesIr, NormalizeError> {
    let policies = match policies {
        None | Some(Value::Null) => return Ok(PoliciesIr::default()),
        Some(value) => require_object(value, "/policies", "policies")?,
    };
    Ok(PoliciesIr {
        retry: normalize_retry(policies.get("retry"))?,
        rate_limit: normalize_rate_limit(policies.get("rate_limit"))?,
        masking: normalize_masking(policies.get("masking"))?,
        permissions: normalize_permissions(policies.get("permissions"))?,
        cost: normalize_cost(policies.get("cost"))?,
    })
}

fn normalize_retry(retry: Option<&Value>) -> Result<RetryPoliciesIr, NormalizeError> {
    let retry = match retry {
        None | Some(Value::Null) => return Ok(RetryPoliciesIr::default()),
        Some(value) => require_object(value, "/policies/retry", "policies.retry")?,
    };
    let default = match retry.get("default") {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_retry_policy(value, "/policies/retry/default")?),
    };
    let mut overrides = FxHashMap::default();
    if let Some(raw) = retry.get("overrides") {
        let entries = optional_array(Some(raw), "/policies/retry/overrides", "retry overrides")?;
        for (idx, raw) in entries.iter().enumerate() {
            let pointer = format!("/policies/retry/overrides/{idx}");
            let entry = require_object(raw, &pointer, "retry override")?;
            let Some(target) = entry.get("target").and_then(Value::as_str) else {
                return Err(NormalizeError::new(
                    ErrorKind::RetryPredicate,
                    "retry override requires a target identifier",
                    format!("{pointer}/target"),
                ));
            };
            overrides.insert(target.to_string(), parse_retry_policy(raw, &pointer)?);
        }
    }
    Ok(RetryPoliciesIr { default, overrides })
}

fn parse_retry_policy(raw: &Value, pointer: &str) -> Result<RetryPolicyIr, NormalizeError> {
    let entry = require_object(raw, pointer, "retry policy")?;
    let strategy_tag = entry
        .get("strategy")
        .and_then(Value::as_str)
        .unwrap_or("fixed");
    let strategy = match strategy_tag {
        "fixed" => RetryStrategy::Fixed,
        "exponential" => RetryStrategy::Exponential,
        "jitter" => RetryStrategy::Jitter,
        other => {
            return Err(NormalizeError::new(
                ErrorKind::RetryPredicate,
                format!("unsupported retry strategy '{other}'"),
                format!("{pointer}/strategy"),
            ))
        }
    };
    let max_attempts = entry
        .get("max_attempts")
        .map_or(Some(1), Value::as_u64)
        .filter(|n| *n >= 1)
        .ok_or_else(|| {
            NormalizeError::new(
                ErrorKind::RetryPredicate,
                "max_attempts must be an integer >= 1",
                format!("{pointer}/max_attempts"),
            )
        })?;
    let interval = non_negative_f64(entry.get("interval"), 0.0).ok_or_else(|| {
        NormalizeError::new(
            ErrorKind::RetryPredicate,
            "interval must be a number >= 0",
            format!("{pointer}/interval"),
        )
    })?;
    let jitter = non_negative_f64(entry.get("jitter"), 0.0).ok_or_else(|| {
        NormalizeError::new(
            ErrorKind::RetryPredicate,
            "jitter must be a number >= 0",
            format!("{pointer}/jitter"),
        )
    })?;
    Ok(RetryPolicyIr {
        strategy,
        max_attempts: max_attempts as u32,
        interval,
        jitter,
    })
}

fn normalize_rate_limit(rate_limit: Option<&Value>) -> Result<RateLimitPoliciesIr, NormalizeError> {
    let rate_limit = match rate_limit {
        None | Some(Value::Null) => return Ok(RateLimitPoliciesIr::default()),
        Some(value) => require_object(value, "/policies/rate_limit", "policies.rate_limit")?,
    };
    let providers = parse_rate_rules(rate_limit.get("providers"), "/policies/rate_limit/providers")?;
    let nodes = parse_rate_rules(rate_limit.get("nodes"), "/policies/rate_limit/nodes")?;
    let mut shared_providers = FxHashMap::default();
    if let Some(raw) = rate_limit.get("shared_providers") {
        let shared = require_object(raw, "/policies/rate_limit/shared_providers", "shared_providers")?;
        for (provider, alias) in shared {
            let Some(alias) = alias.as_str() else {
                return Err(NormalizeError::new(
                    ErrorKind::RlPolicyParam,
                    "shared_providers must map provider ids to alias strings",
                    "/policies/rate_limit/shared_providers",
                ));
            };
            shared_providers.insert(provider.clone(), alias.to_string());
        }
    }
    Ok(RateLimitPoliciesIr {
        providers,
        nodes,
        shared_providers,
    })
}

fn parse_rate_rules(
    rules: Option<&Value>,
    pointer: &str,
) -> Result<Vec<RateLimitRuleIr>, NormalizeError> {
    let entries = optional_array(rules, pointer, "rate limit rules")?;
    let mut parsed = Vec::with_capacity(entries.len());
    for (idx, raw) in entries.iter().enumerate() {
        let entry_pointer = format!("{pointer}/{idx}");
        let entry = require_object(raw, &entry_pointer, "rate limit entry")?;
        let Some(target) = entry.get("target").and_then(Value::as_str) else {
            return Err(NormalizeError::new(
                ErrorKind::RlPolicyParam,
                "rate limit entry missing target",
                format!("{entry_pointer}/target"),
            ));
        };
        let algo_tag = entry
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("token_bucket");
        let algorithm = match algo_tag {
            "token_bucket" => {
                let capacity = entry
                    .get("capacity")
                    .map_or(Some(1), Value::as_u64)
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| {
                        NormalizeError::new(
                            ErrorKind::RlPolicyParam,
                            "token bucket capacity must be an integer >= 1",
                            format!("{entry_pointer}/capacity"),
                        )
                    })?;
                let refill_rate = non_negative_f64(entry.get("refill_rate"), 1.0).ok_or_else(
                    || {
                        NormalizeError::new(
                            ErrorKind::RlPolicyParam,
                            "token bucket refill_rate must be a number >= 0",
                            format!("{entry_pointer}/refill_rate"),
                        )
                    },
                )?;
                RateLimitAlgorithm::TokenBucket {
                    capacity: capacity as u32,
                    refill_rate,
                }
            }
            "fixed_window" => {
                let limit = entry
                    .get("limit")
                    .map_or(Some(1), Value::as_u64)
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| {
                        NormalizeError::new(
                            ErrorKind::RlPolicyParam,
                            "fixed window limit must be an integer >= 1",
                            format!("{entry_pointer}/limit"),
                        )
                    })?;
                let window = non_negative_f64(entry.get("window"), 1.0)
                    .filter(|w| *w > 0.0)
                    .ok_or_else(|| {
                        NormalizeError::new(
                            ErrorKind::RlPolicyParam,
                            "fixed window seconds must be a number > 0",
                            format!("{entry_pointer}/window"),
                        )
                    })?;
                RateLimitAlgorithm::FixedWindow {
                    limit: limit as u32,
                    window,
                }
            }
            other => {
                return Err(NormalizeError::new(
                    ErrorKind::RlPolicyParam,
                    format!("unsupported rate limit type '{other}'"),
                    format!("{entry_pointer}/type"),
                ))
            }
        };
        parsed.push(RateLimitRuleIr {
            target: target.to_string(),
            algorithm,
        });
    }
    Ok(parsed)
}

fn normalize_masking(masking: Option<&Value>) -> Result<MaskingIr, NormalizeError> {
    let masking = match masking {
        None | Some(Value::Null) => return Ok(MaskingIr::default()),
        Some(value) => require_object(value, "/policies/masking", "policies.masking")?,
    };
    let fields = string_list(masking.get("fields"), "/policies/masking/fields")?;
    let diff_fields = string_list(masking.get("diff_fields"), "/policies/masking/diff_fields")?;
    let mask_value = masking
        .get("mask_value")
        .and_then(Value::as_str)
        .unwrap_or("***")
        .to_string();
    Ok(MaskingIr {
        fields,
        diff_fields,
        mask_value,
    })
}

fn normalize_permissions(permissions: Option<&Value>) -> Result<PermissionsIr, NormalizeError> {
    let permissions = match permissions {
        None | Some(Value::Null) => return Ok(PermissionsIr::default()),
        Some(value) => require_object(value, "/policies/permissions", "policies.permissions")?,
    };
    let default_allow = string_list(
        permissions.get("default_allow"),
        "/policies/permissions/default_allow",
    )?;
    let mut allow = FxHashMap::default();
    if let Some(raw) = permissions.get("allow") {
        let allow_map = require_object(raw, "/policies/permissions/allow", "permissions.allow")?;
        for (target, values) in allow_map {
            let pointer = format!("/policies/permissions/allow/{target}");
            allow.insert(target.clone(), string_list(Some(values), &pointer)?);
        }
    }
    Ok(PermissionsIr {
        default_allow,
        allow,
    })
}

fn normalize_cost(cost: Option<&Value>) -> Result<CostIr, NormalizeError> {
    let cost = match cost {
        None | Some(Value::Null) => return Ok(CostIr::default()),
        Some(value) => require_object(value, "/policies/cost", "policies.cost")?,
    };
    let per_run_tokens = match cost.get("per_run_tokens") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().ok_or_else(|| {
            NormalizeError::new(
                ErrorKind::DocShape,
                "per_run_tokens must be a non-negative integer",
                "/policies/cost/per_run_tokens",
            )
        })?),
    };
    Ok(CostIr { per_run_tokens })
}

fn normalize_histories(
    histories: Option<&Value>,
) -> Result<FxHashMap<String, HistoryIr>, NormalizeError> {
    let entries = optional_array(histories, "/histories", "histories")?;
    let mut normalized = FxHashMap::default();
    for (idx, raw) in entries.iter().enumerate() {
        let pointer = format!("/histories/{idx}");
        let entry = require_object(raw, &pointer, "history entry")?;
        let id = require_id(entry, &pointer)?;
        if normalized.contains_key(&id) {
            return Err(NormalizeError::new(
                ErrorKind::HistoryDup,
                format!("duplicate history id '{id}'"),
                format!("{pointer}/id"),
            ));
        }
        let backend = match entry.get("backend") {
            None | Some(Value::Null) => {
                let mut backend = JsonMap::new();
                backend.insert("type".to_string(), Value::String("memory".to_string()));
                backend
            }
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(NormalizeError::new(
                    ErrorKind::DocShape,
                    "history backend must be a mapping",
                    format!("{pointer}/backend"),
                ))
            }
        };
        let system_message = entry
            .get("system_message")
            .and_then(Value::as_str)
            .map(str::to_string);
        normalized.insert(
            id.clone(),
            HistoryIr {
                id,
                backend,
                system_message,
            },
        );
    }
    Ok(normalized)
}

/// Translate the deprecated inline `graph.history` block into a synthesized
/// history record with id `default`. An explicit `histories` entry with the
/// same id wins over the legacy block.
fn merge_legacy_history(
    graph: &JsonMap,
    histories: &mut FxHashMap<String, HistoryIr>,
    warnings: &mut Vec<NormalizationWarning>,
) {
    let Some(Value::Object(legacy)) = graph.get("history") else {
        return;
    };
    warnings.push(NormalizationWarning::new(
        "WARN_GRAPH_HISTORY_DEPRECATED",
        "graph.history is deprecated; declare a top-level histories entry instead",
        "/graph/history",
    ));
    if !legacy.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
        return;
    }
    if histories.contains_key("default") {
        warnings.push(NormalizationWarning::new(
            "WARN_GRAPH_HISTORY_SHADOWED",
            "histories entry 'default' overrides the deprecated graph.history block",
            "/graph/history",
        ));
        return;
    }
    let mut backend = JsonMap::new();
    backend.insert("type".to_string(), Value::String("memory".to_string()));
    if let Some(max_turns) = legacy.get("max_turns").and_then(Value::as_u64) {
        backend.insert("max_turns".to_string(), Value::from(max_turns));
    }
    histories.insert(
        "default".to_string(),
        HistoryIr {
            id: "default".to_string(),
            backend,
            system_message: legacy
                .get("system_message")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    );
}

fn require_object<'a>(
    value: &'a Value,
    pointer: &str,
    what: &str,
) -> Result<&'a JsonMap, NormalizeError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(NormalizeError::new(
            ErrorKind::DocShape,
            format!("{what} must be a mapping"),
            pointer,
        )),
    }
}

fn optional_array<'a>(
    value: Option<&'a Value>,
    pointer: &str,
    what: &str,
) -> Result<&'a [Value], NormalizeError> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(NormalizeError::new(
            ErrorKind::DocShape,
            format!("{what} must be a list"),
            pointer,
        )),
    }
}

fn optional_object(value: Option<&Value>) -> JsonMap {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => JsonMap::new(),
    }
}

fn require_id(entry: &JsonMap, pointer: &str) -> Result<String, NormalizeError> {
    entry
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            NormalizeError::new(
                ErrorKind::DocShape,
                "id must be a string",
                format!("{pointer}/id"),
            )
        })
}

fn require_str(entry: &JsonMap, field: &str, pointer: &str) -> Result<String, NormalizeError> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            NormalizeError::new(
                ErrorKind::DocShape,
                format!("{field} must be a string"),
                format!("{pointer}/{field}"),
            )
        })
}

fn string_list(value: Option<&Value>, pointer: &str) -> Result<Vec<String>, NormalizeError> {
    let entries = optional_array(value, pointer, "field")?;
    let mut parsed = Vec::with_capacity(entries.len());
    for item in entries {
        let Some(item) = item.as_str() else {
            return Err(NormalizeError::new(
                ErrorKind::DocShape,
                "expected a list of strings",
                pointer,
            ));
        };
        parsed.push(item.to_string());
    }
    Ok(parsed)
}

fn non_negative_f64(value: Option<&Value>, default: f64) -> Option<f64> {
    match value {
        None | Some(Value::Null) => Some(default),
        Some(value) => value.as_f64().filter(|n| *n >= 0.0 && n.is_finite()),
    }
}

fn is_snake_case(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
