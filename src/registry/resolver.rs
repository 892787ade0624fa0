//! Resolves provider/tool/component/history declarations into live instances.
//!
//! The host supplies factories keyed by each record's `type`; the registry
//! invokes them lazily and memoizes per id, so an instance is built exactly
//! once no matter how many nodes share it. Providers materialize into opaque
//! handles the core never inspects; tools and components must come back as
//! [`Materialized::Callable`]; a factory that yields anything else fails
//! with `SIGNATURE_MISMATCH`, the typed equivalent of handing the runtime a
//! function with the wrong shape.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

use crate::component::{Component, NodeError};
use crate::errors::{ErrorKind, ResolveError};
use crate::ir::model::{ComponentIr, HistoryIr, ProviderIr, ToolIr, WorkflowIr};
use crate::runtimes::history::{HistoryBackend, InMemoryHistoryBackend};
use crate::utils::collections::JsonMap;

/// Opaque materialized provider handle.
pub type ProviderInstance = Arc<dyn Any + Send + Sync>;

/// What a factory may hand back.
pub enum Materialized {
    /// An opaque handle (providers).
    Opaque(ProviderInstance),
    /// A `(state, inputs, ctx)` callable (tools, components).
    Callable(Arc<dyn Component>),
}

impl Materialized {
    /// Wrap a component instance. Convenience for factory closures.
    pub fn callable(component: impl Component + 'static) -> Self {
        Materialized::Callable(Arc::new(component))
    }

    /// Wrap an opaque handle. Convenience for provider-shaped values.
    pub fn opaque(handle: impl Any + Send + Sync) -> Self {
        Materialized::Opaque(Arc::new(handle))
    }
}

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderIr) -> Result<ProviderInstance, NodeError> + Send + Sync>;
pub type ToolFactory =
    Arc<dyn Fn(&ToolIr, Option<ProviderInstance>) -> Result<Materialized, NodeError> + Send + Sync>;
pub type ComponentFactory = Arc<
    dyn Fn(
            &ComponentIr,
            Option<ProviderInstance>,
            Option<Arc<dyn Component>>,
        ) -> Result<Materialized, NodeError>
        + Send
        + Sync,
>;
pub type HistoryFactory =
    Arc<dyn Fn(&HistoryIr) -> Result<Arc<dyn HistoryBackend>, NodeError> + Send + Sync>;

/// Host-supplied factories keyed by record `type`.
#[derive(Clone, Default)]
pub struct FactorySet {
    providers: FxHashMap<String, ProviderFactory>,
    tools: FxHashMap<String, ToolFactory>,
    components: FxHashMap<String, ComponentFactory>,
    histories: FxHashMap<String, HistoryFactory>,
}

impl FactorySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn provider<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ProviderIr) -> Result<ProviderInstance, NodeError> + Send + Sync + 'static,
    {
        self.providers.insert(type_name.into(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn tool<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ToolIr, Option<ProviderInstance>) -> Result<Materialized, NodeError>
            + Send
            + Sync
            + 'static,
    {
        self.tools.insert(type_name.into(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn component<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(
                &ComponentIr,
                Option<ProviderInstance>,
                Option<Arc<dyn Component>>,
            ) -> Result<Materialized, NodeError>
            + Send
            + Sync
            + 'static,
    {
        self.components.insert(type_name.into(), Arc::new(factory));
        self
    }

    #[must_use]
    pub fn history<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&HistoryIr) -> Result<Arc<dyn HistoryBackend>, NodeError> + Send + Sync + 'static,
    {
        self.histories.insert(type_name.into(), Arc::new(factory));
        self
    }
}

#[derive(Default)]
struct Caches {
    providers: FxHashMap<String, ProviderInstance>,
    tools: FxHashMap<String, Arc<dyn Component>>,
    components: FxHashMap<String, Arc<dyn Component>>,
}

/// Materializes IR records through the factory set, lazily and memoized.
pub struct Registry {
    factories: FactorySet,
    caches: Mutex<Caches>,
}

impl Registry {
    #[must_use]
    pub fn new(factories: FactorySet) -> Self {
        Self {
            factories,
            caches: Mutex::new(Caches::default()),
        }
    }

    pub fn provider(
        &self,
        workflow: &WorkflowIr,
        id: &str,
    ) -> Result<ProviderInstance, ResolveError> {
        if let Some(instance) = self.caches.lock().providers.get(id) {
            return Ok(Arc::clone(instance));
        }
        let pointer = format!("/providers/{id}");
        let record = workflow.providers.get(id).ok_or_else(|| {
            ResolveError::new(
                ErrorKind::ToolImport,
                format!("provider '{id}' is not declared"),
                pointer.clone(),
            )
        })?;
        let factory = self.factories.providers.get(&record.type_name).ok_or_else(|| {
            ResolveError::new(
                ErrorKind::ToolImport,
                format!("no factory registered for provider type '{}'", record.type_name),
                pointer.clone(),
            )
        })?;
        let instance = factory(record).map_err(|err| {
            ResolveError::new(
                ErrorKind::ToolImport,
                format!("provider factory for '{id}' failed: {err}"),
                pointer,
            )
        })?;
        self.caches
            .lock()
            .providers
            .insert(id.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    pub fn tool(
        &self,
        workflow: &WorkflowIr,
        id: &str,
    ) -> Result<Arc<dyn Component>, ResolveError> {
        if let Some(instance) = self.caches.lock().tools.get(id) {
            return Ok(Arc::clone(instance));
        }
        let pointer = format!("/tools/{id}");
        let record = workflow.tools.get(id).ok_or_else(|| {
            ResolveError::new(
                ErrorKind::ToolImport,
                format!("tool '{id}' is not declared"),
                pointer.clone(),
            )
        })?;
        permissions_from_config(&record.config).map_err(|message| {
            ResolveError::new(ErrorKind::PermType, message, format!("{pointer}/config"))
        })?;
        let factory = self.factories.tools.get(&record.type_name).ok_or_else(|| {
            ResolveError::new(
                ErrorKind::ToolImport,
                format!("no factory registered for tool type '{}'", record.type_name),
                pointer.clone(),
            )
        })?;
        let provider = record
            .provider
            .as_deref()
            .map(|provider| self.provider(workflow, provider))
            .transpose()?;
        let instance = match factory(record, provider).map_err(|err| {
            ResolveError::new(
                ErrorKind::ToolImport,
                format!("tool factory for '{id}' failed: {err}"),
                pointer.clone(),
            )
        })? {
            Materialized::Callable(callable) => callable,
            Materialized::Opaque(_) => {
                return Err(ResolveError::new(
                    ErrorKind::SignatureMismatch,
                    format!("tool '{id}' did not materialize into a (state, inputs, ctx) callable"),
                    pointer,
                ))
            }
        };
        self.caches
            .lock()
            .tools
            .insert(id.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    pub fn component(
        &self,
        workflow: &WorkflowIr,
        id: &str,
    ) -> Result<Arc<dyn Component>, ResolveError> {
        if let Some(instance) = self.caches.lock().components.get(id) {
            return Ok(Arc::clone(instance));
        }
        let pointer = format!("/components/{id}");
        let record = workflow.components.get(id).ok_or_else(|| {
            ResolveError::new(
                ErrorKind::ComponentImport,
                format!("component '{id}' is not declared"),
                pointer.clone(),
            )
        })?;
        let factory = self
            .factories
            .components
            .get(&record.type_name)
            .ok_or_else(|| {
                ResolveError::new(
                    ErrorKind::ComponentImport,
                    format!(
                        "no factory registered for component type '{}'",
                        record.type_name
                    ),
                    pointer.clone(),
                )
            })?;
        let provider = record
            .provider
            .as_deref()
            .map(|provider| self.provider(workflow, provider))
            .transpose()?;
        let tool = record
            .tool
            .as_deref()
            .map(|tool| self.tool(workflow, tool))
            .transpose()?;
        let instance = match factory(record, provider, tool).map_err(|err| {
            ResolveError::new(
                ErrorKind::ComponentImport,
                format!("component factory for '{id}' failed: {err}"),
                pointer.clone(),
            )
        })? {
            Materialized::Callable(callable) => callable,
            Materialized::Opaque(_) => {
                return Err(ResolveError::new(
                    ErrorKind::SignatureMismatch,
                    format!(
                        "component '{id}' did not materialize into a (state, inputs, ctx) callable"
                    ),
                    pointer,
                ))
            }
        };
        self.caches
            .lock()
            .components
            .insert(id.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Build a history backend. `memory` ships with the crate; any other
    /// type goes through the host's history factories.
    pub fn history(&self, record: &HistoryIr) -> Result<Arc<dyn HistoryBackend>, ResolveError> {
        let pointer = format!("/histories/{}", record.id);
        let type_name = record
            .backend
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("memory");
        if type_name == "memory" {
            let max_turns = record
                .backend
                .get("max_turns")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            return Ok(Arc::new(InMemoryHistoryBackend::new(max_turns)));
        }
        let factory = self.factories.histories.get(type_name).ok_or_else(|| {
            ResolveError::new(
                ErrorKind::ComponentImport,
                format!("no factory registered for history backend type '{type_name}'"),
                pointer.clone(),
            )
        })?;
        factory(record).map_err(|err| {
            ResolveError::new(
                ErrorKind::ComponentImport,
                format!("history factory for '{}' failed: {err}", record.id),
                pointer,
            )
        })
    }

    /// Every component and tool materialized so far, for teardown.
    #[must_use]
    pub fn materialized_callables(&self) -> Vec<(String, Arc<dyn Component>)> {
        let caches = self.caches.lock();
        caches
            .components
            .iter()
            .chain(caches.tools.iter())
            .map(|(id, instance)| (id.clone(), Arc::clone(instance)))
            .collect()
    }
}

/// Validate the declared `requires_permissions` config value: absent, or a
/// list of strings. Returns the parsed list.
pub(crate) fn permissions_from_config(config: &JsonMap) -> Result<Vec<String>, String> {
    match config.get("requires_permissions") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            let mut parsed = Vec::with_capacity(items.len());
            for item in items {
                let Some(item) = item.as_str() else {
                    return Err("requires_permissions entries must be strings".to_string());
                };
                parsed.push(item.to_string());
            }
            Ok(parsed)
        }
        Some(_) => Err("requires_permissions must be a list of strings".to_string()),
    }
}
