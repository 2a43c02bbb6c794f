//! Instance Registry and Selection
//!
//! Components (controllers and providers) are registered explicitly at
//! startup with a lifetime [`Scope`] and the names of the components they
//! depend on. [`InstanceSelector::select`] computes the [`InstanceSet`]
//! that receives lifecycle hooks, fresh on every call.
//!
//! # Eligibility
//!
//! An entry is selected when
//! - it holds a constructed component (placeholders are skipped), and
//! - its dependency tree is static: neither it nor any transitive
//!   dependency is request-scoped, and every dependency is registered.
//!
//! Ineligible entries are filtered out silently.
//!
//! # Thread Safety
//!
//! The live set sits behind `Arc<RwLock<>>`; clones of the registry share
//! it. Selection takes one read-locked snapshot.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::hooks::{OnIpcDisconnect, OnIpcInit};

/// A component that may implement lifecycle hooks
///
/// Hook capabilities are declared by overriding the accessors, and are
/// resolved once when the component is registered.
///
/// ```
/// # use std::sync::Arc;
/// # use async_trait::async_trait;
/// # use relay_core::{Component, HookResult, OnIpcInit, ServerChannel};
/// struct Cache;
///
/// impl Component for Cache {
///     fn init_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcInit>> {
///         Some(self)
///     }
/// }
///
/// #[async_trait]
/// impl OnIpcInit for Cache {
///     async fn on_ipc_init(&self, _channel: &dyn ServerChannel) -> HookResult {
///         Ok(())
///     }
/// }
///
/// assert!(Arc::new(Cache).init_hook().is_some());
/// ```
pub trait Component: Send + Sync + 'static {
    /// This component's `on_ipc_init` hook, if it has one
    fn init_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcInit>> {
        None
    }

    /// This component's `on_ipc_disconnect` hook, if it has one
    fn disconnect_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcDisconnect>> {
        None
    }
}

/// Lifetime of a component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One instance for the whole process
    #[default]
    Singleton,
    /// A new instance per request; never receives hooks
    Request,
    /// A new instance per consumer, created at startup
    Transient,
}

/// Which list a component belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Message-facing component
    Controller,
    /// Service component
    Provider,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Provider => write!(f, "provider"),
        }
    }
}

/// Builder describing one component to register
pub struct Registration {
    name: String,
    kind: InstanceKind,
    scope: Scope,
    dependencies: Vec<String>,
    instance: Option<Arc<dyn Component>>,
}

impl Registration {
    /// Register a controller
    pub fn controller<C: Component>(name: impl Into<String>, instance: Arc<C>) -> Self {
        Self::new(name.into(), InstanceKind::Controller, Some(instance))
    }

    /// Register a provider
    pub fn provider<C: Component>(name: impl Into<String>, instance: Arc<C>) -> Self {
        Self::new(name.into(), InstanceKind::Provider, Some(instance))
    }

    /// Register a name without a constructed component
    ///
    /// Placeholders satisfy dependency declarations but never receive hooks.
    pub fn placeholder(name: impl Into<String>, kind: InstanceKind) -> Self {
        Self::new(name.into(), kind, None)
    }

    fn new(name: String, kind: InstanceKind, instance: Option<Arc<dyn Component>>) -> Self {
        Self {
            name,
            kind,
            scope: Scope::Singleton,
            dependencies: Vec::new(),
            instance,
        }
    }

    /// Set the lifetime scope
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Declare a dependency on another registered component
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }
}

struct Entry {
    name: String,
    kind: InstanceKind,
    scope: Scope,
    dependencies: Vec<String>,
    constructed: bool,
    init: Option<Arc<dyn OnIpcInit>>,
    disconnect: Option<Arc<dyn OnIpcDisconnect>>,
}

/// One selected component with its resolved hooks
#[derive(Clone)]
pub struct InstanceRef {
    name: String,
    kind: InstanceKind,
    init: Option<Arc<dyn OnIpcInit>>,
    disconnect: Option<Arc<dyn OnIpcDisconnect>>,
}

impl InstanceRef {
    /// Registered name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller or provider
    #[must_use]
    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// The `on_ipc_init` hook, when implemented
    #[must_use]
    pub fn init_hook(&self) -> Option<&Arc<dyn OnIpcInit>> {
        self.init.as_ref()
    }

    /// The `on_ipc_disconnect` hook, when implemented
    #[must_use]
    pub fn disconnect_hook(&self) -> Option<&Arc<dyn OnIpcDisconnect>> {
        self.disconnect.as_ref()
    }
}

impl fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("init", &self.init.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .finish()
    }
}

/// Components eligible for lifecycle hooks, controllers first
#[derive(Debug, Clone, Default)]
pub struct InstanceSet {
    instances: Vec<InstanceRef>,
}

impl InstanceSet {
    /// Iterate in hook dispatch order
    pub fn iter(&self) -> std::slice::Iter<'_, InstanceRef> {
        self.instances.iter()
    }

    /// Names in hook dispatch order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.instances.iter().map(InstanceRef::name).collect()
    }

    /// Number of selected components
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when nothing was selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<'a> IntoIterator for &'a InstanceSet {
    type Item = &'a InstanceRef;
    type IntoIter = std::slice::Iter<'a, InstanceRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}

/// Live set of registered components
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl InstanceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component to the live set
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateInstance` if the name is taken.
    pub fn register(&self, registration: Registration) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == registration.name) {
            return Err(RegistryError::DuplicateInstance(registration.name));
        }

        let constructed = registration.instance.is_some();
        let (init, disconnect) = match registration.instance {
            Some(instance) => (
                Arc::clone(&instance).init_hook(),
                instance.disconnect_hook(),
            ),
            None => (None, None),
        };

        tracing::debug!(
            name = %registration.name,
            kind = %registration.kind,
            scope = ?registration.scope,
            init_hook = init.is_some(),
            disconnect_hook = disconnect.is_some(),
            "Instance registered"
        );

        entries.push(Entry {
            name: registration.name,
            kind: registration.kind,
            scope: registration.scope,
            dependencies: registration.dependencies,
            constructed,
            init,
            disconnect,
        });
        Ok(())
    }

    /// Remove a component from the live set
    ///
    /// Returns true if it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    /// Check that every declared dependency is registered
    ///
    /// # Errors
    ///
    /// Returns the first `RegistryError::UnknownDependency` found.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let entries = self.entries.read();
        let names: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        for entry in entries.iter() {
            if let Some(missing) = entry
                .dependencies
                .iter()
                .find(|d| !names.contains(d.as_str()))
            {
                return Err(RegistryError::UnknownDependency {
                    instance: entry.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Whether the named component has a static dependency tree
    ///
    /// Unknown names are not static.
    #[must_use]
    pub fn is_static(&self, name: &str) -> bool {
        let entries = self.entries.read();
        entries.iter().any(|e| e.name == name) && !non_static(&entries).contains(name)
    }

    /// Registered names in registration order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    /// Number of registered components
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Names whose dependency tree is not static
///
/// Seeds with request-scoped entries and entries with unknown
/// dependencies, then propagates to dependents until nothing changes.
/// Cycles terminate because the set only grows.
fn non_static(entries: &[Entry]) -> HashSet<String> {
    let known: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    let mut tainted: HashSet<String> = entries
        .iter()
        .filter(|e| {
            e.scope == Scope::Request || e.dependencies.iter().any(|d| !known.contains(d.as_str()))
        })
        .map(|e| e.name.clone())
        .collect();

    loop {
        let newly: Vec<String> = entries
            .iter()
            .filter(|e| !tainted.contains(&e.name))
            .filter(|e| e.dependencies.iter().any(|d| tainted.contains(d)))
            .map(|e| e.name.clone())
            .collect();
        if newly.is_empty() {
            return tainted;
        }
        tainted.extend(newly);
    }
}

/// Computes the [`InstanceSet`] from the live registry
#[derive(Debug, Clone)]
pub struct InstanceSelector {
    registry: InstanceRegistry,
}

impl InstanceSelector {
    /// Select from `registry`
    #[must_use]
    pub fn new(registry: InstanceRegistry) -> Self {
        Self { registry }
    }

    /// Eligible components at call time; never cached
    #[must_use]
    pub fn select(&self) -> InstanceSet {
        let entries = self.registry.entries.read();
        let tainted = non_static(&entries);

        let pick = |kind: InstanceKind| {
            entries
                .iter()
                .filter(move |e| e.kind == kind)
                .filter(|e| e.constructed && !tainted.contains(&e.name))
                .map(|e| InstanceRef {
                    name: e.name.clone(),
                    kind: e.kind,
                    init: e.init.clone(),
                    disconnect: e.disconnect.clone(),
                })
                .collect::<Vec<_>>()
        };

        let mut instances = pick(InstanceKind::Controller);
        instances.extend(pick(InstanceKind::Provider));
        InstanceSet { instances }
    }
}
