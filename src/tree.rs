//! Declarative component tree configuration and builder.
//!
//! The microscope is described by a declarative document mapping component
//! names to `{class, role, init, children, metadata}`. The builder resolves
//! child references by name, instantiates depth-first (children before the
//! parents that own them) through a registry of class constructors, and
//! tears the tree down in reverse build order.
//!
//! # Configuration format (TOML)
//!
//! ```toml
//! root = "orsaymic"
//!
//! [components.orsaymic]
//! class = "sim.Microscope"
//! role = "microscope"
//! children = { scanner = "Scanner", focus = "Focus", detector = "Detector" }
//!
//! [components.Scanner]
//! class = "sim.Scanner"
//! role = "scanner"
//! init = { field_of_view = 1.0e-5 }
//! metadata = { volts_per_meter = 1.0e5 }
//! ```
//!
//! Unknown `class` values, dangling child references and cycles all fail
//! the build with a configuration error and leave nothing behind.

use crate::component::{resolve_role, Component};
use crate::error::{ScopeError, ScopeResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration model
// =============================================================================

/// Whole-microscope declarative configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MicroscopeConfig {
    /// Name of the root component.
    pub root: String,
    /// Component name -> description.
    pub components: HashMap<String, ComponentConfig>,
}

/// One component entry in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    /// Component type tag, resolved through the [`ComponentRegistry`].
    pub class: String,
    /// Semantic role of the node.
    pub role: String,
    /// Initialization parameters passed verbatim to the constructor.
    #[serde(default)]
    pub init: HashMap<String, toml::Value>,
    /// Children as role -> component-name references.
    #[serde(default)]
    pub children: HashMap<String, String>,
    /// Static calibration constants.
    #[serde(default)]
    pub metadata: HashMap<String, f64>,
}

impl MicroscopeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> ScopeResult<Self> {
        toml::from_str(text).map_err(|e| ScopeError::Config(e.to_string()))
    }
}

// =============================================================================
// Component registry (class tag -> constructor)
// =============================================================================

/// Everything a constructor needs to build one component. Children are
/// already constructed (the builder works depth-first).
pub struct BuildContext<'a> {
    pub name: &'a str,
    pub role: &'a str,
    pub init: &'a HashMap<String, toml::Value>,
    pub metadata: &'a HashMap<String, f64>,
    pub children: HashMap<String, Arc<dyn Component>>,
}

impl BuildContext<'_> {
    /// Fetch a float init parameter, or the given default when absent.
    pub fn init_f64(&self, key: &str, default: f64) -> ScopeResult<f64> {
        match self.init.get(key) {
            None => Ok(default),
            Some(toml::Value::Float(v)) => Ok(*v),
            Some(toml::Value::Integer(v)) => Ok(*v as f64),
            Some(other) => Err(ScopeError::Config(format!(
                "component '{}': init parameter '{key}' must be a number, got {other}",
                self.name
            ))),
        }
    }

    /// Fetch an integer init parameter, or the given default when absent.
    pub fn init_i64(&self, key: &str, default: i64) -> ScopeResult<i64> {
        match self.init.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(v)) => Ok(*v),
            Some(other) => Err(ScopeError::Config(format!(
                "component '{}': init parameter '{key}' must be an integer, got {other}",
                self.name
            ))),
        }
    }

    /// Fetch a string init parameter, or the given default when absent.
    pub fn init_str(&self, key: &str, default: &str) -> ScopeResult<String> {
        match self.init.get(key) {
            None => Ok(default.to_string()),
            Some(toml::Value::String(v)) => Ok(v.clone()),
            Some(other) => Err(ScopeError::Config(format!(
                "component '{}': init parameter '{key}' must be a string, got {other}",
                self.name
            ))),
        }
    }
}

type Constructor = Box<dyn Fn(BuildContext<'_>) -> ScopeResult<Arc<dyn Component>> + Send + Sync>;

/// Maps `class` tags from the configuration to construction functions.
/// New hardware types register here rather than relying on open-ended
/// dynamic dispatch.
#[derive(Default)]
pub struct ComponentRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a class tag.
    pub fn register(
        &mut self,
        class: impl Into<String>,
        constructor: impl Fn(BuildContext<'_>) -> ScopeResult<Arc<dyn Component>>
            + Send
            + Sync
            + 'static,
    ) {
        self.constructors.insert(class.into(), Box::new(constructor));
    }

    /// Whether the class tag is known.
    pub fn knows(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    fn construct(&self, class: &str, ctx: BuildContext<'_>) -> ScopeResult<Arc<dyn Component>> {
        let constructor = self.constructors.get(class).ok_or_else(|| {
            ScopeError::Config(format!("unknown component class '{class}'"))
        })?;
        constructor(ctx)
    }
}

// =============================================================================
// Tree builder
// =============================================================================

/// A built component tree plus the bookkeeping needed for ordered teardown.
pub struct ComponentTree {
    root: Arc<dyn Component>,
    /// Construction order (children before parents).
    build_order: Vec<Arc<dyn Component>>,
}

impl std::fmt::Debug for ComponentTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentTree")
            .field("root", &self.root.name())
            .field(
                "build_order",
                &self
                    .build_order
                    .iter()
                    .map(|c| c.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ComponentTree {
    /// The root component.
    pub fn root(&self) -> &Arc<dyn Component> {
        &self.root
    }

    /// Role-based lookup from the root, e.g. `["focus"]`. Read-only.
    pub fn resolve(&self, role_path: &[&str]) -> Option<Arc<dyn Component>> {
        resolve_role(&self.root, role_path)
    }

    /// Find a component anywhere in the tree by its role tag.
    pub fn find_by_role(&self, role: &str) -> Option<Arc<dyn Component>> {
        self.build_order.iter().find(|c| c.role() == role).cloned()
    }

    /// Find a component anywhere in the tree by its unique name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.build_order.iter().find(|c| c.name() == name).cloned()
    }

    /// All components in build order.
    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.build_order
    }

    /// Release all components in reverse build order, best-effort: a
    /// failure releasing one component is recorded but does not prevent
    /// releasing the rest.
    pub fn shutdown(&self) -> Vec<(String, ScopeError)> {
        let mut failures = Vec::new();
        for component in self.build_order.iter().rev() {
            debug!(component = component.name(), "shutting down component");
            if let Err(e) = component.shutdown() {
                warn!(component = component.name(), error = %e, "component shutdown failed");
                failures.push((component.name().to_string(), e));
            }
        }
        failures
    }
}

/// Assembles a [`ComponentTree`] from a [`MicroscopeConfig`].
pub struct TreeBuilder<'a> {
    registry: &'a ComponentRegistry,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(registry: &'a ComponentRegistry) -> Self {
        Self { registry }
    }

    /// Build the tree. All-or-nothing: every reference and class tag is
    /// checked before any component is constructed, and if a constructor
    /// fails mid-build, the components built so far are shut down in
    /// reverse order before the error is returned.
    pub fn build(&self, config: &MicroscopeConfig) -> ScopeResult<ComponentTree> {
        self.validate(config)?;

        let mut built: HashMap<String, Arc<dyn Component>> = HashMap::new();
        let mut build_order: Vec<Arc<dyn Component>> = Vec::new();

        match self.construct_recursive(config, &config.root, &mut built, &mut build_order) {
            Ok(root) => {
                let unused: Vec<&String> = config
                    .components
                    .keys()
                    .filter(|name| !built.contains_key(*name))
                    .collect();
                if !unused.is_empty() {
                    warn!(?unused, "configuration entries not reachable from root");
                }
                info!(
                    root = root.name(),
                    components = build_order.len(),
                    "component tree built"
                );
                Ok(ComponentTree { root, build_order })
            }
            Err(e) => {
                // Roll back whatever was constructed so no partial tree
                // keeps hardware handles open.
                for component in build_order.iter().rev() {
                    if let Err(se) = component.shutdown() {
                        warn!(component = component.name(), error = %se,
                            "rollback shutdown failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Structural validation pass: every child reference resolves, every
    /// class is known, and the reference graph is acyclic.
    fn validate(&self, config: &MicroscopeConfig) -> ScopeResult<()> {
        if !config.components.contains_key(&config.root) {
            return Err(ScopeError::Config(format!(
                "root component '{}' is not defined",
                config.root
            )));
        }

        for (name, entry) in &config.components {
            if !self.registry.knows(&entry.class) {
                return Err(ScopeError::Config(format!(
                    "component '{name}': unknown class '{}'",
                    entry.class
                )));
            }
            for (role, child) in &entry.children {
                if !config.components.contains_key(child) {
                    return Err(ScopeError::Config(format!(
                        "component '{name}': child '{child}' (role '{role}') is not defined"
                    )));
                }
            }
        }

        // Cycle detection with an in-progress mark.
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        self.check_cycles(config, &config.root, &mut visiting, &mut visited)
    }

    fn check_cycles(
        &self,
        config: &MicroscopeConfig,
        name: &str,
        visiting: &mut HashSet<String>,
        visited: &mut HashSet<String>,
    ) -> ScopeResult<()> {
        if visited.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(ScopeError::Config(format!(
                "cycle detected through component '{name}'"
            )));
        }
        if let Some(entry) = config.components.get(name) {
            for child in entry.children.values() {
                self.check_cycles(config, child, visiting, visited)?;
            }
        }
        visiting.remove(name);
        visited.insert(name.to_string());
        Ok(())
    }

    fn construct_recursive(
        &self,
        config: &MicroscopeConfig,
        name: &str,
        built: &mut HashMap<String, Arc<dyn Component>>,
        build_order: &mut Vec<Arc<dyn Component>>,
    ) -> ScopeResult<Arc<dyn Component>> {
        if let Some(existing) = built.get(name) {
            return Ok(existing.clone());
        }

        // validate() guarantees the entry exists
        let entry = config.components.get(name).ok_or_else(|| {
            ScopeError::Config(format!("component '{name}' is not defined"))
        })?;

        // Children first.
        let mut children: HashMap<String, Arc<dyn Component>> = HashMap::new();
        for (role, child_name) in &entry.children {
            let child = self.construct_recursive(config, child_name, built, build_order)?;
            children.insert(role.clone(), child);
        }

        debug!(component = name, class = %entry.class, "constructing component");
        let component = self.registry.construct(
            &entry.class,
            BuildContext {
                name,
                role: &entry.role,
                init: &entry.init,
                metadata: &entry.metadata,
                children,
            },
        )?;

        built.insert(name.to_string(), component.clone());
        build_order.push(component.clone());
        Ok(component)
    }
}
