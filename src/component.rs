//! Component abstractions for the hardware tree.
//!
//! A component is a named, role-tagged node representing one physical or
//! logical device unit. Components own their reactive attributes and their
//! child components; the whole microscope is one acyclic tree built once at
//! startup by the tree builder.
//!
//! Concrete components embed [`HwComponent`] for the common state (name,
//! role, attribute set, children, calibration metadata) and implement
//! [`Component`] on top of it; the trait is the only surface the tree
//! builder, the remote server and the acquisition loop talk to.

use crate::attribute::AttributeSet;
use crate::drift::AnchorSource;
use crate::error::{ScopeError, ScopeResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A detector reading taken on demand at the current beam position, for
/// callers that need a fresh measurement without moving the beam.
#[async_trait]
pub trait PointSource: Send + Sync {
    async fn read_point(&self) -> ScopeResult<f64>;
}

/// Object-safe view of a device node in the microscope tree.
pub trait Component: Send + Sync {
    /// Component name, unique within the tree.
    fn name(&self) -> &str;

    /// Semantic role tag used for structural lookup (e.g. "scanner").
    fn role(&self) -> &str;

    /// The reactive attributes owned by this component.
    fn attributes(&self) -> &AttributeSet;

    /// Children addressable by role. Exclusive ownership: a child appears
    /// under exactly one parent.
    fn children(&self) -> &HashMap<String, Arc<dyn Component>>;

    /// Static calibration constants (e.g. volts per meter).
    fn metadata(&self) -> &HashMap<String, f64>;

    /// Release the underlying hardware handle. Must be idempotent; the
    /// tree builder calls this in reverse build order on teardown.
    fn shutdown(&self) -> ScopeResult<()> {
        Ok(())
    }

    /// Capability probe: detectors that can scan the anchor region return
    /// themselves as an [`AnchorSource`] for drift correction.
    fn anchor_source(self: Arc<Self>) -> Option<Arc<dyn AnchorSource>> {
        None
    }

    /// Capability probe: detectors that can take an on-demand reading at
    /// the current beam position return themselves as a [`PointSource`].
    fn point_source(self: Arc<Self>) -> Option<Arc<dyn PointSource>> {
        None
    }
}

impl Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name())
            .field("role", &self.role())
            .field("attributes", &self.attributes().names())
            .field("children", &self.children().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Common owned state for concrete components.
///
/// Drivers construct one of these, register their attributes on it, and
/// delegate the [`Component`] accessors to it.
pub struct HwComponent {
    name: String,
    role: String,
    attributes: AttributeSet,
    children: HashMap<String, Arc<dyn Component>>,
    metadata: HashMap<String, f64>,
}

impl HwComponent {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            attributes: AttributeSet::new(),
            children: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Attach calibration metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, f64>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach children, addressable by role.
    pub fn with_children(mut self, children: HashMap<String, Arc<dyn Component>>) -> Self {
        self.children = children;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut AttributeSet {
        &mut self.attributes
    }

    pub fn children(&self) -> &HashMap<String, Arc<dyn Component>> {
        &self.children
    }

    pub fn metadata(&self) -> &HashMap<String, f64> {
        &self.metadata
    }
}

/// Walk a role path from `root`, e.g. `["scanner"]` or `["chamber", "gauge"]`.
///
/// Read-only lookup: `None` if any segment of the path is absent. Callers
/// at API boundaries convert the miss to [`ScopeError::NotFound`] instead
/// of panicking.
pub fn resolve_role<'a>(
    root: &'a Arc<dyn Component>,
    role_path: &[&str],
) -> Option<Arc<dyn Component>> {
    let mut current: Arc<dyn Component> = root.clone();
    for role in role_path {
        let next = current.children().get(*role)?.clone();
        current = next;
    }
    Some(current)
}

/// Like [`resolve_role`] but surfaces a typed error for API boundaries.
pub fn require_role(
    root: &Arc<dyn Component>,
    role_path: &[&str],
) -> ScopeResult<Arc<dyn Component>> {
    resolve_role(root, role_path).ok_or_else(|| {
        ScopeError::NotFound(format!(
            "no component at role path '{}' under '{}'",
            role_path.join("/"),
            root.name()
        ))
    })
}

/// Depth-first traversal of the tree, parents before children.
pub fn walk(root: &Arc<dyn Component>, visit: &mut dyn FnMut(&Arc<dyn Component>)) {
    visit(root);
    for child in root.children().values() {
        walk(child, visit);
    }
}
