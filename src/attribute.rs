//! Attribute<T> - Reactive, validated attribute cells.
//!
//! Every hardware component exposes its observable state through typed
//! attributes. An attribute is a value cell that validates writes against
//! declared constraints, notifies subscribers of accepted changes, and
//! mirrors its value into a watch channel for async observers (the
//! acquisition loop and the remote server).
//!
//! # Example
//!
//! ```rust,ignore
//! use rust_scope::attribute::Attribute;
//!
//! let dwell = Attribute::new("dwell_time", 1e-6)
//!     .with_range(1e-9, 1.0)
//!     .with_unit("s");
//!
//! let sub = dwell.subscribe(|old, new| {
//!     println!("dwell changed: {} -> {}", old, new);
//!     Ok(())
//! });
//!
//! dwell.set(2e-6)?;          // validates, replaces, notifies
//! assert_eq!(dwell.get(), 2e-6);
//! dwell.unsubscribe(sub);
//! ```

use crate::error::{ScopeError, ScopeResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::warn;

// =============================================================================
// Constraints
// =============================================================================

/// Validation constraints for an attribute value.
#[derive(Clone)]
pub enum Constraints<T> {
    /// No constraints
    None,

    /// Closed numeric range [min, max]
    Range { min: T, max: T },

    /// Allowed discrete values
    Choices(Vec<T>),

    /// Custom validation function
    Custom(Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>),
}

impl<T: PartialEq + PartialOrd + Debug> Constraints<T> {
    /// Validate a candidate value. On rejection the attribute value is
    /// guaranteed untouched by the caller.
    pub fn validate(&self, name: &str, value: &T) -> ScopeResult<()> {
        match self {
            Constraints::None => Ok(()),

            Constraints::Range { min, max } => {
                if value < min || value > max {
                    Err(ScopeError::Validation(format!(
                        "'{name}': value {value:?} out of range [{min:?}, {max:?}]"
                    )))
                } else {
                    Ok(())
                }
            }

            Constraints::Choices(choices) => {
                if choices.iter().any(|c| c == value) {
                    Ok(())
                } else {
                    Err(ScopeError::Validation(format!(
                        "'{name}': value {value:?} is not among the allowed choices"
                    )))
                }
            }

            Constraints::Custom(validator) => validator(value)
                .map_err(|e| ScopeError::Validation(format!("'{name}': {e}"))),
        }
    }
}

impl<T: Debug> Debug for Constraints<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraints::None => write!(f, "None"),
            Constraints::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Constraints::Choices(choices) => f.debug_tuple("Choices").field(choices).finish(),
            Constraints::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

impl<T> Default for Constraints<T> {
    fn default() -> Self {
        Constraints::None
    }
}

// =============================================================================
// Attribute<T>
// =============================================================================

/// Identifier handed out by [`Attribute::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&T, &T) -> anyhow::Result<()> + Send + Sync>;

struct Subscribers<T> {
    listeners: Vec<(SubscriptionId, Listener<T>)>,
    next_id: u64,
}

/// A typed, observable, validated value cell.
///
/// The current value lives in a `tokio::sync::watch` channel so that `get`
/// never contends with notification delivery. Writers are serialized by a
/// mutex that also guards the subscriber list, making every accepted `set`
/// a linearizable event: subscribers observe the accepted values in write
/// order, exactly once each.
pub struct Attribute<T>
where
    T: Clone + Send + Sync + PartialEq + PartialOrd + Debug + 'static,
{
    /// Attribute name (unique within its component)
    name: String,

    /// Physical unit, e.g. "m", "s", "V"
    unit: Option<String>,

    /// Human-readable description
    description: Option<String>,

    /// Rejects `set` (the owning component may still use `set_forced`)
    read_only: bool,

    /// Validation constraints applied to every write
    constraints: Constraints<T>,

    /// Current value holder; `get` reads it without taking the write lock
    value_tx: watch::Sender<T>,

    /// Writer serialization + subscriber list
    subscribers: Mutex<Subscribers<T>>,
}

impl<T> Attribute<T>
where
    T: Clone + Send + Sync + PartialEq + PartialOrd + Debug + 'static,
{
    /// Create a new attribute with an initial value.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (value_tx, _) = watch::channel(initial);
        Self {
            name: name.into(),
            unit: None,
            description: None,
            read_only: false,
            constraints: Constraints::None,
            value_tx,
            subscribers: Mutex::new(Subscribers {
                listeners: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Set the physical unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Restrict values to a closed range.
    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.constraints = Constraints::Range { min, max };
        self
    }

    /// Restrict values to a discrete choice set.
    pub fn with_choices(mut self, choices: Vec<T>) -> Self {
        self.constraints = Constraints::Choices(choices);
        self
    }

    /// Install a custom validation function.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.constraints = Constraints::Custom(Arc::new(validator));
        self
    }

    /// Mark the attribute read-only for external writers.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Get the current value. Never blocks on writers, never fails.
    pub fn get(&self) -> T {
        self.value_tx.borrow().clone()
    }

    /// Attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical unit, if declared.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Description, if declared.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether external writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Declared constraints.
    pub fn constraints(&self) -> &Constraints<T> {
        &self.constraints
    }

    /// Set a new value.
    ///
    /// Validates against the declared constraints. On success the value is
    /// atomically replaced and every subscriber is invoked in subscription
    /// order with `(old, new)`; a subscriber returning an error is reported
    /// via `tracing` and does not prevent later subscribers from running.
    /// On failure the value is unchanged.
    ///
    /// Writing the current value again is accepted but does not notify:
    /// a repeated `set` of the same value is a no-op in effect.
    pub fn set(&self, value: T) -> ScopeResult<()> {
        if self.read_only {
            return Err(ScopeError::ReadOnly(self.name.clone()));
        }
        self.write(value)
    }

    /// Owner-side write that bypasses the read-only flag but still
    /// validates and notifies. Used by component logic to report hardware
    /// completion into read-only attributes.
    pub fn set_forced(&self, value: T) -> ScopeResult<()> {
        self.write(value)
    }

    fn write(&self, value: T) -> ScopeResult<()> {
        self.constraints.validate(&self.name, &value)?;

        // The lock serializes writers and freezes the subscriber list for
        // the duration of the notification, so deliveries arrive in write
        // order. `get` reads the watch channel and never takes this lock.
        let guard = self.lock_subscribers();

        let old = self.value_tx.borrow().clone();
        // The watch channel bumps on every accepted write, including
        // idempotent ones: async waiters use it for completion semantics.
        // Callback subscribers only see actual changes, so a repeated set
        // of the same value is a no-op in effect.
        self.value_tx.send_replace(value.clone());
        if old == value {
            return Ok(());
        }

        for (id, listener) in guard.listeners.iter() {
            if let Err(e) = listener(&old, &value) {
                warn!(
                    attribute = %self.name,
                    subscription = id.0,
                    error = %e,
                    "attribute subscriber failed"
                );
            }
        }
        Ok(())
    }

    /// Register a change listener, invoked with `(old, new)` on every
    /// accepted change. Returns an id for [`Attribute::unsubscribe`].
    pub fn subscribe(
        &self,
        listener: impl Fn(&T, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut guard = self.lock_subscribers();
        let id = SubscriptionId(guard.next_id);
        guard.next_id += 1;
        guard.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.lock_subscribers();
        let before = guard.listeners.len();
        guard.listeners.retain(|(sid, _)| *sid != id);
        guard.listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().listeners.len()
    }

    /// A watch receiver tracking the attribute value, for async observers
    /// that want to `await` changes rather than register a callback.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.value_tx.subscribe()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers<T>> {
        // A poisoned lock only means a listener panicked mid-notification;
        // the list itself is still structurally sound.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Debug for Attribute<T>
where
    T: Clone + Send + Sync + PartialEq + PartialOrd + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("value", &*self.value_tx.borrow())
            .field("unit", &self.unit)
            .field("read_only", &self.read_only)
            .field("constraints", &self.constraints)
            .finish()
    }
}

// =============================================================================
// AttributeBase - type-erased surface for dynamic and remote access
// =============================================================================

/// Object-safe view of an attribute, used by the component tree and the
/// remote server to address attributes without knowing their value type.
/// Values cross this surface as JSON.
pub trait AttributeBase: Send + Sync {
    fn name(&self) -> &str;

    fn unit(&self) -> Option<&str>;

    fn is_read_only(&self) -> bool;

    /// Current value serialized to JSON.
    fn value_json(&self) -> serde_json::Value;

    /// Deserialize and write a value; same contract as the typed `set`.
    fn set_json(&self, value: serde_json::Value) -> ScopeResult<()>;

    /// Declared constraints serialized to JSON (for client introspection).
    fn constraints_json(&self) -> serde_json::Value;

    /// Register a type-erased change listener receiving the new value.
    fn subscribe_json(
        &self,
        listener: Box<dyn Fn(serde_json::Value) + Send + Sync>,
    ) -> SubscriptionId;

    /// Remove a listener registered through either surface.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Downcast support for recovering the typed attribute.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

impl<T> AttributeBase for Attribute<T>
where
    T: Clone + Send + Sync + PartialEq + PartialOrd + Debug + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        Attribute::name(self)
    }

    fn unit(&self) -> Option<&str> {
        Attribute::unit(self)
    }

    fn is_read_only(&self) -> bool {
        Attribute::is_read_only(self)
    }

    fn value_json(&self) -> serde_json::Value {
        serde_json::to_value(self.get()).unwrap_or(serde_json::Value::Null)
    }

    fn set_json(&self, value: serde_json::Value) -> ScopeResult<()> {
        let typed: T = serde_json::from_value(value)
            .map_err(|e| ScopeError::Validation(format!("'{}': {e}", self.name)))?;
        self.set(typed)
    }

    fn constraints_json(&self) -> serde_json::Value {
        match &self.constraints {
            Constraints::None => serde_json::json!({ "kind": "none" }),
            Constraints::Range { min, max } => serde_json::json!({
                "kind": "range",
                "min": serde_json::to_value(min).unwrap_or(serde_json::Value::Null),
                "max": serde_json::to_value(max).unwrap_or(serde_json::Value::Null),
            }),
            Constraints::Choices(choices) => serde_json::json!({
                "kind": "choices",
                "choices": serde_json::to_value(choices).unwrap_or(serde_json::Value::Null),
            }),
            Constraints::Custom(_) => serde_json::json!({ "kind": "custom" }),
        }
    }

    fn subscribe_json(
        &self,
        listener: Box<dyn Fn(serde_json::Value) + Send + Sync>,
    ) -> SubscriptionId {
        self.subscribe(move |_old, new| {
            let value = serde_json::to_value(new)?;
            listener(value);
            Ok(())
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        Attribute::unsubscribe(self, id)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

// =============================================================================
// AttributeSet - attribute collection owned by a component
// =============================================================================

/// The attributes owned by one component, in registration order.
#[derive(Default)]
pub struct AttributeSet {
    attributes: Vec<Arc<dyn AttributeBase>>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute. Replaces any previous attribute of the same
    /// name (names are unique within a component).
    pub fn register(&mut self, attribute: Arc<dyn AttributeBase>) {
        self.attributes
            .retain(|a| a.name() != attribute.name());
        self.attributes.push(attribute);
    }

    /// Look up an attribute by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AttributeBase>> {
        self.attributes
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Look up an attribute by name, recovering its concrete value type.
    pub fn get_typed<T>(&self, name: &str) -> Option<Arc<Attribute<T>>>
    where
        T: Clone + Send + Sync + PartialEq + PartialOrd + Debug + Serialize + DeserializeOwned + 'static,
    {
        self.get(name)?.as_any_arc().downcast::<Attribute<T>>().ok()
    }

    /// Attribute names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AttributeBase>> {
        self.attributes.iter()
    }
}

impl Debug for AttributeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeSet")
            .field("names", &self.names())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
