//! # rust_scope
//!
//! Reactive control backend for a scanning microscope. The instrument is
//! modeled as a tree of components, each exposing its observable state
//! through validated, subscribable attributes; on top of that sit a TCP
//! remoting layer with the same attribute contract, and a drift-corrected
//! acquisition loop that keeps long scans registered to the specimen.
//!
//! ## Crate Structure
//!
//! - **`attribute`**: `Attribute<T>` reactive value cells with constraints,
//!   subscriber notification and async watch support; the type-erased
//!   `AttributeBase` surface used for dynamic and remote access.
//! - **`component`**: the `Component` trait and `HwComponent` base state;
//!   role-based lookup helpers.
//! - **`tree`**: declarative microscope configuration, the class registry
//!   and the `TreeBuilder` (all-or-nothing construction, ordered teardown).
//! - **`sim`**: simulated scanner / focus / detector classes over a seeded
//!   synthetic specimen, used by the daemon without hardware and by the
//!   test suite.
//! - **`remote`**: length-prefixed wire protocol, the TCP
//!   `AttributeServer` and client-side proxies with explicit timeout,
//!   retry and staleness semantics.
//! - **`drift`**: FFT cross-correlation drift estimation from anchor
//!   region frames.
//! - **`acquisition`**: the `AcqState` lifecycle, acquisition requests and
//!   results, and the drift-corrected scan driver.
//! - **`config`**: daemon settings for the `scoped` binary.
//! - **`error`**: the `ScopeError` taxonomy and `ScopeResult` alias.

pub mod acquisition;
pub mod attribute;
pub mod component;
pub mod config;
pub mod drift;
pub mod error;
pub mod remote;
pub mod sim;
pub mod tree;

pub use error::{ScopeError, ScopeResult};
