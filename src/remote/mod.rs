//! Remote attribute access over TCP.
//!
//! [`server::AttributeServer`] exposes a built component tree; clients
//! talk to it through [`client::RemoteClient`] and the per-attribute
//! proxies it hands out. The contract of a [`client::RemoteAttribute`]
//! matches a local attribute's get/set/subscribe, with remoting failure
//! modes (timeouts, staleness, reconnection) made explicit in the API.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RemoteAttribute, RemoteClient, RemoteClientConfig, RemoteComponent, StaleValue};
pub use server::{AttributeServer, ServerHandle};
