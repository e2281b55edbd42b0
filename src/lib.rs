//! # Tidegate
//!
//! `tidegate` is a store-and-forward message gateway for sites that are only
//! sometimes connected, such as ships and the shore stations they report to.
//! Applications attach to their local gateway over framed TCP, register
//! interest with listener patterns, and exchange typed messages. Traffic for
//! other sites is handed to peer gateways, or kept in a durable backlog until
//! a route comes up.
//!
//! ## Core Modules
//!
//! - `broker`: message model, listener matching, the `Channel` trait and the router.
//! - `transport`: wire codec, connection channels, acceptors, TLS and deliverers.
//! - `remote`: channels standing for peer sites, with their send workers.
//! - `persistence`: the per-site backlog store (sled).
//! - `client`: the handle applications use to talk to a gateway.
//! - `introspect`: read-only HTTP debug endpoints.
//! - `config`: settings from files, the environment and defaults.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod introspect;
pub mod persistence;
pub mod remote;
pub mod transport;
pub mod utils;
