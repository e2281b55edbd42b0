//! Client library for applications attached to a gateway.

pub mod gateway_client;
pub use gateway_client::{ClientOptions, GatewayClient};
