//! Clients for the systems an adapter bridges
//!
//! - [`rpc`]: NooBaa RPC notification subscriptions
//! - [`sink`]: sink resolution and CloudEvent delivery
//! - [`secrets`]: `rpcSecret` credential lookup

pub mod rpc;
pub mod secrets;
pub mod sink;
#[cfg(test)]
mod test_server;

pub use rpc::{HttpRpcConnector, Keepalive, Notification, NotificationStream, RpcConnection, RpcConnector};
pub use secrets::{CredentialResolver, KubeCredentialResolver};
pub use sink::{deliver_with_retry, Delivery, HttpSinkClient, RetryPolicy, SinkClient};
