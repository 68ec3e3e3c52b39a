//! Kubernetes controller for NooBaaSource resources
//!
//! This module contains the controller that watches NooBaaSource changes
//! and keeps one adapter running per resource.

mod noobaa_source_controller;
pub mod registry;

pub use noobaa_source_controller::{run as run_noobaa_source_controller, SourceController};
pub use registry::{AdapterExit, AdapterFuture, AdapterRegistry};

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::adapter::{AdapterDeps, AdapterSettings};
use crate::backoff::BackoffPolicy;
use crate::clients::{HttpRpcConnector, HttpSinkClient, KubeCredentialResolver};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::ServerState;
use crate::reconcilers::{EventPublisher, KubeEventPublisher, KubeStatusReporter, StatusReporter};

/// Shared context for the controller
pub struct Context {
    /// Clients handed to every adapter
    pub deps: AdapterDeps,
    pub adapter_settings: AdapterSettings,
    /// Writes `status.is_bad`
    pub status: Arc<dyn StatusReporter>,
    /// Publishes Events on NooBaaSource resources
    pub events: Arc<dyn EventPublisher>,
    /// Readiness and diagnostics
    pub server: ServerState,
    /// Namespace to watch, all namespaces when `None`
    pub watch_namespace: Option<String>,
    pub resync_interval: Duration,
    pub shutdown_grace: Duration,
    /// Backoff between restarts of an adapter that failed to start
    pub restart: BackoffPolicy,
}

impl Context {
    /// Create a context backed by the Kubernetes API and real HTTP clients
    pub fn new(client: Client, config: &Config, server: ServerState) -> Result<Self> {
        let timeout = config.request_timeout();
        let deps = AdapterDeps {
            rpc: Arc::new(HttpRpcConnector::new(timeout)?),
            sink: Arc::new(HttpSinkClient::new(client.clone(), timeout)?),
            credentials: Arc::new(KubeCredentialResolver::new(client.clone())),
        };

        Ok(Self {
            deps,
            adapter_settings: config.adapter_settings(),
            events: Arc::new(KubeEventPublisher::new(client.clone())),
            status: Arc::new(KubeStatusReporter::new(client)),
            server,
            watch_namespace: config.watch_namespace.clone(),
            resync_interval: config.resync_interval(),
            shutdown_grace: config.shutdown_grace(),
            restart: BackoffPolicy::restart(),
        })
    }
}
