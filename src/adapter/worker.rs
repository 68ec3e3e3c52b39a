//! The per-resource pipeline: RPC subscription → transform → sink

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::health::HealthTracker;
use crate::backoff::{Backoff, BackoffPolicy};
use crate::clients::{
    deliver_with_retry, CredentialResolver, Delivery, Notification, NotificationStream, RetryPolicy,
    RpcConnector, SinkClient,
};
use crate::crd::{Destination, NooBaaSource, ResourceKey, SourceSpec};
use crate::error::{Error, Result};
use crate::metrics;
use crate::transform;

/// Everything an adapter needs from its resource, frozen at start
#[derive(Clone, Debug, PartialEq)]
pub struct AdapterSpec {
    pub key: ResourceKey,
    pub generation: String,
    pub source: SourceSpec,
    pub sink: Destination,
    pub extensions: BTreeMap<String, String>,
}

impl AdapterSpec {
    pub fn from_resource(resource: &NooBaaSource) -> Self {
        Self {
            key: resource.key(),
            generation: resource.spec_version(),
            source: resource.spec.source.clone(),
            sink: resource.spec.sink.clone(),
            extensions: resource.spec.extensions(),
        }
    }
}

/// Clients shared by all adapters
#[derive(Clone)]
pub struct AdapterDeps {
    pub rpc: Arc<dyn RpcConnector>,
    pub sink: Arc<dyn SinkClient>,
    pub credentials: Arc<dyn CredentialResolver>,
}

/// Tunables shared by all adapters
#[derive(Clone, Copy, Debug)]
pub struct AdapterSettings {
    /// Consecutive failures before reporting unhealthy
    pub failure_threshold: u32,
    pub delivery: RetryPolicy,
    pub reconnect: BackoffPolicy,
    pub auth: BackoffPolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            delivery: RetryPolicy::default(),
            reconnect: BackoffPolicy::reconnect(),
            auth: BackoffPolicy::auth(),
        }
    }
}

/// An `is_bad` transition reported by an adapter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthUpdate {
    pub key: ResourceKey,
    pub generation: String,
    pub is_bad: bool,
}

enum PumpExit {
    Cancelled,
    Lost { error: Error, received: u64 },
}

/// Bridges one NooBaaSource's bucket notifications to its sink
pub struct Adapter {
    spec: AdapterSpec,
    deps: AdapterDeps,
    settings: AdapterSettings,
    health: mpsc::UnboundedSender<HealthUpdate>,
    tracker: HealthTracker,
}

impl Adapter {
    pub fn new(
        spec: AdapterSpec,
        deps: AdapterDeps,
        settings: AdapterSettings,
        health: mpsc::UnboundedSender<HealthUpdate>,
    ) -> Self {
        let tracker = HealthTracker::new(settings.failure_threshold);
        Self {
            spec,
            deps,
            settings,
            health,
            tracker,
        }
    }

    /// Run until cancelled.
    ///
    /// Returns `Ok(())` only after cancellation. An error means the adapter
    /// could not be set up (credential or sink resolution) and needs to be
    /// restarted by the reconciler.
    #[instrument(skip_all, fields(name = %self.spec.key.name, namespace = %self.spec.key.namespace, generation = %self.spec.generation))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let namespace = self.spec.key.namespace.clone();

        let secret = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            secret = self.deps.credentials.resolve(&namespace, &self.spec.source.rpc_secret) => secret?,
        };
        let sink_uri = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            uri = self.deps.sink.resolve(&namespace, &self.spec.sink) => uri?,
        };
        info!(sink = %sink_uri, bucket = %self.spec.source.bucket, "Adapter starting");

        let mut reconnect = Backoff::new(self.settings.reconnect);
        let mut auth = Backoff::new(self.settings.auth);

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                conn = self.deps.rpc.connect(&self.spec.source.rpc_url, &secret) => conn,
            };
            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    let delay = self.connect_failed(e, &mut reconnect, &mut auth);
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => {
                    conn.close().await;
                    return Ok(());
                }
                stream = conn.subscribe(&self.spec.source.bucket) => stream,
            };
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    conn.close().await;
                    let delay = self.connect_failed(e, &mut reconnect, &mut auth);
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            auth.reset();
            info!(bucket = %self.spec.source.bucket, "Subscribed to bucket notifications");
            let update = self.tracker.connected();
            self.emit(update);

            let exit = self.pump(&mut stream, &sink_uri, &cancel).await;
            drop(stream);
            conn.close().await;

            match exit {
                PumpExit::Cancelled => {
                    info!("Adapter stopped");
                    return Ok(());
                }
                PumpExit::Lost { error, received } => {
                    if received > 0 {
                        reconnect.reset();
                    }
                    metrics::RPC_RECONNECTS
                        .with_label_values(&[&self.spec.key.namespace, &self.spec.key.name])
                        .inc();
                    let update = self.tracker.connection_lost();
                    self.emit(update);
                    let delay = reconnect.next_delay();
                    warn!(error = %error, delay_ms = delay.as_millis() as u64, "Notification stream lost, reconnecting");
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Deliver notifications one at a time, in arrival order
    async fn pump(
        &mut self,
        stream: &mut NotificationStream,
        sink_uri: &str,
        cancel: &CancellationToken,
    ) -> PumpExit {
        let mut received = 0u64;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PumpExit::Cancelled,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(notification)) => {
                    received += 1;
                    metrics::NOTIFICATIONS_RECEIVED
                        .with_label_values(&[&self.spec.key.namespace, &self.spec.key.name])
                        .inc();
                    self.forward(&notification, sink_uri, cancel).await;
                }
                Some(Err(error)) => return PumpExit::Lost { error, received },
                None => {
                    return PumpExit::Lost {
                        error: Error::connection_lost("notification stream ended"),
                        received,
                    }
                }
            }
        }
    }

    async fn forward(&mut self, notification: &Notification, sink_uri: &str, cancel: &CancellationToken) {
        let event = transform::to_event(notification, &self.spec.source.bucket, &self.spec.extensions);
        let result = deliver_with_retry(
            self.deps.sink.as_ref(),
            sink_uri,
            &event,
            self.settings.delivery,
            cancel,
        )
        .await;

        let update = match result {
            Ok(Delivery::Delivered) => {
                debug!(id = %event.id, key = %notification.key, "Delivered event");
                metrics::DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                self.tracker.delivered()
            }
            Ok(Delivery::Cancelled) => {
                debug!(id = %event.id, key = %notification.key, "Delivery interrupted by shutdown");
                return;
            }
            Err(e) => {
                warn!(id = %event.id, key = %notification.key, error = %e, "Dropping undeliverable event");
                metrics::DELIVERIES_TOTAL.with_label_values(&[e.kind()]).inc();
                self.tracker.delivery_failed()
            }
        };
        self.emit(update);
    }

    fn connect_failed(&mut self, error: Error, reconnect: &mut Backoff, auth: &mut Backoff) -> Duration {
        let delay = match error {
            Error::Auth(_) => auth.next_delay(),
            _ => reconnect.next_delay(),
        };
        warn!(error = %error, delay_ms = delay.as_millis() as u64, "RPC connect failed");
        let update = self.tracker.connect_failed();
        self.emit(update);
        delay
    }

    fn emit(&self, update: Option<bool>) {
        let Some(is_bad) = update else {
            return;
        };
        info!(is_bad = is_bad, "Adapter health changed");
        // the reconciler may already be gone during shutdown
        let _ = self.health.send(HealthUpdate {
            key: self.spec.key.clone(),
            generation: self.spec.generation.clone(),
            is_bad,
        });
    }
}

/// Sleep for `delay`; `false` if cancelled first
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
