//! NooBaaSource controller
//!
//! Watches NooBaaSource resources and keeps exactly one adapter running per
//! resource. A single owner task holds every piece of mutable state
//! (registry, status ledger, wake-up timer); watch events, adapter health,
//! adapter exits, resync ticks and retry wake-ups are all handled there.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::ListParams,
    runtime::{
        events::EventType,
        reflector::{self, ObjectRef, Store},
        watcher,
        watcher::{Config as WatcherConfig, Event},
        WatchStreamExt,
    },
    Api, Client, Resource,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::registry::{AdapterExit, AdapterRegistry};
use super::Context;
use crate::adapter::{Adapter, AdapterSpec, HealthUpdate};
use crate::crd::{NooBaaSource, ResourceKey};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::events::{actions, reasons};
use crate::reconcilers::{self, AdapterAction, Desired, StatusLedger, WriteOutcome};

/// Run the NooBaaSource controller until `shutdown` fires
pub async fn run(client: Client, context: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    let api: Api<NooBaaSource> = match &context.watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            error = %e,
            "NooBaaSource CRD not installed, install it with `crdgen | kubectl apply -f -`"
        );
        return Err(Error::Kube(e));
    }

    info!(
        namespace = context.watch_namespace.as_deref().unwrap_or("*"),
        "Starting NooBaaSource controller"
    );

    let (store, writer) = reflector::store();
    let events = watcher(api, WatcherConfig::default())
        .default_backoff()
        .reflect(writer);

    SourceController::new(context, store)
        .run(events, shutdown)
        .await
}

/// Owner of all adapter and status state
pub struct SourceController {
    context: Arc<Context>,
    store: Store<NooBaaSource>,
    registry: AdapterRegistry,
    ledger: StatusLedger,
    health_tx: mpsc::UnboundedSender<HealthUpdate>,
    health_rx: mpsc::UnboundedReceiver<HealthUpdate>,
    exits_rx: mpsc::UnboundedReceiver<AdapterExit>,
    wakeup: Option<Instant>,
}

impl SourceController {
    pub fn new(context: Arc<Context>, store: Store<NooBaaSource>) -> Self {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let registry = AdapterRegistry::new(exits_tx, context.shutdown_grace)
            .with_restart_policy(context.restart);

        Self {
            context,
            store,
            registry,
            ledger: StatusLedger::new(),
            health_tx,
            health_rx,
            exits_rx,
            wakeup: None,
        }
    }

    /// Drive the owner loop over a reflected watch stream.
    ///
    /// On shutdown every adapter is cancelled and awaited before returning.
    pub async fn run<S>(mut self, events: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Event<NooBaaSource>, watcher::Error>> + Send,
    {
        let mut events = std::pin::pin!(events);
        let mut resync = tokio::time::interval(self.context.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; the initial pass comes from InitDone
        resync.tick().await;

        let outcome = loop {
            let wakeup = self.wakeup;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        if self.on_watch_event(&event) {
                            self.reconcile().await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "NooBaaSource watch error");
                        metrics::RECONCILIATION_ERRORS.with_label_values(&["watch"]).inc();
                    }
                    None => {
                        error!("NooBaaSource watch stream ended");
                        break Err(Error::connection_lost("NooBaaSource watch stream ended"));
                    }
                },
                Some(exit) = self.exits_rx.recv() => {
                    self.on_adapter_exit(exit).await;
                    self.reconcile().await;
                }
                Some(update) = self.health_rx.recv() => {
                    self.on_health(update);
                    self.flush_status().await;
                }
                _ = sleep_until(wakeup) => {
                    self.wakeup = None;
                    self.reconcile().await;
                }
                _ = resync.tick() => self.reconcile().await,
            }
        };

        info!(adapters = self.registry.active(), "Stopping all adapters");
        self.registry.shutdown().await;
        metrics::ADAPTERS_RUNNING.set(0.0);
        outcome
    }

    /// Whether the event warrants a reconcile pass
    fn on_watch_event(&self, event: &Event<NooBaaSource>) -> bool {
        match event {
            Event::Apply(_) | Event::Delete(_) => true,
            Event::Init | Event::InitApply(_) => false,
            Event::InitDone => {
                if !self.context.server.is_ready() {
                    info!(resources = self.store.state().len(), "Initial NooBaaSource sync complete");
                    self.context.server.set_ready();
                }
                true
            }
        }
    }

    /// One level-triggered pass: converge adapters on the watch cache
    #[instrument(skip(self))]
    async fn reconcile(&mut self) {
        let timer = metrics::RECONCILE_DURATION.start_timer();
        metrics::RECONCILIATIONS.inc();
        let now = Instant::now();

        let resources: BTreeMap<ResourceKey, Arc<NooBaaSource>> = self
            .store
            .state()
            .into_iter()
            .map(|resource| (resource.key(), resource))
            .collect();

        for (key, resource) in &resources {
            self.ledger.observe(key, resource.reported_is_bad());
        }
        self.ledger.retain(|key| resources.contains_key(key));

        let desired: Vec<Desired> = resources.values().map(|r| Desired::from_resource(r)).collect();
        let plan = reconcilers::plan(&desired, &self.registry.snapshot(), now);

        for action in plan.actions {
            match action {
                AdapterAction::Stop(key) => {
                    info!(name = %key.name, namespace = %key.namespace, "Stopping adapter for deleted NooBaaSource");
                    self.registry.stop(&key);
                    metrics::forget_source(&key.namespace, &key.name);
                }
                AdapterAction::Start(key) | AdapterAction::Restart(key) => {
                    if let Some(resource) = resources.get(&key) {
                        self.start_adapter(resource, now).await;
                    }
                }
            }
        }

        self.wakeup = self.registry.next_retry();
        self.flush_status().await;

        let active = self.registry.active();
        metrics::ADAPTERS_RUNNING.set(active as f64);
        self.context.server.record_pass(active).await;
        timer.observe_duration();
    }

    async fn start_adapter(&mut self, resource: &NooBaaSource, now: Instant) {
        let key = resource.key();
        let generation = resource.spec_version();

        if let Err(e) = reconcilers::validate(resource) {
            let retry_at = self.registry.mark_failed(&key, &generation, now);
            warn!(
                name = %key.name,
                namespace = %key.namespace,
                generation = %generation,
                error = %e,
                retry_in_secs = retry_at.saturating_duration_since(now).as_secs(),
                "Invalid NooBaaSource spec"
            );
            metrics::RECONCILIATION_ERRORS.with_label_values(&[e.kind()]).inc();
            self.ledger.set_desired(&key, true);
            self.context
                .events
                .publish(
                    &resource.object_ref(&()),
                    EventType::Warning,
                    reasons::INVALID_SPEC,
                    actions::START_ADAPTER,
                    Some(e.to_string()),
                )
                .await;
            return;
        }

        info!(name = %key.name, namespace = %key.namespace, generation = %generation, "Starting adapter");
        let adapter = Adapter::new(
            AdapterSpec::from_resource(resource),
            self.context.deps.clone(),
            self.context.adapter_settings,
            self.health_tx.clone(),
        );
        self.registry
            .start(key, generation, move |token| adapter.run(token).boxed());
    }

    async fn on_adapter_exit(&mut self, exit: AdapterExit) {
        let Some((generation, retry_at)) = self.registry.handle_exit(&exit, Instant::now()) else {
            debug!(name = %exit.key.name, namespace = %exit.key.namespace, "Ignoring exit of replaced adapter");
            return;
        };
        let (kind, note) = match &exit.result {
            Err(e) => {
                warn!(
                    name = %exit.key.name,
                    namespace = %exit.key.namespace,
                    generation = %generation,
                    error = %e,
                    retry_in_secs = retry_at.saturating_duration_since(Instant::now()).as_secs(),
                    "Adapter failed"
                );
                (e.kind(), e.to_string())
            }
            Ok(()) => ("adapter_exited", "adapter stopped unexpectedly".to_string()),
        };
        metrics::RECONCILIATION_ERRORS.with_label_values(&[kind]).inc();
        self.ledger.set_desired(&exit.key, true);

        if let Some(reference) = self.object_ref(&exit.key) {
            self.context
                .events
                .publish(
                    &reference,
                    EventType::Warning,
                    reasons::ADAPTER_FAILED,
                    actions::START_ADAPTER,
                    Some(note),
                )
                .await;
        }
    }

    fn on_health(&mut self, update: HealthUpdate) {
        if self.registry.generation(&update.key) != Some(update.generation.as_str()) {
            debug!(name = %update.key.name, namespace = %update.key.namespace, "Ignoring health of replaced adapter");
            return;
        }
        if !update.is_bad {
            self.registry.mark_healthy(&update.key, &update.generation);
        }
        self.ledger.set_desired(&update.key, update.is_bad);
    }

    /// Write pending `is_bad` transitions; failures stay pending for the next pass
    async fn flush_status(&mut self) {
        for (key, is_bad) in self.ledger.pending() {
            match self.context.status.write(&key, is_bad).await {
                Ok(WriteOutcome::Written) => {
                    info!(name = %key.name, namespace = %key.namespace, is_bad, "Updated NooBaaSource status");
                    self.ledger.mark_written(&key, is_bad);
                    metrics::STATUS_WRITES.with_label_values(&["success"]).inc();
                    metrics::SOURCE_BAD
                        .with_label_values(&[&key.namespace, &key.name])
                        .set(if is_bad { 1.0 } else { 0.0 });
                    self.publish_health(&key, is_bad).await;
                }
                Ok(WriteOutcome::Gone) => {
                    debug!(name = %key.name, namespace = %key.namespace, "NooBaaSource gone before status write");
                    self.ledger.forget(&key);
                    metrics::STATUS_WRITES.with_label_values(&["gone"]).inc();
                }
                Err(e) => {
                    warn!(name = %key.name, namespace = %key.namespace, error = %e, "Failed to update NooBaaSource status");
                    metrics::STATUS_WRITES.with_label_values(&["error"]).inc();
                }
            }
        }
    }

    fn object_ref(&self, key: &ResourceKey) -> Option<ObjectReference> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
            .map(|resource| resource.object_ref(&()))
    }

    async fn publish_health(&self, key: &ResourceKey, is_bad: bool) {
        let Some(reference) = self.object_ref(key) else {
            return;
        };
        let (type_, reason, note) = if is_bad {
            (EventType::Warning, reasons::SOURCE_UNHEALTHY, "is_bad set to true")
        } else {
            (EventType::Normal, reasons::SOURCE_HEALTHY, "is_bad set to false")
        };
        self.context
            .events
            .publish(&reference, type_, reason, actions::REPORT_HEALTH, Some(note.to_string()))
            .await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
