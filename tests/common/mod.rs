//! In-memory fakes for the RPC service, the sink, credentials and status

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use serde_json::json;

use noobaa_source_controller::adapter::AdapterDeps;
use noobaa_source_controller::clients::{
    CredentialResolver, Notification, NotificationStream, RpcConnection, RpcConnector, SinkClient,
};
use noobaa_source_controller::crd::{
    Destination, NooBaaSource, NooBaaSourceSpec, ResourceKey, SourceSpec,
};
use noobaa_source_controller::error::{Error, Result};
use noobaa_source_controller::reconcilers::{EventPublisher, StatusReporter, WriteOutcome};
use noobaa_source_controller::transform::StructuredEvent;

// ============================================================================
// RPC
// ============================================================================

/// Accepts one credential and replays queued notifications on subscribe
#[derive(Default)]
pub struct FakeRpc {
    pub valid_secret: Mutex<String>,
    pub queued: Mutex<Vec<Notification>>,
    /// Next subscription drops after this many notifications
    pub lose_after: Mutex<Option<usize>>,
    pub connects: AtomicUsize,
    pub auth_failures: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeRpc {
    pub fn new(valid_secret: &str) -> Arc<Self> {
        Arc::new(Self {
            valid_secret: Mutex::new(valid_secret.to_string()),
            ..Default::default()
        })
    }

    pub fn push(&self, notification: Notification) {
        self.queued.lock().unwrap().push(notification);
    }

    pub fn lose_connection_after(&self, delivered: usize) {
        *self.lose_after.lock().unwrap() = Some(delivered);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcConnector for FakeRpc {
    async fn connect(&self, _url: &str, secret: &str) -> Result<Box<dyn RpcConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if *self.valid_secret.lock().unwrap() != secret {
            self.auth_failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::auth("invalid credentials"));
        }
        let mut pending = self.queued.lock().unwrap();
        let (queued, lost) = match self.lose_after.lock().unwrap().take() {
            Some(n) => {
                let n = n.min(pending.len());
                (pending.drain(..n).collect(), true)
            }
            None => (std::mem::take(&mut *pending), false),
        };
        Ok(Box::new(FakeConnection {
            queued,
            lost,
            closes: self.closes.clone(),
        }))
    }
}

struct FakeConnection {
    queued: Vec<Notification>,
    lost: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RpcConnection for FakeConnection {
    async fn subscribe(&mut self, _bucket: &str) -> Result<NotificationStream> {
        let items = stream::iter(std::mem::take(&mut self.queued).into_iter().map(Ok));
        if self.lost {
            let reset = stream::once(async { Err(Error::connection_lost("connection reset")) });
            return Ok(items.chain(reset).boxed());
        }
        Ok(items.chain(stream::pending()).boxed())
    }

    async fn close(self: Box<Self>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn notification(key: &str) -> Notification {
    Notification {
        id: None,
        key: key.to_string(),
        event_name: Some("ObjectCreated:Put".to_string()),
        time: None,
        payload: json!({ "key": key }),
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Records deliveries and answers from a script (success once exhausted)
#[derive(Default)]
pub struct FakeSink {
    pub script: Mutex<VecDeque<Result<()>>>,
    pub delay: Mutex<Duration>,
    pub delivered: Mutex<Vec<(String, StructuredEvent)>>,
    pub log: Mutex<Vec<String>>,
    pub attempts: AtomicUsize,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(script: Vec<Result<()>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(String, StructuredEvent)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SinkClient for FakeSink {
    async fn resolve(&self, _namespace: &str, sink: &Destination) -> Result<String> {
        sink.uri
            .clone()
            .ok_or_else(|| Error::unresolved_sink("no uri"))
    }

    async fn deliver(&self, uri: &str, event: &StructuredEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let subject = event.subject.clone().unwrap_or_default();
        self.log.lock().unwrap().push(format!("start:{}", subject));

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.log.lock().unwrap().push(format!("end:{}", subject));
        if outcome.is_ok() {
            self.delivered
                .lock()
                .unwrap()
                .push((uri.to_string(), event.clone()));
        }
        outcome
    }
}

// ============================================================================
// Credentials, status and events
// ============================================================================

/// Uses `rpcSecret` verbatim
pub struct RawCredentials;

#[async_trait]
impl CredentialResolver for RawCredentials {
    async fn resolve(&self, _namespace: &str, rpc_secret: &str) -> Result<String> {
        Ok(rpc_secret.to_string())
    }
}

#[derive(Default)]
pub struct FakeStatus {
    pub writes: Mutex<Vec<(ResourceKey, bool)>>,
}

impl FakeStatus {
    pub fn writes(&self) -> Vec<(ResourceKey, bool)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusReporter for FakeStatus {
    async fn write(&self, key: &ResourceKey, is_bad: bool) -> Result<WriteOutcome> {
        self.writes.lock().unwrap().push((key.clone(), is_bad));
        Ok(WriteOutcome::Written)
    }
}

/// Records published Events as (name, type, reason)
#[derive(Default)]
pub struct FakeEvents {
    pub published: Mutex<Vec<(String, EventType, String)>>,
}

impl FakeEvents {
    pub fn published(&self) -> Vec<(String, EventType, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.published().into_iter().map(|(_, _, reason)| reason).collect()
    }
}

#[async_trait]
impl EventPublisher for FakeEvents {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.published.lock().unwrap().push((
            reference.name.clone().unwrap_or_default(),
            type_,
            reason.to_string(),
        ));
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn deps(rpc: Arc<FakeRpc>, sink: Arc<FakeSink>) -> AdapterDeps {
    AdapterDeps {
        rpc,
        sink,
        credentials: Arc::new(RawCredentials),
    }
}

pub fn source_spec(bucket: &str, secret: &str, sink_uri: &str) -> NooBaaSourceSpec {
    NooBaaSourceSpec {
        source: SourceSpec {
            rpc_url: "http://noobaa-mgmt:8080/rpc".to_string(),
            rpc_secret: secret.to_string(),
            bucket: bucket.to_string(),
        },
        sink: Destination {
            reference: None,
            uri: Some(sink_uri.to_string()),
        },
        ce_overrides: None,
    }
}

pub fn source(name: &str, generation: i64, spec: NooBaaSourceSpec) -> NooBaaSource {
    NooBaaSource {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Poll `condition` until it holds; time is paused in these tests so this
/// advances the clock in small steps
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}
