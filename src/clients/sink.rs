//! Sink resolution and structured event delivery

use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery, Api, Client,
};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::crd::{Destination, KReference};
use crate::error::{Error, Result};
use crate::metrics;
use crate::transform::StructuredEvent;

/// Content type for structured-mode CloudEvents
pub const CLOUDEVENTS_JSON: &str = "application/cloudevents+json; charset=utf-8";

/// Resolves sinks and pushes single events to them
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Resolve a destination to an absolute URI
    async fn resolve(&self, namespace: &str, sink: &Destination) -> Result<String>;

    /// One delivery attempt; failures carry their transient/permanent class
    async fn deliver(&self, uri: &str, event: &StructuredEvent) -> Result<()>;
}

/// How hard to try a single event before giving up on it
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::delivery(),
        }
    }
}

/// How [`deliver_with_retry`] ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Cancelled before a retry could be made; the event was not delivered
    Cancelled,
}

/// Deliver with bounded retry of transient failures.
///
/// Permanent failures return immediately. Once `cancel` fires no further
/// attempt is started, but an attempt already in flight runs to completion.
pub async fn deliver_with_retry(
    client: &dyn SinkClient,
    uri: &str,
    event: &StructuredEvent,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Delivery> {
    let mut backoff = Backoff::new(policy.backoff);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let started = Instant::now();
        let result = client.deliver(uri, event).await;
        metrics::DELIVERY_DURATION.observe(started.elapsed().as_secs_f64());

        let err = match result {
            Ok(()) => return Ok(Delivery::Delivered),
            Err(e) => e,
        };
        if !err.is_transient() || attempt >= max_attempts {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Ok(Delivery::Cancelled);
        }

        let delay = backoff.next_delay();
        debug!(
            id = %event.id,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient delivery failure, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Delivery::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Classify a sink response status; `None` means delivered
pub fn classify_response(status: StatusCode) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    let message = format!("sink responded {}", status);
    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    Some(if transient {
        Error::transient_delivery(message)
    } else {
        Error::permanent_delivery(message)
    })
}

/// Combine an optional resolved address with `sink.uri`
pub fn resolve_uri(sink: &Destination, addressable: Option<&str>) -> Result<String> {
    let uri = sink.uri.as_deref().map(str::trim).filter(|u| !u.is_empty());
    match (addressable, uri) {
        (Some(base), None) => parse_absolute(base).map(String::from),
        (Some(base), Some(relative)) => {
            let base = parse_absolute(base)?;
            base.join(relative)
                .map(String::from)
                .map_err(|e| Error::unresolved_sink(format!("invalid sink uri '{}': {}", relative, e)))
        }
        (None, Some(uri)) => parse_absolute(uri).map(String::from),
        (None, None) => Err(Error::unresolved_sink("sink has neither ref nor uri")),
    }
}

fn parse_absolute(uri: &str) -> Result<Url> {
    let url = Url::parse(uri)
        .map_err(|e| Error::unresolved_sink(format!("invalid sink uri '{}': {}", uri, e)))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(Error::unresolved_sink(format!(
            "sink uri '{}' is not an absolute URL",
            uri
        )));
    }
    Ok(url)
}

/// Split a reference's `apiVersion` into (group, version)
pub fn group_version(reference: &KReference) -> Option<(String, String)> {
    let api_version = reference.api_version.as_deref()?.trim();
    if api_version.is_empty() {
        return None;
    }
    Some(match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    })
}

/// In-cluster address of a core `Service`
pub fn service_url(name: &str, namespace: &str) -> String {
    format!("http://{}.{}.svc.cluster.local/", name, namespace)
}

/// `status.address.url` of an Addressable
pub fn addressable_url(data: &Value) -> Option<&str> {
    data.get("status")?
        .get("address")?
        .get("url")?
        .as_str()
        .filter(|u| !u.is_empty())
}

/// Resolves references through the API server and delivers over HTTP
#[derive(Clone)]
pub struct HttpSinkClient {
    http: reqwest::Client,
    kube: Client,
}

impl HttpSinkClient {
    pub fn new(kube: Client, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, kube })
    }

    async fn resolve_ref(&self, namespace: &str, reference: &KReference) -> Result<String> {
        let namespace = reference.namespace.as_deref().unwrap_or(namespace);
        let unresolved = |msg: String| {
            Error::unresolved_sink(format!(
                "{} {}/{}: {}",
                reference.kind, namespace, reference.name, msg
            ))
        };

        let resource = match group_version(reference) {
            Some((group, version)) => {
                if group.is_empty() && reference.kind == "Service" {
                    return Ok(service_url(&reference.name, namespace));
                }
                ApiResource::from_gvk(&GroupVersionKind::gvk(&group, &version, &reference.kind))
            }
            None => {
                let group = reference
                    .group
                    .as_deref()
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| unresolved("ref needs apiVersion or group".to_string()))?;
                let api_group = discovery::group(&self.kube, group)
                    .await
                    .map_err(|e| unresolved(e.to_string()))?;
                let (resource, _caps) = api_group
                    .recommended_kind(&reference.kind)
                    .ok_or_else(|| unresolved(format!("kind not served by group {}", group)))?;
                resource
            }
        };

        let api: Api<DynamicObject> = Api::namespaced_with(self.kube.clone(), namespace, &resource);
        let object = api.get(&reference.name).await.map_err(|e| unresolved(e.to_string()))?;
        addressable_url(&object.data)
            .map(str::to_string)
            .ok_or_else(|| unresolved("addressable has no status.address.url".to_string()))
    }
}

#[async_trait]
impl SinkClient for HttpSinkClient {
    async fn resolve(&self, namespace: &str, sink: &Destination) -> Result<String> {
        let addressable = match &sink.reference {
            Some(reference) => Some(self.resolve_ref(namespace, reference).await?),
            None => None,
        };
        resolve_uri(sink, addressable.as_deref())
    }

    async fn deliver(&self, uri: &str, event: &StructuredEvent) -> Result<()> {
        let response = self
            .http
            .post(uri)
            .header(reqwest::header::CONTENT_TYPE, CLOUDEVENTS_JSON)
            .json(event)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    Error::permanent_delivery(e.to_string())
                } else {
                    Error::transient_delivery(e.to_string())
                }
            })?;

        match classify_response(response.status()) {
            None => Ok(()),
            Some(err) => {
                warn!(uri = %uri, id = %event.id, error = %err, "Sink rejected event");
                Err(err)
            }
        }
    }
}
