//! NooBaaSource reconciler
//!
//! Handles the business logic of converging adapters onto resources:
//! - Spec validation
//! - The desired-vs-running diff ([`plan`])

use std::collections::{BTreeMap, BTreeSet};

use reqwest::Url;
use tokio::time::Instant;

use crate::crd::{NooBaaSource, ResourceKey};
use crate::error::{Error, Result};

/// Validate the NooBaaSource spec
pub fn validate(source: &NooBaaSource) -> Result<()> {
    let spec = &source.spec;

    if spec.source.bucket.trim().is_empty() {
        return Err(Error::validation("source.bucket must not be empty"));
    }
    if spec.source.rpc_secret.trim().is_empty() {
        return Err(Error::validation("source.rpcSecret must not be empty"));
    }
    let rpc_url = spec.source.rpc_url.trim();
    if rpc_url.is_empty() {
        return Err(Error::validation("source.rpcUrl must not be empty"));
    }
    let parsed = Url::parse(rpc_url).map_err(|e| {
        Error::validation(format!("Invalid source.rpcUrl '{}': {}", rpc_url, e))
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::validation(format!(
                "Invalid source.rpcUrl scheme '{}': must be one of: http, https",
                other
            )));
        }
    }

    validate_sink(source)
}

/// Validate the sink shape; the URI itself is only resolved at start
fn validate_sink(source: &NooBaaSource) -> Result<()> {
    let sink = &source.spec.sink;
    let uri = sink.uri.as_deref().map(str::trim).filter(|u| !u.is_empty());

    match (&sink.reference, uri) {
        (None, None) => Err(Error::validation("sink must set either ref or uri")),
        (None, Some(uri)) => {
            let parsed = Url::parse(uri)
                .map_err(|e| Error::validation(format!("Invalid sink.uri '{}': {}", uri, e)))?;
            if parsed.host_str().is_none() {
                return Err(Error::validation(format!(
                    "Invalid sink.uri '{}': must be absolute when sink.ref is not set",
                    uri
                )));
            }
            Ok(())
        }
        (Some(reference), _) => {
            if reference.kind.trim().is_empty() || reference.name.trim().is_empty() {
                return Err(Error::validation("sink.ref requires kind and name"));
            }
            let has_version = reference
                .api_version
                .as_deref()
                .is_some_and(|v| !v.trim().is_empty());
            let has_group = reference
                .group
                .as_deref()
                .is_some_and(|g| !g.trim().is_empty());
            if !has_version && !has_group {
                return Err(Error::validation("sink.ref requires apiVersion or group"));
            }
            Ok(())
        }
    }
}

/// A resource as seen in the watch cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Desired {
    pub key: ResourceKey,
    pub generation: String,
}

impl Desired {
    pub fn from_resource(resource: &NooBaaSource) -> Self {
        Self {
            key: resource.key(),
            generation: resource.spec_version(),
        }
    }
}

/// What the registry holds for one identity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// An adapter task is live
    Active,
    /// The last start failed; do not retry before `retry_at`
    Failed { retry_at: Instant },
}

/// One registry entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Running {
    pub key: ResourceKey,
    pub generation: String,
    pub state: SlotState,
}

/// Step needed to converge one identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterAction {
    /// Nothing is running for this identity
    Start(ResourceKey),
    /// Something is running (or failed) for an outdated or retryable spec
    Restart(ResourceKey),
    /// The resource is gone
    Stop(ResourceKey),
}

impl AdapterAction {
    pub fn key(&self) -> &ResourceKey {
        match self {
            AdapterAction::Start(key) | AdapterAction::Restart(key) | AdapterAction::Stop(key) => {
                key
            }
        }
    }
}

/// Result of one diff
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<AdapterAction>,
    /// Earliest time a backed-off start becomes due
    pub next_retry: Option<Instant>,
}

/// Diff the desired set against the running set.
///
/// Pure: identical inputs always yield the same plan. Applying every action
/// leaves exactly one adapter per desired identity, built from its current
/// generation, and none for identities that are gone.
pub fn plan(desired: &[Desired], running: &[Running], now: Instant) -> Plan {
    let running_by_key: BTreeMap<&ResourceKey, &Running> =
        running.iter().map(|r| (&r.key, r)).collect();
    let desired_keys: BTreeSet<&ResourceKey> = desired.iter().map(|d| &d.key).collect();

    let mut result = Plan::default();

    for want in desired {
        let Some(have) = running_by_key.get(&want.key) else {
            result.actions.push(AdapterAction::Start(want.key.clone()));
            continue;
        };
        if have.generation != want.generation {
            result.actions.push(AdapterAction::Restart(want.key.clone()));
            continue;
        }
        if let SlotState::Failed { retry_at } = have.state {
            if retry_at <= now {
                result.actions.push(AdapterAction::Restart(want.key.clone()));
            } else {
                result.next_retry = Some(match result.next_retry {
                    Some(earliest) => earliest.min(retry_at),
                    None => retry_at,
                });
            }
        }
    }

    for have in running {
        if !desired_keys.contains(&have.key) {
            result.actions.push(AdapterAction::Stop(have.key.clone()));
        }
    }

    result
}
