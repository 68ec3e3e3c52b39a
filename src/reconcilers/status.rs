//! Status reporting
//!
//! [`StatusLedger`] decides *when* a resource's `status.is_bad` needs a
//! patch; [`StatusReporter`] performs the patch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use serde_json::json;
use tracing::debug;

use crate::crd::{NooBaaSource, ResourceKey};
use crate::error::{Error, Result};

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "noobaa-source-controller";

/// Outcome of a status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The resource no longer exists
    Gone,
}

/// Writes `is_bad` onto a resource's status subresource
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn write(&self, key: &ResourceKey, is_bad: bool) -> Result<WriteOutcome>;
}

/// [`StatusReporter`] backed by the Kubernetes API
pub struct KubeStatusReporter {
    client: Client,
}

impl KubeStatusReporter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusReporter for KubeStatusReporter {
    async fn write(&self, key: &ResourceKey, is_bad: bool) -> Result<WriteOutcome> {
        let api: Api<NooBaaSource> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = json!({ "status": { "is_bad": is_bad } });

        match api
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
        {
            Ok(_) => {
                debug!(name = %key.name, namespace = %key.namespace, is_bad, "Patched status");
                Ok(WriteOutcome::Written)
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(WriteOutcome::Gone),
            Err(e) => Err(Error::StatusWrite(format!("{}: {}", key, e))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    desired: Option<bool>,
    written: Option<bool>,
}

/// Write-on-transition bookkeeping for `status.is_bad`.
///
/// A write is pending only while the desired value differs from what was
/// last written, so repeated identical signals never produce extra patches
/// and a failed patch stays pending for the next pass.
#[derive(Debug, Default)]
pub struct StatusLedger {
    entries: BTreeMap<ResourceKey, Entry>,
}

impl StatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource seen in the watch cache.
    ///
    /// The status already on the resource only seeds a new entry; later
    /// cache updates are usually our own patches echoing back.
    pub fn observe(&mut self, key: &ResourceKey, reported: Option<bool>) {
        self.entries
            .entry(key.clone())
            .or_insert(Entry {
                desired: None,
                written: reported,
            });
    }

    /// Set the value the resource should report
    pub fn set_desired(&mut self, key: &ResourceKey, is_bad: bool) {
        self.entries.entry(key.clone()).or_default().desired = Some(is_bad);
    }

    pub fn desired(&self, key: &ResourceKey) -> Option<bool> {
        self.entries.get(key).and_then(|e| e.desired)
    }

    /// Writes needed to converge, in key order
    pub fn pending(&self) -> Vec<(ResourceKey, bool)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| match entry.desired {
                Some(desired) if entry.written != Some(desired) => Some((key.clone(), desired)),
                _ => None,
            })
            .collect()
    }

    pub fn mark_written(&mut self, key: &ResourceKey, is_bad: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.written = Some(is_bad);
        }
    }

    pub fn forget(&mut self, key: &ResourceKey) {
        self.entries.remove(key);
    }

    /// Drop entries for resources no longer present
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&ResourceKey) -> bool,
    {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
