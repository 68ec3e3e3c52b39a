//! NooBaaSource Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NooBaaSource resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "knative.dev",
    version = "v1",
    kind = "NooBaaSource",
    plural = "noobaasources",
    singular = "noobaasource",
    namespaced,
    status = "NooBaaSourceStatus",
    printcolumn = r#"{"name": "Bucket", "type": "string", "jsonPath": ".spec.source.bucket"}"#,
    printcolumn = r#"{"name": "Bad", "type": "boolean", "jsonPath": ".status.is_bad"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NooBaaSourceSpec {
    /// Where bucket notifications come from
    pub source: SourceSpec,

    /// Where structured events are delivered
    pub sink: Destination,

    /// Overrides applied to every emitted event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ce_overrides: Option<CloudEventOverrides>,
}

/// NooBaa RPC endpoint and bucket to subscribe to
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// URL of the NooBaa management RPC service
    pub rpc_url: String,

    /// Credential for the RPC service: a secret name, `name/key`, or a raw token
    pub rpc_secret: String,

    /// Bucket name
    pub bucket: String,
}

/// Destination represents a target of an invocation over HTTP.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Destination {
    /// Points to an Addressable
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<KReference>,

    /// Absolute URI, or a URI relative to the address resolved from `ref`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Enough information to locate an Addressable
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KReference {
    /// Kind of the referent
    pub kind: String,

    /// Name of the referent
    pub name: String,

    /// Namespace of the referent, defaults to the source's namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// API version of the referent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// API group, an alternative to `apiVersion`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// CloudEvent attribute overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CloudEventOverrides {
    /// Extension attributes set on every outbound event
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

/// NooBaaSource status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NooBaaSourceStatus {
    /// Whether the bridge for this source is currently failing
    pub is_bad: bool,
}

impl NooBaaSourceSpec {
    /// Extension attributes from `ceOverrides`, empty when unset
    pub fn extensions(&self) -> BTreeMap<String, String> {
        self.ce_overrides
            .as_ref()
            .map(|o| o.extensions.clone())
            .unwrap_or_default()
    }
}

/// Identity of a NooBaaSource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl NooBaaSource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Token that changes whenever the spec changes
    pub fn spec_version(&self) -> String {
        match self.metadata.generation {
            Some(generation) => generation.to_string(),
            None => self.resource_version().unwrap_or_default(),
        }
    }

    /// The `is_bad` value last written to the status subresource, if any
    pub fn reported_is_bad(&self) -> Option<bool> {
        self.status.as_ref().map(|s| s.is_bad)
    }
}
