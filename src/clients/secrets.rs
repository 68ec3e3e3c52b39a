//! Credential resolution for `source.rpcSecret`
//!
//! The value names a Secret in the source's namespace (`name` or
//! `name/key`, key defaulting to [`DEFAULT_SECRET_KEY`]). When no such Secret
//! exists the value itself is the credential.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::error::{Error, Result};

/// Secret data key read when `rpcSecret` does not name one
pub const DEFAULT_SECRET_KEY: &str = "token";

/// Turns an `rpcSecret` value into the credential sent to the RPC service
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, namespace: &str, rpc_secret: &str) -> Result<String>;
}

/// A parsed Secret reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

impl SecretRef {
    /// Parse `name` or `name/key`; `None` when the value cannot be a Secret name
    pub fn parse(value: &str) -> Option<SecretRef> {
        let (name, key) = match value.split_once('/') {
            Some((name, key)) => (name, key),
            None => (value, DEFAULT_SECRET_KEY),
        };
        if !is_dns_subdomain(name) || key.is_empty() || key.contains('/') {
            return None;
        }
        Some(SecretRef {
            name: name.to_string(),
            key: key.to_string(),
        })
    }
}

fn is_dns_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && name
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric())
        && name
            .bytes()
            .last()
            .is_some_and(|b| b.is_ascii_alphanumeric())
}

/// Resolves credentials from Kubernetes Secrets
#[derive(Clone)]
pub struct KubeCredentialResolver {
    client: Client,
}

impl KubeCredentialResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialResolver for KubeCredentialResolver {
    async fn resolve(&self, namespace: &str, rpc_secret: &str) -> Result<String> {
        let Some(secret_ref) = SecretRef::parse(rpc_secret) else {
            return Ok(rpc_secret.to_string());
        };
        match get_secret(&self.client, &secret_ref.name, namespace).await {
            Ok(secret) => get_secret_string(&secret, &secret_ref.key),
            Err(Error::SecretNotFound(_)) => {
                debug!(namespace = %namespace, "rpcSecret does not name a Secret, using it as the credential");
                Ok(rpc_secret.to_string())
            }
            Err(e) => Err(e),
        }
    }
}

/// Fetch a secret from Kubernetes
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.get(name).await.map_err(|e| match e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            Error::SecretNotFound(format!("{}/{}", namespace, name))
        }
        other => Error::Kube(other),
    })
}

/// Get a string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    };

    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.trim().to_string());
    }
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(missing)?;

    String::from_utf8(bytes.0.clone())
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}
