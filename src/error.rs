//! Error types for the NooBaaSource controller

use std::fmt;

use thiserror::Error;

/// Result type alias using the controller's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Controller error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The RPC service rejected the credential
    #[error("RPC authentication failed: {0}")]
    Auth(String),

    /// Transient network failure talking to the RPC service
    #[error("RPC network error: {0}")]
    Network(String),

    /// The notification stream ended or broke mid-flight
    #[error("RPC connection lost: {0}")]
    ConnectionLost(String),

    /// The sink could not be resolved to a destination URI
    #[error("Unresolved sink: {0}")]
    UnresolvedSink(String),

    /// Delivery to the sink failed
    #[error("{class} delivery error: {message}")]
    Delivery { class: DeliveryClass, message: String },

    /// Status subresource patch failed
    #[error("Status write failed: {0}")]
    StatusWrite(String),

    /// An adapter task ended without being asked to
    #[error("Adapter exited: {0}")]
    AdapterExited(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a failed delivery may succeed on redelivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    Transient,
    Permanent,
}

impl fmt::Display for DeliveryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryClass::Transient => f.write_str("Transient"),
            DeliveryClass::Permanent => f.write_str("Permanent"),
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Create a connection-lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Error::ConnectionLost(msg.into())
    }

    /// Create an unresolved sink error
    pub fn unresolved_sink(msg: impl Into<String>) -> Self {
        Error::UnresolvedSink(msg.into())
    }

    /// Create a transient delivery error (eligible for retry)
    pub fn transient_delivery(msg: impl Into<String>) -> Self {
        Error::Delivery {
            class: DeliveryClass::Transient,
            message: msg.into(),
        }
    }

    /// Create a permanent delivery error (never retried)
    pub fn permanent_delivery(msg: impl Into<String>) -> Self {
        Error::Delivery {
            class: DeliveryClass::Permanent,
            message: msg.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::ConnectionLost(_) => true,
            Error::Delivery { class, .. } => *class == DeliveryClass::Transient,
            Error::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::Kube(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Auth(_) => "auth",
            Error::Network(_) => "network",
            Error::ConnectionLost(_) => "connection_lost",
            Error::UnresolvedSink(_) => "unresolved_sink",
            Error::Delivery {
                class: DeliveryClass::Transient,
                ..
            } => "delivery_transient",
            Error::Delivery {
                class: DeliveryClass::Permanent,
                ..
            } => "delivery_permanent",
            Error::StatusWrite(_) => "status_write",
            Error::AdapterExited(_) => "adapter_exited",
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::SecretNotFound(_) | Error::SecretKeyNotFound { .. } => "secret",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}
