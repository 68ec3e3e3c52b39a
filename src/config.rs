//! Controller configuration, read once at startup from flags or environment

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::adapter::AdapterSettings;
use crate::backoff::BackoffPolicy;
use crate::clients::RetryPolicy;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// NooBaaSource controller
#[derive(Parser, Debug, Clone)]
#[command(name = "noobaa-source-controller", version, about)]
pub struct Config {
    /// Only watch NooBaaSources in this namespace (cluster-wide when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Port for /metrics, /health and /ready
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Seconds between full reconcile passes without watch activity
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Consecutive failures before a source is reported bad
    #[arg(long, env = "FAILURE_THRESHOLD", default_value_t = 3)]
    pub failure_threshold: u32,

    /// Attempts per event before it is dropped
    #[arg(long, env = "DELIVERY_MAX_ATTEMPTS", default_value_t = 5)]
    pub delivery_max_attempts: u32,

    /// Timeout for a single sink or RPC request
    #[arg(long, env = "DELIVERY_TIMEOUT_SECS", default_value_t = 10)]
    pub delivery_timeout_secs: u64,

    /// How long a stopping adapter may take before it is aborted
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            failure_threshold: self.failure_threshold,
            delivery: RetryPolicy {
                max_attempts: self.delivery_max_attempts.max(1),
                backoff: BackoffPolicy::delivery(),
            },
            ..AdapterSettings::default()
        }
    }
}
