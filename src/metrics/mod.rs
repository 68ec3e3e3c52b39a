//! Prometheus metrics and health endpoints for the NooBaaSource controller
//!
//! This module exposes metrics for monitoring controller and adapter
//! behaviour, plus the liveness/readiness probes.

mod prometheus;
mod state;

pub use prometheus::*;
pub use state::{Diagnostics, ServerState};
