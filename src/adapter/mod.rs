//! Per-resource adapters
//!
//! An [`Adapter`] owns the bridge for exactly one NooBaaSource. It is built
//! from a frozen [`AdapterSpec`] and never mutated; a spec change means a new
//! adapter.

pub mod health;
mod worker;

pub use health::HealthTracker;
pub use worker::{Adapter, AdapterDeps, AdapterSettings, AdapterSpec, HealthUpdate};
