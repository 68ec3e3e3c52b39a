//! NooBaaSource controller
//!
//! Watches NooBaaSource resources and, for each one, runs an adapter that
//! subscribes to a NooBaa bucket's notifications and delivers them to a sink
//! as CloudEvents, reporting the bridge's health on the resource's status.

pub mod adapter;
pub mod backoff;
pub mod clients;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod transform;

pub use error::{Error, Result};
