//! Reconciler for NooBaaSource resources
//!
//! This module contains the business logic that keeps adapters in step with
//! resources. It is responsible for:
//! - Validating NooBaaSource specs
//! - Diffing desired resources against running adapters
//! - Deciding when resource status needs updating
//! - Publishing Events about health and start failures

pub mod events;
pub mod noobaa_source;
pub mod status;

pub use events::{EventPublisher, KubeEventPublisher};
pub use noobaa_source::{plan, validate, AdapterAction, Desired, Plan, Running, SlotState};
pub use status::{KubeStatusReporter, StatusLedger, StatusReporter, WriteOutcome};
