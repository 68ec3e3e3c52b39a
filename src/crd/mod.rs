//! Custom Resource Definitions for the NooBaaSource controller

mod noobaa_source;

pub use noobaa_source::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&NooBaaSource::crd()).unwrap()]
}
