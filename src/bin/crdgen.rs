//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the NooBaaSource
//! custom resource watched by the controller.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/noobaasource.yaml

use noobaa_source_controller::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
