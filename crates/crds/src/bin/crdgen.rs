//! Prints the CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/bases.yaml`

use crds::{CloudCluster, CloudMachine};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [CloudMachine::crd(), CloudCluster::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
