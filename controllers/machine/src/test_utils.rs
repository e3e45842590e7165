//! Test utilities for unit testing reconcilers
//!
//! A `Harness` wires a `Reconciler` to the in-memory cloud and record
//! stores so tests can drive reconciles and inspect both sides.

use crate::reconciler::{ReconcileSettings, Reconciler};
use cloudsigma_client::{MockCloudClient, MockProvider};
use controller_common::Metrics;
use controller_common::testing::MemoryStore;
use crds::*;
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "default";

/// Library image every test machine clones from
pub const IMAGE: &str = "11111111-0000-0000-0000-000000000001";

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Fast polling so wait loops finish quickly
pub fn test_settings() -> ReconcileSettings {
    ReconcileSettings {
        clone_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(1),
        resync_interval: Duration::from_secs(300),
    }
}

pub struct Harness {
    pub cloud: MockCloudClient,
    pub provider: MockProvider,
    pub machines: MemoryStore<CloudMachine>,
    pub clusters: MemoryStore<CloudCluster>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: ReconcileSettings) -> Self {
        let cloud = MockCloudClient::new("zrh");
        cloud.add_image(IMAGE, 5 * GIB);
        let provider = MockProvider::new(cloud.clone());
        let machines = MemoryStore::<CloudMachine>::new();
        let clusters = MemoryStore::<CloudCluster>::new();
        let reconciler = Reconciler::new(
            Arc::new(provider.clone()),
            Arc::new(machines.clone()),
            Arc::new(clusters.clone()),
            Metrics::new().expect("metrics"),
            settings,
        );
        Self {
            cloud,
            provider,
            machines,
            clusters,
            reconciler: Arc::new(reconciler),
        }
    }

    /// Current stored copy of a machine
    pub fn machine(&self, name: &str) -> CloudMachine {
        self.machines.snapshot(Some(NAMESPACE), name).expect("machine exists")
    }

    /// Current status of a machine
    pub fn machine_status(&self, name: &str) -> CloudMachineStatus {
        self.machine(name).status.unwrap_or_default()
    }

    /// Current stored copy of a cluster
    pub fn cluster(&self, name: &str) -> CloudCluster {
        self.clusters.snapshot(Some(NAMESPACE), name).expect("cluster exists")
    }

    /// Reconcile the stored copy of a machine
    pub async fn reconcile_machine(&self, name: &str) -> Result<kube_runtime::controller::Action, crate::error::ControllerError> {
        let machine = self.machine(name);
        self.reconciler.reconcile_machine(&machine).await
    }

    /// Reconcile the stored copy of a cluster
    pub async fn reconcile_cluster(&self, name: &str) -> Result<kube_runtime::controller::Action, crate::error::ControllerError> {
        let cluster = self.cluster(name);
        self.reconciler.reconcile_cluster(&cluster).await
    }
}

/// Machine with one 10 GiB disk cloned from `IMAGE`
pub fn create_test_machine(name: &str) -> CloudMachine {
    let mut machine = CloudMachine::new(
        name,
        CloudMachineSpec {
            cpu_mhz: 2000,
            memory_mb: 4096,
            disks: vec![DiskSpec {
                size_bytes: 10 * GIB,
                source_image_id: Some(IMAGE.to_string()),
            }],
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine
}

/// Machine without disks
pub fn create_bare_machine(name: &str) -> CloudMachine {
    let mut machine = CloudMachine::new(
        name,
        CloudMachineSpec {
            cpu_mhz: 2000,
            memory_mb: 4096,
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine
}

pub fn create_test_cluster(name: &str) -> CloudCluster {
    let mut cluster = CloudCluster::new(
        name,
        CloudClusterSpec {
            region: "zrh".to_string(),
            network_cidr: "10.10.0.0/16".to_string(),
            identity: None,
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster
}
