//! Unit tests for CloudCluster reconciliation

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use cloudsigma_client::{CloudError, Vlan};
    use crds::*;
    use kube_runtime::controller::Action;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_claims_lowest_free_vlan() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0002");
        h.cloud.add_vlan("71a0-0001");
        h.clusters.insert(create_test_cluster("c1"));

        let action = h.reconcile_cluster("c1").await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        let status = h.cluster("c1").status.expect("status");
        assert_eq!(status.network_id(), Some("71a0-0001"));
        assert!(status.ready);

        let vlan = h.cloud.vlan("71a0-0001").expect("vlan");
        assert_eq!(vlan.meta.get("cluster-uid").map(String::as_str), Some("uid-c1"));
        assert_eq!(vlan.meta.get("cidr").map(String::as_str), Some("10.10.0.0/16"));
        assert!(h.cluster("c1").metadata.finalizers.unwrap_or_default().contains(&CLUSTER_FINALIZER.to_string()));
    }

    #[tokio::test]
    async fn test_second_cluster_gets_a_different_vlan() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0001");
        h.cloud.add_vlan("71a0-0002");
        h.clusters.insert(create_test_cluster("c1"));
        h.clusters.insert(create_test_cluster("c2"));

        h.reconcile_cluster("c1").await.expect("c1");
        h.reconcile_cluster("c2").await.expect("c2");
        let c1 = h.cluster("c1").status.and_then(|s| s.network_id);
        let c2 = h.cluster("c2").status.and_then(|s| s.network_id);
        assert_eq!(c1.as_deref(), Some("71a0-0001"));
        assert_eq!(c2.as_deref(), Some("71a0-0002"));
    }

    #[tokio::test]
    async fn test_adopts_vlan_already_tagged_with_uid() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0001");
        h.cloud.add_vlan("71a0-0002");
        let mut meta = BTreeMap::new();
        meta.insert("cluster-uid".to_string(), "uid-c1".to_string());
        h.cloud.set_vlan_meta("71a0-0002", meta);
        h.clusters.insert(create_test_cluster("c1"));

        h.reconcile_cluster("c1").await.expect("reconcile");
        assert_eq!(h.cluster("c1").status.and_then(|s| s.network_id).as_deref(), Some("71a0-0002"));
        assert_eq!(h.cloud.calls("update_vlan_meta"), 0);
    }

    #[tokio::test]
    async fn test_no_free_vlan_reports_condition() {
        let h = Harness::new();
        h.clusters.insert(create_test_cluster("c1"));

        let action = h.reconcile_cluster("c1").await.expect("reconcile");
        assert_eq!(action, Action::requeue(test_settings().poll_interval));
        let status = h.cluster("c1").status.expect("status");
        assert!(!status.ready);
        let condition = find_condition(&status.conditions, CONDITION_NETWORK_READY).expect("condition");
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "NoNetworkAvailable");
    }

    #[tokio::test]
    async fn test_lost_vlan_is_cleared_and_reclaimed() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0001");
        let mut cluster = create_test_cluster("c1");
        cluster.status = Some(CloudClusterStatus {
            network_id: Some("71a0-gone".to_string()),
            ready: true,
            conditions: Vec::new(),
        });
        h.clusters.insert(cluster);

        let action = h.reconcile_cluster("c1").await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::ZERO));
        assert_eq!(h.cluster("c1").status.and_then(|s| s.network_id), None);

        h.reconcile_cluster("c1").await.expect("reclaim");
        assert_eq!(h.cluster("c1").status.and_then(|s| s.network_id).as_deref(), Some("71a0-0001"));
    }

    #[tokio::test]
    async fn test_deletion_releases_vlan() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0001");
        h.clusters.insert(create_test_cluster("c1"));
        h.reconcile_cluster("c1").await.expect("claim");

        h.clusters.mark_deleted(Some(NAMESPACE), "c1");
        h.reconcile_cluster("c1").await.expect("delete");

        assert!(!h.clusters.contains(Some(NAMESPACE), "c1"));
        let vlan: Vlan = h.cloud.vlan("71a0-0001").expect("vlan");
        assert!(!vlan.meta.contains_key("cluster-uid"));
        assert!(!vlan.meta.contains_key("managed-by"));
    }

    #[tokio::test]
    async fn test_release_failure_keeps_finalizer() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0001");
        h.clusters.insert(create_test_cluster("c1"));
        h.reconcile_cluster("c1").await.expect("claim");

        h.clusters.mark_deleted(Some(NAMESPACE), "c1");
        h.cloud.fail_next("update_vlan_meta", CloudError::Timeout("slow".to_string()));
        h.reconcile_cluster("c1").await.expect_err("release fails");
        assert!(h.clusters.contains(Some(NAMESPACE), "c1"));
    }
}
