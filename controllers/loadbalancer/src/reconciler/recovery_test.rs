//! Unit tests for startup recovery and the orphan sweep

#[cfg(test)]
mod tests {
    use crate::forwarding::ForwardingUnit;
    use crate::pool::PoolStats;
    use crate::reconciler::recovery::RecoveryReport;
    use crate::test_utils::*;
    use cloudsigma_client::CloudClientTrait;
    use cloudsigma_client::ownership::{ip_is_tagged, ip_owner, ip_tags};

    async fn bound(names: &[&str]) -> Harness {
        let h = Harness::with_nodes();
        h.cloud.add_ip("203.0.113.12", true);
        for name in names {
            h.add_service(name);
            h.reconcile(name).await.expect("bind");
        }
        h
    }

    #[tokio::test]
    async fn test_restart_rebuilds_identical_bindings() {
        let mut h = bound(&["a", "b", "c"]).await;
        let before = h.reconciler.bindings.all();
        let tag_writes = h.cloud.calls("update_ip_meta");
        let server_writes = h.cloud.calls("update_server");
        let units_created = h.forwarder.created();

        h.restart();
        assert_eq!(h.reconciler.bindings.len(), 0);
        let report = h.reconciler.recover().await.expect("recover");

        assert_eq!(report, RecoveryReport { rebuilt: 3, reasserted: 3, released: 0 });
        assert_eq!(h.reconciler.bindings.all(), before);
        assert_eq!(h.cloud.calls("update_ip_meta"), tag_writes);
        assert_eq!(h.cloud.calls("update_server"), server_writes);
        assert_eq!(h.forwarder.created(), units_created);
        assert_eq!(h.reconciler.metrics.bound_services.get(), 3);
    }

    #[tokio::test]
    async fn test_recovery_reasserts_lost_units() {
        let mut h = bound(&["web"]).await;

        h.restart();
        h.forwarder.wipe();
        let report = h.reconciler.recover().await.expect("recover");

        assert_eq!(report.rebuilt, 1);
        let unit = h.forwarder.unit("fip-203-0-113-10-n1").expect("unit recreated");
        assert_eq!(unit.service, "default/web");
        assert_eq!(h.ingress("web").as_deref(), Some("203.0.113.10"));
    }

    #[tokio::test]
    async fn test_status_alone_is_not_trusted() {
        let mut h = bound(&["web"]).await;
        h.cloud
            .update_ip_meta("203.0.113.10", &ip_tags("staging", "default/web"))
            .await
            .unwrap();

        h.restart();
        let report = h.reconciler.recover().await.expect("recover");

        assert_eq!(report.rebuilt, 0);
        assert_eq!(h.ingress("web").as_deref(), Some("203.0.113.11"));
        let ip = h.cloud.ip("203.0.113.11").unwrap();
        assert_eq!(ip_owner(&ip.meta, CLUSTER), Some("default/web"));
    }

    #[tokio::test]
    async fn test_orphans_are_swept() {
        let h = bound(&["web"]).await;
        h.cloud
            .update_ip_meta("203.0.113.11", &ip_tags(CLUSTER, "default/ghost"))
            .await
            .unwrap();
        h.forwarder.plant(ForwardingUnit {
            name: "fip-203-0-113-11-n2".to_string(),
            node: "n2".to_string(),
            service: "default/ghost".to_string(),
            signature: "203.0.113.11:80/tcp@n2->10.96.0.20:80".to_string(),
        });

        let released = h.reconciler.collect_garbage().await.expect("sweep");

        assert_eq!(released, 1);
        assert!(!ip_is_tagged(&h.cloud.ip("203.0.113.11").unwrap().meta));
        assert!(h.forwarder.unit("fip-203-0-113-11-n2").is_none());
        assert!(h.forwarder.unit("fip-203-0-113-10-n1").is_some());
    }

    #[tokio::test]
    async fn test_sweep_forgets_backoff_of_vanished_services() {
        let h = bound(&["a"]).await;
        h.reconciler.backoff.record_failure("default/a");
        h.reconciler.backoff.record_failure("default/gone");

        h.reconciler.discover().await.expect("discover");

        assert_eq!(h.reconciler.backoff.error_count("default/a"), 1);
        assert_eq!(h.reconciler.backoff.error_count("default/gone"), 0);
    }

    #[tokio::test]
    async fn test_discovery_reports_pools() {
        let h = bound(&["web"]).await;

        let stats = h.reconciler.discover().await.expect("discover");
        assert_eq!(stats, PoolStats {
            static_total: 3,
            static_free: 2,
            dynamic_total: 1,
            dynamic_free: 1,
            owned: 1,
        });
    }
}
