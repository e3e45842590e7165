//! Unit tests for CloudMachine reconciliation

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::reconciler::MAX_STATUS_RETRIES;
    use crate::reconciler::machine::record_instance;
    use crate::test_utils::*;
    use cloudsigma_client::ownership::machine_meta;
    use cloudsigma_client::mock::fixture_server;
    use cloudsigma_client::{CloudError, ServerStatus};
    use crds::*;
    use kube_runtime::controller::Action;
    use std::time::Duration;

    fn owned_server(uuid: &str, name: &str) -> cloudsigma_client::Server {
        let mut server = fixture_server(uuid, name);
        server.meta = machine_meta(name, &format!("uid-{name}"));
        server
    }

    #[tokio::test]
    async fn test_first_reconcile_binds_server_and_ready_follows_running() {
        let h = Harness::new();
        h.machines.insert(create_bare_machine("w1"));

        h.reconcile_machine("w1").await.expect("reconcile");
        let status = h.machine_status("w1");
        let instance_id = status.instance_id().expect("instance id").to_string();
        assert!(!status.ready);
        assert_eq!(status.instance_state, Some(InstanceState::Starting));

        let server = h.cloud.server(&instance_id).expect("server exists");
        assert_eq!(server.cpu, 2000);
        assert_eq!(server.mem, 4096 * 1024 * 1024);
        assert_eq!(server.meta.get("machine-uid").map(String::as_str), Some("uid-w1"));

        h.cloud.set_server_status(&instance_id, ServerStatus::Running);
        let action = h.reconcile_machine("w1").await.expect("reconcile");
        let status = h.machine_status("w1");
        assert!(status.ready);
        assert_eq!(status.instance_state, Some(InstanceState::Running));
        assert_eq!(status.provider_id, Some(format!("cloudsigma://{instance_id}")));
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_finalizer_added_before_creation() {
        let h = Harness::new();
        h.machines.insert(create_bare_machine("w1"));
        h.reconcile_machine("w1").await.expect("reconcile");
        assert!(h.machine("w1").metadata.finalizers.unwrap_or_default().contains(&MACHINE_FINALIZER.to_string()));
    }

    #[tokio::test]
    async fn test_reconcile_with_existing_server_is_idempotent() {
        let h = Harness::new();
        h.machines.insert(create_test_machine("w1"));

        h.reconcile_machine("w1").await.expect("first reconcile");
        assert_eq!(h.cloud.create_server_calls(), 1);
        assert_eq!(h.cloud.clone_drive_calls(), 1);

        h.reconcile_machine("w1").await.expect("second reconcile");
        h.reconcile_machine("w1").await.expect("third reconcile");
        assert_eq!(h.cloud.create_server_calls(), 1);
        assert_eq!(h.cloud.clone_drive_calls(), 1);
        assert_eq!(h.cloud.servers().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_owned_server_is_adopted_without_create() {
        let h = Harness::new();
        h.cloud.add_server(owned_server("5e7a-existing", "w1"));
        h.machines.insert(create_test_machine("w1"));

        h.reconcile_machine("w1").await.expect("reconcile");
        assert_eq!(h.machine_status("w1").instance_id(), Some("5e7a-existing"));
        assert_eq!(h.cloud.create_server_calls(), 0);
        assert_eq!(h.cloud.clone_drive_calls(), 0);
    }

    #[tokio::test]
    async fn test_server_of_another_machine_with_same_name_is_ignored() {
        let h = Harness::new();
        let mut foreign = fixture_server("5e7a-foreign", "w1");
        foreign.meta = machine_meta("w1", "uid-someone-else");
        h.cloud.add_server(foreign);
        h.machines.insert(create_bare_machine("w1"));

        h.reconcile_machine("w1").await.expect("reconcile");
        assert_ne!(h.machine_status("w1").instance_id(), Some("5e7a-foreign"));
        assert_eq!(h.cloud.create_server_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_creates_one_server() {
        let h = Harness::new();
        let machine = h.machines.insert(create_test_machine("w1"));

        let (a, b) = tokio::join!(
            h.reconciler.reconcile_machine(&machine),
            h.reconciler.reconcile_machine(&machine),
        );
        a.expect("first delivery");
        b.expect("second delivery");

        let owned: Vec<_> = h
            .cloud
            .servers()
            .into_iter()
            .filter(|s| s.meta.get("machine-uid").map(String::as_str) == Some("uid-w1"))
            .collect();
        assert_eq!(owned.len(), 1);
        assert_eq!(h.cloud.create_server_calls(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_without_match_self_heals() {
        let h = Harness::new();
        h.machines.insert(create_test_machine("w1"));
        h.reconcile_machine("w1").await.expect("create");
        let old_id = h.machine_status("w1").instance_id().expect("bound").to_string();

        // The identity lost access to the server and its drives
        h.cloud.deny(old_id.clone());
        for drive in h.cloud.drives() {
            if drive.meta.get("machine-uid").map(String::as_str) == Some("uid-w1") {
                h.cloud.deny(drive.uuid);
            }
        }

        let action = h.reconcile_machine("w1").await.expect("self-heal");
        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = h.machine_status("w1");
        assert_eq!(status.instance_id(), None);
        assert!(!status.ready);

        h.reconcile_machine("w1").await.expect("recreate");
        let new_id = h.machine_status("w1").instance_id().expect("rebound").to_string();
        assert_ne!(new_id, old_id);
        assert_eq!(h.cloud.create_server_calls(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_adopts_accessible_owned_server() {
        let h = Harness::new();
        h.cloud.add_server(owned_server("5e7a-accessible", "w1"));
        h.cloud.deny("5e7a-stale");
        let mut machine = create_bare_machine("w1");
        machine.status = Some(CloudMachineStatus {
            instance_id: Some("5e7a-stale".to_string()),
            ..Default::default()
        });
        h.machines.insert(machine);

        h.reconcile_machine("w1").await.expect("reconcile");
        assert_eq!(h.machine_status("w1").instance_id(), Some("5e7a-accessible"));
        assert_eq!(h.cloud.create_server_calls(), 0);
        // Adopted server was stopped and gets started
        assert_eq!(h.cloud.server("5e7a-accessible").map(|s| s.status), Some(ServerStatus::Starting));
    }

    #[tokio::test]
    async fn test_not_found_clears_instance_id() {
        let h = Harness::new();
        let mut machine = create_bare_machine("w1");
        machine.status = Some(CloudMachineStatus {
            instance_id: Some("5e7a-gone".to_string()),
            instance_state: Some(InstanceState::Running),
            ready: true,
            provider_id: Some("cloudsigma://5e7a-gone".to_string()),
            ..Default::default()
        });
        h.machines.insert(machine);

        let action = h.reconcile_machine("w1").await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::ZERO));
        let status = h.machine_status("w1");
        assert_eq!(status.instance_id, None);
        assert_eq!(status.provider_id, None);
        assert!(!status.ready);
        assert_eq!(
            find_condition(&status.conditions, CONDITION_INSTANCE_PROVISIONED).map(|c| c.reason.as_str()),
            Some("InstanceLost")
        );
    }

    #[test]
    fn test_record_instance_refuses_to_overwrite_different_id() {
        let mut status = CloudMachineStatus {
            instance_id: Some("a".to_string()),
            ..Default::default()
        };
        let err = record_instance("default/w1", &mut status, "b").expect_err("conflict");
        assert!(matches!(err, ControllerError::InstanceIdConflict { ref recorded, .. } if recorded == "a"));
        assert_eq!(status.instance_id.as_deref(), Some("a"));

        record_instance("default/w1", &mut status, "a").expect("same id is fine");
        let mut empty = CloudMachineStatus {
            instance_id: Some(String::new()),
            ..Default::default()
        };
        record_instance("default/w1", &mut empty, "b").expect("empty id is unset");
        assert_eq!(empty.instance_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_concurrent_writer_recorded_different_instance() {
        let h = Harness::new();
        h.cloud.add_server(owned_server("5e7a-mine", "w1"));
        let mut machine = create_bare_machine("w1");
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let stale = h.machines.insert(machine);
        h.machines.modify(Some(NAMESPACE), "w1", |m| {
            m.status = Some(CloudMachineStatus {
                instance_id: Some("5e7a-other".to_string()),
                ..Default::default()
            });
        });

        let err = h
            .reconciler
            .update_machine_status(&stale, |status| record_instance("default/w1", status, "5e7a-mine"))
            .await
            .expect_err("must refuse");
        assert!(matches!(err, ControllerError::InstanceIdConflict { .. }));
        assert_eq!(h.machine_status("w1").instance_id(), Some("5e7a-other"));
    }

    #[tokio::test]
    async fn test_status_write_retries_on_conflict() {
        let h = Harness::new();
        let mut machine = create_bare_machine("w1");
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        h.machines.insert(machine);
        h.machines.inject_conflicts(2);

        h.reconcile_machine("w1").await.expect("reconcile");
        assert!(h.machine_status("w1").instance_id().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_status_retries_recover_on_next_reconcile() {
        let h = Harness::new();
        let mut machine = create_bare_machine("w1");
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        h.machines.insert(machine);
        h.machines.inject_conflicts(MAX_STATUS_RETRIES);

        let err = h.reconcile_machine("w1").await.expect_err("retries exhausted");
        assert!(matches!(err, ControllerError::Conflict(_)));
        assert_eq!(h.machine_status("w1").instance_id(), None);

        // The server exists; the next attempt adopts it instead of creating another
        h.reconcile_machine("w1").await.expect("recover");
        assert!(h.machine_status("w1").instance_id().is_some());
        assert_eq!(h.cloud.create_server_calls(), 1);
    }

    #[tokio::test]
    async fn test_deletion_removes_server_drives_and_finalizer() {
        let h = Harness::new();
        h.machines.insert(create_test_machine("w1"));
        h.reconcile_machine("w1").await.expect("create");
        let id = h.machine_status("w1").instance_id().expect("bound").to_string();
        h.cloud.set_server_status(&id, ServerStatus::Running);

        h.machines.mark_deleted(Some(NAMESPACE), "w1");
        let action = h.reconcile_machine("w1").await.expect("delete");
        assert_eq!(action, Action::await_change());

        assert!(h.cloud.server(&id).is_none());
        assert!(h.cloud.drives().iter().all(|d| d.uuid == IMAGE));
        assert!(!h.machines.contains(Some(NAMESPACE), "w1"));
    }

    #[tokio::test]
    async fn test_deletion_with_vanished_server_still_releases_finalizer() {
        let h = Harness::new();
        let mut machine = create_bare_machine("w1");
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine.status = Some(CloudMachineStatus {
            instance_id: Some("5e7a-gone".to_string()),
            ..Default::default()
        });
        h.machines.insert(machine);
        h.machines.mark_deleted(Some(NAMESPACE), "w1");

        h.reconcile_machine("w1").await.expect("delete");
        assert!(!h.machines.contains(Some(NAMESPACE), "w1"));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_finalizer() {
        let h = Harness::new();
        h.machines.insert(create_bare_machine("w1"));
        h.reconcile_machine("w1").await.expect("create");
        h.machines.mark_deleted(Some(NAMESPACE), "w1");
        h.cloud.fail_next(
            "delete_server",
            CloudError::Api {
                status: 503,
                message: "maintenance".to_string(),
            },
        );

        h.reconcile_machine("w1").await.expect_err("delete fails");
        assert!(h.machines.contains(Some(NAMESPACE), "w1"));

        h.reconcile_machine("w1").await.expect("retry succeeds");
        assert!(!h.machines.contains(Some(NAMESPACE), "w1"));
        assert!(h.cloud.servers().is_empty());
    }

    #[tokio::test]
    async fn test_startup_reconciliation_adopts_orphaned_server() {
        let h = Harness::new();
        h.cloud.add_server(owned_server("5e7a-orphan", "w1"));
        h.machines.insert(create_bare_machine("w1"));
        h.machines.insert(create_bare_machine("w2"));

        h.reconciler.startup_reconciliation().await.expect("startup");
        assert_eq!(h.machine_status("w1").instance_id(), Some("5e7a-orphan"));
        assert_eq!(h.machine_status("w2").instance_id(), None);
        assert_eq!(h.cloud.create_server_calls(), 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_invalidates_identity_token() {
        let h = Harness::new();
        let mut machine = create_bare_machine("w1");
        machine.spec.identity = Some("alice@example.com".to_string());
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine.status = Some(CloudMachineStatus {
            instance_id: Some("5e7a-x".to_string()),
            ..Default::default()
        });
        h.machines.insert(machine);
        h.cloud.fail_next("get_server", CloudError::Authentication("token expired".to_string()));

        h.reconcile_machine("w1").await.expect_err("401");
        assert_eq!(h.provider.invalidated(), vec!["alice@example.com".to_string()]);
        assert_eq!(h.provider.requested(), vec![Some("alice@example.com".to_string())]);
    }

    #[tokio::test]
    async fn test_stopped_server_is_started_again() {
        let h = Harness::new();
        h.machines.insert(create_bare_machine("w1"));
        h.reconcile_machine("w1").await.expect("create");
        let id = h.machine_status("w1").instance_id().expect("bound").to_string();
        h.cloud.set_server_status(&id, ServerStatus::Stopped);

        h.reconcile_machine("w1").await.expect("reconcile");
        assert_eq!(h.cloud.server(&id).map(|s| s.status), Some(ServerStatus::Starting));
    }

    #[tokio::test]
    async fn test_machine_waits_for_cluster_network() {
        let h = Harness::new();
        let mut machine = create_bare_machine("w1");
        machine.spec.cluster_name = Some("c1".to_string());
        h.machines.insert(machine);

        let action = h.reconcile_machine("w1").await.expect("reconcile");
        assert_eq!(action, Action::requeue(test_settings().poll_interval));
        assert_eq!(h.cloud.create_server_calls(), 0);
        let status = h.machine_status("w1");
        assert_eq!(
            find_condition(&status.conditions, CONDITION_INSTANCE_PROVISIONED).map(|c| c.reason.as_str()),
            Some("WaitingForNetwork")
        );
    }

    #[tokio::test]
    async fn test_machine_joins_cluster_network() {
        let h = Harness::new();
        h.cloud.add_vlan("71a0-0001");
        h.clusters.insert(create_test_cluster("c1"));
        h.reconcile_cluster("c1").await.expect("cluster");

        let mut machine = create_bare_machine("w1");
        machine.spec.cluster_name = Some("c1".to_string());
        machine.spec.nics = vec![NicSpec::default()];
        h.machines.insert(machine);

        h.reconcile_machine("w1").await.expect("machine");
        let id = h.machine_status("w1").instance_id().expect("bound").to_string();
        let server = h.cloud.server(&id).expect("server");
        assert_eq!(server.nics.len(), 1);
        assert_eq!(server.nics[0].vlan.as_ref().map(|v| v.uuid.as_str()), Some("71a0-0001"));
    }

    #[tokio::test]
    async fn test_observed_addresses_reported() {
        let h = Harness::new();
        let mut server = owned_server("5e7a-addr", "w1");
        server.status = ServerStatus::Running;
        server.nics = vec![cloudsigma_client::ServerNic {
            runtime: Some(cloudsigma_client::NicRuntime {
                ip_v4: Some(cloudsigma_client::ResourceRef::new("185.12.6.7")),
                interface_type: Some("public".to_string()),
            }),
            ..Default::default()
        }];
        h.cloud.add_server(server);
        h.machines.insert(create_bare_machine("w1"));

        h.reconcile_machine("w1").await.expect("reconcile");
        let status = h.machine_status("w1");
        assert!(status.ready);
        assert_eq!(
            status.addresses,
            vec![
                MachineAddress {
                    address_type: AddressType::ExternalIP,
                    address: "185.12.6.7".to_string(),
                },
                MachineAddress {
                    address_type: AddressType::Hostname,
                    address: "w1".to_string(),
                },
            ]
        );
    }
}
