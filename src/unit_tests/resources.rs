// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
// Tests for the Kubernetes objects built for a cluster
use super::fakes::{make_app, make_cluster, role};
use crate::crd::*;
use crate::reconciler::ConfigMetaGenerator;
use crate::resources::*;
use k8s_openapi::api::core::v1 as corev1;

#[test]
pub fn test_make_stateful_set() {
    let cluster = make_cluster(vec![]);
    let mut worker = role("Worker", 2);
    worker.storage = Some(Storage {
        size: "10Gi".to_string(),
        storage_class_name: None,
    });
    let mut app = make_app(None);
    app.default_persist_dirs = vec!["/usr".to_string()];
    app.roles[1].id = "Worker".to_string();

    let sts = make_stateful_set(&cluster, &worker, &app, "vc-headless", "app").unwrap();
    assert_eq!(sts.metadata.generate_name.as_deref(), Some("vc-worker-"));
    assert_eq!(replicas(&sts), 0);
    let labels = sts.metadata.labels.clone().unwrap();
    assert_eq!(labels.get(CLUSTER_LABEL).map(String::as_str), Some("vc"));
    assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some("Worker"));
    assert_eq!(sts.metadata.owner_references.as_ref().map(|o| o.len()), Some(1));

    let spec = sts.spec.unwrap();
    assert_eq!(spec.service_name, "vc-headless");
    assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
    assert_eq!(spec.volume_claim_templates.as_ref().map(|v| v.len()), Some(1));
    let container = &spec.template.spec.unwrap().containers[0];
    assert_eq!(container.name, "app");
    assert_eq!(container.image.as_deref(), Some("spark:2.4"));
    assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 22);
    let mount = &container.volume_mounts.as_ref().unwrap()[0];
    assert_eq!(mount.mount_path, "/usr");
    assert_eq!(mount.sub_path.as_deref(), Some("usr"));
}

#[test]
pub fn test_make_stateful_set_without_image() {
    let cluster = make_cluster(vec![]);
    let mut app = make_app(None);
    app.default_image = None;
    assert!(make_stateful_set(&cluster, &role("worker", 1), &app, "vc-headless", "app").is_err());
}

#[test]
pub fn test_reconcile_non_replicas() {
    let cluster = make_cluster(vec![]);
    let app = make_app(None);
    let mut sts = make_stateful_set(&cluster, &role("worker", 1), &app, "vc-headless", "app").unwrap();
    assert!(reconcile_non_replicas(&cluster, "worker", &sts).is_none());

    sts.metadata.labels.as_mut().unwrap().remove(ROLE_LABEL);
    let fixed = reconcile_non_replicas(&cluster, "worker", &sts).unwrap();
    assert!(labels_cover(fixed.metadata.labels.as_ref(), &role_labels(&cluster, "worker")));
}

#[test]
pub fn test_make_member_service() {
    let cluster = make_cluster(vec![]);
    let ports = crate::catalog::ports_for_role(&make_app(None), "worker");
    let svc = make_member_service(&cluster, "vc-worker-abcde-0", "NodePort", &ports);
    assert_eq!(svc.metadata.name.as_deref(), Some("svc-vc-worker-abcde-0"));
    let spec = svc.spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("NodePort"));
    assert_eq!(
        spec.selector.unwrap().get(POD_NAME_LABEL).map(String::as_str),
        Some("vc-worker-abcde-0")
    );
    assert_eq!(spec.ports.unwrap()[0].port, 22);
}

#[test]
pub fn test_make_cluster_service() {
    let svc = make_cluster_service(&make_cluster(vec![]));
    assert_eq!(svc.metadata.name.as_deref(), Some("vc-headless"));
    let spec = svc.spec.unwrap();
    assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
    assert_eq!(spec.publish_not_ready_addresses, Some(true));
}

fn service_of_type(t: &str) -> corev1::Service {
    corev1::Service {
        spec: Some(corev1::ServiceSpec {
            type_: Some(t.to_string()),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

#[test]
pub fn test_service_type_change() {
    assert_eq!(
        service_type_change(&service_of_type("NodePort"), "NodePort"),
        ServiceTypeChange::Unchanged
    );
    assert_eq!(
        service_type_change(&service_of_type("NodePort"), "ClusterIP"),
        ServiceTypeChange::Recreate
    );
    assert_eq!(
        service_type_change(&service_of_type("ClusterIP"), "LoadBalancer"),
        ServiceTypeChange::InPlace(service_of_type("LoadBalancer"))
    );
    assert_eq!(
        service_type_change(&service_of_type("LoadBalancer"), "NodePort"),
        ServiceTypeChange::InPlace(service_of_type("NodePort"))
    );
}

#[test]
pub fn test_member_naming() {
    let domain = member_domain("vc-headless", "default", "svc.cluster.local");
    assert_eq!(domain, "vc-headless.default.svc.cluster.local");
    assert_eq!(
        member_fqdn("vc-worker-abcde-1", &domain),
        "vc-worker-abcde-1.vc-headless.default.svc.cluster.local"
    );
    assert_eq!(member_pvc_name("vc-worker-abcde-1"), "p-vc-worker-abcde-1");
}

#[test]
pub fn test_configmeta() {
    let cluster = make_cluster(vec![role("worker", 2)]);
    let app = make_app(Some("http://pkgs/setup.tgz"));
    let member = |pod: &str, node_id: i64, state: MemberState| MemberStatus {
        pod: pod.to_string(),
        node_id,
        state,
        ..MemberStatus::default()
    };
    let status = VirtualClusterStatus {
        roles: vec![RoleStatus {
            id: "worker".to_string(),
            stateful_set: "vc-worker-abcde".to_string(),
            members: vec![
                member("vc-worker-abcde-0", 1, MemberState::Ready),
                member("vc-worker-abcde-1", 2, MemberState::CreatePending),
                member("vc-worker-abcde-2", 3, MemberState::DeletePending),
            ],
        }],
        ..VirtualClusterStatus::default()
    };

    let generator = ConfigMetaGenerator::new(&cluster, &status, &app, "vc-headless.default.svc.cluster.local");
    let doc = generator.document();
    let roles = &doc["nodegroups"]["1"]["roles"]["worker"];
    assert_eq!(roles["node_ids"], serde_json::json!(["1", "2"]));
    assert_eq!(
        roles["services"]["ssh"]["endpoints"][0],
        "vc-worker-abcde-0.vc-headless.default.svc.cluster.local:22"
    );
    assert_eq!(doc["services"]["ssh"]["1"]["worker"][0], "nodegroups.1.roles.worker.services.ssh");
    assert_eq!(doc["cluster"]["name"], "vc");

    let rendered: serde_json::Value =
        serde_json::from_str(&generator.render("vc-worker-abcde-1").unwrap()).unwrap();
    assert_eq!(rendered["node"]["id"], "2");
    assert_eq!(rendered["node"]["role_id"], "worker");
    let leaving: serde_json::Value =
        serde_json::from_str(&generator.render("vc-worker-abcde-2").unwrap()).unwrap();
    assert!(leaving["node"].is_null());
}
