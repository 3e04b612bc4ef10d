// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::crd::{VirtualCluster, CLUSTER_LABEL, ROLE_LABEL};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Stored in `MemberStatus::service` when the role exposes no ports.
pub const NO_PORTS_SERVICE: &str = "n/a";
pub const PVC_TEMPLATE_NAME: &str = "p";
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";
/// All roles of a cluster form a single node group.
pub const NODEGROUP_ID: &str = "1";

pub fn cluster_service_name(cluster: &VirtualCluster) -> String {
    cluster.name_any() + "-headless"
}

pub fn stateful_set_generate_name(cluster: &VirtualCluster, role_id: &str) -> String {
    format!("{}-{}-", cluster.name_any(), role_id.to_lowercase())
}

pub fn member_pod_name(stateful_set: &str, index: usize) -> String {
    format!("{}-{}", stateful_set, index)
}

pub fn member_service_name(pod: &str) -> String {
    format!("svc-{}", pod)
}

pub fn member_pvc_name(pod: &str) -> String {
    format!("{}-{}", PVC_TEMPLATE_NAME, pod)
}

pub fn cluster_labels(cluster: &VirtualCluster) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.name_any())])
}

pub fn role_labels(cluster: &VirtualCluster, role_id: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(ROLE_LABEL.to_string(), role_id.to_string());
    labels
}

pub fn cluster_label_selector(cluster: &VirtualCluster) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster.name_any())
}

pub fn owner_references(cluster: &VirtualCluster) -> Option<Vec<OwnerReference>> {
    cluster.controller_owner_ref(&()).map(|r| vec![r])
}

/// `<service>.<namespace>.<cluster domain>`
pub fn member_domain(cluster_service: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{}.{}.{}", cluster_service, namespace, cluster_domain)
}

pub fn member_fqdn(pod: &str, domain: &str) -> String {
    format!("{}.{}", pod, domain)
}

/// True if every label in `desired` is present with the same value.
pub fn labels_cover(existing: Option<&BTreeMap<String, String>>, desired: &BTreeMap<String, String>) -> bool {
    desired
        .iter()
        .all(|(k, v)| existing.and_then(|l| l.get(k)) == Some(v))
}
