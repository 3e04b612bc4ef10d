// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::catalog::ServicePort;
use crate::crd::VirtualCluster;
use crate::resources::common::*;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Headless service giving every member a stable DNS name.
pub fn make_cluster_service(cluster: &VirtualCluster) -> corev1::Service {
    corev1::Service {
        metadata: metav1::ObjectMeta {
            name: Some(cluster_service_name(cluster)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(cluster)),
            owner_references: owner_references(cluster),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(cluster_labels(cluster)),
            publish_not_ready_addresses: Some(true),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

/// Returns an updated copy if the cluster service lost any of its labels.
pub fn reconcile_cluster_service_labels(
    cluster: &VirtualCluster,
    svc: &corev1::Service,
) -> Option<corev1::Service> {
    let desired = cluster_labels(cluster);
    if labels_cover(svc.metadata.labels.as_ref(), &desired) {
        return None;
    }
    let mut updated = svc.clone();
    updated.metadata.labels.get_or_insert_with(BTreeMap::new).extend(desired);
    Some(updated)
}

pub fn make_member_service(
    cluster: &VirtualCluster,
    pod: &str,
    service_type: &str,
    ports: &[ServicePort],
) -> corev1::Service {
    let mut labels = cluster_labels(cluster);
    labels.insert(POD_NAME_LABEL.to_string(), pod.to_string());
    corev1::Service {
        metadata: metav1::ObjectMeta {
            name: Some(member_service_name(pod)),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: owner_references(cluster),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(BTreeMap::from([(POD_NAME_LABEL.to_string(), pod.to_string())])),
            publish_not_ready_addresses: Some(true),
            ports: Some(
                ports
                    .iter()
                    .map(|p| corev1::ServicePort {
                        name: Some(p.id.to_lowercase()),
                        port: p.port,
                        target_port: Some(IntOrString::Int(p.port)),
                        protocol: Some("TCP".to_string()),
                        ..corev1::ServicePort::default()
                    })
                    .collect(),
            ),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

pub fn service_type(svc: &corev1::Service) -> &str {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP")
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceTypeChange {
    Unchanged,
    InPlace(corev1::Service),
    /// The existing service holds node ports the target type cannot keep.
    Recreate,
}

pub fn service_type_change(existing: &corev1::Service, desired_type: &str) -> ServiceTypeChange {
    let current = service_type(existing);
    if current == desired_type {
        return ServiceTypeChange::Unchanged;
    }
    let allocates_node_ports = |t: &str| t == "NodePort" || t == "LoadBalancer";
    if allocates_node_ports(current) && !allocates_node_ports(desired_type) {
        return ServiceTypeChange::Recreate;
    }
    let mut updated = existing.clone();
    if let Some(spec) = updated.spec.as_mut() {
        spec.type_ = Some(desired_type.to_string());
    }
    ServiceTypeChange::InPlace(updated)
}
