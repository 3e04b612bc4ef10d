// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::catalog::{self, CatalogError};
use crate::crd::{AppSpec, Role, VirtualCluster};
use crate::resources::common::*;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Builds the StatefulSet backing one role. It starts with zero replicas;
/// the member synchronizer raises the count as members are added.
pub fn make_stateful_set(
    cluster: &VirtualCluster,
    role: &Role,
    app: &AppSpec,
    cluster_service: &str,
    app_container: &str,
) -> Result<appsv1::StatefulSet, CatalogError> {
    let image = catalog::image_for_role(app, &role.id).ok_or_else(|| CatalogError::NoImage {
        app: cluster.spec.app.clone(),
        role: role.id.clone(),
    })?;
    let labels = role_labels(cluster, &role.id);

    Ok(appsv1::StatefulSet {
        metadata: metav1::ObjectMeta {
            generate_name: Some(stateful_set_generate_name(cluster, &role.id)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: owner_references(cluster),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(appsv1::StatefulSetSpec {
            replicas: Some(0),
            service_name: cluster_service.to_string(),
            pod_management_policy: Some("Parallel".to_string()),
            selector: metav1::LabelSelector {
                match_labels: Some(labels.clone()),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(labels.clone()),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(make_pod_spec(role, app, image, app_container)),
            },
            volume_claim_templates: role.storage.as_ref().map(|storage| {
                vec![corev1::PersistentVolumeClaim {
                    metadata: metav1::ObjectMeta {
                        name: Some(PVC_TEMPLATE_NAME.to_string()),
                        labels: Some(labels.clone()),
                        ..metav1::ObjectMeta::default()
                    },
                    spec: Some(corev1::PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                        storage_class_name: storage.storage_class_name.clone(),
                        resources: Some(corev1::VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                Quantity(storage.size.clone()),
                            )])),
                            ..corev1::VolumeResourceRequirements::default()
                        }),
                        ..corev1::PersistentVolumeClaimSpec::default()
                    }),
                    ..corev1::PersistentVolumeClaim::default()
                }]
            }),
            ..appsv1::StatefulSetSpec::default()
        }),
        ..appsv1::StatefulSet::default()
    })
}

fn make_pod_spec(role: &Role, app: &AppSpec, image: String, app_container: &str) -> corev1::PodSpec {
    let ports = catalog::ports_for_role(app, &role.id)
        .into_iter()
        .map(|p| corev1::ContainerPort {
            container_port: p.port,
            name: Some(format!("port-{}", p.port)),
            ..corev1::ContainerPort::default()
        })
        .collect::<Vec<_>>();

    // Persisted directories live on the member's claim, one subPath each.
    let volume_mounts = match role.storage {
        Some(_) => catalog::persist_dirs_for_role(app, &role.id)
            .into_iter()
            .map(|dir| corev1::VolumeMount {
                name: PVC_TEMPLATE_NAME.to_string(),
                sub_path: Some(dir.trim_start_matches('/').to_string()),
                mount_path: dir,
                ..corev1::VolumeMount::default()
            })
            .collect::<Vec<_>>(),
        None => Vec::new(),
    };

    let caps = catalog::capabilities(app);
    corev1::PodSpec {
        containers: vec![corev1::Container {
            name: app_container.to_string(),
            image: Some(image),
            env: (!role.env.is_empty()).then(|| role.env.clone()),
            resources: role.resources.clone(),
            ports: (!ports.is_empty()).then_some(ports),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            security_context: (!caps.is_empty()).then(|| corev1::SecurityContext {
                capabilities: Some(corev1::Capabilities {
                    add: Some(caps.to_vec()),
                    ..corev1::Capabilities::default()
                }),
                ..corev1::SecurityContext::default()
            }),
            ..corev1::Container::default()
        }],
        ..corev1::PodSpec::default()
    }
}

pub fn replicas(sts: &appsv1::StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

pub fn status_replicas(sts: &appsv1::StatefulSet) -> i32 {
    sts.status.as_ref().map(|s| s.replicas).unwrap_or(0)
}

pub fn with_replicas(sts: &appsv1::StatefulSet, count: i32) -> appsv1::StatefulSet {
    let mut updated = sts.clone();
    if let Some(spec) = updated.spec.as_mut() {
        spec.replicas = Some(count);
    }
    updated
}

/// Returns an updated copy if the StatefulSet drifted from what the role
/// wants in anything other than its replica count.
pub fn reconcile_non_replicas(
    cluster: &VirtualCluster,
    role_id: &str,
    sts: &appsv1::StatefulSet,
) -> Option<appsv1::StatefulSet> {
    let desired = role_labels(cluster, role_id);
    let mut changed = false;
    let mut updated = sts.clone();
    if !labels_cover(sts.metadata.labels.as_ref(), &desired) {
        updated.metadata.labels.get_or_insert_with(BTreeMap::new).extend(desired);
        changed = true;
    }
    if updated.metadata.owner_references.is_none() {
        updated.metadata.owner_references = owner_references(cluster);
        changed = updated.metadata.owner_references.is_some() || changed;
    }
    changed.then_some(updated)
}
