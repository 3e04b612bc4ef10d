// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::{ClusterReconciler, Pass};
use crate::catalog;
use crate::crd::{VirtualCluster, VirtualClusterStatus, DEFAULT_SERVICE_TYPE};
use crate::error::Error;
use crate::resources::{
    make_cluster_service, make_member_service, reconcile_cluster_service_labels, service_type_change,
    ServiceTypeChange, NO_PORTS_SERVICE,
};
use crate::shim_layer::APIError;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::*;

impl ClusterReconciler {
    /// Makes sure the headless service naming all members exists and records
    /// its name in the status.
    pub(crate) async fn sync_cluster_service(
        &self,
        cluster: &VirtualCluster,
        key: &str,
        status: &mut VirtualClusterStatus,
    ) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        if !status.cluster_service.is_empty() {
            match self.accessor.get_service(&namespace, &status.cluster_service).await {
                Ok(svc) => {
                    if let Some(updated) = reconcile_cluster_service_labels(cluster, &svc) {
                        if let Err(e) = self.accessor.update_service(&namespace, &updated).await {
                            warn!(cluster = %key, "failed to update labels of cluster service: {}", e);
                        }
                    }
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    info!(cluster = %key, "re-creating missing cluster service {}", status.cluster_service);
                }
                Err(e) => return Err(Error::ReconcileServiceFailed(e)),
            }
        }

        let svc = make_cluster_service(cluster);
        let name = svc.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        match self.accessor.create_service(&namespace, &svc).await {
            Ok(_) | Err(APIError::ObjectAlreadyExists) => {
                status.cluster_service = name;
                Ok(())
            }
            Err(e) => {
                error!(cluster = %key, "failed to create cluster service: {}", e);
                Err(Error::ReconcileServiceFailed(e))
            }
        }
    }

    /// Gives every replica-holding member its own service exposing the
    /// role's ports.
    pub(crate) async fn sync_member_services(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
    ) -> Result<(), Error> {
        let service_type = pass
            .cluster
            .spec
            .service_type
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string());
        let mut first_error = None;

        for role in status.roles.iter_mut() {
            let ports = catalog::ports_for_role(&pass.app, &role.id);
            let candidates: Vec<usize> = role
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| !m.pod.is_empty() && m.state.holds_replica())
                .map(|(idx, _)| idx)
                .collect();

            if ports.is_empty() {
                for idx in candidates {
                    role.members[idx].service = NO_PORTS_SERVICE.to_string();
                }
                continue;
            }

            let results = join_all(candidates.iter().map(|&idx| {
                let desired = make_member_service(pass.cluster, &role.members[idx].pod, &service_type, &ports);
                self.ensure_member_service(pass, desired)
            }))
            .await;

            for (idx, result) in candidates.into_iter().zip(results) {
                match result {
                    Ok(name) => role.members[idx].service = name,
                    Err(e) => {
                        error!(cluster = %pass.key, member = %role.members[idx].pod, "failed to sync member service: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(Error::ReconcileServiceFailed(e)),
            None => Ok(()),
        }
    }

    async fn ensure_member_service(&self, pass: &Pass<'_>, desired: Service) -> Result<String, APIError> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        let desired_type = desired
            .spec
            .as_ref()
            .and_then(|s| s.type_.clone())
            .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string());

        let existing = match self.accessor.get_service(&pass.namespace, &name).await {
            Ok(svc) => svc,
            Err(e) if e.is_not_found() => {
                return match self.accessor.create_service(&pass.namespace, &desired).await {
                    Ok(_) | Err(APIError::ObjectAlreadyExists) => Ok(name),
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        match service_type_change(&existing, &desired_type) {
            ServiceTypeChange::Unchanged => {}
            ServiceTypeChange::InPlace(updated) => {
                info!(cluster = %pass.key, "changing type of service {} to {}", name, desired_type);
                match self.accessor.update_service(&pass.namespace, &updated).await {
                    Ok(_) => {}
                    Err(APIError::Conflict) => {
                        let fresh = self.accessor.get_service(&pass.namespace, &name).await?;
                        if let ServiceTypeChange::InPlace(updated) = service_type_change(&fresh, &desired_type) {
                            self.accessor.update_service(&pass.namespace, &updated).await?;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            ServiceTypeChange::Recreate => {
                info!(cluster = %pass.key, "re-creating service {} as {}", name, desired_type);
                match self.accessor.delete_service(&pass.namespace, &name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.accessor.create_service(&pass.namespace, &desired).await?;
            }
        }
        Ok(name)
    }
}
