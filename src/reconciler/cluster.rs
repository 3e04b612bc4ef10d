// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::{Admission, ClusterReconciler, ConfigMetaGenerator, Pass, RoleSyncState, EVENT_REASON_CLUSTER};
use crate::crd::{ClusterState, VirtualCluster, VirtualClusterStatus, FINALIZER};
use crate::error::Error;
use crate::shim_layer::APIError;
use kube::ResourceExt;
use std::cmp::min;
use tracing::*;
use uuid::Uuid;

/// How the finalizer list must change in the status write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerChange {
    Keep,
    Add,
    Remove,
}

pub fn has_finalizer(cluster: &VirtualCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Drops members whose pod has been cleaned up and roles whose
/// StatefulSet is gone and which have no members left.
pub fn compact_status(status: &mut VirtualClusterStatus) {
    for role in status.roles.iter_mut() {
        role.members.retain(|m| !m.pod.is_empty());
    }
    status
        .roles
        .retain(|r| !r.stateful_set.is_empty() || !r.members.is_empty());
}

impl ClusterReconciler {
    /// Runs one reconciliation pass for the named cluster.
    pub async fn sync_cluster(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let cluster = match self.accessor.get_cluster(namespace, name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                info!(cluster = %format!("{}/{}", namespace, name), "cluster no longer exists");
                return Ok(());
            }
            Err(e) => return Err(Error::ClusterGetFailed(e)),
        };
        let cluster_key = format!("{}/{}", namespace, name);
        let key = cluster.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        let original = cluster.status.clone().unwrap_or_default();

        match self.ledger.admit(&key, &original.generation_uid) {
            Admission::Stale => {
                info!(cluster = %cluster_key, "stale status generation; skipping pass");
                return Ok(());
            }
            Admission::New if cluster.metadata.deletion_timestamp.is_none() => {
                // The status write re-triggers a pass that does the real work.
                info!(cluster = %cluster_key, "new cluster");
                self.accessor
                    .record_event(&cluster, EVENT_REASON_CLUSTER, "new cluster")
                    .await;
                self.app_refs.ensure(&cluster);
                let status = VirtualClusterStatus {
                    state: ClusterState::Creating,
                    ..original
                };
                self.write_back(cluster, &key, Some(status), FinalizerChange::Add).await;
                return Ok(());
            }
            Admission::New | Admission::Proceed => {}
        }
        self.app_refs.ensure(&cluster);

        if cluster.metadata.deletion_timestamp.is_some() {
            if has_finalizer(&cluster) {
                info!(cluster = %cluster_key, "cluster being deleted");
                self.accessor
                    .record_event(&cluster, EVENT_REASON_CLUSTER, "deleting cluster")
                    .await;
                self.app_refs.remove(&cluster);
                self.ledger.delete(&key);
                self.write_back(cluster, &key, None, FinalizerChange::Remove).await;
            }
            return Ok(());
        }
        let finalizer = if has_finalizer(&cluster) {
            FinalizerChange::Keep
        } else {
            FinalizerChange::Add
        };

        let mut status = original.clone();
        let result = self.run_pass(&cluster, &cluster_key, &mut status).await;
        compact_status(&mut status);

        let status_changed = status != original;
        if status_changed || finalizer != FinalizerChange::Keep {
            self.write_back(cluster, &key, status_changed.then_some(status), finalizer)
                .await;
        }
        result
    }

    async fn run_pass(
        &self,
        cluster: &VirtualCluster,
        cluster_key: &str,
        status: &mut VirtualClusterStatus,
    ) -> Result<(), Error> {
        let app = self.catalog.resolve_app(cluster).await.map_err(|e| {
            error!(cluster = %cluster_key, "failed to resolve app {}: {}", cluster.spec.app, e);
            Error::AppResolveFailed(e)
        })?;

        if status.observed_generation != cluster.metadata.generation {
            status.observed_generation = cluster.metadata.generation;
            status.config_generation += 1;
        }

        // StatefulSets name the cluster service, so it goes first.
        self.sync_cluster_service(cluster, cluster_key, status).await?;
        let pass = Pass::new(cluster, app, &status.cluster_service, &self.config.cluster_domain);

        let mut roles = self.init_role_info(&pass, status).await?;
        let role_state = self.sync_roles(&pass, status, &mut roles).await?;
        if role_state == RoleSyncState::MembersChanged {
            status.config_generation += 1;
        }

        self.sync_member_services(&pass, status).await?;

        let retrying = role_state == RoleSyncState::StableReady && self.retry_failed_members(&pass, status).await;
        if role_state == RoleSyncState::StableReady && !retrying {
            if status.state != ClusterState::Ready {
                status.state = ClusterState::Ready;
                self.event(&pass, EVENT_REASON_CLUSTER, "cluster ready".to_string())
                    .await;
            }
            return Ok(());
        }
        if status.state != ClusterState::Creating {
            status.state = ClusterState::Updating;
        }

        let configmeta = ConfigMetaGenerator::new(cluster, status, &pass.app, &pass.domain);
        self.sync_members(&pass, status, &mut roles, &configmeta).await;
        self.replay_pending_notifies(&pass, status).await;
        Ok(())
    }

    /// Persists the finalizer change and status, retrying with exponential
    /// backoff until it lands or the cluster goes away.
    pub(crate) async fn write_back(
        &self,
        cluster: VirtualCluster,
        key: &str,
        status: Option<VirtualClusterStatus>,
        finalizer: FinalizerChange,
    ) {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let mut current = cluster;
        let mut wait = self.config.status_retry_initial();

        loop {
            let err = match self.try_write(&mut current, key, status.as_ref(), finalizer).await {
                Ok(()) => return,
                Err(e) => e,
            };
            warn!(cluster = %format!("{}/{}", namespace, name), "failed to write status, retrying in {:?}: {}", wait, err);

            match self.accessor.get_cluster(&namespace, &name).await {
                Ok(fresh) => {
                    if fresh.metadata.deletion_timestamp.is_some() && finalizer != FinalizerChange::Remove {
                        // The deletion pass takes over; make sure it is not
                        // dropped as stale.
                        let uid = fresh
                            .status
                            .as_ref()
                            .map(|s| s.generation_uid.clone())
                            .unwrap_or_default();
                        self.ledger.write(key, &uid);
                        self.ledger.validate(key);
                        return;
                    }
                    current = fresh;
                }
                Err(e) if e.is_not_found() => {
                    self.ledger.delete(key);
                    return;
                }
                Err(e) => warn!(cluster = %format!("{}/{}", namespace, name), "failed to re-read cluster: {}", e),
            }

            tokio::time::sleep(wait).await;
            wait = min(wait * 2, self.config.status_retry_max());
        }
    }

    async fn try_write(
        &self,
        current: &mut VirtualCluster,
        key: &str,
        status: Option<&VirtualClusterStatus>,
        finalizer: FinalizerChange,
    ) -> Result<(), APIError> {
        match finalizer {
            FinalizerChange::Add if !has_finalizer(current) => {
                let mut updated = current.clone();
                updated.finalizers_mut().push(FINALIZER.to_string());
                *current = self.accessor.update_cluster(&updated).await?;
            }
            FinalizerChange::Remove => {
                if has_finalizer(current) {
                    let mut updated = current.clone();
                    updated.finalizers_mut().retain(|f| f != FINALIZER);
                    self.accessor.update_cluster(&updated).await?;
                }
                return Ok(());
            }
            _ => {}
        }

        if let Some(status) = status {
            let uid = Uuid::new_v4().to_string();
            let mut updated = current.clone();
            updated.status = Some(VirtualClusterStatus {
                generation_uid: uid.clone(),
                ..status.clone()
            });
            self.ledger.write(key, &uid);
            *current = self.accessor.update_cluster_status(&updated).await?;
        }
        Ok(())
    }
}
