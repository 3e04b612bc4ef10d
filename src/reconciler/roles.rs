// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::{ClusterReconciler, MemberBuckets, Pass, EVENT_REASON_ROLE};
use crate::crd::{MemberState, MemberStatus, Role, RoleStatus, VirtualClusterStatus, ROLE_LABEL};
use crate::error::Error;
use crate::resources::{
    cluster_label_selector, make_stateful_set, member_pod_name, member_pvc_name, reconcile_non_replicas,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use std::collections::HashMap;
use tracing::*;

/// What the role synchronizer observed about cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSyncState {
    /// Some role gained or lost members this pass.
    MembersChanged,
    StableUnready,
    StableReady,
}

/// One role as seen by this pass: its spec (if still desired), its status
/// entry (if any) and its StatefulSet (if it exists).
#[derive(Debug, Clone)]
pub struct RoleInfo {
    pub id: String,
    pub spec: Option<Role>,
    pub status_idx: Option<usize>,
    pub stateful_set: Option<StatefulSet>,
    pub desired: usize,
}

impl ClusterReconciler {
    pub(crate) async fn init_role_info(
        &self,
        pass: &Pass<'_>,
        status: &VirtualClusterStatus,
    ) -> Result<Vec<RoleInfo>, Error> {
        let found = self
            .accessor
            .list_stateful_sets(&pass.namespace, &cluster_label_selector(pass.cluster))
            .await
            .map_err(Error::ReconcileStatefulSetFailed)?;
        let mut by_name: HashMap<String, StatefulSet> = found
            .into_iter()
            .filter_map(|sts| sts.metadata.name.clone().map(|n| (n, sts)))
            .collect();

        let mut roles: Vec<RoleInfo> = pass
            .cluster
            .spec
            .roles
            .iter()
            .map(|r| RoleInfo {
                id: r.id.clone(),
                spec: Some(r.clone()),
                status_idx: None,
                stateful_set: None,
                desired: r.desired_members(),
            })
            .collect();

        for (idx, role_status) in status.roles.iter().enumerate() {
            let sts = if role_status.stateful_set.is_empty() {
                None
            } else {
                by_name.remove(&role_status.stateful_set)
            };
            match roles.iter_mut().find(|r| r.id == role_status.id) {
                Some(info) => {
                    info.status_idx = Some(idx);
                    info.stateful_set = sts;
                }
                None => roles.push(RoleInfo {
                    id: role_status.id.clone(),
                    spec: None,
                    status_idx: Some(idx),
                    stateful_set: sts,
                    desired: 0,
                }),
            }
        }

        // StatefulSets nobody's status points at.
        for (name, sts) in by_name {
            let role_id = sts.metadata.labels.as_ref().and_then(|l| l.get(ROLE_LABEL)).cloned();
            match role_id.and_then(|id| roles.iter_mut().find(|r| r.id == id)) {
                Some(info) if info.status_idx.is_none() => info.stateful_set = Some(sts),
                _ => warn!(cluster = %pass.key, "ignoring unreferenced StatefulSet {}", name),
            }
        }
        Ok(roles)
    }

    pub(crate) async fn sync_roles(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        roles: &mut [RoleInfo],
    ) -> Result<RoleSyncState, Error> {
        // Members in creating may already know the current member set and
        // cannot take updates about it yet.
        if status
            .roles
            .iter()
            .any(|r| r.members.iter().any(|m| m.state == MemberState::Creating))
        {
            return Ok(RoleSyncState::StableUnready);
        }

        let mut any_changed = false;
        let mut all_ready = true;
        for role in roles.iter_mut() {
            match (role.stateful_set.is_some(), role.status_idx) {
                (false, None) => {
                    any_changed |= self.handle_role_create(pass, status, role).await?;
                }
                (false, Some(idx)) => {
                    any_changed |= self.handle_role_recreate(pass, status, role, idx).await?;
                }
                (true, Some(idx)) => {
                    self.handle_role_config(pass, role).await;
                    if status.roles[idx].members.is_empty() && role.desired == 0 {
                        self.handle_role_delete(pass, status, role, idx).await;
                    } else {
                        any_changed |= self.handle_role_resize(pass, status, role, idx).await;
                    }
                }
                (true, None) => {
                    let sts_name = role
                        .stateful_set
                        .as_ref()
                        .and_then(|s| s.metadata.name.clone())
                        .unwrap_or_default();
                    error!(cluster = %pass.key, role = %role.id, "StatefulSet {} has no role status", sts_name);
                    return Err(Error::InvariantViolation(format!(
                        "StatefulSet {} for {} has no role status",
                        sts_name, pass.key
                    )));
                }
            }
            if let Some(idx) = role.status_idx {
                if !role_members_ready_or_error(&status.roles[idx], status.config_generation, pass.connections_version) {
                    all_ready = false;
                }
            }
        }

        Ok(if any_changed {
            RoleSyncState::MembersChanged
        } else if all_ready {
            RoleSyncState::StableReady
        } else {
            RoleSyncState::StableUnready
        })
    }

    async fn handle_role_create(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        role: &mut RoleInfo,
    ) -> Result<bool, Error> {
        let Some(spec) = role.spec.clone() else {
            return Ok(false);
        };
        if role.desired == 0 {
            return Ok(false);
        }
        self.event(pass, EVENT_REASON_ROLE, format!("creating role{{{}}}", role.id)).await;
        let sts = make_stateful_set(
            pass.cluster,
            &spec,
            &pass.app,
            &status.cluster_service,
            &self.config.app_container,
        )
        .map_err(Error::AppResolveFailed)?;
        let created = self
            .accessor
            .create_stateful_set(&pass.namespace, &sts)
            .await
            .map_err(|e| {
                error!(cluster = %pass.key, role = %role.id, "failed to create StatefulSet: {}", e);
                Error::ReconcileStatefulSetFailed(e)
            })?;
        let sts_name = created
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;

        let idx = match role.status_idx {
            Some(idx) => {
                status.roles[idx].stateful_set = sts_name;
                idx
            }
            None => {
                status.roles.push(RoleStatus {
                    id: role.id.clone(),
                    stateful_set: sts_name,
                    members: Vec::with_capacity(role.desired),
                });
                status.roles.len() - 1
            }
        };
        role.status_idx = Some(idx);
        role.stateful_set = Some(created);
        add_member_statuses(status, idx, role.desired, spec.storage.is_some());
        Ok(true)
    }

    /// The StatefulSet vanished out-of-band.
    async fn handle_role_recreate(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        role: &mut RoleInfo,
        idx: usize,
    ) -> Result<bool, Error> {
        if status.roles[idx].members.is_empty() {
            if role.desired == 0 {
                status.roles[idx].stateful_set.clear();
                return Ok(false);
            }
            return self.handle_role_create(pass, status, role).await;
        }

        // In-guest state cannot be trusted any more; retire every member and
        // rebuild the role once they are gone.
        self.event(pass, EVENT_REASON_ROLE, format!("restoring role{{{}}}", role.id)).await;
        for member in status.roles[idx].members.iter_mut() {
            member.state = match member.state {
                MemberState::Ready | MemberState::ConfigError | MemberState::DeletePending => {
                    MemberState::DeletePending
                }
                _ => MemberState::Deleting,
            };
        }
        Ok(true)
    }

    async fn handle_role_config(&self, pass: &Pass<'_>, role: &mut RoleInfo) {
        if role.spec.is_none() {
            return;
        }
        let Some(sts) = role.stateful_set.as_ref() else {
            return;
        };
        if let Some(updated) = reconcile_non_replicas(pass.cluster, &role.id, sts) {
            match self.accessor.update_stateful_set(&pass.namespace, &updated).await {
                Ok(sts) => role.stateful_set = Some(sts),
                Err(e) => warn!(cluster = %pass.key, role = %role.id, "failed to update StatefulSet: {}", e),
            }
        }
    }

    /// Role is going away and its members are all gone.
    async fn handle_role_delete(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        role: &mut RoleInfo,
        idx: usize,
    ) {
        self.event(pass, EVENT_REASON_ROLE, format!("finishing cleanup on role{{{}}}", role.id))
            .await;
        let name = status.roles[idx].stateful_set.clone();
        match self.accessor.delete_stateful_set(&pass.namespace, &name).await {
            Ok(()) => status.roles[idx].stateful_set.clear(),
            Err(e) if e.is_not_found() => status.roles[idx].stateful_set.clear(),
            Err(e) => error!(cluster = %pass.key, role = %role.id, "failed to delete StatefulSet {}: {}", name, e),
        }
        role.stateful_set = None;
    }

    async fn handle_role_resize(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        role: &RoleInfo,
        idx: usize,
    ) -> bool {
        let members = &status.roles[idx].members;
        let buckets = MemberBuckets::from_members(members);
        // Creating members are excluded; role changes wait until there are none.
        let prev_desired = buckets.count(MemberState::Ready)
            + buckets.count(MemberState::ConfigError)
            + buckets.count(MemberState::CreatePending);
        if role.desired == prev_desired {
            return false;
        }
        if role.desired > prev_desired {
            // Only expand once no member is on its way out.
            if members.len() != prev_desired {
                return false;
            }
            self.event(pass, EVENT_REASON_ROLE, format!("expanding role{{{}}}", role.id)).await;
            let has_storage = role.spec.as_ref().map(|s| s.storage.is_some()).unwrap_or(false);
            add_member_statuses(status, idx, role.desired, has_storage);
        } else {
            self.event(pass, EVENT_REASON_ROLE, format!("shrinking role{{{}}}", role.id)).await;
            delete_member_statuses(&mut status.roles[idx].members, role.desired);
        }
        true
    }
}

/// Appends create-pending members until the role holds `desired` members.
/// Node IDs come from the cluster-wide counter and are never reused.
pub fn add_member_statuses(status: &mut VirtualClusterStatus, idx: usize, desired: usize, has_storage: bool) {
    let current = status.roles[idx].members.len();
    for i in current..desired {
        let pod = member_pod_name(&status.roles[idx].stateful_set, i);
        let pvc = if has_storage { member_pvc_name(&pod) } else { String::new() };
        status.last_node_id += 1;
        status.roles[idx].members.push(MemberStatus {
            pod,
            pvc,
            node_id: status.last_node_id,
            state: MemberState::CreatePending,
            ..MemberStatus::default()
        });
    }
}

/// Moves members past index `desired` onto a deletion path. Members never
/// started go straight to deleting; running ones announce their departure.
pub fn delete_member_statuses(members: &mut [MemberStatus], desired: usize) {
    for member in members.iter_mut().skip(desired) {
        member.state = match member.state {
            MemberState::CreatePending => MemberState::Deleting,
            MemberState::Ready | MemberState::ConfigError => MemberState::DeletePending,
            other => other,
        };
    }
}

/// A role is stable when every member is ready or in error, and no ready
/// member still owes a notification or holds outdated configuration.
/// Members that never received configmeta are never pushed to, so neither
/// the generation nor the connections version applies to them.
pub fn role_members_ready_or_error(role: &RoleStatus, config_generation: i64, connections_version: i64) -> bool {
    role.members.iter().all(|m| match m.state {
        MemberState::ConfigError => true,
        MemberState::Ready => {
            let detail = &m.state_detail;
            detail.pending_notify_cmds.is_empty()
                && detail.last_config_data_generation.map_or(true, |g| {
                    g == config_generation && detail.last_connection_version.unwrap_or(0) >= connections_version
                })
        }
        _ => false,
    })
}
