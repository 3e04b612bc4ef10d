// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Per-member lifecycle. Each state bucket of a role is handled in turn;
//! members within a bucket are worked on concurrently.
use super::notify::{notification, NotifyOp};
use super::roles::RoleInfo;
use super::setup::{SetupProgress, CONFIGMETA_FILE, STARTSCRIPT};
use super::{ClusterReconciler, ConfigMetaGenerator, MemberBuckets, Pass, EVENT_REASON_MEMBER};
use crate::catalog;
use crate::crd::{FileInjection, MemberState, MemberStatus, VirtualClusterStatus};
use crate::resources::{member_fqdn, replicas, status_replicas, with_replicas, NO_PORTS_SERVICE};
use crate::shim_layer::guest::{run_script, write_file};
use crate::shim_layer::ExecError;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use tracing::*;

/// Result of driving one creating member's setup forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberOutcome {
    Configured,
    ConfigError(String),
    Pending,
}

/// ID of the running app container, if the pod is running.
pub fn app_container_id(pod: &Pod, container: &str) -> Option<String> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    status
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == container)
        .filter(|c| c.state.as_ref().map_or(false, |s| s.running.is_some()))
        .and_then(|c| c.container_id.clone())
}

pub fn scheduling_error(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "PodScheduled" && c.status == "False" && c.reason.as_deref() == Some("Unschedulable"))
        .map(|c| c.message.clone().unwrap_or_default())
}

fn finish_configuring(member: &mut MemberStatus) {
    if let Some(cid) = member.state_detail.configuring_container.take() {
        member.state_detail.last_configured_container = Some(cid);
    }
}

impl ClusterReconciler {
    pub(crate) async fn sync_members(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        roles: &mut [RoleInfo],
        configmeta: &ConfigMetaGenerator,
    ) {
        if !self.push_configmeta(pass, status, configmeta).await {
            warn!(cluster = %pass.key, "failed to update configmeta in some ready members; deferring member changes");
            return;
        }

        for r in 0..status.roles.len() {
            let role_id = status.roles[r].id.clone();
            let Some(info) = roles.iter_mut().find(|i| i.id == role_id) else {
                continue;
            };
            self.handle_create_pending(pass, status, r, info).await;
            self.handle_creating(pass, status, r, configmeta).await;
            self.handle_delete_pending(pass, status, r).await;
            self.handle_deleting(pass, status, r, info).await;
            self.handle_config_error(pass, status, r).await;
        }
    }

    /// Pushes fresh configmeta to ready members whose copy is outdated, and
    /// tells them to reconnect when the connections changed. Returns false if
    /// any member could not be updated.
    async fn push_configmeta(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        configmeta: &ConfigMetaGenerator,
    ) -> bool {
        let config_generation = status.config_generation;
        let connections_version = pass.connections_version;
        let mut all_ok = true;

        for role in status.roles.iter_mut() {
            let stale: Vec<usize> = role
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| {
                    let detail = &m.state_detail;
                    m.state == MemberState::Ready
                        && !m.pod.is_empty()
                        && detail.last_config_data_generation.map_or(false, |g| {
                            g != config_generation || detail.last_connection_version.unwrap_or(0) < connections_version
                        })
                })
                .map(|(idx, _)| idx)
                .collect();

            let results = join_all(stale.iter().map(|&idx| {
                let member = &role.members[idx];
                let reconnect = member.state_detail.last_connection_version.unwrap_or(0) < connections_version;
                async move {
                    let target = self.exec_target(
                        pass,
                        &member.pod,
                        member.state_detail.last_configured_container.as_deref(),
                    );
                    let doc = configmeta
                        .render(&member.pod)
                        .map_err(|e| ExecError::Transport(e.to_string()))?;
                    write_file(self.executor.as_ref(), &target, CONFIGMETA_FILE, doc.as_bytes()).await?;
                    if reconnect {
                        run_script(
                            self.executor.as_ref(),
                            &target,
                            "reconnect",
                            &format!("{} --reconnect", STARTSCRIPT),
                        )
                        .await?;
                    }
                    Ok::<bool, ExecError>(reconnect)
                }
            }))
            .await;

            for (idx, result) in stale.into_iter().zip(results) {
                let member = &mut role.members[idx];
                match result {
                    Ok(reconnected) => {
                        member.state_detail.last_config_data_generation = Some(config_generation);
                        if reconnected {
                            member.state_detail.last_connection_version = Some(connections_version);
                        }
                    }
                    Err(e) => {
                        warn!(cluster = %pass.key, member = %member.pod, "failed to update configmeta: {}", e);
                        all_ok = false;
                    }
                }
            }
        }
        all_ok
    }

    /// Makes the StatefulSet's replica count match the members that should
    /// have a pod. Returns true once the two agree.
    async fn check_member_count(&self, pass: &Pass<'_>, status: &VirtualClusterStatus, r: usize, info: &mut RoleInfo) -> bool {
        let Some(sts) = info.stateful_set.as_ref() else {
            return false;
        };
        let wanted = MemberBuckets::from_members(&status.roles[r].members).replica_count() as i32;
        if replicas(sts) == wanted {
            return true;
        }
        info!(cluster = %pass.key, role = %info.id, "changing replicas from {} to {}", replicas(sts), wanted);
        match self
            .accessor
            .update_stateful_set(&pass.namespace, &with_replicas(sts, wanted))
            .await
        {
            Ok(updated) => info.stateful_set = Some(updated),
            Err(e) => error!(cluster = %pass.key, role = %info.id, "failed to change StatefulSet replicas: {}", e),
        }
        false
    }

    async fn handle_create_pending(&self, pass: &Pass<'_>, status: &mut VirtualClusterStatus, r: usize, info: &mut RoleInfo) {
        let pending = MemberBuckets::from_members(&status.roles[r].members)
            .get(MemberState::CreatePending)
            .to_vec();
        if pending.is_empty() || !self.check_member_count(pass, status, r, info).await {
            return;
        }
        let Some(sts) = info.stateful_set.as_ref() else {
            return;
        };
        if status_replicas(sts) != replicas(sts) {
            info!(cluster = %pass.key, role = %info.id, "waiting for StatefulSet to settle");
            return;
        }

        let members = &status.roles[r].members;
        let pods = join_all(
            pending
                .iter()
                .map(|&idx| self.accessor.get_pod(&pass.namespace, &members[idx].pod)),
        )
        .await;

        for (idx, pod) in pending.into_iter().zip(pods) {
            let member = &mut status.roles[r].members[idx];
            let pod = match pod {
                Ok(pod) => pod,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(cluster = %pass.key, member = %member.pod, "failed to get pod: {}", e);
                    continue;
                }
            };
            match app_container_id(&pod, &self.config.app_container) {
                Some(cid) => {
                    info!(cluster = %pass.key, member = %member.pod, "pod running; starting setup");
                    member.state = MemberState::Creating;
                    member.state_detail.configuring_container = Some(cid);
                    member.state_detail.scheduling_error_message = None;
                }
                None => member.state_detail.scheduling_error_message = scheduling_error(&pod),
            }
        }
    }

    async fn handle_creating(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        r: usize,
        configmeta: &ConfigMetaGenerator,
    ) {
        let creating = MemberBuckets::from_members(&status.roles[r].members)
            .get(MemberState::Creating)
            .to_vec();
        if creating.is_empty() {
            return;
        }
        let role_id = status.roles[r].id.clone();
        let setup_url = catalog::setup_package_url_for_role(&pass.app, &role_id);
        let injections: Vec<FileInjection> = pass
            .cluster
            .spec
            .roles
            .iter()
            .find(|x| x.id == role_id)
            .map(|x| x.file_injections.clone())
            .unwrap_or_default();
        let config_generation = status.config_generation;

        let results = join_all(creating.iter().map(|&idx| {
            let mut member = status.roles[r].members[idx].clone();
            let (role_id, setup_url, injections) = (&role_id, setup_url.as_deref(), &injections);
            async move {
                let outcome = self
                    .configure_member(pass, role_id, injections, setup_url, &mut member, config_generation, configmeta)
                    .await;
                (member, outcome)
            }
        }))
        .await;

        let mut configured = Vec::new();
        for (idx, (member, outcome)) in creating.into_iter().zip(results) {
            status.roles[r].members[idx] = member;
            match outcome {
                MemberOutcome::Configured => configured.push(idx),
                MemberOutcome::ConfigError(detail) => {
                    let member = &mut status.roles[r].members[idx];
                    member.state = MemberState::ConfigError;
                    member.state_detail.config_error_detail = Some(detail.clone());
                    finish_configuring(member);
                    let message = format!("failed to set up member{{{}}} in role{{{}}}: {}", member.pod, role_id, detail);
                    self.event(pass, EVENT_REASON_MEMBER, message).await;
                }
                MemberOutcome::Pending => {}
            }
        }
        if configured.is_empty() {
            return;
        }

        let fqdns: Vec<String> = configured
            .iter()
            .map(|&idx| member_fqdn(&status.roles[r].members[idx].pod, &pass.domain))
            .collect();
        if let Some(desc) = notification(NotifyOp::AddNodes, &role_id, &fqdns) {
            self.notify_ready_members(pass, status, NotifyOp::AddNodes, &desc).await;
        }
        for idx in configured {
            let member = &mut status.roles[r].members[idx];
            member.state = MemberState::Ready;
            member.state_detail.config_error_detail = None;
            finish_configuring(member);
            info!(cluster = %pass.key, member = %member.pod, "member ready");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn configure_member(
        &self,
        pass: &Pass<'_>,
        role_id: &str,
        injections: &[FileInjection],
        setup_url: Option<&str>,
        member: &mut MemberStatus,
        config_generation: i64,
        configmeta: &ConfigMetaGenerator,
    ) -> MemberOutcome {
        member.state_detail.last_connection_version = Some(pass.connections_version);

        if !injections.is_empty() {
            let target = self.exec_target(pass, &member.pod, member.state_detail.configuring_container.as_deref());
            if let Err(e) = self.inject_files(&target, injections).await {
                error!(cluster = %pass.key, member = %member.pod, "failed to inject files: {}", e);
                return MemberOutcome::ConfigError(format!("failed requested file injections: {}", e));
            }
        }

        let Some(url) = setup_url else {
            info!(cluster = %pass.key, member = %member.pod, "initial config skipped");
            return MemberOutcome::Configured;
        };

        match self
            .app_config(pass, role_id, &member.pod, url, &mut member.state_detail, config_generation, configmeta)
            .await
        {
            Ok(SetupProgress::Succeeded) => MemberOutcome::Configured,
            Ok(SetupProgress::Running) => {
                info!(cluster = %pass.key, member = %member.pod, "initial config ongoing");
                MemberOutcome::Pending
            }
            Err(e) => MemberOutcome::ConfigError(format!("execution of app config failed: {}", e)),
        }
    }

    async fn handle_delete_pending(&self, pass: &Pass<'_>, status: &mut VirtualClusterStatus, r: usize) {
        let leaving = MemberBuckets::from_members(&status.roles[r].members)
            .get(MemberState::DeletePending)
            .to_vec();
        if leaving.is_empty() {
            return;
        }
        let role_id = status.roles[r].id.clone();
        let fqdns: Vec<String> = leaving
            .iter()
            .map(|&idx| member_fqdn(&status.roles[r].members[idx].pod, &pass.domain))
            .collect();
        if let Some(desc) = notification(NotifyOp::DelNodes, &role_id, &fqdns) {
            self.notify_ready_members(pass, status, NotifyOp::DelNodes, &desc).await;
        }
        for idx in leaving {
            status.roles[r].members[idx].state = MemberState::Deleting;
        }
    }

    /// Once a deleting member's pod is gone, removes its service and volume
    /// claim and blanks the entry for compaction.
    async fn handle_deleting(&self, pass: &Pass<'_>, status: &mut VirtualClusterStatus, r: usize, info: &mut RoleInfo) {
        let deleting: Vec<usize> = MemberBuckets::from_members(&status.roles[r].members)
            .get(MemberState::Deleting)
            .iter()
            .copied()
            .filter(|&idx| !status.roles[r].members[idx].pod.is_empty())
            .collect();
        if deleting.is_empty() {
            return;
        }
        if info.stateful_set.is_some() && !self.check_member_count(pass, status, r, info).await {
            return;
        }

        let members = &status.roles[r].members;
        let results = join_all(deleting.iter().map(|&idx| self.clean_up_member(pass, &members[idx]))).await;
        for (idx, gone) in deleting.into_iter().zip(results) {
            if gone {
                let member = &mut status.roles[r].members[idx];
                info!(cluster = %pass.key, member = %member.pod, "member deleted");
                member.pod.clear();
                member.service.clear();
                member.pvc.clear();
            }
        }
    }

    async fn clean_up_member(&self, pass: &Pass<'_>, member: &MemberStatus) -> bool {
        match self.accessor.get_pod(&pass.namespace, &member.pod).await {
            Err(e) if e.is_not_found() => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(cluster = %pass.key, member = %member.pod, "failed to get pod: {}", e);
                return false;
            }
        }
        let mut clear = true;
        if !member.service.is_empty() && member.service != NO_PORTS_SERVICE {
            match self.accessor.delete_service(&pass.namespace, &member.service).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(cluster = %pass.key, member = %member.pod, "failed to delete service: {}", e);
                    clear = false;
                }
            }
        }
        if !member.pvc.is_empty() {
            match self.accessor.delete_pvc(&pass.namespace, &member.pvc).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(cluster = %pass.key, member = %member.pod, "failed to delete PVC: {}", e);
                    clear = false;
                }
            }
        }
        clear
    }

    /// Runs the config error check for every role. Returns true if any
    /// member went back to creating.
    pub(crate) async fn retry_failed_members(&self, pass: &Pass<'_>, status: &mut VirtualClusterStatus) -> bool {
        let mut retrying = false;
        for r in 0..status.roles.len() {
            retrying |= self.handle_config_error(pass, status, r).await;
        }
        retrying
    }

    /// A member stuck in config error gets another setup attempt when its
    /// app container has been restarted.
    async fn handle_config_error(&self, pass: &Pass<'_>, status: &mut VirtualClusterStatus, r: usize) -> bool {
        let failed = MemberBuckets::from_members(&status.roles[r].members)
            .get(MemberState::ConfigError)
            .to_vec();
        if failed.is_empty() {
            return false;
        }
        let members = &status.roles[r].members;
        let pods = join_all(
            failed
                .iter()
                .map(|&idx| self.accessor.get_pod(&pass.namespace, &members[idx].pod)),
        )
        .await;

        let mut retrying = false;
        for (idx, pod) in failed.into_iter().zip(pods) {
            let Ok(pod) = pod else {
                continue;
            };
            let member = &mut status.roles[r].members[idx];
            let Some(cid) = app_container_id(&pod, &self.config.app_container) else {
                continue;
            };
            if member.state_detail.last_configured_container.as_deref() != Some(cid.as_str()) {
                info!(cluster = %pass.key, member = %member.pod, "app container restarted; retrying setup");
                member.state = MemberState::Creating;
                member.state_detail.configuring_container = Some(cid);
                retrying = true;
            }
        }
        retrying
    }
}
