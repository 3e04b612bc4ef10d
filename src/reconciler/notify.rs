// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::setup::STARTSCRIPT;
use super::{ClusterReconciler, Pass};
use crate::catalog;
use crate::crd::{MemberState, NotificationDesc, VirtualClusterStatus};
use crate::resources::NODEGROUP_ID;
use crate::shim_layer::guest::run_script;
use crate::shim_layer::ExecError;
use futures::future::join_all;
use tracing::*;

/// Membership change announced to ready members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOp {
    AddNodes,
    DelNodes,
}

impl NotifyOp {
    /// Name of the lifecycle event roles subscribe to.
    pub fn event(self) -> &'static str {
        match self {
            NotifyOp::AddNodes => "addnodes",
            NotifyOp::DelNodes => "delnodes",
        }
    }
}

/// Builds the startscript arguments announcing `fqdns` of `role_id`, or
/// nothing when there is no one to announce.
pub fn notification(op: NotifyOp, role_id: &str, fqdns: &[String]) -> Option<NotificationDesc> {
    if fqdns.is_empty() {
        return None;
    }
    Some(NotificationDesc {
        arguments: vec![
            format!("--{}", op.event()),
            "--nodegroup".to_string(),
            NODEGROUP_ID.to_string(),
            "--role".to_string(),
            role_id.to_string(),
            "--fqdns".to_string(),
            fqdns.join(","),
        ],
    })
}

pub fn notify_command(desc: &NotificationDesc) -> String {
    format!("{} {}", STARTSCRIPT, desc.arguments.join(" "))
}

impl ClusterReconciler {
    async fn run_notify(&self, pass: &Pass<'_>, pod: &str, container: Option<&str>, desc: &NotificationDesc) -> Result<(), ExecError> {
        let target = self.exec_target(pass, pod, container);
        run_script(self.executor.as_ref(), &target, "notify", &notify_command(desc)).await
    }

    /// Delivers `desc` to every ready member whose role subscribes to `op`.
    /// Members that already have queued commands, or that cannot be reached,
    /// get it appended to their queue instead.
    pub(crate) async fn notify_ready_members(
        &self,
        pass: &Pass<'_>,
        status: &mut VirtualClusterStatus,
        op: NotifyOp,
        desc: &NotificationDesc,
    ) {
        for role in status.roles.iter_mut() {
            if catalog::setup_package_url_for_role(&pass.app, &role.id).is_none()
                || !catalog::role_subscribes(&pass.app, &role.id, op.event())
            {
                continue;
            }

            let mut direct = Vec::new();
            for (idx, member) in role.members.iter_mut().enumerate() {
                if member.state != MemberState::Ready || member.pod.is_empty() {
                    continue;
                }
                if member.state_detail.pending_notify_cmds.is_empty() {
                    direct.push(idx);
                } else {
                    member.state_detail.pending_notify_cmds.push(desc.clone());
                }
            }

            let results = join_all(direct.iter().map(|&idx| {
                let member = &role.members[idx];
                self.run_notify(
                    pass,
                    &member.pod,
                    member.state_detail.last_configured_container.as_deref(),
                    desc,
                )
            }))
            .await;

            for (idx, result) in direct.into_iter().zip(results) {
                if let Err(e) = result {
                    let member = &mut role.members[idx];
                    warn!(cluster = %pass.key, member = %member.pod, "failed to deliver {} notification, queueing: {}", op.event(), e);
                    member.state_detail.pending_notify_cmds.push(desc.clone());
                }
            }
        }
    }

    /// Retries queued notifications in order, stopping at the first failure
    /// for each member.
    pub(crate) async fn replay_pending_notifies(&self, pass: &Pass<'_>, status: &mut VirtualClusterStatus) {
        for role in status.roles.iter_mut() {
            let queued: Vec<usize> = role
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.state == MemberState::Ready && !m.state_detail.pending_notify_cmds.is_empty())
                .map(|(idx, _)| idx)
                .collect();
            if queued.is_empty() {
                continue;
            }

            let delivered = join_all(queued.iter().map(|&idx| {
                let member = &role.members[idx];
                async move {
                    let mut done = 0;
                    for desc in &member.state_detail.pending_notify_cmds {
                        let container = member.state_detail.last_configured_container.as_deref();
                        match self.run_notify(pass, &member.pod, container, desc).await {
                            Ok(()) => done += 1,
                            Err(e) => {
                                warn!(cluster = %pass.key, member = %member.pod, "queued notification failed: {}", e);
                                break;
                            }
                        }
                    }
                    done
                }
            }))
            .await;

            for (idx, done) in queued.into_iter().zip(delivered) {
                role.members[idx].state_detail.pending_notify_cmds.drain(..done);
            }
        }
    }
}
