// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! The cluster reconciliation engine.
//!
//! One pass (`ClusterReconciler::sync_cluster`) reads the cluster, checks the
//! status generation ledger, then walks roles, endpoints and members in that
//! order, mutating an in-memory copy of the status that is written back at
//! the end of the pass.
pub mod cluster;
pub mod configmeta;
pub mod endpoints;
pub mod ledger;
pub mod members;
pub mod notify;
pub mod roles;
pub mod setup;

use crate::catalog::{AppCatalog, AppReferences};
use crate::config::ControllerConfig;
use crate::crd::{AppSpec, MemberState, MemberStatus, VirtualCluster};
use crate::resources::member_domain;
use crate::shim_layer::{ExecTarget, GuestExecutor, ResourceAccessor};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::*;

pub use cluster::compact_status;
pub use configmeta::ConfigMetaGenerator;
pub use ledger::{Admission, StatusGenLedger, StatusGenRecord};
pub use roles::RoleSyncState;

pub const EVENT_REASON_CLUSTER: &str = "Cluster";
pub const EVENT_REASON_ROLE: &str = "Role";
pub const EVENT_REASON_MEMBER: &str = "Member";

pub struct ClusterReconciler {
    pub accessor: Arc<dyn ResourceAccessor>,
    pub executor: Arc<dyn GuestExecutor>,
    pub catalog: Arc<dyn AppCatalog>,
    pub ledger: StatusGenLedger,
    pub app_refs: AppReferences,
    pub config: ControllerConfig,
}

impl ClusterReconciler {
    pub fn new(
        accessor: Arc<dyn ResourceAccessor>,
        executor: Arc<dyn GuestExecutor>,
        catalog: Arc<dyn AppCatalog>,
        config: ControllerConfig,
    ) -> Self {
        ClusterReconciler {
            accessor,
            executor,
            catalog,
            ledger: StatusGenLedger::new(),
            app_refs: AppReferences::default(),
            config,
        }
    }

    /// Logs the message and records it as an event on the cluster.
    pub(crate) async fn event(&self, pass: &Pass<'_>, reason: &str, message: String) {
        info!(cluster = %pass.key, "{}", message);
        self.accessor.record_event(pass.cluster, reason, &message).await;
    }

    pub(crate) fn exec_target(&self, pass: &Pass<'_>, pod: &str, container_id: Option<&str>) -> ExecTarget {
        ExecTarget {
            namespace: pass.namespace.clone(),
            pod: pod.to_string(),
            container: self.config.app_container.clone(),
            expected_container_id: container_id.map(|s| s.to_string()),
        }
    }
}

/// Immutable facts about the cluster for the duration of one pass.
pub struct Pass<'a> {
    pub cluster: &'a VirtualCluster,
    pub namespace: String,
    pub name: String,
    /// `namespace/name`, used in log lines.
    pub key: String,
    pub app: AppSpec,
    pub connections_version: i64,
    /// DNS suffix shared by all members: `<cluster service>.<namespace>.<domain>`.
    pub domain: String,
}

impl<'a> Pass<'a> {
    pub fn new(
        cluster: &'a VirtualCluster,
        app: AppSpec,
        cluster_service: &str,
        cluster_domain: &str,
    ) -> Self {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        Pass {
            cluster,
            key: format!("{}/{}", namespace, name),
            domain: member_domain(cluster_service, &namespace, cluster_domain),
            namespace,
            name,
            app,
            connections_version: connections_version(cluster),
        }
    }
}

pub fn connections_version(cluster: &VirtualCluster) -> i64 {
    cluster
        .annotations()
        .get(crate::crd::CONNECTIONS_VERSION_ANNOTATION)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Member indexes of one role grouped by lifecycle state. Rebuilt from the
/// member states whenever needed; never stored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemberBuckets(BTreeMap<MemberState, Vec<usize>>);

impl MemberBuckets {
    pub fn from_members(members: &[MemberStatus]) -> Self {
        let mut buckets = BTreeMap::<MemberState, Vec<usize>>::new();
        for (idx, m) in members.iter().enumerate() {
            buckets.entry(m.state).or_default().push(idx);
        }
        MemberBuckets(buckets)
    }

    pub fn get(&self, state: MemberState) -> &[usize] {
        self.0.get(&state).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn count(&self, state: MemberState) -> usize {
        self.get(state).len()
    }

    pub fn states(&self) -> impl Iterator<Item = MemberState> + '_ {
        self.0.keys().copied()
    }

    /// Members that own a StatefulSet replica.
    pub fn replica_count(&self) -> usize {
        self.0
            .iter()
            .filter(|(state, _)| state.holds_replica())
            .map(|(_, idxs)| idxs.len())
            .sum()
    }
}
