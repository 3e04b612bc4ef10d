// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use k8s_openapi::api::core::v1 as corev1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const FINALIZER: &str = "vcluster.dev/cleanup";
pub const CONNECTIONS_VERSION_ANNOTATION: &str = "vcluster.dev/connections-version";
pub const CLUSTER_LABEL: &str = "vcluster.dev/cluster";
pub const ROLE_LABEL: &str = "vcluster.dev/role";
pub const DEFAULT_SERVICE_TYPE: &str = "NodePort";

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "vcluster.dev", version = "v1", kind = "VirtualCluster")]
#[kube(shortname = "vc", namespaced)]
#[kube(status = "VirtualClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Name of the VirtualClusterApp in the same namespace.
    pub app: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default)]
    pub connections: Connections,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    /// Defaulted by the admission gate; an absent count is treated as zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<corev1::ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
    #[serde(default)]
    pub env: Vec<corev1::EnvVar>,
    #[serde(default)]
    pub file_injections: Vec<FileInjection>,
}

impl Role {
    pub fn desired_members(&self) -> usize {
        self.members.unwrap_or(0).max(0) as usize
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInjection {
    pub src_url: String,
    pub dest_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<FilePermissions>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilePermissions {
    /// Octal mode string, e.g. "0755".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_group: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connections {
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub configmaps: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    #[serde(default)]
    pub state: ClusterState,
    #[serde(default)]
    pub generation_uid: String,
    #[serde(default)]
    pub cluster_service: String,
    #[serde(default)]
    pub last_node_id: i64,
    /// Bumped whenever the rendered member configuration may have changed.
    #[serde(default)]
    pub config_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub roles: Vec<RoleStatus>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    #[default]
    Creating,
    Updating,
    Ready,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleStatus {
    pub id: String,
    /// Empty once the backing StatefulSet is gone for good; such entries are compacted away.
    #[serde(default)]
    pub stateful_set: String,
    #[serde(default)]
    pub members: Vec<MemberStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Empty once the member is fully cleaned up; such entries are compacted away.
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub pvc: String,
    pub node_id: i64,
    pub state: MemberState,
    #[serde(default)]
    pub state_detail: MemberStateDetail,
}

#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum MemberState {
    #[default]
    #[serde(rename = "create pending")]
    CreatePending,
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "delete pending")]
    DeletePending,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "config error")]
    ConfigError,
}

impl MemberState {
    /// Members in these states own a replica of the role's StatefulSet.
    pub fn holds_replica(self) -> bool {
        matches!(
            self,
            MemberState::CreatePending
                | MemberState::Creating
                | MemberState::Ready
                | MemberState::ConfigError
        )
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberState::CreatePending => "create pending",
            MemberState::Creating => "creating",
            MemberState::Ready => "ready",
            MemberState::DeletePending => "delete pending",
            MemberState::Deleting => "deleting",
            MemberState::ConfigError => "config error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStateDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuring_container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_configured_container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config_data_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_notify_cmds: Vec<NotificationDesc>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDesc {
    pub arguments: Vec<String>,
}

/// Application type definition referenced by `VirtualClusterSpec::app`.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "vcluster.dev", version = "v1", kind = "VirtualClusterApp")]
#[kube(shortname = "vca", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub distro_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub systemd_required: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
    #[serde(default)]
    pub default_persist_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_setup_package_url: Option<String>,
    #[serde(default)]
    pub services: Vec<AppService>,
    #[serde(default)]
    pub roles: Vec<AppRole>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppService {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<ServiceEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_scheme: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppRole {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_dirs: Option<Vec<String>>,
    /// Overrides the app default; an empty string disables setup for the role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_package_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_list: Option<Vec<String>>,
    #[serde(default)]
    pub service_ids: Vec<String>,
}
