// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! The shim layer connects the reconciler to the outside world.
//!
//! The reconciler only talks to the traits declared here; `kube_accessor`
//! and `kube_executor` implement them on top of kube-rs, and the unit tests
//! implement them in memory.
pub mod controller_runtime;
pub mod guest;
pub mod kube_accessor;
pub mod kube_executor;

use crate::crd::VirtualCluster;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum APIError {
    #[error("object not found")]
    ObjectNotFound,
    #[error("object already exists")]
    ObjectAlreadyExists,
    #[error("bad request")]
    BadRequest,
    #[error("resource version conflict")]
    Conflict,
    #[error("invalid object")]
    Invalid,
    #[error("internal error")]
    InternalError,
    #[error("timeout")]
    Timeout,
    #[error("server timeout")]
    ServerTimeout,
    #[error("{0}")]
    Other(String),
}

impl APIError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, APIError::ObjectNotFound)
    }
}

/// kube_error_to_api_error translates the error from kube-rs APIs
/// to the form that can be processed by the reconciler.
pub fn kube_error_to_api_error(error: &kube::Error) -> APIError {
    match error {
        kube::Error::Api(error_resp) => match error_resp.reason.as_str() {
            "NotFound" => APIError::ObjectNotFound,
            "AlreadyExists" => APIError::ObjectAlreadyExists,
            "BadRequest" => APIError::BadRequest,
            "Conflict" => APIError::Conflict,
            "Invalid" => APIError::Invalid,
            "InternalError" => APIError::InternalError,
            "Timeout" => APIError::Timeout,
            "ServerTimeout" => APIError::ServerTimeout,
            _ => APIError::Other(error_resp.message.clone()),
        },
        other => APIError::Other(other.to_string()),
    }
}

/// Read/write primitives for the objects the reconciler manages.
///
/// Every write carries the object's resource version; a stale version
/// surfaces as `APIError::Conflict`.
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<VirtualCluster, APIError>;
    /// Replaces the cluster's metadata and spec; used for finalizer bookkeeping.
    async fn update_cluster(&self, cluster: &VirtualCluster) -> Result<VirtualCluster, APIError>;
    async fn update_cluster_status(&self, cluster: &VirtualCluster) -> Result<VirtualCluster, APIError>;

    async fn list_stateful_sets(&self, namespace: &str, label_selector: &str) -> Result<Vec<StatefulSet>, APIError>;
    async fn create_stateful_set(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet, APIError>;
    async fn update_stateful_set(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet, APIError>;
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), APIError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, APIError>;
    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service, APIError>;
    async fn update_service(&self, namespace: &str, svc: &Service) -> Result<Service, APIError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), APIError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, APIError>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), APIError>;

    /// Records a user-visible event against the cluster. Failures are only logged.
    async fn record_event(&self, cluster: &VirtualCluster, reason: &str, message: &str);
}

/// Identifies the container a guest command runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    /// When set, the command is refused unless the container still has this ID.
    pub expected_container_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub container_id: Option<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("exec transport failed: {0}")]
    Transport(String),
    #[error("{description} exited with status {code}: {stderr}")]
    NonZeroExit {
        description: String,
        code: i32,
        stderr: String,
    },
    #[error("container {container} in pod {pod} is not running")]
    ContainerMissing { pod: String, container: String },
    #[error("container ID changed from {expected} to {actual}")]
    ContainerMismatch { expected: String, actual: String },
}

/// Runs commands inside a member's container.
#[async_trait]
pub trait GuestExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &ExecTarget,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ExecError>;
}
