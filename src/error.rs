// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::catalog::CatalogError;
use crate::shim_layer::APIError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get VirtualCluster: {0}")]
    ClusterGetFailed(#[source] APIError),
    #[error("Failed to reconcile StatefulSet: {0}")]
    ReconcileStatefulSetFailed(#[source] APIError),
    #[error("Failed to reconcile Service: {0}")]
    ReconcileServiceFailed(#[source] APIError),
    #[error("Failed to resolve app: {0}")]
    AppResolveFailed(#[source] CatalogError),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}
