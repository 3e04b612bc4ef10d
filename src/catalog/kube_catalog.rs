// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::{AppCatalog, CatalogError};
use crate::crd::{AppSpec, VirtualCluster, VirtualClusterApp};
use crate::shim_layer::kube_error_to_api_error;
use async_trait::async_trait;
use kube::{api::Api, Client, ResourceExt};

/// Resolves apps from `VirtualClusterApp` objects in the cluster's namespace.
pub struct KubeAppCatalog {
    client: Client,
}

impl KubeAppCatalog {
    pub fn new(client: Client) -> Self {
        KubeAppCatalog { client }
    }
}

#[async_trait]
impl AppCatalog for KubeAppCatalog {
    async fn resolve_app(&self, cluster: &VirtualCluster) -> Result<AppSpec, CatalogError> {
        let namespace = cluster.namespace().unwrap_or_default();
        let api = Api::<VirtualClusterApp>::namespaced(self.client.clone(), &namespace);
        match api.get_opt(&cluster.spec.app).await {
            Ok(Some(app)) => Ok(app.spec),
            Ok(None) => Err(CatalogError::NotFound(cluster.spec.app.clone())),
            Err(e) => Err(CatalogError::Lookup(
                cluster.spec.app.clone(),
                kube_error_to_api_error(&e).to_string(),
            )),
        }
    }
}
