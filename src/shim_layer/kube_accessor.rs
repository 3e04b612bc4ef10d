// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::{kube_error_to_api_error, APIError, ResourceAccessor};
use crate::crd::VirtualCluster;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource,
};
use tracing::*;

/// ResourceAccessor backed by the Kubernetes API server.
pub struct KubeAccessor {
    client: Client,
    reporter: Reporter,
}

impl KubeAccessor {
    pub fn new(client: Client) -> Self {
        KubeAccessor {
            client,
            reporter: Reporter {
                controller: "vcluster-controller".to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn clusters(&self, namespace: &str) -> Api<VirtualCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_name<K: Resource>(obj: &K) -> Result<&str, APIError> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| APIError::Other("object misses .metadata.name".to_string()))
}

#[async_trait]
impl ResourceAccessor for KubeAccessor {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<VirtualCluster, APIError> {
        self.clusters(namespace)
            .get(name)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn update_cluster(&self, cluster: &VirtualCluster) -> Result<VirtualCluster, APIError> {
        let namespace = cluster.meta().namespace.as_deref().unwrap_or_default();
        self.clusters(namespace)
            .replace(object_name(cluster)?, &PostParams::default(), cluster)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn update_cluster_status(&self, cluster: &VirtualCluster) -> Result<VirtualCluster, APIError> {
        let namespace = cluster.meta().namespace.as_deref().unwrap_or_default();
        // The serialized object carries metadata.resourceVersion, so a stale
        // read is rejected with Conflict.
        let data = serde_json::to_vec(cluster).map_err(|e| APIError::Other(e.to_string()))?;
        self.clusters(namespace)
            .replace_status(object_name(cluster)?, &PostParams::default(), data)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn list_stateful_sets(&self, namespace: &str, label_selector: &str) -> Result<Vec<StatefulSet>, APIError> {
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), namespace);
        api.list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn create_stateful_set(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet, APIError> {
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), sts)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn update_stateful_set(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet, APIError> {
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), namespace);
        api.replace(object_name(sts)?, &PostParams::default(), sts)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), APIError> {
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, APIError> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| kube_error_to_api_error(&e))
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service, APIError> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), svc)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn update_service(&self, namespace: &str, svc: &Service) -> Result<Service, APIError> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        api.replace(object_name(svc)?, &PostParams::default(), svc)
            .await
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), APIError> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, APIError> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| kube_error_to_api_error(&e))
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), APIError> {
        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| kube_error_to_api_error(&e))
    }

    async fn record_event(&self, cluster: &VirtualCluster, reason: &str, message: &str) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            cluster.object_ref(&()),
        );
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("failed to record event {}: {}", reason, e);
        }
    }
}
