// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::catalog::kube_catalog::KubeAppCatalog;
use crate::config::ControllerConfig;
use crate::crd::VirtualCluster;
use crate::error::Error;
use crate::reconciler::ClusterReconciler;
use crate::shim_layer::kube_accessor::KubeAccessor;
use crate::shim_layer::kube_executor::KubeExecutor;
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client, ResourceExt,
};
use std::sync::Arc;
use tracing::*;

// Data we want access to in error/reconcile calls
pub struct Data {
    pub reconciler: ClusterReconciler,
}

/// run_controller wires the reconciler to kube-rs and drives it until a
/// shutdown signal arrives.
pub async fn run_controller(client: Client, config: ControllerConfig) -> Result<()> {
    let (clusters, stateful_sets, services) = match &config.namespace {
        Some(ns) => (
            Api::<VirtualCluster>::namespaced(client.clone(), ns),
            Api::<StatefulSet>::namespaced(client.clone(), ns),
            Api::<Service>::namespaced(client.clone(), ns),
        ),
        None => (
            Api::<VirtualCluster>::all(client.clone()),
            Api::<StatefulSet>::all(client.clone()),
            Api::<Service>::all(client.clone()),
        ),
    };

    let reconciler = ClusterReconciler::new(
        Arc::new(KubeAccessor::new(client.clone())),
        Arc::new(KubeExecutor::new(client.clone())),
        Arc::new(KubeAppCatalog::new(client.clone())),
        config,
    );

    Controller::new(clusters, watcher::Config::default())
        .owns(stateful_sets, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Data { reconciler }))
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("reconciled {:?}", o),
                Err(e) => warn!("reconcile failed: {}", e),
            }
        })
        .await;
    info!("controller terminated");
    Ok(())
}

async fn reconcile(cluster: Arc<VirtualCluster>, ctx: Arc<Data>) -> Result<Action, Error> {
    let name = cluster.metadata.name.as_ref().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = cluster
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    ctx.reconciler.sync_cluster(namespace, name).await?;
    Ok(Action::requeue(ctx.reconciler.config.requeue_interval()))
}

/// The controller triggers this on reconcile errors
fn error_policy(cluster: Arc<VirtualCluster>, error: &Error, ctx: Arc<Data>) -> Action {
    warn!("Reconcile of {} failed due to error: {}", cluster.name_any(), error);
    Action::requeue(ctx.reconciler.config.error_requeue_interval())
}
