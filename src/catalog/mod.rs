// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Application type lookup.
//!
//! `AppCatalog` resolves the `VirtualClusterApp` a cluster refers to; the
//! free functions answer role-scoped questions about a resolved `AppSpec`.
pub mod kube_catalog;

use crate::crd::{AppRole, AppSpec, VirtualCluster};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

pub use kube_catalog::KubeAppCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("app {0} not found")]
    NotFound(String),
    #[error("failed to read app {0}: {1}")]
    Lookup(String, String),
    #[error("app {app} has no image for role {role}")]
    NoImage { app: String, role: String },
}

#[async_trait]
pub trait AppCatalog: Send + Sync {
    async fn resolve_app(&self, cluster: &VirtualCluster) -> Result<AppSpec, CatalogError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub id: String,
    pub port: i32,
    pub scheme: Option<String>,
}

pub fn app_role<'a>(app: &'a AppSpec, role_id: &str) -> Option<&'a AppRole> {
    app.roles.iter().find(|r| r.id == role_id)
}

/// Ports exposed by the services the role runs, in role declaration order.
pub fn ports_for_role(app: &AppSpec, role_id: &str) -> Vec<ServicePort> {
    let Some(role) = app_role(app, role_id) else {
        return Vec::new();
    };
    role.service_ids
        .iter()
        .filter_map(|sid| app.services.iter().find(|s| &s.id == sid))
        .filter_map(|s| {
            s.endpoint.as_ref().map(|ep| ServicePort {
                id: s.id.clone(),
                port: ep.port,
                scheme: ep.url_scheme.clone(),
            })
        })
        .collect()
}

pub fn image_for_role(app: &AppSpec, role_id: &str) -> Option<String> {
    app_role(app, role_id)
        .and_then(|r| r.image.clone())
        .or_else(|| app.default_image.clone())
}

/// `None` means the role runs without a setup package.
pub fn setup_package_url_for_role(app: &AppSpec, role_id: &str) -> Option<String> {
    let url = match app_role(app, role_id).and_then(|r| r.setup_package_url.clone()) {
        Some(url) => Some(url),
        None => app.default_setup_package_url.clone(),
    };
    url.filter(|u| !u.is_empty())
}

pub fn persist_dirs_for_role(app: &AppSpec, role_id: &str) -> Vec<String> {
    app_role(app, role_id)
        .and_then(|r| r.persist_dirs.clone())
        .unwrap_or_else(|| app.default_persist_dirs.clone())
}

pub fn capabilities(app: &AppSpec) -> &[String] {
    &app.capabilities
}

pub fn systemd_required(app: &AppSpec) -> bool {
    app.systemd_required
}

/// A role without an event list subscribes to every lifecycle event.
pub fn role_subscribes(app: &AppSpec, role_id: &str, event: &str) -> bool {
    match app_role(app, role_id).and_then(|r| r.event_list.as_ref()) {
        Some(events) => events.iter().any(|e| e == event),
        None => true,
    }
}

/// Tracks which clusters currently use which app, so an app in use can be
/// protected from deletion.
#[derive(Debug, Default)]
pub struct AppReferences {
    refs: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

fn cluster_key(cluster: &VirtualCluster) -> String {
    format!("{}/{}", cluster.namespace().unwrap_or_default(), cluster.name_any())
}

fn app_key(cluster: &VirtualCluster) -> String {
    format!("{}/{}", cluster.namespace().unwrap_or_default(), cluster.spec.app)
}

impl AppReferences {
    pub fn ensure(&self, cluster: &VirtualCluster) {
        if let Ok(mut refs) = self.refs.write() {
            refs.entry(app_key(cluster)).or_default().insert(cluster_key(cluster));
        }
    }

    pub fn remove(&self, cluster: &VirtualCluster) {
        if let Ok(mut refs) = self.refs.write() {
            let key = app_key(cluster);
            if let Some(users) = refs.get_mut(&key) {
                users.remove(&cluster_key(cluster));
                if users.is_empty() {
                    refs.remove(&key);
                }
            }
        }
    }

    /// Clusters referencing the app `namespace/name`.
    pub fn clusters_using_app(&self, namespace: &str, name: &str) -> Vec<String> {
        self.refs
            .read()
            .ok()
            .and_then(|refs| refs.get(&format!("{}/{}", namespace, name)).cloned())
            .map(|users| users.into_iter().collect())
            .unwrap_or_default()
    }
}
