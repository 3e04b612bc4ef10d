// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::catalog;
use crate::crd::{AppSpec, VirtualCluster, VirtualClusterStatus};
use crate::resources::{member_fqdn, NODEGROUP_ID};
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

const CONFIGMETA_VERSION: &str = "1";

/// Renders the configuration document pushed into members.
///
/// The cluster-wide part is built once per pass; `render` only fills in the
/// "node" section for the member asking.
#[derive(Debug, Clone)]
pub struct ConfigMetaGenerator {
    document: Value,
    nodes: HashMap<String, Value>,
}

impl ConfigMetaGenerator {
    pub fn new(cluster: &VirtualCluster, status: &VirtualClusterStatus, app: &AppSpec, domain: &str) -> Self {
        let mut roles = Map::new();
        let mut services: Map<String, Value> = Map::new();
        let mut nodes = HashMap::new();

        for role_status in &status.roles {
            let members: Vec<_> = role_status
                .members
                .iter()
                .filter(|m| !m.pod.is_empty() && m.state.holds_replica())
                .collect();
            if members.is_empty() {
                continue;
            }
            let role_id = &role_status.id;
            let fqdns: Vec<String> = members.iter().map(|m| member_fqdn(&m.pod, domain)).collect();
            let node_ids: Vec<String> = members.iter().map(|m| m.node_id.to_string()).collect();
            let fqdn_mappings: Map<String, Value> = fqdns
                .iter()
                .zip(members.iter())
                .map(|(f, m)| (f.clone(), json!(m.node_id.to_string())))
                .collect();

            let mut role_services = Map::new();
            for port in catalog::ports_for_role(app, role_id) {
                let endpoints: Vec<String> = fqdns
                    .iter()
                    .map(|f| match &port.scheme {
                        Some(scheme) => format!("{}://{}:{}", scheme, f, port.port),
                        None => format!("{}:{}", f, port.port),
                    })
                    .collect();
                let label = app
                    .services
                    .iter()
                    .find(|s| s.id == port.id)
                    .map(|s| s.label.clone())
                    .unwrap_or_default();
                role_services.insert(
                    port.id.clone(),
                    json!({
                        "name": label,
                        "endpoints": endpoints,
                        "fqdns": fqdns,
                        "exported_service": port.scheme.clone().unwrap_or_default(),
                    }),
                );
                let refs = services
                    .entry(port.id.clone())
                    .or_insert_with(|| json!({ NODEGROUP_ID: {} }));
                if let Some(group) = refs.get_mut(NODEGROUP_ID).and_then(Value::as_object_mut) {
                    group.insert(
                        role_id.clone(),
                        json!([format!("nodegroups.{}.roles.{}.services.{}", NODEGROUP_ID, role_id, port.id)]),
                    );
                }
            }

            let flavor = cluster
                .spec
                .roles
                .iter()
                .find(|r| &r.id == role_id)
                .map(|r| {
                    let quantity = |name: &str| {
                        r.resources
                            .as_ref()
                            .and_then(|res| res.limits.as_ref().or(res.requests.as_ref()))
                            .and_then(|q| q.get(name))
                            .map(|q| q.0.clone())
                            .unwrap_or_default()
                    };
                    json!({
                        "cores": quantity("cpu"),
                        "memory": quantity("memory"),
                        "storage": r.storage.as_ref().map(|s| s.size.clone()).unwrap_or_default(),
                    })
                })
                .unwrap_or_else(|| json!({}));

            roles.insert(
                role_id.clone(),
                json!({
                    "node_ids": node_ids,
                    "hostnames": fqdns,
                    "fqdns": fqdns,
                    "fqdn_mappings": fqdn_mappings,
                    "services": role_services,
                    "flavor": flavor,
                }),
            );

            for (m, fqdn) in members.iter().zip(fqdns.iter()) {
                nodes.insert(
                    m.pod.clone(),
                    json!({
                        "role_id": role_id,
                        "nodegroup_id": NODEGROUP_ID,
                        "id": m.node_id.to_string(),
                        "hostname": fqdn,
                        "fqdn": fqdn,
                        "domain": domain,
                        "distro_id": app.distro_id,
                        "depends_on": {},
                    }),
                );
            }
        }

        let connections = &cluster.spec.connections;
        let document = json!({
            "version": CONFIGMETA_VERSION,
            "services": services,
            "nodegroups": {
                NODEGROUP_ID: {
                    "roles": roles,
                    "distro_id": app.distro_id,
                    "catalog_entry_version": app.version,
                    "config_metadata": {},
                }
            },
            "distros": {
                app.distro_id.clone(): {
                    NODEGROUP_ID: {
                        "roles": status.roles.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
                    }
                }
            },
            "cluster": {
                "name": cluster.name_any(),
                "namespace": cluster.namespace().unwrap_or_default(),
                "id": cluster.uid().unwrap_or_default(),
                "isolated": false,
                "config_meta": {},
                "connections": {
                    "clusters": connections.clusters,
                    "configmaps": connections.configmaps,
                    "secrets": connections.secrets,
                },
            },
        });

        ConfigMetaGenerator { document, nodes }
    }

    /// JSON text for `pod`; the "node" section is null for unknown pods.
    pub fn render(&self, pod: &str) -> Result<String, serde_json::Error> {
        let mut doc = self.document.clone();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("node".to_string(), self.nodes.get(pod).cloned().unwrap_or(Value::Null));
        }
        serde_json::to_string(&doc)
    }

    #[cfg(test)]
    pub fn document(&self) -> &Value {
        &self.document
    }
}
