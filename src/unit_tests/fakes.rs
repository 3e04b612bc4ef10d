// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! In-memory stand-ins for the API server, the in-guest executor and the
//! app catalog.
use crate::catalog::{AppCatalog, CatalogError};
use crate::config::ControllerConfig;
use crate::crd::*;
use crate::reconciler::setup::{SETUP_STATUS_FILE, STARTSCRIPT};
use crate::reconciler::ClusterReconciler;
use crate::shim_layer::{APIError, ExecError, ExecOutput, ExecTarget, GuestExecutor, ResourceAccessor};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodCondition, PodStatus, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "default";
pub const CLUSTER_NAME: &str = "vc";
pub const CLUSTER_UID: &str = "uid-vc";

#[derive(Default)]
struct ApiState {
    clusters: BTreeMap<String, VirtualCluster>,
    stateful_sets: BTreeMap<String, StatefulSet>,
    services: BTreeMap<String, Service>,
    pods: BTreeMap<String, Pod>,
    pvcs: BTreeSet<String>,
    events: Vec<(String, String)>,
    restarts: BTreeMap<String, u32>,
    unschedulable: bool,
    status_conflicts: usize,
    status_writes: usize,
    next_rv: u64,
    next_suffix: u64,
}

impl ApiState {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn container_id(&self, pod: &str) -> String {
        match self.restarts.get(pod) {
            Some(n) => format!("cid-{}-{}", pod, n),
            None => format!("cid-{}", pod),
        }
    }

    fn make_pod(&self, name: &str) -> Pod {
        let status = if self.unschedulable {
            PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("0/3 nodes are available: insufficient cpu".to_string()),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }
        } else {
            PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    container_id: Some(self.container_id(name)),
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..ContainerState::default()
                    }),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }
        };
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(status),
            ..Pod::default()
        }
    }

    /// Plays the StatefulSet controller: pods follow the replica count
    /// immediately.
    fn sync_pods(&mut self) {
        let mut wanted = BTreeMap::new();
        for (name, sts) in self.stateful_sets.iter_mut() {
            let spec = sts.spec.as_ref();
            let replicas = spec.and_then(|s| s.replicas).unwrap_or(0);
            let has_claims = spec.and_then(|s| s.volume_claim_templates.as_ref()).is_some();
            for i in 0..replicas {
                wanted.insert(format!("{}-{}", name, i), has_claims);
            }
            sts.status = Some(StatefulSetStatus {
                replicas,
                ..StatefulSetStatus::default()
            });
        }
        let stale: Vec<String> = self.pods.keys().filter(|p| !wanted.contains_key(*p)).cloned().collect();
        for pod in stale {
            self.pods.remove(&pod);
        }
        for (pod, has_claims) in wanted {
            if !self.pods.contains_key(&pod) {
                if has_claims {
                    self.pvcs.insert(format!("p-{}", pod));
                }
                let made = self.make_pod(&pod);
                self.pods.insert(pod, made);
            }
        }
    }
}

#[derive(Default)]
pub struct FakeAccessor {
    state: Mutex<ApiState>,
}

impl FakeAccessor {
    fn state(&self) -> std::sync::MutexGuard<'_, ApiState> {
        self.state.lock().unwrap()
    }

    pub fn insert_cluster(&self, mut cluster: VirtualCluster) {
        let mut st = self.state();
        cluster.metadata.resource_version = Some(st.bump());
        st.clusters.insert(cluster.name_any(), cluster);
    }

    pub fn cluster(&self) -> Option<VirtualCluster> {
        self.state().clusters.get(CLUSTER_NAME).cloned()
    }

    pub fn status(&self) -> VirtualClusterStatus {
        self.cluster().and_then(|c| c.status).unwrap_or_default()
    }

    /// Edits the spec the way `kubectl apply` would.
    pub fn edit_spec(&self, edit: impl FnOnce(&mut VirtualClusterSpec)) {
        let mut st = self.state();
        let rv = st.bump();
        if let Some(cluster) = st.clusters.get_mut(CLUSTER_NAME) {
            edit(&mut cluster.spec);
            cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
            cluster.metadata.resource_version = Some(rv);
        }
    }

    pub fn set_annotation(&self, key: &str, value: &str) {
        let mut st = self.state();
        let rv = st.bump();
        if let Some(cluster) = st.clusters.get_mut(CLUSTER_NAME) {
            cluster.annotations_mut().insert(key.to_string(), value.to_string());
            cluster.metadata.resource_version = Some(rv);
        }
    }

    pub fn mark_deleted(&self) {
        let mut st = self.state();
        let rv = st.bump();
        if let Some(cluster) = st.clusters.get_mut(CLUSTER_NAME) {
            cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
            cluster.metadata.resource_version = Some(rv);
        }
    }

    pub fn stateful_sets(&self) -> Vec<StatefulSet> {
        self.state().stateful_sets.values().cloned().collect()
    }

    /// Creates a StatefulSet out-of-band, labelled as belonging to `role_id`.
    pub fn insert_role_stateful_set(&self, name: &str, role_id: &str) {
        let mut st = self.state();
        let rv = st.bump();
        let sts = StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([
                    (CLUSTER_LABEL.to_string(), CLUSTER_NAME.to_string()),
                    (ROLE_LABEL.to_string(), role_id.to_string()),
                ])),
                resource_version: Some(rv),
                ..ObjectMeta::default()
            },
            ..StatefulSet::default()
        };
        st.stateful_sets.insert(name.to_string(), sts);
        st.sync_pods();
    }

    pub fn remove_stateful_set(&self, name: &str) {
        let mut st = self.state();
        st.stateful_sets.remove(name);
        st.sync_pods();
    }

    pub fn services(&self) -> Vec<Service> {
        self.state().services.values().cloned().collect()
    }

    pub fn pods(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    pub fn pvcs(&self) -> Vec<String> {
        self.state().pvcs.iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.state().events.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    /// The next `n` status writes lose a race with another writer.
    pub fn fail_status_writes(&self, n: usize) {
        self.state().status_conflicts = n;
    }

    pub fn set_unschedulable(&self, unschedulable: bool) {
        let mut st = self.state();
        st.unschedulable = unschedulable;
        let names: Vec<String> = st.pods.keys().cloned().collect();
        for name in names {
            let pod = st.make_pod(&name);
            st.pods.insert(name, pod);
        }
    }

    /// Simulates the app container restarting with a new container ID.
    pub fn restart_pod(&self, name: &str) {
        let mut st = self.state();
        *st.restarts.entry(name.to_string()).or_insert(0) += 1;
        let pod = st.make_pod(name);
        st.pods.insert(name.to_string(), pod);
    }
}

fn check_rv(stored: Option<&String>, incoming: Option<&String>) -> Result<(), APIError> {
    match (stored, incoming) {
        (Some(a), Some(b)) if a != b => Err(APIError::Conflict),
        _ => Ok(()),
    }
}

fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|kv| match kv.split_once('=') {
            Some((k, v)) => labels.get(k).map(|x| x == v).unwrap_or(false),
            None => false,
        })
}

#[async_trait]
impl ResourceAccessor for FakeAccessor {
    async fn get_cluster(&self, _namespace: &str, name: &str) -> Result<VirtualCluster, APIError> {
        self.state().clusters.get(name).cloned().ok_or(APIError::ObjectNotFound)
    }

    async fn update_cluster(&self, cluster: &VirtualCluster) -> Result<VirtualCluster, APIError> {
        let mut st = self.state();
        let name = cluster.name_any();
        let stored = st.clusters.get(&name).cloned().ok_or(APIError::ObjectNotFound)?;
        check_rv(stored.metadata.resource_version.as_ref(), cluster.metadata.resource_version.as_ref())?;
        let mut updated = cluster.clone();
        updated.status = stored.status;
        updated.metadata.resource_version = Some(st.bump());
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            st.clusters.remove(&name);
        } else {
            st.clusters.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn update_cluster_status(&self, cluster: &VirtualCluster) -> Result<VirtualCluster, APIError> {
        let mut st = self.state();
        let name = cluster.name_any();
        let stored = st.clusters.get(&name).cloned().ok_or(APIError::ObjectNotFound)?;
        if st.status_conflicts > 0 {
            st.status_conflicts -= 1;
            let rv = st.bump();
            if let Some(c) = st.clusters.get_mut(&name) {
                c.metadata.resource_version = Some(rv);
            }
            return Err(APIError::Conflict);
        }
        check_rv(stored.metadata.resource_version.as_ref(), cluster.metadata.resource_version.as_ref())?;
        let mut updated = stored;
        updated.status = cluster.status.clone();
        updated.metadata.resource_version = Some(st.bump());
        st.status_writes += 1;
        st.clusters.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_stateful_sets(&self, _namespace: &str, label_selector: &str) -> Result<Vec<StatefulSet>, APIError> {
        Ok(self
            .state()
            .stateful_sets
            .values()
            .filter(|s| selector_matches(s.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_stateful_set(&self, _namespace: &str, sts: &StatefulSet) -> Result<StatefulSet, APIError> {
        let mut st = self.state();
        let mut created = sts.clone();
        if created.metadata.name.is_none() {
            st.next_suffix += 1;
            let prefix = created.metadata.generate_name.clone().unwrap_or_default();
            created.metadata.name = Some(format!("{}{:05}", prefix, st.next_suffix));
        }
        let name = created.name_any();
        if st.stateful_sets.contains_key(&name) {
            return Err(APIError::ObjectAlreadyExists);
        }
        created.metadata.resource_version = Some(st.bump());
        st.stateful_sets.insert(name.clone(), created);
        st.sync_pods();
        st.stateful_sets.get(&name).cloned().ok_or(APIError::InternalError)
    }

    async fn update_stateful_set(&self, _namespace: &str, sts: &StatefulSet) -> Result<StatefulSet, APIError> {
        let mut st = self.state();
        let name = sts.name_any();
        let stored = st.stateful_sets.get(&name).cloned().ok_or(APIError::ObjectNotFound)?;
        check_rv(stored.metadata.resource_version.as_ref(), sts.metadata.resource_version.as_ref())?;
        let mut updated = sts.clone();
        updated.metadata.resource_version = Some(st.bump());
        st.stateful_sets.insert(name.clone(), updated);
        st.sync_pods();
        st.stateful_sets.get(&name).cloned().ok_or(APIError::InternalError)
    }

    async fn delete_stateful_set(&self, _namespace: &str, name: &str) -> Result<(), APIError> {
        let mut st = self.state();
        st.stateful_sets.remove(name).ok_or(APIError::ObjectNotFound)?;
        st.sync_pods();
        Ok(())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Service, APIError> {
        self.state().services.get(name).cloned().ok_or(APIError::ObjectNotFound)
    }

    async fn create_service(&self, _namespace: &str, svc: &Service) -> Result<Service, APIError> {
        let mut st = self.state();
        let name = svc.name_any();
        if st.services.contains_key(&name) {
            return Err(APIError::ObjectAlreadyExists);
        }
        let mut created = svc.clone();
        created.metadata.resource_version = Some(st.bump());
        st.services.insert(name, created.clone());
        Ok(created)
    }

    async fn update_service(&self, _namespace: &str, svc: &Service) -> Result<Service, APIError> {
        let mut st = self.state();
        let name = svc.name_any();
        let stored = st.services.get(&name).cloned().ok_or(APIError::ObjectNotFound)?;
        check_rv(stored.metadata.resource_version.as_ref(), svc.metadata.resource_version.as_ref())?;
        let mut updated = svc.clone();
        updated.metadata.resource_version = Some(st.bump());
        st.services.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), APIError> {
        self.state().services.remove(name).map(|_| ()).ok_or(APIError::ObjectNotFound)
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, APIError> {
        self.state().pods.get(name).cloned().ok_or(APIError::ObjectNotFound)
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<(), APIError> {
        if self.state().pvcs.remove(name) {
            Ok(())
        } else {
            Err(APIError::ObjectNotFound)
        }
    }

    async fn record_event(&self, _cluster: &VirtualCluster, reason: &str, message: &str) {
        self.state().events.push((reason.to_string(), message.to_string()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub pod: String,
    pub script: String,
}

struct ExecState {
    files: BTreeMap<String, BTreeMap<String, String>>,
    calls: Vec<ExecCall>,
    failing_pattern: Option<String>,
    /// Exit status the setup script reports right after launch; `None`
    /// leaves it running.
    setup_exit: Option<String>,
}

/// Simulates each member's filesystem and the setup script.
pub struct FakeExecutor {
    state: Mutex<ExecState>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        FakeExecutor {
            state: Mutex::new(ExecState {
                files: BTreeMap::new(),
                calls: Vec::new(),
                failing_pattern: None,
                setup_exit: Some("0".to_string()),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ExecState> {
        self.state.lock().unwrap()
    }

    pub fn set_setup_exit(&self, exit: Option<&str>) {
        self.state().setup_exit = exit.map(|s| s.to_string());
    }

    /// Completes a setup script left running.
    pub fn finish_setup(&self, pod: &str, exit: &str) {
        let mut st = self.state();
        if let Some(content) = st.files.get_mut(pod).and_then(|f| f.get_mut(SETUP_STATUS_FILE)) {
            content.push_str(exit);
        }
    }

    /// Scripts containing `pattern` fail as if the member were unreachable.
    pub fn fail_scripts_containing(&self, pattern: Option<&str>) {
        self.state().failing_pattern = pattern.map(|s| s.to_string());
    }

    pub fn wipe(&self, pod: &str) {
        self.state().files.remove(pod);
    }

    pub fn file(&self, pod: &str, path: &str) -> Option<String> {
        self.state().files.get(pod).and_then(|f| f.get(path).cloned())
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.state().calls.clone()
    }

    pub fn scripts_containing(&self, pattern: &str) -> Vec<ExecCall> {
        self.calls().into_iter().filter(|c| c.script.contains(pattern)).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

fn ok(stdout: String, exit_code: i32) -> Result<ExecOutput, ExecError> {
    Ok(ExecOutput {
        container_id: None,
        exit_code,
        stdout,
        stderr: String::new(),
    })
}

#[async_trait]
impl GuestExecutor for FakeExecutor {
    async fn execute(&self, target: &ExecTarget, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        let mut st = self.state.lock().unwrap();
        let input = stdin.map(|s| String::from_utf8_lossy(s).to_string()).unwrap_or_default();
        let script = if argv[0] == "/bin/bash" { input.clone() } else { argv.join(" ") };
        st.calls.push(ExecCall {
            pod: target.pod.clone(),
            script: script.clone(),
        });
        let failing = st.failing_pattern.as_ref().map_or(false, |p| script.contains(p.as_str()));
        if failing {
            return Err(ExecError::Transport("connection refused".to_string()));
        }
        let setup_exit = st.setup_exit.clone();
        let files = st.files.entry(target.pod.clone()).or_default();

        match argv[0].as_str() {
            "test" => ok(String::new(), if files.contains_key(&argv[2]) { 0 } else { 1 }),
            "cat" => ok(files.get(&argv[1]).cloned().unwrap_or_default(), 0),
            "sh" => {
                let path = argv[2]
                    .split("tee '")
                    .nth(1)
                    .and_then(|rest| rest.split('\'').next())
                    .unwrap_or_default()
                    .to_string();
                files.insert(path, input);
                ok(String::new(), 0)
            }
            _ => {
                if let Some(path) = script.strip_prefix("test -f ") {
                    return ok(String::new(), if files.contains_key(path.trim()) { 0 } else { 1 });
                }
                if script.contains("appconfig.tgz") {
                    files.insert(STARTSCRIPT.to_string(), String::new());
                } else if let Some(rest) = script.strip_prefix("echo -n ") {
                    let cid = rest.split('=').next().unwrap_or_default();
                    files.insert(
                        SETUP_STATUS_FILE.to_string(),
                        format!("{}={}", cid, setup_exit.unwrap_or_default()),
                    );
                }
                ok(String::new(), 0)
            }
        }
    }
}

pub struct FakeCatalog {
    pub app: Mutex<Option<AppSpec>>,
}

#[async_trait]
impl AppCatalog for FakeCatalog {
    async fn resolve_app(&self, cluster: &VirtualCluster) -> Result<AppSpec, CatalogError> {
        self.app
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CatalogError::NotFound(cluster.spec.app.clone()))
    }
}

pub fn role(id: &str, members: i32) -> Role {
    Role {
        id: id.to_string(),
        members: Some(members),
        ..Role::default()
    }
}

pub fn make_cluster(roles: Vec<Role>) -> VirtualCluster {
    let mut cluster = VirtualCluster::new(
        CLUSTER_NAME,
        VirtualClusterSpec {
            app: "spark".to_string(),
            roles,
            service_type: None,
            connections: Connections::default(),
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some(CLUSTER_UID.to_string());
    cluster.metadata.generation = Some(1);
    cluster
}

/// An app with a controller and a worker role, both exposing ssh.
pub fn make_app(setup_url: Option<&str>) -> AppSpec {
    AppSpec {
        distro_id: "bluedata/spark".to_string(),
        version: "2.4".to_string(),
        default_image: Some("spark:2.4".to_string()),
        default_setup_package_url: setup_url.map(|s| s.to_string()),
        services: vec![AppService {
            id: "ssh".to_string(),
            label: "SSH".to_string(),
            endpoint: Some(ServiceEndpoint {
                port: 22,
                url_scheme: None,
            }),
        }],
        roles: vec![
            AppRole {
                id: "controller".to_string(),
                service_ids: vec!["ssh".to_string()],
                ..AppRole::default()
            },
            AppRole {
                id: "worker".to_string(),
                service_ids: vec!["ssh".to_string()],
                ..AppRole::default()
            },
        ],
        ..AppSpec::default()
    }
}

pub struct Harness {
    pub accessor: Arc<FakeAccessor>,
    pub executor: Arc<FakeExecutor>,
    pub catalog: Arc<FakeCatalog>,
    pub reconciler: ClusterReconciler,
}

impl Harness {
    pub fn new(cluster: VirtualCluster, app: AppSpec) -> Self {
        let accessor = Arc::new(FakeAccessor::default());
        accessor.insert_cluster(cluster);
        let executor = Arc::new(FakeExecutor::new());
        let catalog = Arc::new(FakeCatalog {
            app: Mutex::new(Some(app)),
        });
        let config = ControllerConfig {
            status_retry_initial_ms: 1,
            status_retry_max_ms: 4,
            ..ControllerConfig::default()
        };
        let reconciler = ClusterReconciler::new(accessor.clone(), executor.clone(), catalog.clone(), config);
        Harness {
            accessor,
            executor,
            catalog,
            reconciler,
        }
    }

    pub async fn pass(&self) -> Result<(), crate::error::Error> {
        self.reconciler.sync_cluster(NAMESPACE, CLUSTER_NAME).await
    }

    /// Runs passes until the cluster reports ready, failing after `limit`.
    pub async fn run_until_ready(&self, limit: usize) {
        for _ in 0..limit {
            self.pass().await.unwrap();
            if self.accessor.status().state == ClusterState::Ready {
                return;
            }
        }
        panic!("cluster not ready after {} passes: {:#?}", limit, self.accessor.status());
    }

    pub fn members(&self, role_id: &str) -> Vec<MemberStatus> {
        self.accessor
            .status()
            .roles
            .into_iter()
            .find(|r| r.id == role_id)
            .map(|r| r.members)
            .unwrap_or_default()
    }
}
