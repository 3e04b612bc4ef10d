use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DynamicObject, ListParams},
    core::GroupVersionKind,
    discovery::{ApiResource, Discovery},
    Client,
};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::common::*;

const CLUSTER_NAME: &str = "web";
const CLUSTER_LABEL: &str = "vcluster.dev/cluster";

pub fn vcluster_app() -> String {
    "
    apiVersion: vcluster.dev/v1
    kind: VirtualClusterApp
    metadata:
      name: nginx
      namespace: default
    spec:
      distroId: nginx
      version: '1.25'
      defaultImage: nginx:1.25
      services:
      - id: http
        label: HTTP
        endpoint:
          port: 80
          urlScheme: http
      roles:
      - id: web
        serviceIds:
        - http
    "
    .to_string()
}

pub fn vcluster(members: i32) -> String {
    format!(
        "
    apiVersion: vcluster.dev/v1
    kind: VirtualCluster
    metadata:
      name: {}
      namespace: default
    spec:
      app: nginx
      serviceType: ClusterIP
      roles:
      - id: web
        members: {}
    ",
        CLUSTER_NAME, members
    )
}

fn cluster_api(client: Client) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("vcluster.dev", "v1", "VirtualCluster");
    Api::default_namespaced_with(client, &ApiResource::from_gvk(&gvk))
}

async fn check_crds(client: Client) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    for name in ["virtualclusters.vcluster.dev", "virtualclusterapps.vcluster.dev"] {
        if let Err(e) = crds.get(name).await {
            println!("No CRD {} found, create one before run the e2e test!\n", name);
            return Err(Error::CRDGetFailed(e));
        }
    }
    println!("CRDs found, continue to run the e2e test!\n");
    Ok(())
}

fn ready_members(status: &Value, role: &str) -> Option<Vec<Value>> {
    let roles = status.get("roles")?.as_array()?;
    let role = roles.iter().find(|r| r["id"] == role)?;
    let members = role.get("members")?.as_array()?;
    if members.iter().all(|m| m["state"] == "ready") {
        Some(members.clone())
    } else {
        None
    }
}

/// Waits until the cluster reports ready with exactly `members` ready members in the web role.
pub async fn wait_for_ready(client: Client, members: usize, timeout: Duration) -> Result<Vec<Value>, Error> {
    let api = cluster_api(client);
    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            return Err(Error::Timeout);
        }

        let cluster = match api.get(CLUSTER_NAME).await {
            Err(e) => {
                println!("Get virtual cluster failed with error {}.", e);
                continue;
            }
            Ok(cluster) => cluster,
        };
        let status = match cluster.data.get("status") {
            None => {
                println!("Virtual cluster has no status yet.");
                continue;
            }
            Some(status) => status.clone(),
        };
        if status["state"] != "ready" {
            println!("Virtual cluster is {}, continue to wait.", status["state"]);
            continue;
        }
        match ready_members(&status, "web") {
            Some(ready) if ready.len() == members => {
                println!("All {} members are ready.", members);
                return Ok(ready);
            }
            Some(ready) => {
                println!("{} members are ready, expecting {}.", ready.len(), members);
                continue;
            }
            None => {
                println!("Not all members are ready yet.");
                continue;
            }
        }
    }
}

pub async fn desired_state_test(client: Client, members: usize) -> Result<(), Error> {
    let ready = wait_for_ready(client.clone(), members, Duration::from_secs(600)).await?;

    let sts_api: Api<StatefulSet> = Api::default_namespaced(client.clone());
    let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, CLUSTER_NAME));
    let sts_list = sts_api.list(&lp).await?;
    if sts_list.items.len() != 1 {
        println!("Found {} stateful sets for the cluster, expecting 1.", sts_list.items.len());
        return Err(Error::VClusterStsFailed);
    }
    let replicas = sts_list.items[0].spec.as_ref().and_then(|s| s.replicas);
    if replicas != Some(members as i32) {
        println!("Stateful set replicas {:?} do not match {} members.", replicas, members);
        return Err(Error::VClusterStsFailed);
    }

    let svc_api: Api<Service> = Api::default_namespaced(client.clone());
    let pod_api: Api<Pod> = Api::default_namespaced(client.clone());
    for member in ready.iter() {
        let pod = member["pod"].as_str().unwrap_or_default();
        let service = member["service"].as_str().unwrap_or_default();
        if let Err(e) = pod_api.get(pod).await {
            println!("Get member pod {} failed with error {}.", pod, e);
            return Err(Error::VClusterStatusFailed);
        }
        match svc_api.get(service).await {
            Err(e) => {
                println!("Get member service {} failed with error {}.", service, e);
                return Err(Error::VClusterServiceFailed);
            }
            Ok(svc) => {
                let port = svc.spec.and_then(|s| s.ports).and_then(|p| p.first().map(|p| p.port));
                if port != Some(80) {
                    println!("Member service {} exposes {:?} instead of port 80.", service, port);
                    return Err(Error::VClusterServiceFailed);
                }
            }
        }
    }
    println!("Desired state test passed.");
    Ok(())
}

pub async fn scaling_test(client: Client, members: usize) -> Result<(), Error> {
    run_command(
        "kubectl",
        vec![
            "patch",
            "virtualcluster",
            CLUSTER_NAME,
            "--type=json",
            "-p",
            &format!("[{{\"op\":\"replace\",\"path\":\"/spec/roles/0/members\",\"value\":{}}}]", members),
        ],
        "failed to scale virtual cluster",
    );
    desired_state_test(client, members).await
}

/// Removed members must leave no member service behind.
pub async fn cleanup_test(client: Client, members: usize) -> Result<(), Error> {
    let svc_api: Api<Service> = Api::default_namespaced(client);
    let timeout = Duration::from_secs(120);
    let start = Instant::now();
    let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, CLUSTER_NAME));
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            return Err(Error::Timeout);
        }
        let services = svc_api.list(&lp).await?;
        // One headless service plus one per member.
        if services.items.len() == members + 1 {
            break;
        }
        println!("Found {} services, waiting for {}.", services.items.len(), members + 1);
    }
    println!("Cleanup test passed.");
    Ok(())
}

pub async fn vcluster_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    check_crds(client.clone()).await?;

    let discovery = Discovery::new(client.clone()).run().await?;
    apply(vcluster_app(), client.clone(), &discovery).await?;
    apply(vcluster(2), client.clone(), &discovery).await?;

    desired_state_test(client.clone(), 2).await?;
    println!("E2e test passed.");
    Ok(())
}

pub async fn vcluster_scaling_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    check_crds(client.clone()).await?;

    let discovery = Discovery::new(client.clone()).run().await?;
    apply(vcluster_app(), client.clone(), &discovery).await?;
    apply(vcluster(2), client.clone(), &discovery).await?;

    desired_state_test(client.clone(), 2).await?;
    scaling_test(client.clone(), 3).await?;
    scaling_test(client.clone(), 1).await?;
    cleanup_test(client.clone(), 1).await?;
    println!("E2e test passed.");
    Ok(())
}
