// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "vcluster-controller", version, about = "Virtual cluster lifecycle controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the custom resource definitions as YAML.
    Export,
    /// Run the controller.
    Run(ControllerConfig),
}

#[derive(Args, Debug, Clone)]
pub struct ControllerConfig {
    /// Only watch clusters in this namespace (all namespaces if unset).
    #[arg(long, env = "VCLUSTER_NAMESPACE")]
    pub namespace: Option<String>,

    /// Poll interval for clusters that reconciled cleanly.
    #[arg(long, env = "VCLUSTER_REQUEUE_SECS", default_value_t = 30)]
    pub requeue_secs: u64,

    #[arg(long, env = "VCLUSTER_ERROR_REQUEUE_SECS", default_value_t = 10)]
    pub error_requeue_secs: u64,

    /// DNS suffix appended to <service>.<namespace> when building member FQDNs.
    #[arg(long, env = "VCLUSTER_CLUSTER_DOMAIN", default_value = "svc.cluster.local")]
    pub cluster_domain: String,

    /// Name of the container that runs the application in every member pod.
    #[arg(long, env = "VCLUSTER_APP_CONTAINER", default_value = "app")]
    pub app_container: String,

    /// Local tarball installed into members before app setup runs.
    #[arg(long, env = "VCLUSTER_NODE_PREP_PACKAGE")]
    pub node_prep_package: Option<PathBuf>,

    #[arg(long, env = "VCLUSTER_STATUS_RETRY_INITIAL_MS", default_value_t = 1_000)]
    pub status_retry_initial_ms: u64,

    #[arg(long, env = "VCLUSTER_STATUS_RETRY_MAX_MS", default_value_t = 4_096_000)]
    pub status_retry_max_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            namespace: None,
            requeue_secs: 30,
            error_requeue_secs: 10,
            cluster_domain: "svc.cluster.local".to_string(),
            app_container: "app".to_string(),
            node_prep_package: None,
            status_retry_initial_ms: 1_000,
            status_retry_max_ms: 4_096_000,
        }
    }
}

impl ControllerConfig {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn error_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn status_retry_initial(&self) -> Duration {
        Duration::from_millis(self.status_retry_initial_ms)
    }

    pub fn status_retry_max(&self) -> Duration {
        Duration::from_millis(self.status_retry_max_ms)
    }
}
