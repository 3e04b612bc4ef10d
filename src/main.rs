// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use anyhow::Result;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing::*;
use tracing_subscriber::EnvFilter;
use vcluster_controller::config::{Cli, Command};
use vcluster_controller::crd::{VirtualCluster, VirtualClusterApp};
use vcluster_controller::shim_layer::controller_runtime::run_controller;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Export => {
            info!("exporting custom resource definitions");
            println!("{}", serde_yaml::to_string(&VirtualCluster::crd())?);
            println!("---");
            println!("{}", serde_yaml::to_string(&VirtualClusterApp::crd())?);
        }
        Command::Run(config) => {
            info!("running vcluster-controller");
            let client = Client::try_default().await?;
            run_controller(client, config).await?;
        }
    }
    Ok(())
}
