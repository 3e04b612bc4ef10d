// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::{kube_error_to_api_error, ExecError, ExecOutput, ExecTarget, GuestExecutor};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::{
    api::{Api, AttachParams},
    Client,
};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::*;

/// GuestExecutor that runs commands through the pods/exec subresource.
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        KubeExecutor { client }
    }
}

fn container_id(pod: &Pod, container: &str) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == container)
        .and_then(|cs| cs.container_id.clone())
        .filter(|id| !id.is_empty())
}

async fn collect_output<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    match reader {
        Some(reader) => tokio_util::io::ReaderStream::new(reader)
            .filter_map(|r| async { r.ok().and_then(|v| String::from_utf8(v.to_vec()).ok()) })
            .collect::<Vec<_>>()
            .await
            .join(""),
        None => String::new(),
    }
}

/// Maps the exec status message to a process exit code. A stream that closed
/// before reporting a status tells us nothing about the command.
fn exit_code(status: Option<Status>) -> Result<i32, ExecError> {
    let status = status.ok_or_else(|| ExecError::Transport("exec stream closed without a status".to_string()))?;
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    Ok(status
        .details
        .and_then(|d| d.causes)
        .and_then(|causes| {
            causes
                .into_iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message)
        })
        .and_then(|m| m.parse::<i32>().ok())
        .unwrap_or(-1))
}

#[async_trait]
impl GuestExecutor for KubeExecutor {
    async fn execute(
        &self,
        target: &ExecTarget,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ExecError> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), &target.namespace);
        let pod = pods
            .get(&target.pod)
            .await
            .map_err(|e| ExecError::Transport(kube_error_to_api_error(&e).to_string()))?;
        let current = container_id(&pod, &target.container).ok_or_else(|| ExecError::ContainerMissing {
            pod: target.pod.clone(),
            container: target.container.clone(),
        })?;
        if let Some(expected) = &target.expected_container_id {
            if *expected != current {
                return Err(ExecError::ContainerMismatch {
                    expected: expected.clone(),
                    actual: current,
                });
            }
        }

        debug!("exec in {}/{}: {}", target.pod, target.container, argv.join(" "));
        let params = AttachParams::default()
            .container(target.container.as_str())
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        let mut attached = pods
            .exec(&target.pod, argv.to_vec(), &params)
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        if let Some(input) = stdin {
            let mut writer = attached
                .stdin()
                .ok_or_else(|| ExecError::Transport("exec stdin unavailable".to_string()))?;
            writer
                .write_all(input)
                .await
                .map_err(|e| ExecError::Transport(e.to_string()))?;
            writer
                .shutdown()
                .await
                .map_err(|e| ExecError::Transport(e.to_string()))?;
        }

        let status_fut = attached.take_status();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = futures::join!(
            collect_output(stdout_reader),
            collect_output(stderr_reader)
        );
        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        let exit_code = exit_code(status)?;
        Ok(ExecOutput {
            container_id: Some(current),
            exit_code,
            stdout,
            stderr,
        })
    }
}
