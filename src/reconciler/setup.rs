// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! In-guest setup of a member: file injection and the resumable setup
//! script protocol.
use super::{ClusterReconciler, ConfigMetaGenerator, Pass};
use crate::catalog;
use crate::crd::{FileInjection, MemberStateDetail};
use crate::shim_layer::guest::{read_file, run_script, write_file};
use crate::shim_layer::{ExecError, ExecTarget};
use thiserror::Error;
use tracing::*;

pub const CONFIGMETA_FILE: &str = "/etc/guestconfig/configmeta.json";
pub const SETUP_STATUS_FILE: &str = "/opt/guestconfig/configure.status";
const SETUP_STDOUT_FILE: &str = "/opt/guestconfig/configure.stdout";
const SETUP_STDERR_FILE: &str = "/opt/guestconfig/configure.stderr";
pub const STARTSCRIPT: &str = "/opt/guestconfig/*/startscript";
const NODE_PREP_DEST_FILE: &str = "/tmp/configcli.tgz";
const NODE_PREP_TEST_FILE: &str = "/usr/local/bin/configcli";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("configure failed with malformed status file")]
    MalformedStatus,
    #[error("configure failed with exit status {{{0}}}")]
    ExitStatus(String),
    #[error("failed to render configmeta: {0}")]
    ConfigMeta(#[from] serde_json::Error),
    #[error("failed to read node prep package: {0}")]
    NodePrep(#[from] std::io::Error),
    #[error("no app container recorded for member")]
    NoContainer,
}

/// Progress of the setup script in one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupProgress {
    Running,
    Succeeded,
}

fn app_setup_init_cmd(url: &str) -> String {
    format!(
        "mkdir -p /opt/guestconfig && chmod 700 /opt/guestconfig && cd /opt/guestconfig && \
         rm -rf /opt/guestconfig/* && curl -L {} -o appconfig.tgz && tar xzf appconfig.tgz && \
         chmod u+x {} && rm -rf /opt/guestconfig/appconfig.tgz",
        url, STARTSCRIPT
    )
}

/// Launches the startscript in the background; its exit status is appended
/// to the status file after `<container id>=`.
pub fn startscript_launch_cmd(container_id: &str, arg: &str) -> String {
    format!(
        "echo -n {cid}= > {status} && nohup sh -c '{script} --{arg} 2>{stderr} 1>{stdout}; echo -n $? >> {status}' &",
        cid = container_id,
        status = SETUP_STATUS_FILE,
        script = STARTSCRIPT,
        arg = arg,
        stderr = SETUP_STDERR_FILE,
        stdout = SETUP_STDOUT_FILE,
    )
}

fn node_prep_install_cmd() -> String {
    "cd /tmp && tar xzf configcli.tgz && chmod u+x /tmp/configcli-*/install && \
     /tmp/configcli-*/install /usr/local && rm -rf /tmp/configcli-* && rm -f /tmp/configcli.tgz"
        .to_string()
}

pub fn file_injection_cmd(injection: &FileInjection) -> String {
    let file_name = injection
        .src_url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("injected");
    let dest = format!("{}/{}", injection.dest_dir.trim_end_matches('/'), file_name);
    let mut cmd = format!(
        "mkdir -p {dir} && cd {dir} && curl -L {src} -o {dest}",
        dir = injection.dest_dir,
        src = injection.src_url,
        dest = dest
    );
    if let Some(perms) = &injection.permissions {
        if let Some(mode) = &perms.file_mode {
            cmd.push_str(&format!(" && chmod {} {}", mode, dest));
        }
        if let Some(owner) = &perms.file_owner {
            cmd.push_str(&format!(" && chown {} {}", owner, dest));
        }
        if let Some(group) = &perms.file_group {
            cmd.push_str(&format!(" && chgrp {} {}", group, dest));
        }
    }
    cmd
}

/// Splits "<container id>=<exit status>" at the last '='.
pub fn parse_setup_status(content: &str) -> Option<(&str, &str)> {
    let idx = content.rfind('=')?;
    Some((&content[..idx], content[idx + 1..].trim()))
}

impl ClusterReconciler {
    pub(crate) async fn inject_files(
        &self,
        target: &ExecTarget,
        injections: &[FileInjection],
    ) -> Result<(), ExecError> {
        for injection in injections {
            let cmd = file_injection_cmd(injection);
            run_script(self.executor.as_ref(), target, "file injection", &cmd).await?;
        }
        Ok(())
    }

    /// Drives the setup script one step forward. Errors are final for this
    /// setup attempt.
    pub(crate) async fn app_config(
        &self,
        pass: &Pass<'_>,
        role_id: &str,
        pod: &str,
        setup_url: &str,
        detail: &mut MemberStateDetail,
        config_generation: i64,
        configmeta: &ConfigMetaGenerator,
    ) -> Result<SetupProgress, SetupError> {
        let container_id = detail.configuring_container.clone().ok_or(SetupError::NoContainer)?;
        let target = self.exec_target(pass, pod, Some(&container_id));
        let exec = self.executor.as_ref();

        if detail.config_error_detail.is_some() {
            detail.config_error_detail = None;
            detail.pending_notify_cmds.clear();
            info!(cluster = %pass.key, member = %pod, "member was previously in config error state; re-trying setup");
        } else if let Some(content) = read_file(exec, &target, SETUP_STATUS_FILE).await? {
            let (status_cid, exit_status) = parse_setup_status(&content).ok_or(SetupError::MalformedStatus)?;
            if !exit_status.is_empty() {
                return match exit_status.parse::<i32>() {
                    Ok(0) => Ok(SetupProgress::Succeeded),
                    _ => Err(SetupError::ExitStatus(exit_status.to_string())),
                };
            }
            if status_cid == container_id {
                return Ok(SetupProgress::Running);
            }
            info!(cluster = %pass.key, member = %pod, "previous setup interrupted; re-trying setup");
        }

        if catalog::systemd_required(&pass.app) {
            let check = "systemctl status systemd-journald > /tmp/journald-status.out 2>&1";
            match run_script(exec, &target, "systemd check", check).await {
                Ok(()) => {}
                Err(ExecError::NonZeroExit { .. }) => {
                    info!(cluster = %pass.key, member = %pod, "systemd not yet responsive");
                    return Ok(SetupProgress::Running);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let doc = configmeta.render(pod)?;
        write_file(exec, &target, CONFIGMETA_FILE, doc.as_bytes()).await?;
        detail.last_config_data_generation = Some(config_generation);

        self.setup_node_prep(&target).await?;

        match run_script(exec, &target, "startscript check", &format!("test -f {}", STARTSCRIPT)).await {
            Ok(()) => {}
            Err(ExecError::NonZeroExit { .. }) => {
                run_script(exec, &target, "app config setup", &app_setup_init_cmd(setup_url)).await?;
            }
            Err(e) => return Err(e.into()),
        }

        if !catalog::role_subscribes(&pass.app, role_id, "configure") {
            return Ok(SetupProgress::Succeeded);
        }
        run_script(exec, &target, "app config", &startscript_launch_cmd(&container_id, "configure")).await?;
        Ok(SetupProgress::Running)
    }

    async fn setup_node_prep(&self, target: &ExecTarget) -> Result<(), SetupError> {
        let Some(package) = self.config.node_prep_package.as_ref() else {
            return Ok(());
        };
        let exec = self.executor.as_ref();
        if crate::shim_layer::guest::file_exists(exec, target, NODE_PREP_TEST_FILE).await? {
            return Ok(());
        }
        let contents = tokio::fs::read(package).await?;
        write_file(exec, target, NODE_PREP_DEST_FILE, &contents).await?;
        run_script(exec, target, "node prep setup", &node_prep_install_cmd()).await?;
        Ok(())
    }
}
