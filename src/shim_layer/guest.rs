// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! File and script helpers built on `GuestExecutor::execute`.
use super::{ExecError, ExecTarget, GuestExecutor};

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Exit status 1 from `test -f` is a normal "absent" answer.
pub async fn file_exists(
    exec: &dyn GuestExecutor,
    target: &ExecTarget,
    path: &str,
) -> Result<bool, ExecError> {
    let out = exec.execute(target, &argv(&["test", "-f", path]), None).await?;
    match out.exit_code {
        0 => Ok(true),
        1 => Ok(false),
        code => Err(ExecError::NonZeroExit {
            description: format!("test -f {}", path),
            code,
            stderr: out.stderr,
        }),
    }
}

/// Returns `None` if the file does not exist.
pub async fn read_file(
    exec: &dyn GuestExecutor,
    target: &ExecTarget,
    path: &str,
) -> Result<Option<String>, ExecError> {
    if !file_exists(exec, target, path).await? {
        return Ok(None);
    }
    let out = exec.execute(target, &argv(&["cat", path]), None).await?;
    if out.exit_code != 0 {
        return Err(ExecError::NonZeroExit {
            description: format!("cat {}", path),
            code: out.exit_code,
            stderr: out.stderr,
        });
    }
    Ok(Some(out.stdout))
}

pub async fn write_file(
    exec: &dyn GuestExecutor,
    target: &ExecTarget,
    path: &str,
    contents: &[u8],
) -> Result<(), ExecError> {
    let dir = match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    };
    let script = format!(
        "mkdir -p {} && tee {} > /dev/null",
        shell_quote(dir),
        shell_quote(path)
    );
    let out = exec
        .execute(target, &argv(&["sh", "-c", &script]), Some(contents))
        .await?;
    if out.exit_code != 0 {
        return Err(ExecError::NonZeroExit {
            description: format!("write {}", path),
            code: out.exit_code,
            stderr: out.stderr,
        });
    }
    Ok(())
}

/// Feeds `script` to bash on stdin.
pub async fn run_script(
    exec: &dyn GuestExecutor,
    target: &ExecTarget,
    description: &str,
    script: &str,
) -> Result<(), ExecError> {
    let out = exec
        .execute(target, &argv(&["/bin/bash", "-s"]), Some(script.as_bytes()))
        .await?;
    if out.exit_code != 0 {
        return Err(ExecError::NonZeroExit {
            description: description.to_string(),
            code: out.exit_code,
            stderr: out.stderr,
        });
    }
    Ok(())
}
