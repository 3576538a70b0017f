//! Remote command boundary.
//!
//! The engine never talks to hosts directly: every command goes through a
//! `RemoteExecutor`. `run` executes on the host itself, `exec` inside the
//! container backing a node.

use futures::future::BoxFuture;
use tokio::process::Command;

use crate::error::RemoteError;
use crate::models::{HostId, Node};

/// A connection able to run commands on one host.
pub trait RemoteExecutor: Send + Sync {
    /// Identifier of the host this connection drives.
    fn host(&self) -> &HostId;

    /// Run a command on the host and return its stdout.
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, RemoteError>>;

    /// Run a command inside a node's container and return its stdout.
    fn exec<'a>(
        &'a self,
        node: &'a Node,
        command: &'a str,
    ) -> BoxFuture<'a, Result<String, RemoteError>>;
}

/// Executor for nodes running as docker containers on the local machine.
pub struct LocalExecutor {
    host: HostId,
    container_prefix: String,
}

impl LocalExecutor {
    pub fn new(host: HostId, container_prefix: impl Into<String>) -> Self {
        LocalExecutor {
            host,
            container_prefix: container_prefix.into(),
        }
    }

    async fn output(&self, mut command: Command, display: &str) -> Result<String, RemoteError> {
        let output = command.output().await.map_err(|e| {
            let err = RemoteError::Transport {
                host: self.host.to_string(),
                reason: format!("failed to spawn '{}': {}", display, e),
            };
            log::error!("{}", err);
            err
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stderr.is_empty() {
            log::debug!("[{}] stderr: {}", self.host, stderr.trim_end());
        }

        if output.status.success() {
            Ok(stdout)
        } else {
            let err = RemoteError::CommandFailed {
                host: self.host.to_string(),
                command: display.to_string(),
                status: output.status.code(),
                stderr: stderr.trim_end().to_string(),
            };
            log::error!("{}", err);
            Err(err)
        }
    }
}

impl RemoteExecutor for LocalExecutor {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, RemoteError>> {
        Box::pin(async move {
            log::debug!("[{}] run: {}", self.host, command);
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).kill_on_drop(true);
            self.output(cmd, command).await
        })
    }

    fn exec<'a>(
        &'a self,
        node: &'a Node,
        command: &'a str,
    ) -> BoxFuture<'a, Result<String, RemoteError>> {
        Box::pin(async move {
            let container = node.container_name(&self.container_prefix);
            log::debug!("[{}] exec on {}: {}", self.host, container, command);
            let mut cmd = Command::new("docker");
            cmd.arg("exec")
                .arg(&container)
                .arg("sh")
                .arg("-c")
                .arg(command)
                .kill_on_drop(true);
            self.output(cmd, command).await
        })
    }
}
