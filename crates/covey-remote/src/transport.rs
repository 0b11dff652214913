//! Transport seam between [`RemoteHost`](crate::RemoteHost) logic and the
//! actual `ssh`/`scp` invocations.
//!
//! Remote execution drives the system `ssh`/`scp` binaries through
//! `tokio::process`, with `BatchMode=yes` so a missing key fails fast
//! instead of prompting.

use async_trait::async_trait;
use covey_proto::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Captured output of a completed remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Minimal primitives the host layer needs from an SSH session.
///
/// `run` and `upload` complete before returning; `spawn` hands back the
/// still-running child so the caller can drain its output.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Verifies the session works at all. Failure here aborts cluster
    /// construction for the host.
    async fn check(&self) -> Result<()>;

    /// Runs a command to completion and captures its output.
    async fn run(&self, cmd: &str) -> Result<CommandOutput>;

    /// Copies a local file to a remote path.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Spawns a long-running remote command with piped stdout/stderr.
    fn spawn(&self, cmd: &str) -> Result<Child>;

    /// `user@host` label for error messages.
    fn target(&self) -> &str;
}

/// Production transport: drives the system `ssh`/`scp` binaries.
#[derive(Debug)]
pub struct SshTransport {
    target: String,
}

impl SshTransport {
    pub fn new(user: &str, addr: &str) -> Self {
        Self {
            target: format!("{user}@{addr}"),
        }
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg(&self.target);
        cmd
    }

    fn transport_error(&self, op: &str, stderr: impl Into<String>) -> Error {
        Error::Transport {
            host: self.target.clone(),
            op: op.to_string(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn check(&self) -> Result<()> {
        let out = self.run("true").await?;
        if out.success() {
            Ok(())
        } else {
            Err(self.transport_error("connect", out.stderr))
        }
    }

    async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        debug!(target = %self.target, cmd, "Running remote command");
        let output = self
            .ssh_command()
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.transport_error("exec", e.to_string()))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(target = %self.target, local = %local.display(), remote, "Uploading file");
        let output = Command::new("scp")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(local)
            .arg(format!("{}:{remote}", self.target))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.transport_error("upload", e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.transport_error("upload", String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn spawn(&self, cmd: &str) -> Result<Child> {
        debug!(target = %self.target, cmd, "Spawning remote command");
        self.ssh_command()
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.transport_error("spawn", e.to_string()))
    }

    fn target(&self) -> &str {
        &self.target
    }
}
