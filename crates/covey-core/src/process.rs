//! Process handles for worker nodes.
//!
//! One closed set of variants behind a single contract: local children
//! spawned by the driver, remote processes reached through a
//! [`RemoteHost`] channel, and external processes the driver merely
//! attaches to. `terminate` is idempotent and never fails on "process
//! already gone" - it logs and returns the `None` sentinel.

use crate::client::NodeClient;
use covey_proto::{Error, NodeAddr, Result};
use covey_remote::{RemoteChannel, RemoteHost};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{Signal, kill};
#[cfg(unix)]
use nix::unistd::Pid;

/// Handle to one node's OS process.
pub enum ProcessHandle {
    Local(LocalProcess),
    Remote(RemoteProcess),
    External(ExternalProcess),
}

impl ProcessHandle {
    /// Spawns a local worker with stdout/stderr redirected into uniquely
    /// named capture files (or inherited when capture is off).
    pub fn spawn_local(
        program: &str,
        args: &[String],
        env: &[(String, String)],
        stdout_log: &Path,
        stderr_log: &Path,
        capture_output: bool,
    ) -> Result<Self> {
        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in env {
            command.env(key, value);
        }

        if capture_output {
            command.stdout(Stdio::from(std::fs::File::create(stdout_log)?));
            command.stderr(Stdio::from(std::fs::File::create(stderr_log)?));
        } else {
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
        }
        command.stdin(Stdio::null());

        debug!(program, args = ?args, "Spawning local worker");
        let child = command.spawn().map_err(|e| Error::Process {
            node: program.to_string(),
            detail: format!("spawn failed: {e}"),
        })?;

        Ok(Self::Local(LocalProcess { child }))
    }

    /// Spawns a worker on a remote host; its output drains into `log_path`
    /// in the background.
    pub async fn spawn_remote(
        host: Arc<RemoteHost>,
        cmd: &str,
        log_path: &Path,
    ) -> Result<Self> {
        let channel = host.open_channel(cmd, log_path).await?;
        Ok(Self::Remote(RemoteProcess { host, channel }))
    }

    /// Attaches to a pre-existing process. Spawn is a no-op by definition.
    pub fn external(addr: NodeAddr) -> Self {
        Self::External(ExternalProcess {
            addr,
            shut_down: false,
        })
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        match self {
            Self::Local(p) => matches!(p.child.try_wait(), Ok(None)),
            Self::Remote(p) => matches!(p.channel.try_wait(), Ok(None)),
            // Assumed running until we asked it to stop; the driver has no
            // handle to check.
            Self::External(p) => !p.shut_down,
        }
    }

    /// Terminates the process: graceful signal, bounded grace wait, then
    /// force kill. Returns the exit code when one is known.
    ///
    /// Idempotent; a process that is already gone logs and yields `None`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        match self {
            Self::Local(p) => p.terminate(grace).await,
            Self::Remote(p) => p.terminate(grace).await,
            Self::External(p) => {
                p.shutdown().await;
                Ok(None)
            }
        }
    }

    /// Waits for exit, bounded by `timeout`. Returns `None` on timeout.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>> {
        match self {
            Self::Local(p) => match tokio::time::timeout(timeout, p.child.wait()).await {
                Ok(status) => Ok(status?.code()),
                Err(_) => Ok(None),
            },
            Self::Remote(p) => p.channel.wait(timeout).await,
            Self::External(_) => Ok(None),
        }
    }
}

/// A worker spawned on this machine.
pub struct LocalProcess {
    child: Child,
}

impl LocalProcess {
    async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(code = ?status.code(), "Local worker already exited");
            return Ok(status.code());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let pid = Pid::from_raw(pid as i32);
            debug!(%pid, "Sending SIGTERM to local worker");
            // ESRCH means it raced us to the exit; that is fine.
            let _ = kill(pid, Signal::SIGTERM);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                warn!("Local worker ignored SIGTERM, force killing");
                self.child.kill().await?;
                Ok(self.child.wait().await?.code())
            }
        }
    }
}

/// A worker spawned over SSH. The host association is non-owning: the host
/// provides transport, the cluster owns the node's lifecycle.
pub struct RemoteProcess {
    host: Arc<RemoteHost>,
    channel: RemoteChannel,
}

impl RemoteProcess {
    async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Ok(Some(code)) = self.channel.try_wait() {
            debug!(host = host_label(&self.host), code, "Remote worker already exited");
            return Ok(Some(code));
        }

        if let Some(pid) = self.channel.pid() {
            // "No such process" is the idempotent case, not a failure.
            if let Err(e) = self.host.run_command(&format!("kill -TERM {pid} || true")).await {
                warn!(host = host_label(&self.host), pid, error = %e, "Remote SIGTERM failed");
                return Err(e);
            }

            if let Some(code) = self.channel.wait(grace).await? {
                return Ok(Some(code));
            }

            warn!(host = host_label(&self.host), pid, "Remote worker ignored SIGTERM, force killing");
            if let Err(e) = self.host.run_command(&format!("kill -KILL {pid} || true")).await {
                warn!(host = host_label(&self.host), pid, error = %e, "Remote SIGKILL failed");
            }
        } else {
            debug!(host = host_label(&self.host), "No remote pid known, closing channel only");
        }

        let code = self.channel.wait(Duration::from_secs(5)).await?;
        if code.is_none() {
            self.channel.kill_local().await;
        }
        Ok(code)
    }
}

fn host_label(host: &RemoteHost) -> &str {
    host.addr()
}

/// A pre-existing process the driver does not control.
pub struct ExternalProcess {
    addr: NodeAddr,
    shut_down: bool,
}

impl ExternalProcess {
    /// Best-effort remote shutdown through the control API. Must not fail
    /// if the process is already gone.
    async fn shutdown(&mut self) {
        if self.shut_down {
            debug!(node = %self.addr, "External node already asked to shut down");
            return;
        }
        NodeClient::new(self.addr.clone()).shutdown().await;
        self.shut_down = true;
    }
}
