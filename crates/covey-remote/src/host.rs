//! One SSH-connected machine: content-addressed uploads, remote exec, and
//! remotely spawned node processes with local output capture.

use crate::transport::{SshTransport, Transport};
use covey_proto::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Marker line a remotely spawned command prints first so the driver learns
/// its remote pid. Consumed by the drain task, never written to the log.
const PID_MARKER: &str = "__covey_pid=";

/// How long to wait for the pid marker before giving up on it.
const PID_WAIT: Duration = Duration::from_secs(30);

/// One SSH-connected machine.
///
/// Holds a mapping from content hash to uploaded remote path so identical
/// content is transferred once, and spawns remote node processes whose
/// output is drained into local log files. The host's lifetime spans one or
/// more cluster builds; the caller closes it, not the cluster.
pub struct RemoteHost {
    addr: String,
    user: String,
    remote_dir: String,
    transport: Box<dyn Transport>,
    upload_cache: Mutex<HashMap<String, String>>,
}

impl RemoteHost {
    /// Connects to `user@addr` and verifies the session works.
    ///
    /// A failure here is fatal for the host: cluster construction must not
    /// proceed against a machine we cannot reach.
    pub async fn connect(user: &str, addr: &str) -> Result<Self> {
        let transport = SshTransport::new(user, addr);
        Self::with_transport(user, addr, Box::new(transport)).await
    }

    /// Builds a host over an arbitrary transport. Used by tests to count
    /// transfer calls; `connect` is the production path.
    pub async fn with_transport(
        user: &str,
        addr: &str,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        transport.check().await?;
        let host = Self {
            addr: addr.to_string(),
            user: user.to_string(),
            remote_dir: format!("/tmp/covey-{user}"),
            transport,
            upload_cache: Mutex::new(HashMap::new()),
        };
        host.run_command(&format!("mkdir -p {}", host.remote_dir))
            .await?;
        Ok(host)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.addr)
    }

    /// Uploads a file, skipping the transfer when identical content was
    /// already uploaded to this host. Returns the remote path.
    pub async fn upload_file(&self, local: &Path) -> Result<String> {
        let bytes = tokio::fs::read(local).await?;
        let hash = content_hash(&bytes, &self.user);

        if let Some(remote) = self.upload_cache.lock().unwrap().get(&hash) {
            debug!(host = %self.addr, local = %local.display(), remote, "Upload cache hit");
            return Ok(remote.clone());
        }

        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let remote = format!("{}/{}-{}", self.remote_dir, &hash[..16], file_name);

        self.transport.upload(local, &remote).await?;
        self.upload_cache.lock().unwrap().insert(hash, remote.clone());
        Ok(remote)
    }

    /// Runs a remote command to completion.
    ///
    /// A non-zero exit surfaces the remote stderr; retries are the caller's
    /// responsibility.
    pub async fn run_command(&self, cmd: &str) -> Result<(String, String)> {
        let out = self.transport.run(cmd).await?;
        if out.success() {
            Ok((out.stdout, out.stderr))
        } else {
            Err(Error::Transport {
                host: self.target(),
                op: format!("exec `{cmd}`"),
                stderr: if out.stderr.is_empty() {
                    format!("exit code {:?}", out.exit_code)
                } else {
                    out.stderr
                },
            })
        }
    }

    /// Relays an already-uploaded file to peer hosts server-to-server,
    /// avoiding a round trip through the driver. `-p` keeps the file mode,
    /// so an executable stays executable on every peer.
    ///
    /// Each peer's upload cache is primed so a later `upload_file` of the
    /// same content on that peer is a no-op.
    pub async fn push_file_to_peers(&self, local: &Path, peers: &[&RemoteHost]) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        let hash = content_hash(&bytes, &self.user);
        let remote = self
            .upload_cache
            .lock()
            .unwrap()
            .get(&hash)
            .cloned()
            .ok_or_else(|| Error::Transport {
                host: self.target(),
                op: "relay".to_string(),
                stderr: format!("{} was never uploaded to this host", local.display()),
            })?;

        for peer in peers {
            self.run_command(&format!(
                "mkdir -p {dir} && scp -p -o BatchMode=yes {remote} {target}:{remote}",
                dir = peer.remote_dir,
                target = peer.target(),
            ))
            .await?;
            let peer_hash = content_hash(&bytes, &peer.user);
            peer.upload_cache
                .lock()
                .unwrap()
                .insert(peer_hash, remote.clone());
        }
        Ok(())
    }

    /// Spawns a long-running remote command and drains its output into
    /// `log_path` in the background.
    ///
    /// The command is wrapped so the remote shell reports its pid before
    /// exec'ing the real command; the pid is what `kill` on this host later
    /// targets.
    pub async fn open_channel(&self, cmd: &str, log_path: &Path) -> Result<RemoteChannel> {
        let wrapped = format!("echo {PID_MARKER}$$; exec {cmd}");
        let mut child = self.transport.spawn(&wrapped)?;

        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Transport {
            host: self.target(),
            op: "spawn".to_string(),
            stderr: "child stdout was not piped".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| Error::Transport {
            host: self.target(),
            op: "spawn".to_string(),
            stderr: "child stderr was not piped".to_string(),
        })?;

        let (pid_tx, pid_rx) = oneshot::channel();
        let log = std::sync::Arc::new(tokio::sync::Mutex::new(log));

        let stdout_log = log.clone();
        let stdout_drain = tokio::spawn(async move {
            let mut pid_tx = Some(pid_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(rest) = line.strip_prefix(PID_MARKER) {
                    if let (Some(tx), Ok(pid)) = (pid_tx.take(), rest.trim().parse::<u32>()) {
                        let _ = tx.send(pid);
                    }
                    continue;
                }
                append_line(&stdout_log, &line).await;
            }
        });

        let stderr_log = log.clone();
        let stderr_drain = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                append_line(&stderr_log, &line).await;
            }
        });

        let pid = match tokio::time::timeout(PID_WAIT, pid_rx).await {
            Ok(Ok(pid)) => Some(pid),
            _ => {
                warn!(host = %self.addr, cmd, "Remote process did not report a pid");
                None
            }
        };

        Ok(RemoteChannel {
            child,
            pid,
            drains: vec![stdout_drain, stderr_drain],
        })
    }
}

async fn append_line(log: &std::sync::Arc<tokio::sync::Mutex<tokio::fs::File>>, line: &str) {
    let mut file = log.lock().await;
    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
        warn!(error = %e, "Failed to append remote output line");
    }
}

/// A remotely spawned command.
///
/// The local `ssh` child is a liveness proxy for the remote process: when
/// the remote side exits, ssh exits with the same code.
pub struct RemoteChannel {
    child: Child,
    pid: Option<u32>,
    drains: Vec<JoinHandle<()>>,
}

impl RemoteChannel {
    /// The remote pid, if the spawn wrapper managed to report it.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check via the local ssh child. `None` means
    /// still running; a signal-killed child reports `128 + signal` so it is
    /// never mistaken for one.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    /// Waits for exit, bounded by `timeout`. Returns `None` on timeout.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(exit_code(status?))),
            Err(_) => Ok(None),
        }
    }

    /// Kills the local ssh child. A last resort when the remote kill failed.
    pub async fn kill_local(&mut self) {
        let _ = self.child.kill().await;
        for drain in self.drains.drain(..) {
            drain.abort();
        }
    }
}

/// Flattens an exit status to one code, shell-style: signal deaths map to
/// `128 + signal` instead of disappearing into "no code".
fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

fn content_hash(bytes: &[u8], user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(user.as_bytes());
    format!("{:x}", hasher.finalize())
}
