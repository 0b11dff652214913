//! Builds a cluster: spawn nodes, write the flatfile, stabilize, and on
//! failure unwind whatever was already spawned.

use crate::cluster::{Cluster, Node};
use crate::config::{HarnessConfig, WorkerConfig};
use crate::discovery::DiscoveryFile;
use crate::process::ProcessHandle;
use crate::sandbox::Sandbox;
use crate::scanner::LogFaultScanner;
use crate::stabilize::stabilize;
use covey_proto::{Error, NodeAddr, NodeRole, NodeState, PORTS_PER_NODE, Result};
use covey_remote::RemoteHost;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period for unwinding partially built clusters.
const UNWIND_GRACE: Duration = Duration::from_secs(10);

/// Cap on the per-node re-stabilization window for remote clusters.
const PER_NODE_WINDOW: Duration = Duration::from_secs(120);

/// How to invoke the worker service binary for one node.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub heap_gb: Option<u32>,
}

impl WorkerCommand {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: Vec::new(),
            heap_gb: config.heap_gb,
        }
    }

    /// Harness-supplied arguments: control port, bind address, node-local
    /// scratch directory, discovery file, cluster name.
    fn node_args(&self, addr: &NodeAddr, scratch: &str, flatfile: &str, cluster: &str) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(heap) = self.heap_gb {
            args.push("--heap-gb".to_string());
            args.push(heap.to_string());
        }
        args.extend([
            "--port".to_string(),
            addr.port.to_string(),
            "--bind".to_string(),
            addr.addr.clone(),
            "--scratch".to_string(),
            scratch.to_string(),
            "--flatfile".to_string(),
            flatfile.to_string(),
            "--name".to_string(),
            cluster.to_string(),
        ]);
        args
    }

    /// Full command line for a remote spawn. The inner `sh -c` keeps the
    /// reported pid equal to the worker's pid via `exec`.
    fn remote_cmdline(
        &self,
        program: &str,
        addr: &NodeAddr,
        scratch: &str,
        flatfile: &str,
        cluster: &str,
    ) -> String {
        let args = self.node_args(addr, scratch, flatfile, cluster).join(" ");
        format!("sh -c 'mkdir -p {scratch}; exec {program} {args}'")
    }
}

/// Error returned by [`ClusterBuilder::build`].
///
/// Carries the triggering error, the post-unwind log-scan verdict, and, if
/// cleanup was explicitly skipped, the partially built nodes.
pub struct BuildFailure {
    pub error: Error,
    /// Non-empty only when the caller requested no cleanup.
    pub orphans: Vec<Node>,
    /// Whether the post-unwind log scan found a fault. Reported alongside
    /// the triggering error; neither class may shadow the other.
    pub log_fault: bool,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster build failed: {}", self.error)?;
        if self.log_fault {
            write!(f, "; log scan found faults in captured node output")?;
        }
        if !self.orphans.is_empty() {
            write!(f, "; {} partially built node(s) kept for inspection", self.orphans.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildFailure")
            .field("error", &self.error)
            .field("orphans", &self.orphans.len())
            .field("log_fault", &self.log_fault)
            .finish()
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Top-level orchestrator for standing up a cluster.
pub struct ClusterBuilder {
    name: String,
    nodes_per_host: usize,
    hosts: Vec<Arc<RemoteHost>>,
    external: Vec<NodeAddr>,
    base_port: u16,
    bind_addr: String,
    timeout: Duration,
    retry_delay: Duration,
    keep_partial: bool,
    capture_output: bool,
    worker: WorkerCommand,
}

impl ClusterBuilder {
    pub fn new(name: impl Into<String>, nodes_per_host: usize) -> Self {
        Self {
            name: name.into(),
            nodes_per_host,
            hosts: Vec::new(),
            external: Vec::new(),
            base_port: 54321,
            bind_addr: "127.0.0.1".to_string(),
            timeout: Duration::from_secs(120),
            retry_delay: Duration::from_secs(1),
            keep_partial: false,
            capture_output: true,
            worker: WorkerCommand::from_config(&WorkerConfig::default()),
        }
    }

    /// Builder configured from the driver config; `hosts` must already be
    /// connected (host connect failures abort before any spawn).
    pub fn from_config(name: impl Into<String>, config: &HarnessConfig, hosts: Vec<Arc<RemoteHost>>) -> Self {
        Self {
            name: name.into(),
            nodes_per_host: config.nodes_per_host,
            hosts,
            external: Vec::new(),
            base_port: config.base_port,
            bind_addr: config.bind_addr.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            keep_partial: config.keep_partial,
            capture_output: config.capture_output,
            worker: WorkerCommand::from_config(&config.worker),
        }
    }

    /// Attach to already running nodes instead of spawning any.
    pub fn attach(mut self, addrs: Vec<NodeAddr>) -> Self {
        self.external = addrs;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn keep_partial(mut self, keep: bool) -> Self {
        self.keep_partial = keep;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Builds and stabilizes the cluster.
    ///
    /// On return the coordinator has confirmed full size with consensus;
    /// callers never see a partially converged cluster. On failure every
    /// node spawned so far is terminated (unless no-cleanup was requested)
    /// and the sandbox is scanned, so a crash with no HTTP-visible symptom
    /// still surfaces.
    pub async fn build(self, sandbox: &Sandbox) -> std::result::Result<Cluster, BuildFailure> {
        let name = self.name.clone();
        let keep_partial = self.keep_partial;
        let mut nodes = Vec::new();

        match self.build_inner(sandbox, &mut nodes).await {
            Ok(expected) => {
                info!(cluster = %name, size = expected, "Cluster stable");
                Ok(Cluster::new(name, expected, nodes, sandbox.clone()))
            }
            Err(error) => {
                warn!(cluster = %name, error = %error, "Cluster build failed, unwinding");
                if keep_partial {
                    return Err(BuildFailure {
                        error,
                        orphans: nodes,
                        log_fault: false,
                    });
                }

                for node in &mut nodes {
                    if let Err(e) = node.terminate(UNWIND_GRACE).await {
                        warn!(node = node.id(), error = %e, "Unwind terminate failed");
                    }
                }

                let log_fault = match LogFaultScanner::new().scan_dir(sandbox.dir()) {
                    Ok(report) => report.faulted,
                    Err(e) => {
                        warn!(error = %e, "Post-unwind log scan failed");
                        false
                    }
                };

                Err(BuildFailure {
                    error,
                    orphans: Vec::new(),
                    log_fault,
                })
            }
        }
    }

    async fn build_inner(&self, sandbox: &Sandbox, nodes: &mut Vec<Node>) -> Result<usize> {
        let plan = self.plan();
        let expected = plan.len();
        if expected == 0 {
            return Err(Error::Config("cluster topology resolves to zero nodes".into()));
        }

        // The flatfile must be complete before any spawn counts as done.
        let addrs: Vec<NodeAddr> = plan.iter().map(|(addr, ..)| addr.clone()).collect();
        let flatfile_path = sandbox.dir().join(format!("{}.flatfile", self.name));
        let flatfile = DiscoveryFile::write(&flatfile_path, &addrs)?;
        info!(cluster = %self.name, nodes = expected, flatfile = %flatfile_path.display(), "Discovery file written");

        let (remote_flatfile, remote_program) = self.distribute(&flatfile).await?;

        for (id, (addr, role, host)) in plan.into_iter().enumerate() {
            let node = self
                .spawn_node(id, addr, role, host, sandbox, &flatfile, remote_flatfile.as_deref(), remote_program.as_deref())
                .await?;
            nodes.push(node);
        }

        self.stabilize_cluster(nodes.as_mut_slice(), expected).await?;
        for node in nodes.iter_mut() {
            node.advance(NodeState::ClusterMember);
        }
        Ok(expected)
    }

    /// Ordered node plan: address, role, and owning host (for remotes).
    fn plan(&self) -> Vec<(NodeAddr, NodeRole, Option<Arc<RemoteHost>>)> {
        if !self.external.is_empty() {
            return self
                .external
                .iter()
                .map(|addr| (addr.clone(), NodeRole::External, None))
                .collect();
        }

        let mut plan = Vec::new();
        if self.hosts.is_empty() {
            for i in 0..self.nodes_per_host {
                let port = self.base_port + (i as u16) * PORTS_PER_NODE;
                plan.push((NodeAddr::new(self.bind_addr.clone(), port), NodeRole::Local, None));
            }
        } else {
            for host in &self.hosts {
                for i in 0..self.nodes_per_host {
                    let port = self.base_port + (i as u16) * PORTS_PER_NODE;
                    plan.push((
                        NodeAddr::new(host.addr().to_string(), port),
                        NodeRole::Remote,
                        Some(host.clone()),
                    ));
                }
            }
        }
        plan
    }

    /// Pushes the flatfile (and the worker binary, when it exists locally)
    /// to every remote host: one upload from the driver, then host-to-host
    /// relay for the rest.
    async fn distribute(
        &self,
        flatfile: &DiscoveryFile,
    ) -> Result<(Option<String>, Option<String>)> {
        if self.hosts.is_empty() {
            return Ok((None, None));
        }

        let first = &self.hosts[0];
        let peers: Vec<&RemoteHost> = self.hosts[1..].iter().map(Arc::as_ref).collect();

        let remote_flatfile = first.upload_file(flatfile.path()).await?;
        if !peers.is_empty() {
            first.push_file_to_peers(flatfile.path(), &peers).await?;
        }

        let program_path = Path::new(&self.worker.program);
        let remote_program = if program_path.is_file() {
            let uploaded = first.upload_file(program_path).await?;
            // The relay preserves the file mode, so the binary must be
            // executable before any peer receives it.
            first.run_command(&format!("chmod +x {uploaded}")).await?;
            if !peers.is_empty() {
                first.push_file_to_peers(program_path, &peers).await?;
            }
            uploaded
        } else {
            // Not a local file: assume the binary is already installed at
            // this path on every host.
            self.worker.program.clone()
        };

        Ok((Some(remote_flatfile), Some(remote_program)))
    }

    async fn spawn_node(
        &self,
        id: usize,
        addr: NodeAddr,
        role: NodeRole,
        host: Option<Arc<RemoteHost>>,
        sandbox: &Sandbox,
        flatfile: &DiscoveryFile,
        remote_flatfile: Option<&str>,
        remote_program: Option<&str>,
    ) -> Result<Node> {
        let handle = match role {
            NodeRole::External => ProcessHandle::external(addr.clone()),
            NodeRole::Local => {
                let scratch = sandbox.dir().join(format!("scratch-node{id}"));
                std::fs::create_dir_all(&scratch)?;
                let args = self.worker.node_args(
                    &addr,
                    &scratch.display().to_string(),
                    &flatfile.path().display().to_string(),
                    &self.name,
                );
                ProcessHandle::spawn_local(
                    &self.worker.program,
                    &args,
                    &self.worker.env,
                    &sandbox.node_log(&self.name, id, "out"),
                    &sandbox.node_log(&self.name, id, "err"),
                    self.capture_output,
                )?
            }
            NodeRole::Remote => {
                let host = host.expect("remote node plan always carries a host");
                let scratch = format!("/tmp/covey-{}/scratch-node{id}", host.user());
                let cmdline = self.worker.remote_cmdline(
                    remote_program.unwrap_or(&self.worker.program),
                    &addr,
                    &scratch,
                    remote_flatfile.unwrap_or_default(),
                    &self.name,
                );
                ProcessHandle::spawn_remote(
                    host,
                    &cmdline,
                    &sandbox.node_log(&self.name, id, "out"),
                )
                .await?
            }
        };

        let mut node = Node::new(id, addr, role, handle);
        node.advance(NodeState::Spawning);
        if role == NodeRole::External || node.is_alive() {
            node.advance(NodeState::AwaitingConnections);
        }
        info!(node = id, addr = %node.addr(), role = ?role, "Node spawned");
        Ok(node)
    }

    /// Stabilizes the coordinator for the full expected size, then (for
    /// remote clusters) defensively re-stabilizes every other node with a
    /// shorter window.
    ///
    /// A node whose window closes without it ever converging is marked
    /// unreachable; a node that answered with a malformed response is not.
    async fn stabilize_cluster(&self, nodes: &mut [Node], expected: usize) -> Result<()> {
        if let Err(e) = self.stabilize_node(&nodes[0], expected, self.timeout).await {
            mark_unreachable(&mut nodes[0], &e);
            return Err(e);
        }

        if nodes.iter().any(|n| n.role() == NodeRole::Remote) {
            let window = self.timeout.min(PER_NODE_WINDOW);
            for i in 1..nodes.len() {
                if let Err(e) = self.stabilize_node(&nodes[i], expected, window).await {
                    mark_unreachable(&mut nodes[i], &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn stabilize_node(&self, node: &Node, expected: usize, window: Duration) -> Result<()> {
        let client = node.client();
        let cluster = self.name.clone();
        let label = format!("cluster {cluster} node {} size {expected}", node.id());

        stabilize(&label, window, self.retry_delay, move || {
            let client = client.clone();
            let cluster = cluster.clone();
            async move {
                let status = client.cloud_status().await?;
                if status.cloud_size > expected {
                    // Likely a zombie cluster sharing our name on the
                    // network; by itself not fatal, the size/consensus
                    // conjunction still gates success.
                    warn!(
                        cluster = %cluster,
                        reported = status.cloud_size,
                        expected,
                        "Node reports an oversized cloud"
                    );
                }
                Ok(status.cloud_size == expected && status.consensus)
            }
        })
        .await?;
        Ok(())
    }
}

/// Connection-shaped failures mean the node never joined; protocol answers
/// mean it did, however badly.
fn mark_unreachable(node: &mut Node, error: &Error) {
    if matches!(error, Error::Timeout { .. } | Error::NotReady { .. }) {
        node.advance(NodeState::Unreachable);
    }
}
