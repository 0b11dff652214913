//! Driver configuration.
//!
//! The harness consumes this as a plain struct; argument parsing lives in
//! the CLI crate. Loaded from YAML with per-field defaults so a minimal
//! file (or none at all) gives a working single-node local setup.

use covey_proto::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for one harness run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Nodes to spawn per host; with no hosts, nodes spawned locally.
    #[serde(default = "default_nodes_per_host")]
    pub nodes_per_host: usize,

    /// Remote hosts. Empty means a local cluster.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// First control port; each node reserves three consecutive ports.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Bind address for local nodes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Overall stabilization window in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Delay between stabilization retries, in seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Capture node stdout/stderr into the sandbox for fault scanning.
    #[serde(default = "default_true")]
    pub capture_output: bool,

    /// On build failure, hand the partially built node list back instead
    /// of terminating it.
    #[serde(default)]
    pub keep_partial: bool,

    /// Directory collecting captured output for this run.
    #[serde(default = "default_sandbox_dir")]
    pub sandbox_dir: String,

    /// The worker service binary and its fixed arguments.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// One remote host entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub addr: String,
    pub user: String,
}

/// How to invoke the external worker service binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Binary to run (local path; remote spawns upload it first).
    #[serde(default = "default_worker_program")]
    pub program: String,

    /// Fixed arguments placed before the harness-supplied ones.
    #[serde(default)]
    pub args: Vec<String>,

    /// Worker heap size in GB, passed through when set.
    #[serde(default)]
    pub heap_gb: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: Vec::new(),
            heap_gb: None,
        }
    }
}

fn default_nodes_per_host() -> usize {
    1
}

fn default_base_port() -> u16 {
    54321
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_retry_delay_secs() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_sandbox_dir() -> String {
    "./sandbox".to_string()
}

fn default_worker_program() -> String {
    "worker".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        // A default-constructed config equals an empty YAML document.
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl HarnessConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn is_remote(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Total cluster size implied by the topology.
    pub fn expected_size(&self) -> usize {
        self.nodes_per_host * self.hosts.len().max(1)
    }
}

/// Derives the cluster name from operator identity and driver pid, so
/// concurrent runs on shared infrastructure cannot collide.
pub fn cluster_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "covey".to_string());
    format!("{user}-{}", std::process::id())
}
