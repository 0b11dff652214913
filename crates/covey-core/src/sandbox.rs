//! The per-run directory collecting captured node output.
//!
//! Wiped and recreated exactly once per overall run, before any node is
//! spawned; drain tasks and scanners only ever see a fully created
//! directory.

use covey_proto::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Wipes any previous run's directory and creates a fresh one.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;
        debug!(dir = %root.display(), "Sandbox created");
        Ok(Self { root })
    }

    /// Opens an existing sandbox without wiping it. Used when attaching to
    /// a run already in progress.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    /// Uniquely named capture file for one node's output stream.
    pub fn node_log(&self, cluster: &str, node_id: usize, stream: &str) -> PathBuf {
        self.root.join(format!("{cluster}-node{node_id}.{stream}"))
    }
}
