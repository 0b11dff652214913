//! The flatfile nodes use to find each other.
//!
//! One line per node, `/{addr}:{port}`, written once per build and shared
//! byte-for-byte with every participating host. Nodes read it instead of
//! relying on broadcast discovery.

use covey_proto::{NodeAddr, Result};
use std::path::{Path, PathBuf};

/// An immutable, fully written discovery file.
#[derive(Debug, Clone)]
pub struct DiscoveryFile {
    path: PathBuf,
    contents: String,
}

impl DiscoveryFile {
    /// Renders the flatfile bytes for an ordered set of node addresses.
    pub fn render(addrs: &[NodeAddr]) -> String {
        let mut out = String::new();
        for addr in addrs {
            out.push('/');
            out.push_str(&addr.addr);
            out.push(':');
            out.push_str(&addr.port.to_string());
            out.push('\n');
        }
        out
    }

    /// Writes the flatfile to `path`. The file is complete before this
    /// returns; no node spawn may be considered done before then.
    pub fn write(path: &Path, addrs: &[NodeAddr]) -> Result<Self> {
        let contents = Self::render(addrs);
        std::fs::write(path, &contents)?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }
}
