//! Cloud-status envelope returned by a node's control API.

use serde::{Deserialize, Serialize};

/// One member descriptor in a node's view of the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudMember {
    /// Member name as the node reports it, typically `addr:port`.
    pub name: String,
    /// Advertised address of the member.
    #[serde(default)]
    pub addr: Option<String>,
    /// Whether the reporting node considers this member healthy.
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// Response body of the cloud-status endpoint.
///
/// `cloud_size` and `consensus` gate cluster stabilization; the rest is
/// carried for diagnostics. Missing required fields fail deserialization,
/// which callers surface as a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudStatus {
    /// Name of the cloud this node believes it belongs to.
    pub cloud_name: String,
    /// The reporting node's own name.
    pub node_name: String,
    /// Number of members in the node's current view.
    pub cloud_size: usize,
    /// True once the node's agreement protocol considers the view final.
    pub consensus: bool,
    /// True while the membership is locked against further joins.
    #[serde(default)]
    pub locked: bool,
    /// Member descriptors for the current view.
    #[serde(default)]
    pub nodes: Vec<CloudMember>,
}
