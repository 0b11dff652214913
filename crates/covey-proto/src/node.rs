//! Node roles, addressing, and the lifecycle state machine.

use serde::{Deserialize, Serialize};

/// How many consecutive ports one node reserves: the control port plus two
/// auxiliary channels.
pub const PORTS_PER_NODE: u16 = 3;

/// Where a node's process lives relative to the driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Spawned by the driver on the local machine.
    Local,
    /// Spawned over SSH on a remote host.
    Remote,
    /// Pre-existing process not under the driver's control.
    External,
}

/// Lifecycle state of a node.
///
/// `Unreachable` is absorbing and distinct from "not yet up": connection
/// refusal during `Spawning`/`AwaitingConnections` is retried, not treated
/// as unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unspawned,
    Spawning,
    AwaitingConnections,
    ClusterMember,
    Terminating,
    Dead,
    Unreachable,
}

impl NodeState {
    /// Whether the state machine permits a transition to `next`.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Unspawned, Spawning)
                | (Spawning, AwaitingConnections)
                | (AwaitingConnections, ClusterMember)
                | (Spawning, Unreachable)
                | (AwaitingConnections, Unreachable)
                | (ClusterMember, Terminating)
                | (Spawning, Terminating)
                | (AwaitingConnections, Terminating)
                | (Terminating, Dead)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Unspawned => "unspawned",
            NodeState::Spawning => "spawning",
            NodeState::AwaitingConnections => "awaiting_connections",
            NodeState::ClusterMember => "cluster_member",
            NodeState::Terminating => "terminating",
            NodeState::Dead => "dead",
            NodeState::Unreachable => "unreachable",
        }
    }
}

/// A node's advertised address and control port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddr {
    pub addr: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}
