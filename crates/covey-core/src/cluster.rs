//! The cluster model: nodes owned by the cluster that built them.
//!
//! There is deliberately no process-wide "current cluster"; callers thread
//! the handle returned by [`crate::ClusterBuilder::build`] through every
//! subsequent call.

use crate::client::NodeClient;
use crate::process::ProcessHandle;
use crate::sandbox::Sandbox;
use crate::scanner::{LogFaultScanner, ScanReport};
use covey_proto::{NodeAddr, NodeRole, NodeState, Result};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// One worker node. Owned exclusively by its cluster; a remote host keeps
/// only transport-level state for the nodes it carries.
pub struct Node {
    id: usize,
    addr: NodeAddr,
    role: NodeRole,
    state: NodeState,
    handle: ProcessHandle,
}

impl Node {
    pub(crate) fn new(id: usize, addr: NodeAddr, role: NodeRole, handle: ProcessHandle) -> Self {
        Self {
            id,
            addr,
            role,
            state: NodeState::Unspawned,
            handle,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Client bound to this node's control API.
    pub fn client(&self) -> NodeClient {
        NodeClient::new(self.addr.clone())
    }

    /// Advances the lifecycle state machine. Invalid transitions are
    /// refused and logged, not panicked on.
    pub(crate) fn advance(&mut self, next: NodeState) {
        if self.state == next {
            return;
        }
        if self.state.can_transition_to(next) {
            debug!(
                node = self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Node state transition"
            );
            self.state = next;
        } else {
            warn!(
                node = self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Refusing invalid node state transition"
            );
        }
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        self.handle.is_alive()
    }

    /// Terminates the node's process and marks it dead.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        self.advance(NodeState::Terminating);
        let code = self.handle.terminate(grace).await?;
        self.advance(NodeState::Dead);
        Ok(code)
    }
}

// The process handle is not Debug; render everything else.
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("role", &self.role)
            .field("state", &self.state.as_str())
            .finish_non_exhaustive()
    }
}

/// A stabilized (or being-built) cluster of nodes.
pub struct Cluster {
    name: String,
    expected_size: usize,
    nodes: Vec<Node>,
    sandbox: Sandbox,
}

impl Cluster {
    pub(crate) fn new(name: String, expected_size: usize, nodes: Vec<Node>, sandbox: Sandbox) -> Self {
        Self {
            name,
            expected_size,
            nodes,
            sandbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected_size(&self) -> usize {
        self.expected_size
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The designated coordinator: node 0. Stabilization gates on its view.
    pub fn coordinator(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Client for the coordinator's control API.
    pub fn coordinator_client(&self) -> Option<NodeClient> {
        self.coordinator().map(Node::client)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Mid-run fault check over the captured logs so far.
    pub fn check_logs(&self) -> Result<ScanReport> {
        LogFaultScanner::new().scan_dir(self.sandbox.dir())
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("expected_size", &self.expected_size)
            .field("nodes", &self.nodes)
            .field("sandbox", &self.sandbox.dir())
            .finish()
    }
}
