//! # covey-proto
//!
//! Shared types, wire envelopes, and error definitions for the Covey harness.
//!
//! This crate provides the foundational abstractions used across all Covey
//! crates, including:
//! - The error taxonomy (not-ready vs. protocol vs. timeout vs. transport)
//! - Cloud-status and job envelopes for the node control API
//! - Node role and lifecycle state definitions

mod error;
mod job;
mod node;
mod status;

pub use error::{Error, Result};
pub use job::{JobResponse, JobStatus, PollTarget};
pub use node::{NodeAddr, NodeRole, NodeState, PORTS_PER_NODE};
pub use status::{CloudMember, CloudStatus};
