//! # covey-remote
//!
//! SSH host management for the Covey harness.
//!
//! This crate provides:
//! - [`RemoteHost`]: one SSH-connected machine with a content-addressed
//!   upload cache and peer-to-peer file relay
//! - [`RemoteChannel`]: a remotely spawned command whose output is drained
//!   into a local log file by a background task
//! - [`Transport`]: the seam between host logic and the actual `ssh`/`scp`
//!   invocations, mockable in tests

mod host;
mod transport;

pub use host::{RemoteChannel, RemoteHost};
pub use transport::{CommandOutput, SshTransport, Transport};
