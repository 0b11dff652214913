//! # covey-core
//!
//! Cluster lifecycle and asynchronous job coordination for the Covey harness.
//!
//! This crate provides:
//! - Building a cluster of worker nodes (local, remote over SSH, or
//!   externally attached) that agree they belong together
//! - The bounded retry-until-predicate stabilization primitive
//! - The HTTP+JSON node client and the redirect-based job long-poll
//! - Deterministic teardown with post-hoc log fault scanning

mod builder;
mod client;
mod cluster;
mod config;
mod discovery;
mod poller;
mod process;
mod sandbox;
mod scanner;
mod stabilize;
mod teardown;

pub use builder::{BuildFailure, ClusterBuilder, WorkerCommand};
pub use client::NodeClient;
pub use cluster::{Cluster, Node};
pub use config::{HarnessConfig, HostConfig, WorkerConfig, cluster_name};
pub use discovery::DiscoveryFile;
pub use poller::JobPoller;
pub use process::ProcessHandle;
pub use sandbox::Sandbox;
pub use scanner::{LogFaultScanner, ScanReport};
pub use stabilize::{StabilizeOutcome, stabilize};
pub use teardown::teardown;
