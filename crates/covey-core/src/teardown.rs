//! Deterministic cluster teardown.
//!
//! Every node is terminated even when earlier terminates fail; the log
//! scanner then runs regardless, so a crash that produced no HTTP-visible
//! symptom still fails the run. Terminate failures and log faults are
//! reported together, never one shadowing the other.

use crate::cluster::Cluster;
use crate::scanner::LogFaultScanner;
use covey_proto::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tears the cluster down and renders the run verdict.
///
/// Idempotent: a second call on an already emptied cluster is a no-op.
pub async fn teardown(cluster: &mut Cluster, grace: Duration) -> Result<()> {
    if cluster.is_empty() {
        debug!(cluster = %cluster.name(), "Teardown of empty cluster is a no-op");
        return Ok(());
    }

    info!(cluster = %cluster.name(), nodes = cluster.nodes().len(), "Tearing down cluster");

    let mut failures = Vec::new();
    for node in cluster.nodes_mut().iter_mut() {
        match node.terminate(grace).await {
            Ok(code) => {
                debug!(node = node.id(), code = ?code, "Node terminated");
            }
            Err(e) => {
                // Keep going: the remaining nodes must still come down.
                warn!(node = node.id(), error = %e, "Node terminate failed");
                failures.push(format!("node {} ({}): {e}", node.id(), node.addr()));
            }
        }
    }
    cluster.nodes_mut().clear();

    let log_fault = match LogFaultScanner::new().scan_dir(cluster.sandbox().dir()) {
        Ok(report) => {
            for line in &report.echoed {
                info!(target: "covey::faults", "{line}");
            }
            report.faulted
        }
        Err(e) => {
            warn!(error = %e, "Log scan failed during teardown");
            failures.push(format!("log scan: {e}"));
            false
        }
    };

    if failures.is_empty() && !log_fault {
        info!(cluster = %cluster.name(), "Teardown clean");
        Ok(())
    } else {
        Err(Error::Teardown {
            failures,
            log_fault,
        })
    }
}
