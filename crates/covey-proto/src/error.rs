//! Error taxonomy for the Covey harness.
//!
//! Lower components raise narrow, specific variants; only the cluster
//! builder and teardown aggregate them. The split between `NotReady` and
//! everything else is load-bearing: stabilization loops retry `NotReady`
//! and propagate all other variants immediately.

use thiserror::Error;

/// Convenience result alias used across the harness.
pub type Result<T> = std::result::Result<T, Error>;

/// Harness-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The node is not accepting connections yet. Retried inside the current
    /// stabilization window, never escalated on its own.
    #[error("node {node} not ready: {detail}")]
    NotReady { node: String, detail: String },

    /// The node answered, but the response is malformed or violates a
    /// protocol invariant. Never retried: a malformed response cannot be
    /// fixed by asking again.
    #[error("protocol violation from {node}: {detail}")]
    Protocol { node: String, detail: String },

    /// A stabilization or poll loop exhausted its window.
    #[error(
        "{label} did not stabilize within {bound_secs}s \
         (elapsed {elapsed_secs}s, {retries} retries, last state: {last_state})"
    )]
    Timeout {
        label: String,
        bound_secs: u64,
        elapsed_secs: u64,
        retries: u32,
        last_state: String,
    },

    /// SSH connect, upload, or remote exec failure.
    #[error("remote transport failure on {host} during {op}: {stderr}")]
    Transport {
        host: String,
        op: String,
        stderr: String,
    },

    /// A local or remote worker process could not be spawned or controlled.
    #[error("process failure for node {node}: {detail}")]
    Process { node: String, detail: String },

    /// An asynchronous job terminated with an error status.
    #[error("job {job} failed on {node}: {message}")]
    Job {
        job: String,
        node: String,
        message: String,
    },

    /// The log scanner found a fault in a captured node log after the fact.
    #[error("fault detected in captured node logs")]
    LogFault,

    /// Aggregate teardown verdict: individual terminate failures plus the
    /// post-hoc log scan result.
    #[error("teardown failed: {} terminate failure(s){}{}",
        failures.len(),
        if *log_fault { "; faults found in node logs" } else { "" },
        if failures.is_empty() { String::new() } else { format!(": {}", failures.join("; ")) })]
    Teardown {
        failures: Vec<String>,
        log_fault: bool,
    },

    /// A configuration file that could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An HTTP transport error that is neither a refused connection nor a
    /// request timeout (those classify as `NotReady`).
    #[error("http error for {node}: {detail}")]
    Http { node: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors that a stabilization loop should absorb and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady { .. })
    }
}
