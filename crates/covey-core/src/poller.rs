//! Redirect-based long-poll protocol for asynchronous jobs.
//!
//! A submit response with status `poll` points at a follow-up endpoint;
//! the poller queries it until the job reports `done` or `error`. This is
//! the stabilization shape with a side-effecting attempt (each poll is a
//! real request), so it carries its own loop instead of reusing
//! [`crate::stabilize`], while keeping the same bounded-retry contract.

use crate::client::NodeClient;
use covey_proto::{Error, JobResponse, JobStatus, PollTarget, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Drives one asynchronous job to completion against one node.
pub struct JobPoller<'a> {
    client: &'a NodeClient,
    /// Overall window for the whole job, across all polls.
    timeout: Duration,
    /// Sleep between polls.
    retry_delay: Duration,
}

impl<'a> JobPoller<'a> {
    pub fn new(client: &'a NodeClient, timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            client,
            timeout,
            retry_delay,
        }
    }

    /// Submits the job and, if the response redirects, polls to completion.
    ///
    /// Returns the terminal `done` envelope. A terminal `error` status, an
    /// invariant-violating envelope, or an exhausted window all fail.
    pub async fn run(&self, endpoint: &str, params: &[(String, String)]) -> Result<JobResponse> {
        info!(node = %self.client.addr(), endpoint, "Submitting job");
        let initial = self.client.submit_job(endpoint, params).await?;
        self.wait(endpoint, initial).await
    }

    /// Polls an already submitted job to completion.
    pub async fn wait(&self, job_label: &str, initial: JobResponse) -> Result<JobResponse> {
        let start = Instant::now();
        let mut response = initial;
        let mut polls = 0u32;

        loop {
            self.validate(job_label, &response)?;

            match response.status {
                JobStatus::Done => {
                    info!(
                        node = %self.client.addr(),
                        job = job_label,
                        polls,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Job done"
                    );
                    return Ok(response);
                }
                JobStatus::Error => {
                    return Err(Error::Job {
                        job: job_label.to_string(),
                        node: self.client.addr().to_string(),
                        message: response
                            .error
                            .unwrap_or_else(|| "no error message in envelope".to_string()),
                    });
                }
                JobStatus::Poll => {}
            }

            let target = response.poll_target().ok_or_else(|| Error::Protocol {
                node: self.client.addr().to_string(),
                detail: format!("{job_label}: poll status without a redirect target"),
            })?;

            if start.elapsed() >= self.timeout {
                return Err(self.timeout_error(job_label, &response, &target, polls, start));
            }

            tokio::time::sleep(self.retry_delay).await;
            debug!(node = %self.client.addr(), target = %target, polls, "Polling job");
            response = self.client.poll_job(&target).await?;
            polls += 1;
        }
    }

    fn validate(&self, job_label: &str, response: &JobResponse) -> Result<()> {
        if let Some(violation) = response.invariant_violation() {
            return Err(Error::Protocol {
                node: self.client.addr().to_string(),
                detail: format!("{job_label}: {violation}"),
            });
        }
        Ok(())
    }

    /// Timeout diagnostics carry the last-seen status and the full redirect
    /// target, so "too slow" and "never going to succeed" are tellable apart.
    fn timeout_error(
        &self,
        job_label: &str,
        last: &JobResponse,
        target: &PollTarget,
        polls: u32,
        start: Instant,
    ) -> Error {
        Error::Timeout {
            label: format!("job {job_label}"),
            bound_secs: self.timeout.as_secs(),
            elapsed_secs: start.elapsed().as_secs(),
            retries: polls,
            last_state: format!(
                "status={} progress={:?}/{:?} target={target}",
                last.status.as_str(),
                last.progress,
                last.progress_total,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covey_proto::NodeAddr;
    use std::collections::BTreeMap;

    fn envelope(status: JobStatus) -> JobResponse {
        JobResponse {
            status,
            redirect_request: Some("Progress.json".to_string()),
            redirect_request_args: Some(BTreeMap::from([(
                "job_key".to_string(),
                serde_json::Value::String("k1".to_string()),
            )])),
            progress: Some(1),
            progress_total: Some(10),
            error: None,
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_done_envelope_returns_immediately() {
        let client = NodeClient::new(NodeAddr::new("127.0.0.1", 1));
        let poller = JobPoller::new(&client, Duration::from_secs(1), Duration::from_millis(5));

        let mut done = envelope(JobStatus::Done);
        done.extra
            .insert("result_key".to_string(), serde_json::Value::from("r1"));
        let out = poller.wait("ingest", done).await.unwrap();
        assert_eq!(out.extra["result_key"], "r1");
    }

    #[tokio::test]
    async fn test_error_envelope_fails_with_message() {
        let client = NodeClient::new(NodeAddr::new("127.0.0.1", 1));
        let poller = JobPoller::new(&client, Duration::from_secs(1), Duration::from_millis(5));

        let mut failed = envelope(JobStatus::Error);
        failed.error = Some("out of memory".to_string());
        let err = poller.wait("train", failed).await.unwrap_err();
        assert!(matches!(err, Error::Job { .. }));
        assert!(err.to_string().contains("out of memory"));
    }

    #[tokio::test]
    async fn test_progress_violation_is_a_protocol_error() {
        let client = NodeClient::new(NodeAddr::new("127.0.0.1", 1));
        let poller = JobPoller::new(&client, Duration::from_secs(1), Duration::from_millis(5));

        let mut bogus = envelope(JobStatus::Poll);
        bogus.progress = Some(11);
        bogus.progress_total = Some(10);
        let err = poller.wait("ingest", bogus).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_poll_without_redirect_is_a_protocol_error() {
        let client = NodeClient::new(NodeAddr::new("127.0.0.1", 1));
        let poller = JobPoller::new(&client, Duration::from_secs(1), Duration::from_millis(5));

        let mut bogus = envelope(JobStatus::Poll);
        bogus.redirect_request = None;
        let err = poller.wait("ingest", bogus).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_timeout_embeds_last_status_and_target() {
        let client = NodeClient::new(NodeAddr::new("127.0.0.1", 1));
        // Zero overall window: the first poll attempt trips the timeout
        // before any network traffic happens.
        let poller = JobPoller::new(&client, Duration::ZERO, Duration::from_millis(5));

        let err = poller.wait("train", envelope(JobStatus::Poll)).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("job train"));
        assert!(msg.contains("status=poll"));
        assert!(msg.contains("Progress.json"));
        assert!(msg.contains("job_key=k1"));
    }
}
