//! Job envelopes for the redirect-based long-poll protocol.
//!
//! A submit or poll call returns a [`JobResponse`]. While the status is
//! `poll`, the envelope carries a redirect target (endpoint plus parameter
//! bag) the caller must query next; `done` and `error` are terminal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status tag of a job envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The job is still running; follow the redirect target.
    Poll,
    /// The job finished; the payload carries the result.
    Done,
    /// The job failed; `error` carries the message.
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Poll => "poll",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// True once no further polling is valid for the job.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Poll)
    }
}

/// The redirect target extracted from a `poll` envelope: the endpoint to
/// query next plus its parameter bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub endpoint: String,
    pub args: BTreeMap<String, String>,
}

impl std::fmt::Display for PollTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint)?;
        for (i, (k, v)) in self.args.iter().enumerate() {
            write!(f, "{}{k}={v}", if i == 0 { "?" } else { "&" })?;
        }
        Ok(())
    }
}

/// Response body of the job-submit and job-poll endpoints.
///
/// Job-specific payload fields are captured in `extra` without
/// interpretation; the harness only acts on the generic status, redirect,
/// progress, and error fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub status: JobStatus,

    /// Endpoint to query next while status is `poll`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_request: Option<String>,

    /// Parameter bag for the redirect endpoint. Values arrive as JSON
    /// scalars; they are stringified for the follow-up query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_request_args: Option<BTreeMap<String, serde_json::Value>>,

    /// Work completed so far, in job-defined units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u64>,

    /// Total work expected, in the same units as `progress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_total: Option<u64>,

    /// Error message when status is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Job-specific payload, passed through uninterpreted.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobResponse {
    /// Builds the redirect target from a `poll` envelope.
    ///
    /// Returns `None` when the envelope carries no redirect endpoint; a
    /// `poll` status without one is a protocol violation the caller reports.
    pub fn poll_target(&self) -> Option<PollTarget> {
        let endpoint = self.redirect_request.as_ref()?;
        let args = self
            .redirect_request_args
            .as_ref()
            .map(|bag| {
                bag.iter()
                    .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                    .collect()
            })
            .unwrap_or_default();
        Some(PollTarget {
            endpoint: endpoint.trim_start_matches('/').to_string(),
            args,
        })
    }

    /// Checks the monotonic-sanity invariants every envelope must satisfy.
    ///
    /// Returns the violation description, if any. `progress` may never
    /// exceed `progress_total`.
    pub fn invariant_violation(&self) -> Option<String> {
        if let (Some(progress), Some(total)) = (self.progress, self.progress_total)
            && progress > total
        {
            return Some(format!("progress {progress} exceeds progress_total {total}"));
        }
        None
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_envelope_round_trip() {
        let body = r#"{
            "status": "poll",
            "redirect_request": "/Progress.json",
            "redirect_request_args": {"job_key": "abc123", "attempt": 2},
            "progress": 10,
            "progress_total": 100
        }"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.status, JobStatus::Poll);
        assert!(!resp.status.is_terminal());

        let target = resp.poll_target().unwrap();
        assert_eq!(target.endpoint, "Progress.json");
        assert_eq!(target.args["job_key"], "abc123");
        assert_eq!(target.args["attempt"], "2");
    }

    #[test]
    fn test_done_envelope_keeps_payload() {
        let body = r#"{"status": "done", "model_key": "gbm-7"}"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.status, JobStatus::Done);
        assert!(resp.status.is_terminal());
        assert_eq!(resp.extra["model_key"], "gbm-7");
    }

    #[test]
    fn test_progress_invariant() {
        let body = r#"{"status": "poll", "redirect_request": "/P.json",
                       "progress": 101, "progress_total": 100}"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        let violation = resp.invariant_violation().unwrap();
        assert!(violation.contains("exceeds"));
    }

    #[test]
    fn test_poll_without_redirect_has_no_target() {
        let body = r#"{"status": "poll"}"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        assert!(resp.poll_target().is_none());
    }

    #[test]
    fn test_poll_target_display() {
        let body = r#"{
            "status": "poll",
            "redirect_request": "Progress.json",
            "redirect_request_args": {"job_key": "k1"}
        }"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        let target = resp.poll_target().unwrap();
        assert_eq!(target.to_string(), "Progress.json?job_key=k1");
    }
}
