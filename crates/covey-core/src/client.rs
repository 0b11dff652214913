//! HTTP+JSON client bound to one node's control API.
//!
//! Every endpoint lives at `http://{addr}:{port}/{Endpoint}.json`. The
//! client classifies transport errors before surfacing them: a refused
//! connection or request timeout during startup is "not ready yet" and
//! retryable, everything else is not.

use covey_proto::{CloudStatus, Error, JobResponse, NodeAddr, PollTarget, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Default per-request timeout. Distinct from any overall job or
/// stabilization window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Client for one node's control API.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    addr: NodeAddr,
}

impl NodeClient {
    pub fn new(addr: NodeAddr) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, addr }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.addr.addr,
            self.addr.port,
            endpoint.trim_start_matches('/')
        )
    }

    fn classify(&self, e: &reqwest::Error) -> Error {
        if e.is_connect() || e.is_timeout() {
            Error::NotReady {
                node: self.addr.to_string(),
                detail: e.to_string(),
            }
        } else {
            Error::Http {
                node: self.addr.to_string(),
                detail: e.to_string(),
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<T> {
        let url = self.url(endpoint);
        debug!(node = %self.addr, %url, "GET");

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(&e))?;
        debug!(node = %self.addr, %url, status = status.as_u16(), "Response");

        if !status.is_success() {
            return Err(Error::Protocol {
                node: self.addr.to_string(),
                detail: format!("{endpoint} returned HTTP {status}: {body}"),
            });
        }
        serde_json::from_str(&body).map_err(|e| Error::Protocol {
            node: self.addr.to_string(),
            detail: format!("{endpoint} body did not validate: {e}"),
        })
    }

    /// Queries the node's view of the cloud.
    pub async fn cloud_status(&self) -> Result<CloudStatus> {
        self.get_json("Cloud.json", &[]).await
    }

    /// Submits a job. The response is either terminal or a `poll` envelope
    /// carrying the redirect target for [`crate::JobPoller`].
    pub async fn submit_job(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<JobResponse> {
        let endpoint = normalize_endpoint(endpoint);
        self.get_json(&endpoint, params).await
    }

    /// Issues one poll against a redirect target.
    pub async fn poll_job(&self, target: &PollTarget) -> Result<JobResponse> {
        let query: Vec<(String, String)> = target
            .args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.get_json(&target.endpoint, &query).await
    }

    /// Fire-and-forget shutdown. The node drops the connection without
    /// answering, so every transport error here counts as success.
    pub async fn shutdown(&self) {
        let url = self.url("Shutdown.json");
        debug!(node = %self.addr, %url, "Requesting shutdown");
        match self.http.get(&url).send().await {
            Ok(response) => {
                debug!(node = %self.addr, status = response.status().as_u16(), "Shutdown acknowledged");
            }
            Err(e) => {
                debug!(node = %self.addr, error = %e, "Shutdown connection dropped (expected)");
            }
        }
    }

    /// Two-phase file upload: negotiate an upload port via the control API,
    /// then stream the file bytes to it over a raw TCP connection.
    pub async fn upload_file(&self, local: &Path) -> Result<()> {
        #[derive(serde::Deserialize)]
        struct UploadNegotiation {
            port: u16,
        }

        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let negotiation: UploadNegotiation = self
            .get_json(
                "FileUpload.json",
                &[("filename".to_string(), file_name.clone())],
            )
            .await?;

        let bytes = tokio::fs::read(local).await?;
        debug!(
            node = %self.addr,
            file = %file_name,
            upload_port = negotiation.port,
            size = bytes.len(),
            "Streaming file to negotiated port"
        );

        let mut stream =
            tokio::net::TcpStream::connect((self.addr.addr.as_str(), negotiation.port))
                .await
                .map_err(|e| Error::NotReady {
                    node: self.addr.to_string(),
                    detail: format!("upload port {} refused: {e}", negotiation.port),
                })?;
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// One stabilization attempt: can the node answer a status query at all?
    ///
    /// Refused connections report "not yet"; a well-formed answer reports
    /// ready regardless of cloud size.
    pub async fn accepts_connections(&self) -> Result<bool> {
        match self.cloud_status().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_retryable() => {
                debug!(node = %self.addr, "Not accepting connections yet");
                Ok(false)
            }
            Err(e) => {
                warn!(node = %self.addr, error = %e, "Status query failed fatally");
                Err(e)
            }
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_start_matches('/');
    if endpoint.ends_with(".json") {
        endpoint.to_string()
    } else {
        format!("{endpoint}.json")
    }
}
