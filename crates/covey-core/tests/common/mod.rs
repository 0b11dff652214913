//! Scripted HTTP mock for the node control API.
//!
//! Just enough HTTP/1.1 to satisfy the client: read one request, answer
//! with canned JSON, close. Requests are recorded so tests can assert on
//! which endpoints were hit.

// Each integration binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub type RequestLog = Arc<Mutex<Vec<String>>>;

/// Serves `respond(path)` as a JSON body on an ephemeral port. Returns the
/// port and the request log. The listener task lives until the runtime
/// shuts down.
pub async fn serve_json<F>(respond: F) -> (u16, RequestLog)
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let task_log = log.clone();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            let log = task_log.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                log.lock().unwrap().push(path.clone());

                let body = respond(&path);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    (port, log)
}

/// A server that accepts and immediately drops connections without
/// answering, the way a node honors a shutdown request.
pub async fn serve_dropping() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            drop(sock);
        }
    });
    port
}

/// Canned cloud-status body for a healthy member of an `size`-node cloud.
pub fn cloud_status_body(cluster: &str, size: usize, consensus: bool) -> String {
    format!(
        r#"{{"cloud_name":"{cluster}","node_name":"127.0.0.1","cloud_size":{size},"consensus":{consensus},"locked":false,"nodes":[]}}"#
    )
}
