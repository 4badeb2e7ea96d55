//! Network probes for HTTP and TCP health checks.

use std::time::Duration;

use tracing::debug;

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered within the rules of the check.
    Success,
    /// The endpoint failed, refused, or timed out.
    Failure(String),
    /// The answer counts neither way (1xx with `ignore_http_1xx`).
    Ignored,
}

/// Perform an HTTP GET against `http://<host>:<port><path>`.
///
/// 2xx and 3xx are success. 1xx is a failure unless `ignore_1xx` is
/// set, in which case it is ignored entirely: it neither fails nor
/// resets the streak.
pub async fn http_probe(
    host: &str,
    port: u32,
    path: &str,
    timeout: Duration,
    ignore_1xx: bool,
) -> ProbeOutcome {
    let address = format!("{host}:{port}");
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeOutcome::Failure(format!("connect: {e}"));
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeOutcome::Failure(format!("handshake: {e}"));
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &address)
            .header("user-agent", "flotilla-health/0.4")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .expect("static request is well formed");

        match sender.send_request(req).await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || status.is_redirection() {
                    ProbeOutcome::Success
                } else if status.is_informational() && ignore_1xx {
                    debug!(%status, %uri, "ignoring 1xx health response");
                    ProbeOutcome::Ignored
                } else {
                    debug!(%status, %uri, "health probe bad status");
                    ProbeOutcome::Failure(format!("status {status}"))
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeOutcome::Failure(format!("request: {e}"))
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeOutcome::Failure("timeout".to_string())
        }
    }
}

/// Connect-and-close within the timeout.
pub async fn tcp_probe(host: &str, port: u32, timeout: Duration) -> ProbeOutcome {
    let address = format!("{host}:{port}");
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => ProbeOutcome::Success,
        Ok(Err(e)) => {
            debug!(error = %e, %address, "tcp probe failed");
            ProbeOutcome::Failure(format!("connect: {e}"))
        }
        Err(_) => {
            debug!(%address, "tcp probe timed out");
            ProbeOutcome::Failure("timeout".to_string())
        }
    }
}
