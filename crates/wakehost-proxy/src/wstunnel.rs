//! WebSocket tunnel: hijacks an upgraded connection and pumps bytes
//! between client and backend by hand, rather than
//! `tokio::io::copy_bidirectional`, so every forwarded frame can touch the
//! agent's activity clock and so a stalled direction can be killed on a
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use wakehost_policy::{ActivityTracker, WsCounter};

use crate::handler::ProxyError;

/// No WebSocket frame is expected to go quiet for this long; past it, the
/// connection is presumed dead and torn down rather than held open forever.
const FRAME_DEADLINE: Duration = Duration::from_secs(300);
const BUFFER_SIZE: usize = 16 * 1024;

pub async fn handle_websocket_upgrade(
    mut req: Request,
    agent: String,
    target_addr: String,
    target_path: String,
    activity: Arc<ActivityTracker>,
    ws_counter: WsCounter,
) -> Result<Response, ProxyError> {
    use hyper::client::conn::http1::Builder;

    let client_upgrade = hyper::upgrade::on(&mut req);

    let tcp_stream = TcpStream::connect(&target_addr).await.map_err(|e| {
        ProxyError::UpstreamError(format!("failed to connect to backend {target_addr}: {e}"))
    })?;
    let io = TokioIo::new(tcp_stream);

    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await
        .map_err(|e| ProxyError::UpstreamError(format!("backend handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            let msg = err.to_string();
            if !msg.contains("connection closed") && !msg.contains("not connected") {
                error!(%err, "websocket backend connection error");
            }
        }
    });

    *req.uri_mut() = target_path
        .parse()
        .map_err(|e| ProxyError::InvalidUri(format!("{e}")))?;

    let backend_response = sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::UpstreamError(format!("backend request failed: {e}")))?;

    if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %backend_response.status(), "backend did not upgrade websocket");
        return Ok(backend_response.into_response());
    }

    info!(agent = %agent, target = %target_addr, "websocket upgrade established");

    let mut response_builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in backend_response.headers() {
        response_builder = response_builder.header(name, value);
    }
    let backend_upgrade = hyper::upgrade::on(backend_response);
    let client_response = response_builder
        .body(Body::empty())
        .map_err(|e| ProxyError::UpstreamError(e.to_string()))?;

    tokio::spawn(async move {
        let guard = ws_counter.inc(&agent);
        match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok((client_io, backend_io)) => {
                let client_io = TokioIo::new(client_io);
                let backend_io = TokioIo::new(backend_io);
                pump(client_io, backend_io, &agent, &activity).await;
            }
            Err(err) => {
                error!(%err, agent = %agent, "websocket upgrade bridging failed");
            }
        }
        drop(guard);
    });

    Ok(client_response)
}

/// Pump bytes in both directions until either side closes or goes quiet
/// past `FRAME_DEADLINE`. Each successful read or write touches the
/// agent's activity clock, so an open but chatty WebSocket never looks
/// idle to the lifecycle policy.
async fn pump<A, B>(mut client: A, mut backend: B, agent: &str, activity: &ActivityTracker)
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut backend_buf = vec![0u8; BUFFER_SIZE];
    let mut client_bytes = 0u64;
    let mut backend_bytes = 0u64;

    loop {
        tokio::select! {
            result = tokio::time::timeout(FRAME_DEADLINE, client.read(&mut client_buf)) => {
                match result {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        activity.touch(agent);
                        client_bytes += n as u64;
                        if backend.write_all(&client_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            result = tokio::time::timeout(FRAME_DEADLINE, backend.read(&mut backend_buf)) => {
                match result {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        activity.touch(agent);
                        backend_bytes += n as u64;
                        if client.write_all(&backend_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }
    }
    debug!(agent, client_bytes, backend_bytes, "websocket tunnel closed");

    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;
}

/// Check if the request is a WebSocket upgrade: `Upgrade: websocket` plus
/// a `Connection` header that lists `upgrade`.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    let has_upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_connection_upgrade = req
        .headers()
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);

    has_upgrade && has_connection_upgrade
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn detects_websocket_upgrade() {
        let req = Request::builder()
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .body(Body::empty())
            .unwrap();
        assert!(is_websocket_upgrade(&req));
    }

    #[test]
    fn detects_case_insensitively() {
        let req = Request::builder()
            .header("upgrade", "WebSocket")
            .header("connection", "keep-alive, Upgrade")
            .body(Body::empty())
            .unwrap();
        assert!(is_websocket_upgrade(&req));
    }

    #[test]
    fn rejects_non_websocket_upgrade_header() {
        let req = Request::builder()
            .header("upgrade", "h2c")
            .header("connection", "Upgrade")
            .body(Body::empty())
            .unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn rejects_missing_headers() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[tokio::test]
    async fn pump_copies_bytes_until_client_closes() {
        let (mut client_a, client_b) = tokio::io::duplex(64);
        let (backend_a, mut backend_b) = tokio::io::duplex(64);

        let activity = ActivityTracker::new();
        let pump_task = tokio::spawn(async move {
            pump(client_b, backend_a, "agent", &activity).await;
        });

        client_a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client_a);
        tokio::time::timeout(Duration::from_secs(1), pump_task)
            .await
            .expect("pump should finish")
            .expect("pump task should not panic");
    }
}
