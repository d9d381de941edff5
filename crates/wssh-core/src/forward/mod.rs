//! Browser-adapted port forwarding.
//!
//! A native client would open a local TCP listener; here there is none.
//! Instead the core dials a second WebSocket to the tunnel service, which
//! allocates a public ingress (subdomain URL and optional raw TCP port).
//! Incoming HTTP requests and raw TCP connections arrive multiplexed on
//! that control stream and are forwarded through SSH direct-tcpip channels
//! to the target reachable from the remote host.

pub mod frame;
pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::api::{Core, Wssh};
use crate::constants::{
    CONN_QUEUE, DIRECT_TCPIP_TIMEOUT, FORWARD_BUFFER, HTTP_RESPONSE_LIMIT,
    MAX_CONCURRENT_HANDLERS, PUMP_BUFFER, TUNNEL_READY_LIMIT,
};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::{parse_ws_url, WsControl, WsStream};
use crate::util::{mint_id, OnceLatch};

use frame::{build_binary_frame, is_json, parse_binary_frame, ControlMsg, TunnelReady};

/// Host-supplied parameters for one port forward.
#[derive(Debug, Clone, Default)]
pub struct ForwardConfig {
    /// Target host, from the remote SSH server's point of view.
    pub remote_host: String,
    pub remote_port: u16,
    /// WebSocket URL of the tunnel service.
    pub proxy_tunnel_url: String,
    /// Bearer token for the tunnel, if it requires one.
    pub token: Option<String>,
    /// Development opt-in for `ws://` tunnels.
    pub allow_insecure_ws: bool,
}

/// Forward metadata as reported to the host.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub remote_host: String,
    pub remote_port: u16,
    /// Public ingress URL allocated by the tunnel.
    pub tunnel_url: String,
    /// Raw TCP ingress port, or 0 when the tunnel allocated none.
    pub raw_port: u16,
    pub active: bool,
}

/// One active port forward.
pub struct PortForward {
    pub id: String,
    pub session_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub tunnel_url: String,
    pub raw_port: u16,
    /// Child of the owning session's token.
    token: CancellationToken,
    transport: WsControl,
    /// Serializes every write to the tunnel stream.
    writer: tokio::sync::Mutex<WriteHalf<WsStream>>,
    /// Bounds concurrent HTTP/TCP handler tasks.
    sem: Arc<Semaphore>,
    /// connId -> inbound byte queue of the owning TCP handler.
    conns: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
    cleanup_latch: OnceLatch,
}

impl std::fmt::Debug for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForward")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("remote", &format!("{}:{}", self.remote_host, self.remote_port))
            .field("tunnel_url", &self.tunnel_url)
            .finish_non_exhaustive()
    }
}

impl PortForward {
    fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            tunnel_url: self.tunnel_url.clone(),
            raw_port: self.raw_port,
            active: true,
        }
    }

    /// Write one frame to the tunnel under the write lock.
    async fn write_tunnel(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    async fn send_http_response(
        &self,
        req_id: &str,
        status: u16,
        headers: &HashMap<String, String>,
        body: &str,
        body_encoding: Option<&str>,
    ) {
        let data = http::response_envelope(req_id, status, headers, body, body_encoding).to_string();
        if let Err(e) = self.write_tunnel(data.as_bytes()).await {
            tracing::debug!(forward = %self.id, error = %e, "http_response write failed");
        }
    }

    async fn send_tcp_close(&self, conn_id: &str) {
        let msg = json!({ "type": "tcp_close", "connId": conn_id }).to_string();
        if let Err(e) = self.write_tunnel(msg.as_bytes()).await {
            tracing::debug!(forward = %self.id, error = %e, "tcp_close write failed");
        }
    }
}

impl Wssh {
    /// Start a port forward: dial the tunnel, wait for its `tunnel_ready`,
    /// and begin serving proxied requests through the session.
    pub async fn port_forward_start(
        &self,
        session_id: &str,
        config: ForwardConfig,
    ) -> Result<TunnelInfo> {
        let core = self.core();
        let session = core.sessions.get(session_id).ok_or_else(|| Error::Validation {
            message: format!("portForwardStart: session {session_id:?} not found"),
        })?;

        if config.remote_host.trim().is_empty()
            || config.proxy_tunnel_url.trim().is_empty()
        {
            return Err(Error::Validation {
                message: "portForwardStart: remoteHost, remotePort, and proxyTunnelUrl required"
                    .into(),
            });
        }
        if config.remote_port == 0 {
            return Err(Error::Validation {
                message: "portForwardStart: remotePort must be 1-65535".into(),
            });
        }

        let mut url = parse_ws_url(&config.proxy_tunnel_url, config.allow_insecure_ws)?;
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }

        let ws = WsStream::dial(url.as_str()).await?;
        let transport = ws.control();
        let (mut read_half, write_half) = tokio::io::split(ws);

        let ready = match read_tunnel_ready(&mut read_half).await {
            Ok(ready) => ready,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        let forward_id = mint_id();
        let fwd = Arc::new(PortForward {
            id: forward_id.clone(),
            session_id: session.id.clone(),
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            tunnel_url: ready.tunnel_url,
            raw_port: ready.raw_port,
            token: session.token.child_token(),
            transport,
            writer: tokio::sync::Mutex::new(write_half),
            sem: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
            conns: Mutex::new(HashMap::new()),
            cleanup_latch: OnceLatch::new(),
        });

        core.forwards.insert(forward_id.clone(), fwd.clone());

        tokio::spawn(tunnel_pump(core.clone(), session, fwd.clone(), read_half));

        tracing::info!(
            forward = %forward_id,
            tunnel_url = %fwd.tunnel_url,
            raw_port = fwd.raw_port,
            "port forward established"
        );
        Ok(fwd.info())
    }

    /// Stop a port forward. Idempotent; unknown ids are ignored.
    pub async fn port_forward_stop(&self, forward_id: &str) {
        let core = self.core();
        if let Some(fwd) = core.forwards.get(forward_id) {
            cleanup_forward(core, &fwd).await;
        }
    }

    /// All active forwards for a session.
    pub fn port_forward_list(&self, session_id: &str) -> Vec<TunnelInfo> {
        self.core()
            .forwards
            .filter(|f| f.session_id == session_id)
            .into_iter()
            .map(|(_, f)| f.info())
            .collect()
    }
}

/// Tear a forward down: cancel handlers, close the tunnel stream, drop all
/// per-connection queues, deregister. Exactly one caller does the work.
pub(crate) async fn cleanup_forward(core: &Arc<Core>, fwd: &Arc<PortForward>) {
    if !fwd.cleanup_latch.acquire() {
        return;
    }
    tracing::info!(forward = %fwd.id, "closing port forward");
    fwd.token.cancel();
    fwd.transport.close();
    fwd.conns.lock().unwrap().clear();
    core.forwards.take(&fwd.id);
}

/// Read and decode the single `tunnel_ready` control frame.
async fn read_tunnel_ready(read_half: &mut ReadHalf<WsStream>) -> Result<TunnelReady> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; FORWARD_BUFFER];
    loop {
        let n = read_half.read(&mut chunk).await.map_err(|e| Error::Transport {
            message: format!("portForwardStart: tunnel read: {e}"),
        })?;
        if n == 0 {
            return Err(Error::Protocol {
                message: "portForwardStart: tunnel closed before tunnel_ready".into(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > TUNNEL_READY_LIMIT {
            return Err(Error::Protocol {
                message: "portForwardStart: tunnel_ready exceeds 1 MiB".into(),
            });
        }

        // Decode the first JSON value; trailing bytes from a coalesced read
        // are not part of the handshake.
        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<TunnelReady>();
        match values.next() {
            Some(Ok(ready)) => {
                if ready.msg_type != "tunnel_ready" {
                    return Err(Error::Protocol {
                        message: format!(
                            "portForwardStart: expected tunnel_ready, got {:?}",
                            ready.msg_type
                        ),
                    });
                }
                return Ok(ready);
            }
            Some(Err(e)) if e.is_eof() => continue,
            Some(Err(e)) => {
                return Err(Error::Protocol {
                    message: format!("portForwardStart: parse tunnel_ready: {e}"),
                })
            }
            None => continue,
        }
    }
}

/// Read tunnel frames and dispatch them until the stream or forward dies.
async fn tunnel_pump(
    core: Arc<Core>,
    session: Arc<Session>,
    fwd: Arc<PortForward>,
    mut read_half: ReadHalf<WsStream>,
) {
    let mut buf = vec![0u8; FORWARD_BUFFER];
    loop {
        let n = tokio::select! {
            _ = fwd.token.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        let data = &buf[..n];

        // Binary TCP frame: dispatch to the connection's inbound queue.
        // Frames for unknown connections are dropped.
        if data.len() >= 4 && !is_json(data) {
            if let Some((conn_id, payload)) = parse_binary_frame(data) {
                let tx = fwd.conns.lock().unwrap().get(&conn_id).cloned();
                if let Some(tx) = tx {
                    let payload = Bytes::copy_from_slice(payload);
                    tokio::select! {
                        _ = fwd.token.cancelled() => break,
                        _ = tx.send(payload) => {}
                    }
                }
                continue;
            }
        }

        let Ok(msg) = serde_json::from_slice::<ControlMsg>(data) else {
            continue;
        };

        match msg.msg_type.as_str() {
            "http_request" => match fwd.sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(handle_http_request(
                        session.clone(),
                        fwd.clone(),
                        msg,
                        permit,
                    ));
                }
                Err(_) => {
                    fwd.send_http_response(
                        &msg.id,
                        503,
                        &HashMap::new(),
                        "too many concurrent requests",
                        None,
                    )
                    .await;
                }
            },
            "tcp_open" => match fwd.sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(handle_tcp_open(
                        session.clone(),
                        fwd.clone(),
                        msg.conn_id,
                        permit,
                    ));
                }
                Err(_) => fwd.send_tcp_close(&msg.conn_id).await,
            },
            "tcp_close" => {
                // Dropping the sender ends the handler's inbound loop.
                fwd.conns.lock().unwrap().remove(&msg.conn_id);
            }
            other => {
                tracing::debug!(forward = %fwd.id, msg_type = other, "ignoring tunnel message");
            }
        }
    }

    cleanup_forward(&core, &fwd).await;
}

/// Open a direct-tcpip channel with a hard deadline.
///
/// The dial runs detached: if it loses the race against the deadline or
/// cancellation, the late channel is dropped (which closes it) instead of
/// leaking.
async fn dial_direct_tcpip(
    session: &Arc<Session>,
    token: &CancellationToken,
    host: &str,
    port: u16,
) -> Result<russh::Channel<russh::client::Msg>> {
    let (tx, rx) = oneshot::channel();
    let dial_session = session.clone();
    let dial_host = host.to_string();
    tokio::spawn(async move {
        let result = dial_session
            .handle()
            .channel_open_direct_tcpip(dial_host, u32::from(port), "127.0.0.1".to_string(), 0)
            .await;
        // A failed send means the waiter gave up; the channel (if any)
        // drops here and closes.
        let _ = tx.send(result);
    });

    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(DIRECT_TCPIP_TIMEOUT) => Err(Error::Timeout {
            message: format!("ssh dial {host}:{port}"),
        }),
        result = rx => match result {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(Error::Protocol {
                message: format!("ssh dial {host}:{port}: {e}"),
            }),
            Err(_) => Err(Error::Internal {
                message: "direct-tcpip dial task vanished".into(),
            }),
        },
    }
}

/// Replay one proxied HTTP request at the remote service and send the
/// response envelope back through the tunnel.
async fn handle_http_request(
    session: Arc<Session>,
    fwd: Arc<PortForward>,
    msg: ControlMsg,
    _permit: OwnedSemaphorePermit,
) {
    let channel = match dial_direct_tcpip(&session, &fwd.token, &fwd.remote_host, fwd.remote_port)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            fwd.send_http_response(
                &msg.id,
                502,
                &HashMap::new(),
                &format!("SSH dial failed: {e}"),
                None,
            )
            .await;
            return;
        }
    };

    let request = match http::build_http_request(
        &msg.method,
        &msg.path,
        &fwd.remote_host,
        fwd.remote_port,
        &msg.headers,
        &msg.body,
    ) {
        Ok(request) => request,
        Err(_) => {
            fwd.send_http_response(&msg.id, 400, &HashMap::new(), "bad request", None)
                .await;
            return;
        }
    };

    let mut stream = channel.into_stream();
    if stream.write_all(request.as_bytes()).await.is_err() {
        fwd.send_http_response(&msg.id, 502, &HashMap::new(), "write failed", None)
            .await;
        return;
    }

    let mut raw = Vec::new();
    let mut limited = (&mut stream).take(HTTP_RESPONSE_LIMIT);
    if limited.read_to_end(&mut raw).await.is_err() {
        fwd.send_http_response(&msg.id, 502, &HashMap::new(), "read failed", None)
            .await;
        return;
    }

    let parts = http::parse_http_response(&raw);
    let (body, body_encoding) = http::encode_body(&parts.headers, parts.body);
    fwd.send_http_response(&msg.id, parts.status, &parts.headers, &body, body_encoding)
        .await;
}

/// Relay one raw TCP connection between the tunnel and an SSH channel.
async fn handle_tcp_open(
    session: Arc<Session>,
    fwd: Arc<PortForward>,
    conn_id: String,
    _permit: OwnedSemaphorePermit,
) {
    if conn_id.is_empty() {
        return;
    }

    let channel = match dial_direct_tcpip(&session, &fwd.token, &fwd.remote_host, fwd.remote_port)
        .await
    {
        Ok(channel) => channel,
        Err(_) => {
            fwd.send_tcp_close(&conn_id).await;
            return;
        }
    };

    let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(CONN_QUEUE);
    fwd.conns.lock().unwrap().insert(conn_id.clone(), in_tx);

    let (mut ssh_read, mut ssh_write) = tokio::io::split(channel.into_stream());

    // Tunnel -> SSH: drain the inbound queue into the channel.
    let token = fwd.token.clone();
    let to_ssh = tokio::spawn(async move {
        loop {
            let data = tokio::select! {
                _ = token.cancelled() => break,
                data = in_rx.recv() => data,
            };
            let Some(data) = data else { break };
            if ssh_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = ssh_write.shutdown().await;
    });

    // SSH -> Tunnel: wrap channel reads as binary frames.
    let token = fwd.token.clone();
    let frame_fwd = fwd.clone();
    let frame_conn = conn_id.clone();
    let to_tunnel = tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER];
        loop {
            let n = tokio::select! {
                _ = token.cancelled() => break,
                read = ssh_read.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            let framed = build_binary_frame(&frame_conn, &buf[..n]);
            if frame_fwd.write_tunnel(&framed).await.is_err() {
                break;
            }
        }
    });

    let _ = tokio::join!(to_ssh, to_tunnel);

    fwd.conns.lock().unwrap().remove(&conn_id);
    fwd.send_tcp_close(&conn_id).await;
}
