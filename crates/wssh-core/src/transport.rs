//! Byte-stream adapter over a message-oriented WebSocket.
//!
//! The relay speaks binary WebSocket messages; the SSH stack wants an
//! ordered byte stream. [`WsStream`] bridges the two: a receive pump feeds a
//! bounded queue, reads drain it greedily to keep round trips down, and
//! writes are chunked into small binary messages. Memory is bounded at every
//! point — an oversized frame or a full receive queue is fatal for the
//! stream, never silently dropped.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::constants::{WS_DIAL_TIMEOUT, WS_MAX_FRAME, WS_RECV_QUEUE, WS_WRITE_CHUNK};
use crate::error::{public_err, Error, Result};

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tunables for a WebSocket stream. Defaults match production use; tests
/// shrink the bounds to exercise the failure paths.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Hard bound on one incoming frame.
    pub max_frame_size: usize,
    /// Capacity of the incoming message queue.
    pub recv_queue: usize,
    /// Dial deadline.
    pub dial_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: WS_MAX_FRAME,
            recv_queue: WS_RECV_QUEUE,
            dial_timeout: WS_DIAL_TIMEOUT,
        }
    }
}

/// Validate a relay or tunnel URL.
///
/// `wss` is always accepted; `ws` only with the explicit development opt-in;
/// everything else is rejected.
pub fn parse_ws_url(raw: &str, allow_insecure: bool) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation {
            message: "proxy URL is required".into(),
        });
    }

    let url = Url::parse(trimmed).map_err(|_| Error::Validation {
        message: "invalid WebSocket URL".into(),
    })?;

    match url.scheme() {
        "wss" => Ok(url),
        "ws" if allow_insecure => Ok(url),
        "ws" => Err(Error::Validation {
            message: "insecure ws:// URL blocked; use wss:// or enable allow_insecure_ws for development"
                .into(),
        }),
        _ => Err(Error::Validation {
            message: "WebSocket URL must use ws:// or wss://".into(),
        }),
    }
}

/// State shared between the stream, its control handle, and the pump.
#[derive(Debug)]
struct Shared {
    /// Sticky error; once set, every subsequent read/write fails with it.
    err: Mutex<Option<String>>,
    /// Set by a local or remote clean close.
    closed: AtomicBool,
    token: CancellationToken,
}

impl Shared {
    fn set_err(&self, msg: &str) {
        let mut err = self.err.lock().unwrap();
        if err.is_none() {
            *err = Some(msg.to_string());
        }
    }

    fn err(&self) -> Option<String> {
        self.err.lock().unwrap().clone()
    }
}

/// Detached control over a [`WsStream`] whose I/O half has been handed to
/// the SSH layer. Owners keep this to force teardown.
#[derive(Debug, Clone)]
pub struct WsControl {
    shared: Arc<Shared>,
}

impl WsControl {
    /// Begin teardown: mark closed and cancel the pump. Idempotent.
    /// Subsequent reads on the stream yield EOF.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.token.cancel();
    }

    /// The sticky error, if the stream has failed.
    pub fn error(&self) -> Option<String> {
        self.shared.err()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.shared.token.is_cancelled()
    }
}

/// A full-duplex byte stream over one WebSocket connection.
pub struct WsStream {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    sink: SplitSink<WsSocket, Message>,
}

impl WsStream {
    /// Dial `url` and return an established stream.
    pub async fn dial(url: &str) -> Result<WsStream> {
        Self::dial_with(url, WsConfig::default()).await
    }

    /// Dial with explicit bounds.
    pub async fn dial_with(url: &str, config: WsConfig) -> Result<WsStream> {
        let (socket, _response) = match tokio::time::timeout(
            config.dial_timeout,
            connect_async(url),
        )
        .await
        {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => return Err(public_err("websocket: dial failed", e)),
            Err(_) => {
                return Err(Error::Transport {
                    message: "websocket: dial timeout".into(),
                })
            }
        };

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(config.recv_queue);

        let shared = Arc::new(Shared {
            err: Mutex::new(None),
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
        });

        tokio::spawn(recv_pump(
            stream,
            tx,
            shared.clone(),
            config.max_frame_size,
        ));

        Ok(WsStream {
            shared,
            rx,
            leftover: Bytes::new(),
            sink,
        })
    }

    /// A handle for closing the stream after the I/O object moves elsewhere.
    pub fn control(&self) -> WsControl {
        WsControl {
            shared: self.shared.clone(),
        }
    }

    fn copy_out(&mut self, buf: &mut ReadBuf<'_>, mut data: Bytes) {
        let n = data.len().min(buf.remaining());
        buf.put_slice(&data[..n]);
        data.advance(n);
        if !data.is_empty() {
            self.leftover = data;
        }
    }
}

/// Receive pump: drains the socket into the bounded queue.
///
/// Frame-size violations and queue overflow are fatal: the error sticks, the
/// token cancels, and the pump exits (dropping the socket's read half).
async fn recv_pump(
    mut stream: SplitStream<WsSocket>,
    tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    max_frame: usize,
) {
    loop {
        let msg = tokio::select! {
            _ = shared.token.cancelled() => break,
            msg = stream.next() => msg,
        };

        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "websocket receive failed");
                shared.set_err("websocket: connection closed");
                shared.token.cancel();
                break;
            }
            None => {
                shared.closed.store(true, Ordering::SeqCst);
                shared.token.cancel();
                break;
            }
        };

        let data: Bytes = match msg {
            Message::Binary(_) | Message::Text(_) => msg.into_data(),
            Message::Close(_) => {
                shared.closed.store(true, Ordering::SeqCst);
                shared.token.cancel();
                break;
            }
            // Ping/pong are handled by the protocol layer.
            _ => continue,
        };

        if data.len() > max_frame {
            shared.set_err("websocket: incoming frame too large");
            shared.token.cancel();
            break;
        }

        match tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                shared.set_err("websocket: receive buffer overflow");
                shared.token.cancel();
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Serve leftover bytes from a prior partial copy first, even when an
        // error is pending; data already received must not be lost.
        if !this.leftover.is_empty() {
            let data = std::mem::take(&mut this.leftover);
            this.copy_out(buf, data);
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = this.shared.err() {
            return Poll::Ready(Err(io::Error::other(err)));
        }

        // Local close: EOF, matching the graceful-close contract SSH expects.
        if this.shared.closed.load(Ordering::SeqCst) && this.rx.is_empty() {
            return Poll::Ready(Ok(()));
        }

        let data = match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => data,
            Poll::Ready(None) => {
                // Pump exited. A sticky error wins; otherwise clean EOF.
                return match this.shared.err() {
                    Some(err) => Poll::Ready(Err(io::Error::other(err))),
                    None => Poll::Ready(Ok(())),
                };
            }
            Poll::Pending => return Poll::Pending,
        };
        this.copy_out(buf, data);

        // Greedy read: drain whatever is already queued into the remaining
        // space before returning. Cuts per-read overhead for fast channels.
        while buf.remaining() > 0 && this.leftover.is_empty() {
            match this.rx.try_recv() {
                Ok(extra) => this.copy_out(buf, extra),
                Err(_) => break,
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(err) = this.shared.err() {
            return Poll::Ready(Err(io::Error::other(err)));
        }
        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "websocket: not in OPEN state",
            )));
        }

        match Pin::new(&mut this.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                this.shared.set_err("websocket: connection closed");
                return Poll::Ready(Err(io::Error::other(e.to_string())));
            }
            Poll::Pending => return Poll::Pending,
        }

        // One binary message per chunk; callers loop for the rest.
        let n = buf.len().min(WS_WRITE_CHUNK);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if let Err(e) = Pin::new(&mut this.sink).start_send(Message::Binary(chunk)) {
            this.shared.set_err("websocket: connection closed");
            return Poll::Ready(Err(io::Error::other(e.to_string())));
        }

        // Kick the flush so small writes do not sit in the sink buffer; a
        // pending flush completes on a later poll.
        let _ = Pin::new(&mut this.sink).poll_flush(cx);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.sink)
            .poll_flush(cx)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.shared.closed.store(true, Ordering::SeqCst);
        this.shared.token.cancel();
        Pin::new(&mut this.sink)
            .poll_close(cx)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

impl Drop for WsStream {
    fn drop(&mut self) {
        // Releases the pump even if nobody called close.
        self.shared.token.cancel();
    }
}

impl std::fmt::Debug for WsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStream")
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .field("err", &self.shared.err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_url() {
        assert!(parse_ws_url("", false).is_err());
        assert!(parse_ws_url("   ", false).is_err());
    }

    #[test]
    fn rejects_insecure_by_default() {
        let err = parse_ws_url("ws://relay.example/relay", false).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn allows_insecure_with_opt_in() {
        let url = parse_ws_url("ws://relay.example/relay", true).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn accepts_wss_always() {
        assert!(parse_ws_url("wss://relay.example/relay", false).is_ok());
        assert!(parse_ws_url("wss://relay.example/relay", true).is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(parse_ws_url("https://relay.example/relay", false).is_err());
        assert!(parse_ws_url("ftp://relay.example", true).is_err());
        assert!(parse_ws_url("not a url", true).is_err());
    }

    #[test]
    fn scheme_check_is_case_insensitive() {
        // Url::parse lowercases schemes, so WSS:// lands on the wss arm.
        assert!(parse_ws_url("WSS://relay.example/relay", false).is_ok());
    }

    #[test]
    fn control_close_is_idempotent() {
        let shared = Arc::new(Shared {
            err: Mutex::new(None),
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
        });
        let control = WsControl { shared };
        control.close();
        control.close();
        assert!(control.is_closed());
        assert!(control.error().is_none());
    }

    #[test]
    fn sticky_error_is_first_writer_wins() {
        let shared = Shared {
            err: Mutex::new(None),
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
        };
        shared.set_err("first");
        shared.set_err("second");
        assert_eq!(shared.err().as_deref(), Some("first"));
    }
}
