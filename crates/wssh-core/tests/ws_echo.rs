//! Transport integration tests against an in-process WebSocket server.
//!
//! These exercise the stream adapter end to end: framing coalescing across
//! message boundaries, write chunking, the oversized-frame kill switch, and
//! receive-queue overflow.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use wssh_core::transport::{WsConfig, WsStream};

/// Start a one-connection WebSocket server and return its ws:// URL.
async fn ws_server<F, Fut>(behavior: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                behavior(ws).await;
            }
        }
    });
    format!("ws://{addr}")
}

async fn send_binary(ws: &mut WebSocketStream<TcpStream>, data: &[u8]) {
    ws.send(Message::Binary(data.to_vec().into())).await.unwrap();
}

#[tokio::test]
async fn reads_cross_message_boundaries() {
    let url = ws_server(|mut ws| async move {
        send_binary(&mut ws, b"ABCD").await;
        send_binary(&mut ws, b"EFGH").await;
        // Keep the connection open while the client reads.
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABCD");
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"EFGH");
}

#[tokio::test]
async fn greedy_read_coalesces_queued_messages() {
    let url = ws_server(|mut ws| async move {
        send_binary(&mut ws, b"ABCD").await;
        send_binary(&mut ws, b"EFGH").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();
    // Let both frames land in the receive queue first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 8, "greedy read should drain both queued frames");
    assert_eq!(&buf, b"ABCDEFGH");
}

#[tokio::test]
async fn partial_reads_keep_leftover_bytes() {
    let url = ws_server(|mut ws| async move {
        send_binary(&mut ws, b"ABCDEFGH").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABCD");
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"EFGH");
}

#[tokio::test]
async fn echo_roundtrip_through_relay() {
    let url = ws_server(|mut ws| async move {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_binary() {
                let _ = ws.send(msg).await;
            }
        }
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();
    stream.write_all(b"ssh-ish payload").await.unwrap();

    let mut buf = [0u8; 15];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ssh-ish payload");
}

#[tokio::test]
async fn writes_are_chunked_into_small_messages() {
    let (got_tx, got_rx) = tokio::sync::oneshot::channel::<Vec<usize>>();
    let url = ws_server(|mut ws| async move {
        let mut sizes = Vec::new();
        let mut total = 0usize;
        while total < 10_000 {
            match ws.next().await {
                Some(Ok(msg)) if msg.is_binary() => {
                    let len = msg.into_data().len();
                    sizes.push(len);
                    total += len;
                }
                _ => break,
            }
        }
        let _ = got_tx.send(sizes);
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();
    stream.write_all(&vec![0x5A; 10_000]).await.unwrap();
    stream.flush().await.unwrap();

    let sizes = got_rx.await.unwrap();
    assert_eq!(sizes.iter().sum::<usize>(), 10_000);
    assert!(sizes.iter().all(|&s| s <= 4096), "chunks over 4 KiB: {sizes:?}");
    assert!(sizes.len() >= 3);
}

#[tokio::test]
async fn oversized_frame_kills_the_stream() {
    let url = ws_server(|mut ws| async move {
        send_binary(&mut ws, &vec![0u8; 4096]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let config = WsConfig {
        max_frame_size: 1024,
        ..WsConfig::default()
    };
    let mut stream = WsStream::dial_with(&url, config).await.unwrap();

    let mut buf = [0u8; 64];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(
        err.to_string().contains("frame too large"),
        "unexpected error: {err}"
    );

    // The error sticks: writes fail fast too.
    let write_err = stream.write_all(b"more").await.unwrap_err();
    assert!(write_err.to_string().contains("frame too large"));
}

#[tokio::test]
async fn receive_queue_overflow_is_fatal() {
    let url = ws_server(|mut ws| async move {
        for i in 0..16u8 {
            send_binary(&mut ws, &[i; 8]).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let config = WsConfig {
        recv_queue: 4,
        ..WsConfig::default()
    };
    let mut stream = WsStream::dial_with(&url, config).await.unwrap();

    // Give the flood time to overwhelm the bounded queue.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut buf = [0u8; 64];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(
        err.to_string().contains("receive buffer overflow"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn peer_close_reads_as_eof() {
    let url = ws_server(|mut ws| async move {
        send_binary(&mut ws, b"bye").await;
        let _ = ws.close(None).await;
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();

    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bye");

    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0, "clean close should read as EOF");
}

#[tokio::test]
async fn local_close_makes_reads_eof_and_writes_fail() {
    let url = ws_server(|mut ws| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_binary(&mut ws, b"late").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let mut stream = WsStream::dial(&url).await.unwrap();
    let control = stream.control();
    control.close();
    control.close(); // idempotent

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    let err = stream.write_all(b"data").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

#[tokio::test]
async fn dial_refused_port_fails() {
    // Bind and drop to get a (very likely) unused port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WsStream::dial(&format!("ws://{addr}")).await.unwrap_err();
    let rendered = err.to_string();
    assert!(
        rendered.contains("dial failed") || rendered.contains("dial timeout"),
        "unexpected error: {rendered}"
    );
    // The low-level cause never reaches the public message.
    assert!(!rendered.to_lowercase().contains("refused"));
}
