//! SFTP transfer engine: chunked upload/download with progress and
//! cancellation, push-based streaming upload, and pull-based streaming
//! download for the service-worker fetch bridge.
//!
//! The bulk paths buffer the whole payload and are capped; the streaming
//! paths hold at most a bounded queue of chunks in memory regardless of
//! file size.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::Wssh;
use crate::bridge::{guard, ProgressFn, StreamDownloadEvent};
use crate::constants::{
    DOWNLOAD_INIT_CAP, MAX_BUFFERED_TRANSFER, STREAM_DOWNLOAD_EVENT, STREAM_DOWNLOAD_TIMEOUT,
    TRANSFER_CHUNK, UPLOAD_QUEUE,
};
use crate::error::{Error, Result};
use crate::sftp::path::basename;
use crate::util::{mint_id, DoneSignal};

type RemoteFile = russh_sftp::client::fs::File;

/// One chunk handed to the service worker by [`Wssh::stream_pull`].
#[derive(Debug, Clone)]
pub struct PullChunk {
    pub data: Option<Bytes>,
    pub done: bool,
}

impl PullChunk {
    fn finished() -> Self {
        Self {
            data: None,
            done: true,
        }
    }
}

// =============================================================================
// Bulk transfers
// =============================================================================

impl Wssh {
    /// Upload a buffered payload to a remote file.
    ///
    /// Writes in 64 KiB chunks, reporting progress after each chunk and
    /// honouring `cancel` between chunks. Payloads over the buffered-transfer
    /// ceiling are rejected up front; use the streaming API for those.
    pub async fn sftp_upload(
        &self,
        sftp_id: &str,
        remote_path: &str,
        data: Bytes,
        on_progress: Option<ProgressFn>,
        cancel: Option<CancellationToken>,
    ) -> Result<()> {
        let handle = self.sftp_handle(sftp_id)?;
        let remote_path = handle.validate(remote_path)?;

        let total = data.len() as u64;
        if total > MAX_BUFFERED_TRANSFER {
            return Err(Error::SizeLimit {
                message: format!(
                    "sftpUpload: payload too large ({total} bytes, max {MAX_BUFFERED_TRANSFER}). Use sftpUploadStream for large files"
                ),
            });
        }

        let mut file = handle
            .sftp
            .open_with_flags(
                &remote_path,
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpUpload: create: {e}"),
            })?;

        let mut written = 0u64;
        for chunk in data.chunks(TRANSFER_CHUNK) {
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled);
            }
            file.write_all(chunk).await.map_err(|e| Error::Remote {
                message: format!("sftpUpload: write at {written}: {e}"),
            })?;
            written += chunk.len() as u64;
            if let Some(progress) = &on_progress {
                guard("on_progress", || progress(written, total));
            }
        }

        file.shutdown().await.map_err(|e| Error::Remote {
            message: format!("sftpUpload: close: {e}"),
        })?;
        Ok(())
    }

    /// Download a remote file into one buffer.
    ///
    /// Rejected when the remote size exceeds the buffered-transfer ceiling;
    /// the streaming download exists for those.
    pub async fn sftp_download(
        &self,
        sftp_id: &str,
        remote_path: &str,
        on_progress: Option<ProgressFn>,
        cancel: Option<CancellationToken>,
    ) -> Result<Bytes> {
        let handle = self.sftp_handle(sftp_id)?;
        let remote_path = handle.validate(remote_path)?;

        let attrs = handle
            .sftp
            .metadata(&remote_path)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpDownload: stat: {e}"),
            })?;
        let total = attrs.size.unwrap_or(0);
        if total > MAX_BUFFERED_TRANSFER {
            return Err(Error::SizeLimit {
                message: format!(
                    "sftpDownload: file too large ({total} bytes, max {MAX_BUFFERED_TRANSFER}). Use sftpDownloadStream for large files"
                ),
            });
        }

        let mut file = handle
            .sftp
            .open(&remote_path)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpDownload: open: {e}"),
            })?;

        // Modest initial capacity; growth is geometric from there rather
        // than hundreds of megabytes up front.
        let init_cap = (total as usize).min(DOWNLOAD_INIT_CAP);
        let mut buf = Vec::with_capacity(init_cap);
        let mut chunk = vec![0u8; TRANSFER_CHUNK];
        let mut read_total = 0u64;

        loop {
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled);
            }
            let n = file.read(&mut chunk).await.map_err(|e| Error::Remote {
                message: format!("sftpDownload: read: {e}"),
            })?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            read_total += n as u64;
            if let Some(progress) = &on_progress {
                guard("on_progress", || progress(read_total, total));
            }
        }

        Ok(Bytes::from(buf))
    }
}

// =============================================================================
// Streaming download (pull-based, via the service-worker bridge)
// =============================================================================

/// State of one in-flight streaming download.
pub struct DownloadStream {
    pub id: String,
    pub sftp_id: String,
    pub remote_path: String,
    pub total_size: u64,
    /// Pull authentication token. Distinct from the stream id; known only
    /// to the page-side bridge. Never logged.
    token: String,
    reader: tokio::sync::Mutex<Option<RemoteFile>>,
    progress: AtomicU64,
    done: DoneSignal,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("id", &self.id)
            .field("remote_path", &self.remote_path)
            .field("total_size", &self.total_size)
            .field("done", &self.done.is_set())
            .finish_non_exhaustive()
    }
}

impl DownloadStream {
    /// Read the next chunk for the service worker. EOF and read errors both
    /// finish the stream and release the remote file.
    async fn pull_chunk(&self) -> PullChunk {
        let mut reader = self.reader.lock().await;
        let Some(file) = reader.as_mut() else {
            return PullChunk::finished();
        };

        let mut chunk = vec![0u8; TRANSFER_CHUNK];
        match file.read(&mut chunk).await {
            Ok(0) => {
                reader.take();
                self.done.set();
                PullChunk::finished()
            }
            Ok(n) => {
                chunk.truncate(n);
                self.progress.fetch_add(n as u64, Ordering::Relaxed);
                PullChunk {
                    data: Some(Bytes::from(chunk)),
                    done: false,
                }
            }
            Err(e) => {
                tracing::warn!(stream = %self.id, error = %e, "stream read failed");
                reader.take();
                self.done.set();
                PullChunk::finished()
            }
        }
    }

    /// Close the reader and signal completion. Idempotent.
    async fn finish(&self) {
        self.reader.lock().await.take();
        self.done.set();
    }
}

impl Wssh {
    /// Start a streaming download through the host's fetch bridge.
    ///
    /// Registers the stream, dispatches the download event to the host, and
    /// resolves when the service worker has pulled the file to completion
    /// (or after the 30-minute budget).
    pub async fn sftp_download_stream(
        &self,
        sftp_id: &str,
        remote_path: &str,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        let core = self.core();
        let Some(on_stream) = core.on_stream_download.clone() else {
            return Err(Error::Validation {
                message: "sftpDownloadStream: no stream download handler registered".into(),
            });
        };

        let handle = self.sftp_handle(sftp_id)?;
        let remote_path = handle.validate(remote_path)?;

        let attrs = handle
            .sftp
            .metadata(&remote_path)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpDownloadStream: stat: {e}"),
            })?;
        let total_size = attrs.size.unwrap_or(0);

        let file = handle
            .sftp
            .open(&remote_path)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpDownloadStream: open: {e}"),
            })?;

        let stream_id = mint_id();
        let token = mint_id();

        let stream = Arc::new(DownloadStream {
            id: stream_id.clone(),
            sftp_id: sftp_id.to_string(),
            remote_path: remote_path.clone(),
            total_size,
            token: token.clone(),
            reader: tokio::sync::Mutex::new(Some(file)),
            progress: AtomicU64::new(0),
            done: DoneSignal::new(),
        });
        core.streams.insert(stream_id.clone(), stream.clone());

        guard(STREAM_DOWNLOAD_EVENT, || {
            on_stream(StreamDownloadEvent {
                stream_id: stream_id.clone(),
                stream_token: token.clone(),
                filename: basename(&remote_path).to_string(),
                size: total_size,
                mime_type: "application/octet-stream",
            })
        });

        let finished = tokio::time::timeout(STREAM_DOWNLOAD_TIMEOUT, stream.done.wait()).await;
        if finished.is_err() {
            stream.finish().await;
            core.streams.take(&stream_id);
            return Err(Error::Timeout {
                message: "sftpDownloadStream: timed out after 30 minutes".into(),
            });
        }

        if let Some(progress) = &on_progress {
            let done = stream.progress.load(Ordering::Relaxed);
            guard("on_progress", || progress(done, total_size));
        }

        core.streams.take(&stream_id);
        Ok(())
    }

    /// Pull the next chunk of a streaming download. Invoked by the page
    /// bridge on behalf of the service worker; `token` must match the value
    /// minted at start. A mismatch yields a terminal chunk without touching
    /// the stream.
    pub async fn stream_pull(&self, stream_id: &str, token: &str) -> PullChunk {
        let Some(stream) = self.core().streams.get(stream_id) else {
            return PullChunk::finished();
        };
        if stream.token != token {
            return PullChunk::finished();
        }
        stream.pull_chunk().await
    }

    /// Cancel a streaming download. Token-checked and idempotent; a wrong
    /// token neither closes the reader nor removes the stream.
    pub async fn stream_cancel(&self, stream_id: &str, token: &str) {
        let core = self.core();
        let Some(stream) = core.streams.get(stream_id) else {
            return;
        };
        if stream.token != token {
            return;
        }
        core.streams.take(stream_id);
        stream.finish().await;
    }
}

// =============================================================================
// Streaming upload (push-based)
// =============================================================================

/// State of one in-flight streaming upload.
pub struct StreamingUpload {
    pub id: String,
    /// Size announced by the host at start; informational.
    pub expected_size: u64,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    written: AtomicU64,
    err: Mutex<Option<String>>,
    done: DoneSignal,
}

impl std::fmt::Debug for StreamingUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingUpload")
            .field("id", &self.id)
            .field("written", &self.written())
            .field("done", &self.done.is_set())
            .finish_non_exhaustive()
    }
}

impl StreamingUpload {
    fn new(id: String, expected_size: u64) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
        (
            Arc::new(Self {
                id,
                expected_size,
                tx: Mutex::new(Some(tx)),
                written: AtomicU64::new(0),
                err: Mutex::new(None),
                done: DoneSignal::new(),
            }),
            rx,
        )
    }

    /// Single consumer of the chunk queue: writes serially until the queue
    /// closes. On a write error the error sticks, the remaining queue is
    /// drained to unblock pushers, and the remote file is released.
    fn spawn_writer<W>(self: &Arc<Self>, mut rx: mpsc::Receiver<Bytes>, mut file: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                match file.write_all(&chunk).await {
                    Ok(()) => {
                        state.written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        state.set_err(format!("sftpUploadStream: write: {e}"));
                        while rx.recv().await.is_some() {}
                        break;
                    }
                }
            }
            let _ = file.shutdown().await;
            state.done.set();
        });
    }

    fn set_err(&self, msg: String) {
        let mut err = self.err.lock().unwrap();
        if err.is_none() {
            *err = Some(msg);
        }
    }

    fn sticky_err(&self) -> Option<String> {
        self.err.lock().unwrap().clone()
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Enqueue one chunk. Blocks when the queue is full (backpressure on
    /// the producer). The sticky error is checked before and after the
    /// enqueue: a write may fail while the producer is suspended on a full
    /// queue.
    async fn push(&self, chunk: Bytes) -> Result<()> {
        if let Some(err) = self.sticky_err() {
            return Err(Error::Remote { message: err });
        }

        let sender = self.tx.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Err(Error::Internal {
                message: "upload queue already closed".into(),
            });
        };

        if sender.send(chunk).await.is_err() {
            // Writer gone; the sticky error explains why.
            if let Some(err) = self.sticky_err() {
                return Err(Error::Remote { message: err });
            }
            return Err(Error::Cancelled);
        }

        if let Some(err) = self.sticky_err() {
            return Err(Error::Remote { message: err });
        }
        Ok(())
    }

    /// Close the queue, wait for the writer to drain, surface any error.
    async fn finish(&self) -> Result<()> {
        self.tx.lock().unwrap().take();
        self.done.wait().await;
        match self.sticky_err() {
            Some(err) => Err(Error::Remote { message: err }),
            None => Ok(()),
        }
    }

    /// Close the queue without waiting; the writer completes and releases
    /// the remote file on its own.
    fn abort(&self) {
        self.tx.lock().unwrap().take();
    }
}

impl Wssh {
    /// Begin a streaming upload. Returns the upload id the host pushes
    /// chunks to.
    pub async fn sftp_upload_stream_start(
        &self,
        sftp_id: &str,
        remote_path: &str,
        size: u64,
    ) -> Result<String> {
        let handle = self.sftp_handle(sftp_id)?;
        let remote_path = handle.validate(remote_path)?;

        let file = handle
            .sftp
            .open_with_flags(
                &remote_path,
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpUploadStreamStart: create: {e}"),
            })?;

        let upload_id = mint_id();
        let (state, rx) = StreamingUpload::new(upload_id.clone(), size);
        state.spawn_writer(rx, file);
        self.core().uploads.insert(upload_id.clone(), state);
        Ok(upload_id)
    }

    /// Push one chunk to an active streaming upload. Applies backpressure
    /// when the writer is behind.
    pub async fn sftp_upload_stream_write(&self, upload_id: &str, chunk: Bytes) -> Result<()> {
        let state = self
            .core()
            .uploads
            .get(upload_id)
            .ok_or_else(|| Error::Validation {
                message: format!("sftpUploadStreamWrite: upload {upload_id:?} not found"),
            })?;
        state.push(chunk).await
    }

    /// Finalize a streaming upload: waits for the writer and surfaces any
    /// write error. Returns the byte count written.
    pub async fn sftp_upload_stream_end(&self, upload_id: &str) -> Result<u64> {
        let state = self
            .core()
            .uploads
            .take(upload_id)
            .ok_or_else(|| Error::Validation {
                message: format!("sftpUploadStreamEnd: upload {upload_id:?} not found"),
            })?;
        state.finish().await?;
        Ok(state.written())
    }

    /// Cancel an active streaming upload. Unknown ids are ignored.
    pub async fn sftp_upload_stream_cancel(&self, upload_id: &str) {
        if let Some(state) = self.core().uploads.take(upload_id) {
            state.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writer_drains_queue_and_counts_bytes() {
        let (state, rx) = StreamingUpload::new("u1".into(), 0);
        let (client, mut server) = tokio::io::duplex(1024 * 1024);
        state.spawn_writer(rx, client);

        let reader = tokio::spawn(async move {
            let mut sink = Vec::new();
            server.read_to_end(&mut sink).await.unwrap();
            sink
        });

        for i in 0..5u8 {
            state.push(Bytes::from(vec![i; 1000])).await.unwrap();
        }
        state.finish().await.unwrap();
        assert_eq!(state.written(), 5000);

        let sink = reader.await.unwrap();
        assert_eq!(sink.len(), 5000);
        assert_eq!(&sink[..1000], &[0u8; 1000][..]);
    }

    #[tokio::test]
    async fn push_blocks_when_queue_and_pipe_are_full() {
        let (state, rx) = StreamingUpload::new("u2".into(), 0);
        // Tiny pipe: the writer wedges on the first oversized chunk, so the
        // queue (16 slots) fills and further pushes must suspend.
        let (client, mut server) = tokio::io::duplex(64);
        state.spawn_writer(rx, client);

        let chunk = Bytes::from(vec![0xAB; TRANSFER_CHUNK]);
        let mut accepted = 0usize;
        loop {
            match tokio::time::timeout(Duration::from_millis(50), state.push(chunk.clone())).await
            {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(e)) => panic!("unexpected push error: {e}"),
                Err(_) => break, // suspended on the full queue
            }
            assert!(accepted < 64, "push never applied backpressure");
        }
        // One chunk stuck in the writer plus a full queue.
        assert!(accepted >= UPLOAD_QUEUE, "queue should hold {UPLOAD_QUEUE} chunks");

        // Drain the pipe; the suspended producer side clears out.
        let drain = tokio::spawn(async move {
            let mut sink = vec![0u8; 4096];
            while server.read(&mut sink).await.unwrap() > 0 {}
        });

        state.finish().await.unwrap();
        assert_eq!(state.written(), accepted as u64 * TRANSFER_CHUNK as u64);
        drain.abort();
    }

    #[tokio::test]
    async fn write_error_is_sticky_and_unblocks_pushers() {
        struct FailingWriter;
        impl AsyncWrite for FailingWriter {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::task::Poll::Ready(Err(std::io::Error::other("disk full")))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let (state, rx) = StreamingUpload::new("u3".into(), 0);
        state.spawn_writer(rx, FailingWriter);

        // The first push may land before the failure is recorded; keep
        // pushing until the sticky error surfaces.
        let mut saw_error = false;
        for _ in 0..32 {
            match state.push(Bytes::from_static(b"data")).await {
                Ok(()) => tokio::task::yield_now().await,
                Err(Error::Remote { message }) => {
                    assert!(message.contains("disk full"));
                    saw_error = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_error, "sticky error never surfaced");

        // finish() reports the same sticky error.
        let err = state.finish().await.unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
        assert_eq!(state.written(), 0);
    }

    #[tokio::test]
    async fn finish_after_abort_is_safe() {
        let (state, rx) = StreamingUpload::new("u4".into(), 0);
        let (client, _server) = tokio::io::duplex(1024);
        state.spawn_writer(rx, client);
        state.abort();
        state.done.wait().await;
    }

    fn registered_stream(wssh: &Wssh, id: &str, token: &str) -> Arc<DownloadStream> {
        let stream = Arc::new(DownloadStream {
            id: id.to_string(),
            sftp_id: "f1".into(),
            remote_path: "/big.bin".into(),
            total_size: 42,
            token: token.to_string(),
            reader: tokio::sync::Mutex::new(None),
            progress: AtomicU64::new(0),
            done: DoneSignal::new(),
        });
        wssh.core().streams.insert(id, stream.clone());
        stream
    }

    #[tokio::test]
    async fn stream_cancel_requires_matching_token() {
        let wssh = Wssh::new();
        let stream = registered_stream(&wssh, "s-cancel", "good-token");

        wssh.stream_cancel("s-cancel", "wrong-token").await;
        assert!(wssh.core().streams.contains("s-cancel"));
        assert!(!stream.done.is_set());

        wssh.stream_cancel("s-cancel", "good-token").await;
        assert!(!wssh.core().streams.contains("s-cancel"));
        assert!(stream.done.is_set());

        // Idempotent.
        wssh.stream_cancel("s-cancel", "good-token").await;
    }

    #[tokio::test]
    async fn stream_pull_with_wrong_token_touches_nothing() {
        let wssh = Wssh::new();
        let stream = registered_stream(&wssh, "s-pull", "good-token");

        let chunk = wssh.stream_pull("s-pull", "wrong-token").await;
        assert!(chunk.done);
        assert!(chunk.data.is_none());
        assert!(wssh.core().streams.contains("s-pull"));
        assert!(!stream.done.is_set());
    }

    #[tokio::test]
    async fn download_stream_state_pull_and_finish() {
        // A DownloadStream over no reader behaves as finished.
        let stream = DownloadStream {
            id: "s1".into(),
            sftp_id: "f1".into(),
            remote_path: "/big.bin".into(),
            total_size: 42,
            token: "t".into(),
            reader: tokio::sync::Mutex::new(None),
            progress: AtomicU64::new(0),
            done: DoneSignal::new(),
        };
        let chunk = stream.pull_chunk().await;
        assert!(chunk.done);
        assert!(chunk.data.is_none());

        stream.finish().await;
        stream.finish().await;
        assert!(stream.done.is_set());
    }
}
