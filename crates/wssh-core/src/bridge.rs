//! Glue between the core and the embedding host.
//!
//! The host hands the core plain callbacks; the core hands the host opaque
//! identifiers and futures. Everything that crosses this boundary goes
//! through the aliases and helpers here: host callbacks are never allowed to
//! panic into core tasks, and every wait on a host decision is bounded by a
//! deadline.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::session::config::HostKeyInfo;

/// Terminal output callback: one batch of stdout bytes.
pub type DataFn = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Session close callback, invoked exactly once with the close reason.
pub type CloseFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Server banner callback (already control-character sanitised).
pub type BannerFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Transfer progress callback: `(bytes_done, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Host-key decision callback. The returned future resolves to `true` to
/// accept the key. The core bounds the wait; a slow host cannot wedge the
/// handshake forever.
pub type HostKeyFn = Arc<dyn Fn(HostKeyInfo) -> BoxFuture<'static, bool> + Send + Sync>;

/// Streaming-download dispatch callback; see [`StreamDownloadEvent`].
pub type StreamEventFn = Arc<dyn Fn(StreamDownloadEvent) + Send + Sync>;

/// Payload of the streaming-download host event.
///
/// The host-side helper is expected to navigate to
/// `/_stream/<stream_id>/<stream_token>/<urlencoded filename>` so the
/// registered service worker can intercept the fetch and pull chunks. The
/// token authenticates the worker's pulls and must not be logged or exposed
/// in any public event.
#[derive(Debug, Clone)]
pub struct StreamDownloadEvent {
    pub stream_id: String,
    pub stream_token: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: &'static str,
}

/// Await a future with a hard deadline.
///
/// On elapse the pending future is dropped, which releases any callback
/// state it held; late completions go nowhere. This is what keeps an
/// unanswered host-key prompt from wedging the handshake task.
pub async fn await_with_deadline<F, T>(fut: F, deadline: Duration, what: &str) -> Result<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(v) => Ok(v),
        Err(_) => Err(Error::Timeout {
            message: what.to_string(),
        }),
    }
}

/// Invoke a host callback, absorbing panics.
///
/// Host code must never unwind into a core task: a panicking progress or
/// data callback is logged and dropped.
pub fn guard<R>(name: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(callback = name, "host callback panicked; ignoring");
            None
        }
    }
}
