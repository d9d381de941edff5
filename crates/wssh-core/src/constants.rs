//! Protocol and configuration constants for wssh.

use std::time::Duration;

// =============================================================================
// WebSocket Transport
// =============================================================================

/// Capacity of the incoming WebSocket message queue. Large enough that a
/// bursty relay does not stall the receive pump.
pub const WS_RECV_QUEUE: usize = 4096;

/// Maximum bytes per outgoing WebSocket binary message.
pub const WS_WRITE_CHUNK: usize = 4096;

/// Bound on one incoming WebSocket frame. Anything larger is treated as a
/// hostile or broken peer and kills the stream.
pub const WS_MAX_FRAME: usize = 8 * 1024 * 1024;

// =============================================================================
// Timing
// =============================================================================

/// Maximum time to establish a WebSocket connection.
pub const WS_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time for the SSH handshake (key exchange and auth plumbing).
pub const SSH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between SSH keepalive probes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered keepalive probes before the connection is considered dead.
pub const KEEPALIVE_MAX: usize = 3;

/// Maximum time to open a direct-tcpip channel for a forwarded connection.
pub const DIRECT_TCPIP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the user gets to accept or reject an unknown host key.
pub const HOST_KEY_DECISION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Maximum wall-clock time for one streaming download.
pub const STREAM_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// =============================================================================
// Transfers
// =============================================================================

/// Read/write chunk size for SFTP transfers.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

/// Ceiling for fully-buffered uploads and downloads. Larger files must go
/// through the streaming APIs.
pub const MAX_BUFFERED_TRANSFER: u64 = 512 * 1024 * 1024;

/// Initial allocation cap for the bulk download buffer.
pub const DOWNLOAD_INIT_CAP: usize = 1024 * 1024;

/// Bounded chunk queue depth for streaming uploads (1 MiB at 64 KiB chunks).
pub const UPLOAD_QUEUE: usize = 16;

// =============================================================================
// Port Forwarding
// =============================================================================

/// Concurrent HTTP/TCP handler tasks per forward.
pub const MAX_CONCURRENT_HANDLERS: usize = 100;

/// Inbound byte queue depth per forwarded TCP connection.
pub const CONN_QUEUE: usize = 256;

/// Bound on the `tunnel_ready` control frame.
pub const TUNNEL_READY_LIMIT: usize = 1024 * 1024;

/// Bound on one proxied HTTP response read from the SSH channel.
pub const HTTP_RESPONSE_LIMIT: u64 = 10 * 1024 * 1024;

/// Read buffer size for the tunnel message pump and TCP relays.
pub const FORWARD_BUFFER: usize = 64 * 1024;

/// Read batch size for the SSH-to-tunnel direction of a TCP relay and for
/// the interactive stdout pump.
pub const PUMP_BUFFER: usize = 32 * 1024;

// =============================================================================
// Defaults
// =============================================================================

/// Default terminal columns.
pub const DEFAULT_COLS: u32 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u32 = 24;

/// TERM value requested for the interactive PTY.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Host event dispatched when a streaming download is ready to be pulled.
pub const STREAM_DOWNLOAD_EVENT: &str = "wssh-stream-download";
