//! wssh-core: an embeddable SSH client core delivered over WebSocket.
//!
//! This crate provides:
//! - A byte-stream adapter over a message-oriented WebSocket relay
//! - SSH session management (connect, PTY, host-key verification, ProxyJump)
//! - An in-memory SSH agent with forwarding support
//! - SFTP directory/metadata operations and a chunked/streaming transfer engine
//! - A tunnel-based port forwarder (HTTP and raw TCP over a control channel)
//!
//! The embedding host supplies callbacks (terminal output, close notification,
//! host-key decisions, progress, download dispatch); the core owns all network
//! and protocol state. All cryptography is handled by the `russh` stack — the
//! only network link is a WebSocket to a byte-piping relay.

pub mod agent;
pub mod api;
pub mod bridge;
pub mod constants;
pub mod error;
pub mod forward;
pub mod logging;
pub mod randomart;
pub mod registry;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod util;

pub use agent::KeyInfo;
pub use api::Wssh;
pub use bridge::StreamDownloadEvent;
pub use error::{Error, Result};
pub use forward::{ForwardConfig, TunnelInfo};
pub use logging::{init_logging, LogFormat};
pub use session::config::{AuthMethod, ConnectConfig, HostKeyInfo, JumpHostConfig};
pub use sftp::transfer::PullChunk;
pub use sftp::FileInfo;
