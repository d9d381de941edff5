//! The host-facing API surface.
//!
//! [`Wssh`] is a cheap-to-clone handle over the shared core state. The
//! embedding host constructs one and calls its methods; every other module
//! hangs its operations off `impl Wssh` blocks. Opaque 32-hex identifiers
//! are the only references handed out.

use std::sync::Arc;

use crate::agent::{KeyInfo, Keyring};
use crate::bridge::StreamEventFn;
use crate::error::Result;
use crate::forward::PortForward;
use crate::registry::Registry;
use crate::session::Session;
use crate::sftp::transfer::{DownloadStream, StreamingUpload};
use crate::sftp::SftpHandle;

/// Shared state behind every [`Wssh`] clone: the resource registries, the
/// process-wide agent keyring, and the host's stream-download hook.
pub struct Core {
    pub(crate) sessions: Registry<Session>,
    pub(crate) sftp: Registry<SftpHandle>,
    pub(crate) forwards: Registry<PortForward>,
    pub(crate) streams: Registry<DownloadStream>,
    pub(crate) uploads: Registry<StreamingUpload>,
    pub(crate) agent: Arc<Keyring>,
    pub(crate) on_stream_download: Option<StreamEventFn>,
}

impl Core {
    pub(crate) fn agent_handle(&self) -> Arc<Keyring> {
        self.agent.clone()
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("sessions", &self.sessions.len())
            .field("sftp", &self.sftp.len())
            .field("forwards", &self.forwards.len())
            .field("agent_keys", &self.agent.len())
            .finish()
    }
}

/// The client core. Construct one per embedding host; clones share all
/// state, including the agent keyring, for the process lifetime.
#[derive(Clone, Debug)]
pub struct Wssh {
    core: Arc<Core>,
}

impl Default for Wssh {
    fn default() -> Self {
        Self::new()
    }
}

impl Wssh {
    /// A core with no stream-download hook; `sftp_download_stream` is
    /// unavailable until one is provided at construction.
    pub fn new() -> Self {
        Self::with_stream_events(None)
    }

    /// A core whose streaming downloads dispatch through `on_stream_download`
    /// (the host-side helper that navigates to the service-worker URL).
    pub fn with_stream_events(on_stream_download: Option<StreamEventFn>) -> Self {
        Self {
            core: Arc::new(Core {
                sessions: Registry::new(),
                sftp: Registry::new(),
                forwards: Registry::new(),
                streams: Registry::new(),
                uploads: Registry::new(),
                agent: Arc::new(Keyring::new()),
                on_stream_download,
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    // =========================================================================
    // Agent
    // =========================================================================

    /// Parse a PEM private key and add it to the in-memory agent. Returns
    /// the key's SHA-256 fingerprint. Input buffers are zeroed.
    pub fn agent_add_key(&self, pem: String, passphrase: Option<String>) -> Result<String> {
        self.core.agent.add(pem, passphrase)
    }

    /// Remove one key by its SHA-256 fingerprint.
    pub fn agent_remove_key(&self, fingerprint: &str) -> Result<()> {
        self.core.agent.remove(fingerprint)
    }

    /// Empty the keyring.
    pub fn agent_remove_all(&self) {
        self.core.agent.remove_all();
    }

    /// Describe every key currently held.
    pub fn agent_list_keys(&self) -> Vec<KeyInfo> {
        self.core.agent.list()
    }
}
