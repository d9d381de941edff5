//! russh client handler: host-key verification, banner delivery, and
//! forwarded agent channels.

use std::sync::Arc;

use russh::client::{self, Msg, Session};
use russh::keys::ssh_key::PublicKey;
use russh::Channel;

use crate::agent::{self, Keyring};
use crate::bridge::{await_with_deadline, guard, BannerFn, HostKeyFn};
use crate::constants::HOST_KEY_DECISION_TIMEOUT;
use crate::error::Error;
use crate::session::config::HostKeyInfo;
use crate::util::mask_control;

/// Per-connection handler. One instance per SSH client (jump or final).
pub struct ClientHandler {
    hostname: String,
    on_host_key: Option<HostKeyFn>,
    allow_insecure_host_key: bool,
    on_banner: Option<BannerFn>,
    /// Keyring served on forwarded agent channels; `None` refuses them.
    forward_agent: Option<Arc<Keyring>>,
}

impl ClientHandler {
    pub fn new(
        hostname: String,
        on_host_key: Option<HostKeyFn>,
        allow_insecure_host_key: bool,
        on_banner: Option<BannerFn>,
        forward_agent: Option<Arc<Keyring>>,
    ) -> Self {
        Self {
            hostname,
            on_host_key,
            allow_insecure_host_key,
            on_banner,
            forward_agent,
        }
    }

    fn host_key_info(&self, key: &PublicKey) -> HostKeyInfo {
        HostKeyInfo {
            hostname: self.hostname.clone(),
            fingerprint: agent::sha256_fingerprint(key),
            fingerprint_md5: agent::md5_fingerprint(key),
            key_type: key.algorithm().as_str().to_string(),
            random_art: agent::random_art_for(key),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(on_host_key) = self.on_host_key.clone() else {
            if self.allow_insecure_host_key {
                // Only reachable with the explicit development opt-in;
                // connect() rejects configs without a callback otherwise.
                tracing::warn!(
                    host = %self.hostname,
                    "accepting host key without verification (allow_insecure_host_key)"
                );
                return Ok(true);
            }
            return Err(Error::HostKey {
                message: "no host key callback configured".into(),
            });
        };

        let info = self.host_key_info(server_public_key);
        tracing::debug!(host = %self.hostname, fingerprint = %info.fingerprint, "asking host to verify key");

        let decision = guard("on_host_key", || on_host_key(info)).ok_or(Error::HostKey {
            message: "host key verification failed".into(),
        })?;

        match await_with_deadline(decision, HOST_KEY_DECISION_TIMEOUT, "host key verification")
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => Err(Error::HostKey {
                message: "host key rejected by user".into(),
            }),
            Err(_) => Err(Error::HostKey {
                message: "host key verification failed: timeout".into(),
            }),
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(on_banner) = &self.on_banner {
            let sanitized = mask_control(banner);
            guard("on_banner", || on_banner(&sanitized));
        }
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(keyring) = self.forward_agent.clone() else {
            tracing::debug!("refusing agent channel: forwarding not enabled");
            return Ok(());
        };

        tokio::spawn(async move {
            if let Err(e) = agent::protocol::serve(channel.into_stream(), keyring).await {
                tracing::debug!(error = %e, "forwarded agent channel ended");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_keys::ED25519_PEM;
    use russh::client::Handler;
    use russh::keys::decode_secret_key;

    fn test_public_key() -> PublicKey {
        decode_secret_key(ED25519_PEM, None)
            .unwrap()
            .public_key()
            .clone()
    }

    fn handler_with(cb: Option<HostKeyFn>, allow_insecure: bool) -> ClientHandler {
        ClientHandler::new("example.test:22".into(), cb, allow_insecure, None, None)
    }

    #[tokio::test]
    async fn no_callback_rejects_key() {
        let mut handler = handler_with(None, false);
        let err = handler.check_server_key(&test_public_key()).await.unwrap_err();
        assert!(matches!(err, Error::HostKey { .. }));
    }

    #[tokio::test]
    async fn no_callback_with_insecure_opt_in_accepts() {
        let mut handler = handler_with(None, true);
        assert!(handler.check_server_key(&test_public_key()).await.unwrap());
    }

    #[tokio::test]
    async fn user_accept_is_accepted() {
        let cb: HostKeyFn = Arc::new(|info| {
            Box::pin(async move {
                assert!(info.fingerprint.starts_with("SHA256:"));
                assert_eq!(info.key_type, "ssh-ed25519");
                assert!(info.random_art.contains('S'));
                assert_eq!(info.fingerprint_md5.matches(':').count(), 15);
                true
            })
        });
        let mut handler = handler_with(Some(cb), false);
        assert!(handler.check_server_key(&test_public_key()).await.unwrap());
    }

    #[tokio::test]
    async fn user_reject_is_an_error() {
        let cb: HostKeyFn = Arc::new(|_| Box::pin(async { false }));
        let mut handler = handler_with(Some(cb), false);
        let err = handler.check_server_key(&test_public_key()).await.unwrap_err();
        match err {
            Error::HostKey { message } => assert!(message.contains("rejected")),
            other => panic!("expected host key rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn banner_is_sanitized() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let seen_clone = seen.clone();
        let on_banner: BannerFn = Arc::new(move |b| {
            *seen_clone.lock().unwrap() = b.to_string();
        });

        let handler = ClientHandler::new(
            "example.test:22".into(),
            None,
            true,
            Some(on_banner),
            None,
        );

        // Drive auth_banner through a fabricated session is not possible
        // without a live connection; exercise the sanitising path directly.
        let sanitized = mask_control("welcome\x1b[31m!\r\n");
        handler.on_banner.as_ref().unwrap()(&sanitized);
        assert_eq!(*seen.lock().unwrap(), "welcome\u{FFFD}[31m!\r\n");
    }
}
