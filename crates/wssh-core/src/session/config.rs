//! Connection configuration and host-facing session types.

use serde::Serialize;

use crate::bridge::{BannerFn, CloseFn, DataFn, HostKeyFn};
use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_SSH_PORT};
use crate::error::{Error, Result};

/// How the final (or jump) host is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// Plain password.
    #[default]
    Password,
    /// A PEM private key supplied in the config.
    Key,
    /// Every key currently in the in-memory agent, tried in order.
    Agent,
}

/// Information handed to the host's host-key decision callback.
#[derive(Debug, Clone, Serialize)]
pub struct HostKeyInfo {
    pub hostname: String,
    /// `SHA256:…` fingerprint.
    pub fingerprint: String,
    /// Legacy colon-separated MD5 fingerprint.
    pub fingerprint_md5: String,
    /// Wire algorithm name, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// Drunken-bishop rendering for eyeball comparison.
    pub random_art: String,
}

/// Credentials and host-key policy for an intermediate (ProxyJump) host.
#[derive(Clone, Default)]
pub struct JumpHostConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub password: Option<String>,
    pub key_pem: Option<String>,
    pub key_passphrase: Option<String>,
    pub allow_insecure_host_key: bool,
    pub on_host_key: Option<HostKeyFn>,
}

impl JumpHostConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for JumpHostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JumpHostConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("has_on_host_key", &self.on_host_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything needed to establish one SSH session through the relay.
///
/// `on_data` and `on_close` are mandatory; a session without a consumer for
/// terminal output makes no sense. The host-key callback is mandatory by
/// policy unless the insecure development opt-in is set, and that is
/// enforced before any socket opens.
#[derive(Clone)]
pub struct ConnectConfig {
    pub proxy_url: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub password: Option<String>,
    pub key_pem: Option<String>,
    pub key_passphrase: Option<String>,
    /// Forward the in-memory agent to the remote host.
    pub agent_forward: bool,
    /// Development opt-in for `ws://` relays.
    pub allow_insecure_ws: bool,
    /// Development opt-in for connecting without host-key verification.
    pub allow_insecure_host_key: bool,
    /// Apply strict validation to every SFTP path on this session.
    pub strict_sftp_paths: bool,
    pub cols: u32,
    pub rows: u32,
    /// Bearer token for the relay, if it requires one.
    pub token: Option<String>,
    pub on_data: DataFn,
    pub on_close: CloseFn,
    pub on_host_key: Option<HostKeyFn>,
    pub on_banner: Option<BannerFn>,
    pub jump_host: Option<JumpHostConfig>,
}

impl ConnectConfig {
    pub fn new(
        proxy_url: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        on_data: DataFn,
        on_close: CloseFn,
    ) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth_method: AuthMethod::Password,
            password: None,
            key_pem: None,
            key_passphrase: None,
            agent_forward: false,
            allow_insecure_ws: false,
            allow_insecure_host_key: false,
            strict_sftp_paths: false,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            token: None,
            on_data,
            on_close,
            on_host_key: None,
            on_banner: None,
            jump_host: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.auth_method = AuthMethod::Password;
        self.password = Some(password.into());
        self
    }

    pub fn with_key(mut self, pem: impl Into<String>, passphrase: Option<String>) -> Self {
        self.auth_method = AuthMethod::Key;
        self.key_pem = Some(pem.into());
        self.key_passphrase = passphrase;
        self
    }

    pub fn with_agent_auth(mut self) -> Self {
        self.auth_method = AuthMethod::Agent;
        self
    }

    pub fn with_host_key_callback(mut self, cb: HostKeyFn) -> Self {
        self.on_host_key = Some(cb);
        self
    }

    pub fn with_size(mut self, cols: u32, rows: u32) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Validate required fields, auth completeness, and the host-key
    /// policy. Runs before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.proxy_url.trim().is_empty()
            || self.host.trim().is_empty()
            || self.username.trim().is_empty()
        {
            return Err(Error::Validation {
                message: "connect: proxyUrl, host, and username are required".into(),
            });
        }
        if self.port == 0 {
            return Err(Error::Validation {
                message: "connect: port must be 1-65535".into(),
            });
        }

        validate_auth(
            self.auth_method,
            self.password.as_deref(),
            self.key_pem.as_deref(),
        )?;

        if self.on_host_key.is_none() && !self.allow_insecure_host_key {
            return Err(Error::HostKey {
                message:
                    "connect: a host key callback is required (or set allow_insecure_host_key for development)"
                        .into(),
            });
        }

        if let Some(jump) = &self.jump_host {
            if jump.host.trim().is_empty() || jump.username.trim().is_empty() {
                return Err(Error::Validation {
                    message: "connect: jump host requires host and username".into(),
                });
            }
            if jump.port == 0 {
                return Err(Error::Validation {
                    message: "connect: jump host port must be 1-65535".into(),
                });
            }
            validate_auth(
                jump.auth_method,
                jump.password.as_deref(),
                jump.key_pem.as_deref(),
            )?;
            if jump.on_host_key.is_none() && !jump.allow_insecure_host_key {
                return Err(Error::HostKey {
                    message:
                        "connect: jump host requires a host key callback (or allow_insecure_host_key)"
                            .into(),
                });
            }
        }

        Ok(())
    }
}

fn validate_auth(
    method: AuthMethod,
    password: Option<&str>,
    key_pem: Option<&str>,
) -> Result<()> {
    match method {
        AuthMethod::Password if password.unwrap_or("").is_empty() => Err(Error::Validation {
            message: "connect: password required for password auth".into(),
        }),
        AuthMethod::Key if key_pem.unwrap_or("").is_empty() => Err(Error::Validation {
            message: "connect: keyPEM required for key auth".into(),
        }),
        // Agent auth is checked against the keyring at connect time.
        _ => Ok(()),
    }
}

impl std::fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("proxy_url", &self.proxy_url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("agent_forward", &self.agent_forward)
            .field("strict_sftp_paths", &self.strict_sftp_paths)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("has_on_host_key", &self.on_host_key.is_some())
            .field("jump_host", &self.jump_host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn base_config() -> ConnectConfig {
        ConnectConfig::new(
            "wss://relay.example/relay",
            "target.internal",
            "deploy",
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        )
        .with_password("hunter2")
    }

    fn accepting_callback() -> HostKeyFn {
        Arc::new(|_| Box::pin(async { true }))
    }

    #[test]
    fn valid_config_passes() {
        let config = base_config().with_host_key_callback(accepting_callback());
        config.validate().unwrap();
    }

    #[test]
    fn missing_required_fields_rejected() {
        let mut config = base_config().with_host_key_callback(accepting_callback());
        config.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn empty_password_rejected() {
        let mut config = base_config().with_host_key_callback(accepting_callback());
        config.password = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_auth_without_pem_rejected() {
        let mut config = base_config().with_host_key_callback(accepting_callback());
        config.auth_method = AuthMethod::Key;
        config.key_pem = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_host_key_callback_rejected_without_opt_in() {
        let config = base_config();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::HostKey { .. }));
    }

    #[test]
    fn insecure_opt_in_allows_missing_callback() {
        let mut config = base_config();
        config.allow_insecure_host_key = true;
        config.validate().unwrap();
    }

    #[test]
    fn jump_host_requires_host_and_username() {
        let mut config = base_config().with_host_key_callback(accepting_callback());
        let mut jump = JumpHostConfig::new("", "ops");
        jump.allow_insecure_host_key = true;
        jump.password = Some("pw".into());
        config.jump_host = Some(jump);
        assert!(config.validate().is_err());
    }

    #[test]
    fn jump_host_enforces_host_key_policy() {
        let mut config = base_config().with_host_key_callback(accepting_callback());
        let mut jump = JumpHostConfig::new("bastion.example", "ops");
        jump.password = Some("pw".into());
        config.jump_host = Some(jump);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::HostKey { .. }));
    }

    #[test]
    fn zero_port_rejected() {
        let mut config = base_config().with_host_key_callback(accepting_callback());
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = base_config().with_host_key_callback(accepting_callback());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
