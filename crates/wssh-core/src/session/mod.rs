//! SSH session management: connect, write, resize, disconnect.
//!
//! Each session is a complete SSH connection with its own WebSocket
//! transport, interactive PTY channel, optional jump-host resources, and a
//! teardown cascade that closes every SFTP client and port forward bound to
//! it.

pub mod config;
pub mod handler;

use std::sync::Arc;

use bytes::Bytes;
use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect, Pty};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::agent::Keyring;
use crate::api::{Core, Wssh};
use crate::bridge::{guard, CloseFn, DataFn};
use crate::constants::{
    DEFAULT_TERM, DIRECT_TCPIP_TIMEOUT, HOST_KEY_DECISION_TIMEOUT, KEEPALIVE_INTERVAL,
    KEEPALIVE_MAX, SSH_HANDSHAKE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::forward;
use crate::session::config::{AuthMethod, ConnectConfig};
use crate::session::handler::ClientHandler;
use crate::transport::{parse_ws_url, WsControl, WsStream};
use crate::util::{mint_id, OnceLatch};

/// All state for one live SSH connection.
pub struct Session {
    pub id: String,
    /// Cancels the stdout pump and every child task.
    pub token: CancellationToken,
    handle: client::Handle<ClientHandler>,
    /// Present when the connection went through a ProxyJump bastion.
    jump_handle: Option<client::Handle<ClientHandler>>,
    /// The physical WebSocket under this session (the bastion's, if jumped).
    transport: WsControl,
    stdin: russh::ChannelWriteHalf<client::Msg>,
    on_close: CloseFn,
    close_latch: OnceLatch,
    /// Inherited by every SFTP client opened on this session.
    pub strict_sftp_paths: bool,
}

impl Session {
    /// The SSH client handle, for SFTP subsystem channels and direct-tcpip.
    pub(crate) fn handle(&self) -> &client::Handle<ClientHandler> {
        &self.handle
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("jumped", &self.jump_handle.is_some())
            .field("closed", &self.close_latch.is_fired())
            .finish_non_exhaustive()
    }
}

impl Wssh {
    /// Establish an SSH session through the WebSocket relay.
    ///
    /// Returns the session identifier the host uses for every follow-up
    /// call. See [`ConnectConfig`] for the knobs.
    pub async fn connect(&self, config: ConnectConfig) -> Result<String> {
        config.validate()?;

        let core = self.core();
        if matches!(config.auth_method, AuthMethod::Agent) && core.agent.is_empty() {
            return Err(Error::Auth {
                message: "connect: no agent keys loaded".into(),
            });
        }
        if let Some(jump) = &config.jump_host {
            if matches!(jump.auth_method, AuthMethod::Agent) && core.agent.is_empty() {
                return Err(Error::Auth {
                    message: "connect: jump host: no agent keys loaded".into(),
                });
            }
        }

        let session_id = mint_id();

        let forward_agent = if config.agent_forward && !core.agent.is_empty() {
            Some(core.agent_handle())
        } else {
            None
        };

        let mut ssh_config = client::Config::default();
        ssh_config.keepalive_interval = Some(KEEPALIVE_INTERVAL);
        ssh_config.keepalive_max = KEEPALIVE_MAX;
        let ssh_config = Arc::new(ssh_config);

        // Transport: direct relay dial, or tunneled through a jump host.
        let (mut handle, jump_handle, transport) = if let Some(jump) = &config.jump_host {
            let url = relay_url(
                &config.proxy_url,
                config.allow_insecure_ws,
                &jump.host,
                jump.port,
                config.token.as_deref(),
            )?;
            let ws = WsStream::dial(url.as_str()).await?;
            let transport = ws.control();

            let jump_handler = ClientHandler::new(
                format!("{}:{}", jump.host, jump.port),
                jump.on_host_key.clone(),
                jump.allow_insecure_host_key,
                None,
                None,
            );
            let mut jump_handle = handshake(
                ssh_config.clone(),
                ws,
                jump_handler,
                jump.on_host_key.is_some(),
            )
            .await
            .inspect_err(|_| transport.close())?;

            authenticate(
                &mut jump_handle,
                &jump.username,
                jump.auth_method,
                jump.password.as_deref(),
                jump.key_pem.as_deref(),
                jump.key_passphrase.as_deref(),
                &core.agent,
            )
            .await
            .map_err(|e| {
                transport.close();
                prefix_auth(e, "jump host")
            })?;

            // Tunnel through the bastion to the final destination.
            let channel = tokio::time::timeout(
                DIRECT_TCPIP_TIMEOUT,
                jump_handle.channel_open_direct_tcpip(
                    config.host.clone(),
                    u32::from(config.port),
                    "127.0.0.1".to_string(),
                    0,
                ),
            )
            .await
            .map_err(|_| {
                transport.close();
                Error::Timeout {
                    message: format!("jump host tunnel to {}:{}", config.host, config.port),
                }
            })?
            .map_err(|e| {
                transport.close();
                Error::Protocol {
                    message: format!(
                        "connect: jump host tunnel to {}:{}: {e}",
                        config.host, config.port
                    ),
                }
            })?;

            let handler = ClientHandler::new(
                format!("{}:{}", config.host, config.port),
                config.on_host_key.clone(),
                config.allow_insecure_host_key,
                config.on_banner.clone(),
                forward_agent.clone(),
            );
            let handle = handshake(
                ssh_config.clone(),
                channel.into_stream(),
                handler,
                config.on_host_key.is_some(),
            )
            .await
            .inspect_err(|_| {
                transport.close();
            })?;

            (handle, Some(jump_handle), transport)
        } else {
            let url = relay_url(
                &config.proxy_url,
                config.allow_insecure_ws,
                &config.host,
                config.port,
                config.token.as_deref(),
            )?;
            let ws = WsStream::dial(url.as_str()).await?;
            let transport = ws.control();

            let handler = ClientHandler::new(
                format!("{}:{}", config.host, config.port),
                config.on_host_key.clone(),
                config.allow_insecure_host_key,
                config.on_banner.clone(),
                forward_agent.clone(),
            );
            let handle = handshake(
                ssh_config.clone(),
                ws,
                handler,
                config.on_host_key.is_some(),
            )
            .await
            .inspect_err(|_| transport.close())?;

            (handle, None, transport)
        };

        authenticate(
            &mut handle,
            &config.username,
            config.auth_method,
            config.password.as_deref(),
            config.key_pem.as_deref(),
            config.key_passphrase.as_deref(),
            &core.agent,
        )
        .await
        .inspect_err(|_| transport.close())?;

        // Interactive channel with PTY and shell.
        let channel = handle
            .channel_open_session()
            .await
            .inspect_err(|_| transport.close())?;

        if forward_agent.is_some() {
            match channel.agent_forward(true).await {
                Ok(()) => tracing::info!(
                    session = %session_id,
                    "agent forwarding enabled; the remote host can use local keys"
                ),
                Err(e) => tracing::warn!(error = %e, "agent forwarding setup failed"),
            }
        }

        let modes = [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, 14400),
            (Pty::TTY_OP_OSPEED, 14400),
        ];
        channel
            .request_pty(true, DEFAULT_TERM, config.cols, config.rows, 0, 0, &modes)
            .await
            .inspect_err(|_| transport.close())?;
        channel
            .request_shell(true)
            .await
            .inspect_err(|_| transport.close())?;

        let (read_half, write_half) = channel.split();

        let session = Arc::new(Session {
            id: session_id.clone(),
            token: CancellationToken::new(),
            handle,
            jump_handle,
            transport,
            stdin: write_half,
            on_close: config.on_close.clone(),
            close_latch: OnceLatch::new(),
            strict_sftp_paths: config.strict_sftp_paths,
        });

        core.sessions.insert(session_id.clone(), session.clone());

        tokio::spawn(stdout_pump(
            core.clone(),
            session.clone(),
            read_half,
            config.on_data.clone(),
        ));

        tracing::info!(session = %session_id, host = %config.host, "session established");
        Ok(session_id)
    }

    /// Send bytes to the session's stdin. Unknown ids and write errors are
    /// ignored; a broken pipe surfaces through the stdout pump, which runs
    /// the close cascade.
    pub async fn write(&self, session_id: &str, data: &[u8]) {
        let Some(session) = self.core().sessions.get(session_id) else {
            return;
        };
        let mut writer = session.stdin.make_writer();
        let _ = writer.write_all(data).await;
    }

    /// Change the PTY window size. Ignored for unknown ids.
    pub async fn resize(&self, session_id: &str, cols: u32, rows: u32) {
        let Some(session) = self.core().sessions.get(session_id) else {
            return;
        };
        let _ = session.stdin.window_change(cols, rows, 0, 0).await;
    }

    /// Gracefully close a session. Idempotent; unknown ids are ignored.
    pub async fn disconnect(&self, session_id: &str) {
        let Some(session) = self.core().sessions.get(session_id) else {
            return;
        };
        close_session(self.core(), &session, "user disconnect").await;
    }
}

/// Run the SSH handshake over an established byte stream.
///
/// The budget covers key exchange; when an interactive host-key callback is
/// configured the user's decision window is added on top, since the prompt
/// happens inside the handshake.
async fn handshake<S>(
    config: Arc<client::Config>,
    stream: S,
    handler: ClientHandler,
    interactive: bool,
) -> Result<client::Handle<ClientHandler>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let budget = if interactive {
        SSH_HANDSHAKE_TIMEOUT + HOST_KEY_DECISION_TIMEOUT
    } else {
        SSH_HANDSHAKE_TIMEOUT
    };

    match tokio::time::timeout(budget, client::connect_stream(config, stream, handler)).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e @ Error::HostKey { .. })) => Err(e),
        Ok(Err(e)) => Err(Error::Protocol {
            message: format!("connect: ssh handshake: {e}"),
        }),
        Err(_) => Err(Error::Timeout {
            message: "ssh handshake".into(),
        }),
    }
}

/// Authenticate `handle` with the configured method.
async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    method: AuthMethod,
    password: Option<&str>,
    key_pem: Option<&str>,
    key_passphrase: Option<&str>,
    keyring: &Keyring,
) -> Result<()> {
    match method {
        AuthMethod::Password => {
            let password = password.unwrap_or_default();
            let result = handle.authenticate_password(username, password).await?;
            if !result.success() {
                return Err(Error::Auth {
                    message: "authentication failed".into(),
                });
            }
        }
        AuthMethod::Key => {
            let key = russh::keys::decode_secret_key(
                key_pem.unwrap_or_default(),
                key_passphrase.filter(|p| !p.is_empty()),
            )
            .map_err(|e| Error::Auth {
                message: format!("parse key: {e}"),
            })?;
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            let result = handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await?;
            if !result.success() {
                return Err(Error::Auth {
                    message: "authentication failed".into(),
                });
            }
        }
        AuthMethod::Agent => {
            let keys = keyring.keys();
            if keys.is_empty() {
                return Err(Error::Auth {
                    message: "no agent keys loaded".into(),
                });
            }
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            let mut authed = false;
            for key in keys {
                let result = handle
                    .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, hash))
                    .await?;
                if result.success() {
                    authed = true;
                    break;
                }
            }
            if !authed {
                return Err(Error::Auth {
                    message: "authentication failed".into(),
                });
            }
        }
    }
    Ok(())
}

fn prefix_auth(err: Error, context: &str) -> Error {
    match err {
        Error::Auth { message } => Error::Auth {
            message: format!("{context}: {message}"),
        },
        other => other,
    }
}

/// Build the relay URL with encoded `host`, `port`, and optional `token`
/// query parameters.
fn relay_url(
    proxy_url: &str,
    allow_insecure: bool,
    host: &str,
    port: u16,
    token: Option<&str>,
) -> Result<Url> {
    let mut url = parse_ws_url(proxy_url, allow_insecure)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("host", host);
        pairs.append_pair("port", &port.to_string());
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            pairs.append_pair("token", token);
        }
    }
    Ok(url)
}

/// Forward interactive stdout to the host until the channel dies, then run
/// the close cascade.
async fn stdout_pump(
    core: Arc<Core>,
    session: Arc<Session>,
    mut read_half: russh::ChannelReadHalf,
    on_data: DataFn,
) {
    loop {
        let msg = tokio::select! {
            _ = session.token.cancelled() => break,
            msg = read_half.wait() => msg,
        };
        let Some(msg) = msg else { break };

        match msg {
            ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                let batch = Bytes::copy_from_slice(&data);
                guard("on_data", || on_data(batch));
            }
            ChannelMsg::Eof | ChannelMsg::Close | ChannelMsg::ExitStatus { .. } => break,
            _ => {}
        }
    }

    close_session(&core, &session, "session ended").await;
}

/// Tear a session down. Exactly one caller runs the cascade; the rest
/// return immediately. Order: cancel children, close SFTP clients and
/// forwards bound to the session, close stdin/channel/client/transport,
/// release jump resources, deregister, notify the host.
pub(crate) async fn close_session(core: &Arc<Core>, session: &Arc<Session>, reason: &str) {
    if !session.close_latch.acquire() {
        return;
    }

    tracing::info!(session = %session.id, reason, "closing session");
    session.token.cancel();

    for (sftp_id, _handle) in core.sftp.filter(|s| s.session_id == session.id) {
        // Dropping the handle closes the subsystem channel.
        core.sftp.take(&sftp_id);
    }

    for (_, fwd) in core.forwards.filter(|f| f.session_id == session.id) {
        forward::cleanup_forward(core, &fwd).await;
    }

    let _ = session.stdin.close().await;
    let _ = session
        .handle
        .disconnect(Disconnect::ByApplication, "", "")
        .await;
    session.transport.close();

    if let Some(jump) = &session.jump_handle {
        let _ = jump.disconnect(Disconnect::ByApplication, "", "").await;
    }

    core.sessions.take(&session.id);

    guard("on_close", || (session.on_close)(reason));
}
