//! Minimal ssh-agent wire responder.
//!
//! When agent forwarding is active, the remote server opens
//! `auth-agent@openssh.com` channels back to us and speaks the ssh-agent
//! protocol on them. This responder answers the two requests a forwarding
//! consumer needs — identity listing and signing — from the in-memory
//! keyring. Everything else (adding, removing, locking) is refused: the
//! remote side has no business mutating the local keyring.
//!
//! Wire format: every message is `[u32 length][u8 type][payload]`, strings
//! are `[u32 length][bytes]`, all big-endian.

use std::sync::Arc;

use signature::Signer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Keyring;
use crate::error::{Error, Result};

const SSH_AGENT_FAILURE: u8 = 5;
const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// Bound on one agent request; identities and sign payloads are tiny.
const MAX_AGENT_MESSAGE: usize = 256 * 1024;

/// Serve the agent protocol on `stream` until EOF or error.
///
/// Spawned once per forwarded agent channel; failures end the channel, not
/// the session.
pub async fn serve<S>(mut stream: S, keyring: Arc<Keyring>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // Clean end of the channel.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_AGENT_MESSAGE {
            return Err(Error::Protocol {
                message: format!("agent message length {len} out of range"),
            });
        }

        let mut msg = vec![0u8; len];
        stream.read_exact(&mut msg).await?;

        let reply = match msg[0] {
            SSH_AGENTC_REQUEST_IDENTITIES => identities_answer(&keyring),
            SSH_AGENTC_SIGN_REQUEST => sign_response(&keyring, &msg[1..]),
            other => {
                tracing::debug!(msg_type = other, "refusing agent request");
                vec![SSH_AGENT_FAILURE]
            }
        };

        let mut framed = Vec::with_capacity(4 + reply.len());
        framed.extend_from_slice(&(reply.len() as u32).to_be_bytes());
        framed.extend_from_slice(&reply);
        stream.write_all(&framed).await?;
        stream.flush().await?;
    }
}

fn identities_answer(keyring: &Keyring) -> Vec<u8> {
    let keys = keyring.keys();

    let mut out = vec![SSH_AGENT_IDENTITIES_ANSWER];
    let mut listed = 0u32;
    let mut body = Vec::new();
    for key in &keys {
        let Ok(blob) = key.public_key().to_bytes() else {
            continue;
        };
        put_string(&mut body, &blob);
        put_string(&mut body, key.comment().as_bytes());
        listed += 1;
    }
    out.extend_from_slice(&listed.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn sign_response(keyring: &Keyring, payload: &[u8]) -> Vec<u8> {
    let mut cursor = payload;
    let (Some(blob), Some(data)) = (read_string(&mut cursor), read_string(&mut cursor)) else {
        return vec![SSH_AGENT_FAILURE];
    };
    // Trailing u32 flags are ignored; ssh-key picks the signature hash.

    let Some(key) = keyring.find_by_blob(&blob) else {
        return vec![SSH_AGENT_FAILURE];
    };

    let sig = match key.try_sign(&data) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "agent signing failed");
            return vec![SSH_AGENT_FAILURE];
        }
    };

    // Signature blob: string(algorithm) || string(raw signature).
    let mut sig_blob = Vec::new();
    put_string(&mut sig_blob, sig.algorithm().as_str().as_bytes());
    put_string(&mut sig_blob, sig.as_bytes());

    let mut out = vec![SSH_AGENT_SIGN_RESPONSE];
    put_string(&mut out, &sig_blob);
    out
}

fn put_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s);
}

fn read_string(cursor: &mut &[u8]) -> Option<Vec<u8>> {
    if cursor.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
    let rest = &cursor[4..];
    if rest.len() < len {
        return None;
    }
    let (s, tail) = rest.split_at(len);
    *cursor = tail;
    Some(s.to_vec())
}
