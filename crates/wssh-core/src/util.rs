//! Shared utilities: identifier minting, secret scrubbing, output
//! sanitisation, and small one-shot synchronisation primitives.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::RngCore;
use tokio::sync::watch;
use zeroize::Zeroize;

/// Length of a rendered identifier: 16 random bytes as lowercase hex.
pub const ID_LEN: usize = 32;

/// Mint an opaque identifier from the CSPRNG.
///
/// Identifiers are the only reference the host holds into the core, so they
/// must be unguessable; 128 bits of CSPRNG output rendered as 32 hex chars.
pub fn mint_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut s = String::with_capacity(ID_LEN);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// True when `s` has the exact shape of a minted identifier.
pub fn is_hex_id(s: &str) -> bool {
    s.len() == ID_LEN
        && s.bytes()
            .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
}

/// Overwrite a byte buffer before it goes out of scope.
pub fn scrub(buf: &mut [u8]) {
    buf.zeroize();
}

/// Sanitise SSH banner/prompt output before it reaches the host.
///
/// Malicious servers can embed escape sequences in banners to manipulate the
/// user's terminal. TAB, LF, and CR survive; every other control character is
/// replaced with U+FFFD.
pub fn mask_control(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' | '\r' | '\t' => out.push(c),
            c if c.is_control() => out.push('\u{FFFD}'),
            c => out.push(c),
        }
    }
    out
}

/// A latch that admits exactly one caller.
///
/// Teardown paths (session close, forward cleanup) are reachable from
/// multiple tasks; the first caller through the latch runs the teardown, the
/// rest see `false`.
#[derive(Debug, Default)]
pub struct OnceLatch {
    fired: AtomicBool,
}

impl OnceLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for exactly one caller.
    pub fn acquire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// An awaitable completion flag with idempotent set semantics.
#[derive(Debug)]
pub struct DoneSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Mark complete. Safe to call any number of times.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until [`set`](Self::set) has been called.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_id_shape() {
        let id = mint_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(is_hex_id(&id));
    }

    #[test]
    fn mint_id_unique() {
        assert_ne!(mint_id(), mint_id());
    }

    #[test]
    fn hex_id_validation() {
        assert!(is_hex_id("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(is_hex_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_hex_id("0123456789ABCDEF0123456789ABCDEF")); // uppercase
        assert!(!is_hex_id("aaaa"));
        assert!(!is_hex_id("gggggggggggggggggggggggggggggggg"));
        assert!(!is_hex_id(""));
    }

    #[test]
    fn scrub_zeroes() {
        let mut buf = vec![0xAAu8; 64];
        scrub(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn mask_control_preserves_whitespace() {
        assert_eq!(mask_control("hello\r\n\tworld"), "hello\r\n\tworld");
    }

    #[test]
    fn mask_control_replaces_escapes() {
        let banner = "evil\x1b[2Jbanner\x07";
        let masked = mask_control(banner);
        assert_eq!(masked, "evil\u{FFFD}[2Jbanner\u{FFFD}");
        assert!(!masked.contains('\x1b'));
    }

    #[test]
    fn once_latch_admits_one() {
        let latch = OnceLatch::new();
        assert!(latch.acquire());
        assert!(!latch.acquire());
        assert!(latch.is_fired());
    }

    #[tokio::test]
    async fn done_signal_idempotent() {
        let done = DoneSignal::new();
        assert!(!done.is_set());
        done.set();
        done.set();
        assert!(done.is_set());
        done.wait().await;
    }

    #[tokio::test]
    async fn done_signal_wakes_waiter() {
        let done = std::sync::Arc::new(DoneSignal::new());
        let waiter = {
            let done = done.clone();
            tokio::spawn(async move { done.wait().await })
        };
        tokio::task::yield_now().await;
        done.set();
        waiter.await.unwrap();
    }
}
