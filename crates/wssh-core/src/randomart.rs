//! OpenSSH "visual host key" rendering (the drunken-bishop algorithm).
//!
//! A bishop starts at the center of a 17x9 grid and moves according to
//! successive bit-pairs of a fingerprint hash; cells count visits and are
//! rendered through a fixed character ramp, with `S` marking the start and
//! `E` the final position. Gives users a cheap visual check of a host key
//! during verification.

const ART_WIDTH: usize = 17;
const ART_HEIGHT: usize = 9;

/// Visit counts map onto this ramp; the last two slots are the start and
/// end markers.
const ART_CHARS: &[u8] = b" .o+=*BOX@%&#/^SE";

const START_MARKER: u8 = (ART_CHARS.len() - 2) as u8;
const END_MARKER: u8 = (ART_CHARS.len() - 1) as u8;

/// Render random-art for a fingerprint hash.
///
/// Pure function of the inputs: the same `(hash, key_type, bits, hash_name)`
/// always produces the same grid. `key_type` appears uppercased in the top
/// border, `hash_name` in the bottom border.
pub fn from_hash(hash: &[u8], key_type: &str, bits: u32, hash_name: &str) -> String {
    let mut field = [[0u8; ART_WIDTH]; ART_HEIGHT];

    let (mut x, mut y) = (ART_WIDTH / 2, ART_HEIGHT / 2);

    for &b in hash {
        for shift in (0..8).step_by(2) {
            // 2-bit direction, LSB-first: 0 up-left, 1 up-right,
            // 2 down-left, 3 down-right.
            let dir = (b >> shift) & 0x03;
            match dir {
                0 => {
                    x = x.saturating_sub(1);
                    y = y.saturating_sub(1);
                }
                1 => {
                    x = (x + 1).min(ART_WIDTH - 1);
                    y = y.saturating_sub(1);
                }
                2 => {
                    x = x.saturating_sub(1);
                    y = (y + 1).min(ART_HEIGHT - 1);
                }
                _ => {
                    x = (x + 1).min(ART_WIDTH - 1);
                    y = (y + 1).min(ART_HEIGHT - 1);
                }
            }
            field[y][x] = field[y][x].saturating_add(1);
        }
    }

    field[ART_HEIGHT / 2][ART_WIDTH / 2] = START_MARKER;
    field[y][x] = END_MARKER;

    let mut out = String::new();
    out.push_str(&border(&format!("{} {}", key_type.to_uppercase(), bits)));
    out.push('\n');

    for row in &field {
        out.push('|');
        for &cell in row {
            let idx = if cell == START_MARKER || cell == END_MARKER {
                cell as usize
            } else {
                (cell as usize).min(ART_CHARS.len() - 3)
            };
            out.push(ART_CHARS[idx] as char);
        }
        out.push_str("|\n");
    }

    out.push_str(&border(hash_name));
    out
}

/// Render random-art from a hex fingerprint string, with or without an
/// `MD5:` prefix and colon separators. Returns an empty string on malformed
/// input.
pub fn from_fingerprint(fingerprint: &str, key_type: &str, bits: u32) -> String {
    let fp = fingerprint.strip_prefix("MD5:").unwrap_or(fingerprint);
    let fp: String = fp.chars().filter(|&c| c != ':').collect();

    if fp.is_empty() || fp.len() % 2 != 0 {
        return String::new();
    }

    let mut hash = Vec::with_capacity(fp.len() / 2);
    let bytes = fp.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = hex_val(pair[0]);
        let lo = hex_val(pair[1]);
        match (hi, lo) {
            (Some(h), Some(l)) => hash.push((h << 4) | l),
            _ => return String::new(),
        }
    }

    from_hash(&hash, key_type, bits, "MD5")
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// One `+--[label]--+` border line, label centered.
fn border(label: &str) -> String {
    let inner = label.len() + 2;
    let left = ART_WIDTH.saturating_sub(inner) / 2;
    let right = ART_WIDTH.saturating_sub(left + inner);
    format!(
        "+{}[{}]{}+",
        "-".repeat(left),
        label,
        "-".repeat(right)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: [u8; 16] = [
        0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe, 0xba, 0xbe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
        0xcd, 0xef,
    ];

    #[test]
    fn structural_properties() {
        let art = from_hash(&HASH, "ssh-rsa", 4096, "MD5");
        let lines: Vec<&str> = art.split('\n').collect();
        assert_eq!(lines.len(), ART_HEIGHT + 2);

        assert!(lines[0].contains("SSH-RSA"));
        assert!(lines[0].contains("4096"));
        assert!(lines[lines.len() - 1].contains("MD5"));

        for line in &lines[1..=ART_HEIGHT] {
            assert_eq!(line.len(), ART_WIDTH + 2, "bad grid row: {line:?}");
            assert!(line.starts_with('|') && line.ends_with('|'));
        }

        let body: String = lines[1..=ART_HEIGHT].concat();
        assert!(body.contains('S'));
        assert!(body.contains('E'));
    }

    #[test]
    fn deterministic() {
        let a = from_hash(&HASH, "ed25519", 256, "MD5");
        let b = from_hash(&HASH, "ed25519", 256, "MD5");
        assert_eq!(a, b);
    }

    #[test]
    fn different_hashes_differ() {
        let other = [0u8; 16];
        assert_ne!(
            from_hash(&HASH, "ed25519", 256, "MD5"),
            from_hash(&other, "ed25519", 256, "MD5")
        );
    }

    #[test]
    fn from_fingerprint_accepts_both_forms() {
        let with_prefix = "MD5:de:ad:be:ef:ca:fe:ba:be:01:23:45:67:89:ab:cd:ef";
        let bare = "deadbeefcafebabe0123456789abcdef";
        let a = from_fingerprint(with_prefix, "ssh-rsa", 4096);
        let b = from_fingerprint(bare, "ssh-rsa", 4096);
        assert!(!a.is_empty());
        assert_eq!(a, b);
        assert!(a.contains("SSH-RSA"));
    }

    #[test]
    fn from_fingerprint_rejects_garbage() {
        assert_eq!(from_fingerprint("not-hex!", "ssh-rsa", 2048), "");
        assert_eq!(from_fingerprint("abc", "ssh-rsa", 2048), "");
        assert_eq!(from_fingerprint("", "ssh-rsa", 2048), "");
    }

    #[test]
    fn long_label_does_not_panic() {
        let art = from_hash(&HASH, "ecdsa-sha2-nistp521-very-long", 521, "SHA256");
        assert!(art.starts_with('+'));
    }
}
