//! Payload masking (RFC 6455 §5.3).
//!
//! Every frame a client sends must be masked: the payload is XOR-ed with a
//! 4-byte key that travels in the frame header.  Byte `i` of the payload is
//! combined with byte `i mod 4` of the key:
//!
//! ```text
//! output[i] = payload[i] XOR key[i % 4]
//! ```
//!
//! XOR is its own inverse, so the same routine masks and unmasks.
//!
//! # Key generation
//!
//! Keys come from the operating system's CSPRNG.  If that source is not
//! available the key is derived from a SHA-1 digest over a process-local
//! counter, the clock and the process id.  The derived key is unpredictable
//! enough to defeat cache-poisoning proxies but it is NOT cryptographically
//! random, and a warning is logged whenever it is used.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::warn;

/// Length of a masking key in bytes.
pub const MASK_KEY_LEN: usize = 4;

/// A 4-byte masking key.
pub type MaskKey = [u8; MASK_KEY_LEN];

/// XORs `payload` in place with `key`.
///
/// Applying the same key twice restores the original bytes.
///
/// # Examples
///
/// ```rust
/// use ws_core::protocol::mask::apply_mask;
///
/// let key = [0x37, 0xfa, 0x21, 0x3d];
/// let mut data = b"Hello".to_vec();
/// apply_mask(&mut data, key);
/// assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
/// apply_mask(&mut data, key);
/// assert_eq!(data, b"Hello");
/// ```
pub fn apply_mask(payload: &mut [u8], key: MaskKey) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % MASK_KEY_LEN];
    }
}

/// Generates a fresh masking key.
pub fn generate_mask_key() -> MaskKey {
    let mut key = [0u8; MASK_KEY_LEN];
    fill_random(&mut key);
    key
}

/// Fills `buf` from the OS random source, falling back to SHA-1 derivation.
pub(crate) fn fill_random(buf: &mut [u8]) {
    if let Err(e) = OsRng.try_fill_bytes(buf) {
        warn!("OS random source unavailable ({e}); deriving bytes from SHA-1 (weaker)");
        fill_derived(buf);
    }
}

fn fill_derived(buf: &mut [u8]) {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    for chunk in buf.chunks_mut(20) {
        let nonce = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha1::new();
        hasher.update(nonce.to_be_bytes());
        hasher.update(nanos.to_be_bytes());
        hasher.update(std::process::id().to_be_bytes());
        let digest = hasher.finalize();
        chunk.copy_from_slice(&digest[..chunk.len()]);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_matches_rfc_example() {
        // RFC 6455 §5.7: "Hello" masked with 37 fa 21 3d
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_mask_twice_restores_payload() {
        let original: Vec<u8> = (0..=255).collect();
        let key = [0xde, 0xad, 0xbe, 0xef];
        let mut data = original.clone();

        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);

        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_empty_payload_is_noop() {
        let mut data: Vec<u8> = Vec::new();
        apply_mask(&mut data, [1, 2, 3, 4]);
        assert!(data.is_empty());
    }

    #[test]
    fn test_zero_key_leaves_payload_unchanged() {
        let mut data = b"unchanged".to_vec();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(data, b"unchanged");
    }

    #[test]
    fn test_generated_keys_differ() {
        // Two consecutive keys colliding has probability 2^-32.
        let keys: Vec<MaskKey> = (0..8).map(|_| generate_mask_key()).collect();
        assert!(keys.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_derived_fill_covers_long_buffers() {
        let mut buf = [0u8; 45];
        fill_derived(&mut buf);
        // Three SHA-1 blocks were needed; none of them should be all zero.
        assert!(buf[..20].iter().any(|&b| b != 0));
        assert!(buf[20..40].iter().any(|&b| b != 0));
        assert!(buf[40..].iter().any(|&b| b != 0));
    }

    #[test]
    fn test_derived_fill_changes_between_calls() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        fill_derived(&mut a);
        fill_derived(&mut b);
        assert_ne!(a, b, "counter must feed into every derivation");
    }
}
