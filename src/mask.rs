//! WebSocket frame masking.
//!
//! Client-to-server frames carry a 4-byte key; the payload is the byte-wise
//! XOR `p[i] ^ key[i % 4]`. Unmasking is the same transform.

use std::cell::Cell;

/// Apply the masking transform in place.
///
/// Processes eight bytes per step with the key broadcast into a `u64`,
/// then finishes the tail byte-wise.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    let key_u64 = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ key_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    let tail = chunks.into_remainder();
    for (i, byte) in tail.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(0) };
}

/// Advance the thread-local xorshift64 state and return the next word.
///
/// Mask keys do not need to be cryptographically secure; they only have to
/// be unpredictable enough to defeat proxy cache poisoning.
#[inline]
fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        let mut s = state.get();

        if s == 0 {
            s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            // Mix in a stack address so two threads seeded in the same
            // nanosecond still diverge.
            s ^= &s as *const _ as u64;
            s |= 1;
        }

        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;

        state.set(s);
        s
    })
}

/// Generate a random 4-byte mask key.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    (next_u64() as u32).to_ne_bytes()
}

/// Fill `buf` with pseudo-random bytes (handshake nonces).
pub(crate) fn random_bytes(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(8) {
        let word = next_u64().to_ne_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_is_involution() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let original: Vec<u8> = (0..100).collect();

        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_matches_bytewise_definition() {
        let key = [0x01, 0x02, 0x03, 0x04];
        let mut data: Vec<u8> = (0..37).collect();
        apply_mask(&mut data, key);

        for (i, byte) in data.iter().enumerate() {
            assert_eq!(*byte, (i as u8) ^ key[i % 4]);
        }
    }

    #[test]
    fn test_mask_empty() {
        let mut data: [u8; 0] = [];
        apply_mask(&mut data, [1, 2, 3, 4]);
    }

    #[test]
    fn test_generate_mask_varies() {
        let a = generate_mask();
        let b = generate_mask();
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_bytes_fills() {
        let mut buf = [0u8; 16];
        random_bytes(&mut buf);
        assert_ne!(buf, [0u8; 16]);
    }
}
