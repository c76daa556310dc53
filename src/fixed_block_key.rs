// src/fixed_block_key.rs
use blake2::digest::Digest;
use blake2::Blake2b512;
use bytemuck::{Pod, Zeroable};
use xxhash_rust::xxh64::{xxh64, Xxh64};

/// Width of a map key in bytes.
pub const KEY_LEN: usize = 16;

// Golden-ratio constant used in many hashers.
const MIX_CONSTANT: u64 = 0x9E37_79B9_7F4A_7C15;

/// A pre-hashed 128-bit map key.
///
/// Bytes 0..8 hold the primary 64-bit hash (little-endian); it selects the
/// starting block and contributes the control tag. Bytes 8..16 hold a mixed
/// secondary hash so the full key stays unique even across rare 64-bit
/// collisions. Equality is byte-wise over all 16 bytes.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct FixedBlockKey(pub [u8; KEY_LEN]);

impl FixedBlockKey {
    /// Derives a key from text: primary hash via xxHash, secondary via the
    /// bitwise mixer.
    pub fn from_string(text: &str) -> Self {
        Self::from_bytes(text.as_bytes())
    }

    /// Same derivation over a raw byte string.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let h1 = xxh64(bytes, 0);
        Self::from_parts(h1, mix64(h1))
    }

    /// Builds a key directly from two 64-bit halves, for callers that bring
    /// their own hashes.
    pub fn from_parts(h1: u64, h2: u64) -> Self {
        let mut key = [0u8; KEY_LEN];
        key[0..8].copy_from_slice(&h1.to_le_bytes());
        key[8..16].copy_from_slice(&h2.to_le_bytes());
        Self(key)
    }

    /// The primary 64-bit hash; the map masks this to pick the start block.
    #[inline]
    pub fn primary_hash(&self) -> u64 {
        let mut half = [0u8; 8];
        half.copy_from_slice(&self.0[0..8]);
        u64::from_le_bytes(half)
    }

    /// Occupied control tag: MSB set over the low 7 bits of the first byte.
    #[inline]
    pub(crate) fn tag(&self) -> u8 {
        self.0[0] | 0x80
    }
}

/// Avalanche finalizer spreading the primary hash into the upper key half.
#[inline]
pub fn mix64(x: u64) -> u64 {
    let mut y = x ^ (x >> 33);
    y = y.wrapping_mul(MIX_CONSTANT);
    y ^ (y >> 33)
}

/// Fast non-cryptographic vs cryptographic derivation.
#[derive(Debug, Clone, Copy)]
pub enum HashMode {
    /// xxHash-based, seeded per domain.
    Fast,
    /// BLAKE2b-512, first 16 digest bytes.
    Cryptographic,
}

impl Default for HashMode {
    fn default() -> Self {
        HashMode::Fast
    }
}

/// Per-mode seed material, absorbed once from the domain.
enum Seed {
    Fast(u64),
    Cryptographic(Blake2b512),
}

/// Domain-separated key derivation. The domain is fixed at construction,
/// keys are passed to `derive`. Keys from different domains or modes are
/// unrelated; snapshots only round-trip under the deriver that produced
/// their keys.
pub struct KeyDeriver {
    seed: Seed,
}

impl KeyDeriver {
    pub fn new(domain: &[u8], hash_mode: HashMode) -> Self {
        let seed = match hash_mode {
            HashMode::Fast => Seed::Fast(fast_domain_seed(domain)),
            HashMode::Cryptographic => Seed::Cryptographic(crypto_domain_state(domain)),
        };
        Self { seed }
    }

    #[inline]
    pub fn hash_mode(&self) -> HashMode {
        match self.seed {
            Seed::Fast(_) => HashMode::Fast,
            Seed::Cryptographic(_) => HashMode::Cryptographic,
        }
    }

    /// Derives the 16-byte key for `key` under this domain.
    pub fn derive(&self, key: &[u8]) -> FixedBlockKey {
        match &self.seed {
            Seed::Fast(seed) => {
                let h1 = xxh64(key, *seed);
                FixedBlockKey::from_parts(h1, mix64(h1))
            }
            Seed::Cryptographic(state) => {
                let mut st = state.clone();
                st.update((key.len() as u64).to_be_bytes());
                st.update(key);
                let digest = st.finalize();

                let mut bytes = [0u8; KEY_LEN];
                bytes.copy_from_slice(&digest[..KEY_LEN]);
                FixedBlockKey(bytes)
            }
        }
    }
}

/// xxh64("FBMv1" || domain), unseeded.
fn fast_domain_seed(domain: &[u8]) -> u64 {
    let mut st = Xxh64::new(0);
    st.update(b"FBMv1");
    st.update(domain);
    st.digest()
}

/// Length-prefixed domain absorption; cloned per derivation.
fn crypto_domain_state(domain: &[u8]) -> Blake2b512 {
    let mut st = Blake2b512::new();
    st.update(b"FBMv1");
    st.update((domain.len() as u64).to_be_bytes());
    st.update(domain);
    st
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_string_deterministic() {
        let k1 = FixedBlockKey::from_string("hello");
        let k2 = FixedBlockKey::from_string("hello");
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_different_strings() {
        let k1 = FixedBlockKey::from_string("hello");
        let k2 = FixedBlockKey::from_string("world");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_halves_little_endian() {
        let key = FixedBlockKey::from_parts(0x0102_0304_0506_0708, 0x1112_1314_1516_1718);
        assert_eq!(key.0[0], 0x08);
        assert_eq!(key.0[7], 0x01);
        assert_eq!(key.0[8], 0x18);
        assert_eq!(key.0[15], 0x11);
        assert_eq!(key.primary_hash(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_secondary_is_mixed_primary() {
        let key = FixedBlockKey::from_string("abc");
        let h1 = key.primary_hash();
        let mut upper = [0u8; 8];
        upper.copy_from_slice(&key.0[8..16]);
        assert_eq!(u64::from_le_bytes(upper), mix64(h1));
    }

    #[test]
    fn test_mix64_avalanches() {
        assert_eq!(mix64(0), 0);
        assert_ne!(mix64(1), 1);
        assert_ne!(mix64(1), mix64(2));
        // single input bit flips roughly half the output bits
        let diff = (mix64(7) ^ mix64(6)).count_ones();
        assert!(diff > 16, "weak diffusion: {} bits", diff);
    }

    #[test]
    fn test_tag_distinct_from_tombstone() {
        // first byte 0x01 would collide with the tombstone marker without
        // the MSB
        let key = FixedBlockKey::from_parts(0x01, 0);
        assert_eq!(key.tag(), 0x81);
    }

    #[test]
    fn test_tag_idempotent_on_high_bit() {
        let key = FixedBlockKey::from_parts(0xF3, 0);
        assert_eq!(key.tag(), 0xF3);
    }

    #[test]
    fn test_deriver_fast_deterministic() {
        let d = KeyDeriver::new(b"test_domain", HashMode::Fast);
        assert_eq!(d.derive(b"key1"), d.derive(b"key1"));
        assert_ne!(d.derive(b"key1"), d.derive(b"key2"));
    }

    #[test]
    fn test_deriver_domains_differ() {
        let d1 = KeyDeriver::new(b"domain_a", HashMode::Fast);
        let d2 = KeyDeriver::new(b"domain_b", HashMode::Fast);
        assert_ne!(d1.derive(b"key"), d2.derive(b"key"));
    }

    #[test]
    fn test_deriver_cryptographic() {
        let d = KeyDeriver::new(b"domain", HashMode::Cryptographic);
        assert_eq!(d.derive(b"key"), d.derive(b"key"));
        assert_ne!(d.derive(b"key"), d.derive(b"other"));

        let fast = KeyDeriver::new(b"domain", HashMode::Fast);
        assert_ne!(d.derive(b"key"), fast.derive(b"key"));
    }
}
