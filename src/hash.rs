//! Deterministic hashes used for cache keys.
//!
//! Chunk content hashes use a cyrb53-style 53-bit mix: cheap, stable
//! across processes, and collision-resistant enough for keying cached
//! explanations. Request fingerprints and legacy cache keys use SHA-256.

use sha2::{Digest as _, Sha256};

const SEED_A: u32 = 0xdead_beef;
const SEED_B: u32 = 0x41c6_ce57;

/// 53-bit mixing hash over the text's code points.
pub fn cyrb53(input: &str) -> u64 {
    let mut h1 = SEED_A;
    let mut h2 = SEED_B;

    for ch in input.chars() {
        let ch = ch as u32;
        h1 = (h1 ^ ch).wrapping_mul(2_654_435_761);
        h2 = (h2 ^ ch).wrapping_mul(1_597_334_677);
    }

    h1 = (h1 ^ (h1 >> 16))
        .wrapping_mul(2_246_822_507)
        ^ (h2 ^ (h2 >> 13)).wrapping_mul(3_266_489_909);
    h2 = (h2 ^ (h2 >> 16))
        .wrapping_mul(2_246_822_507)
        ^ (h1 ^ (h1 >> 13)).wrapping_mul(3_266_489_909);

    ((h2 & 0x1f_ffff) as u64) << 32 | h1 as u64
}

/// Hex rendering of [`cyrb53`]; the stored chunk `contentHash` format.
pub fn content_hash(input: &str) -> String {
    format!("{:x}", cyrb53(input))
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
