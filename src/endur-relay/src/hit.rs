//! Public relay-eligibility filter.
//!
//! A candidate transaction "hits" a seed UTXO when
//! `keccak256(LE(seed) ‖ LE(candidate)) mod 32 == 0`. Neither party can steer
//! the outcome once the seed is fixed, so about 1 in 32 transactions qualify.

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use sha3::{Digest, Keccak256};

pub const HIT_MODULUS: u8 = 32;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The hash a hit decision is taken on. Both ids are fed in their internal
/// (little-endian) byte order, seed first.
pub fn hit_hash(seed: &Txid, candidate: &Txid) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(seed.as_byte_array());
    buf[32..].copy_from_slice(candidate.as_byte_array());
    keccak256(&buf)
}

pub fn is_hit(seed: &Txid, candidate: &Txid) -> bool {
    // the digest is a big-endian integer, so its residue lives in the last byte
    hit_hash(seed, candidate)[31] % HIT_MODULUS == 0
}
