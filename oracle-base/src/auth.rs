//! Access tokens for webhook jobs and bridges. Only the SHA3-256 hash of a
//! token is ever stored.

use sha3::{Digest, Sha3_256};
use uuid::Uuid;

/// A fresh random token.
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Hex encoded SHA3-256 of `token`.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha3_256::digest(token.as_bytes()))
}

/// Whether `presented` hashes to `stored_hash`.
pub fn verify_token(presented: &str, stored_hash: &str) -> bool {
    let computed = hash_token(presented);
    // compare without an early exit
    computed.len() == stored_hash.len()
        && computed
            .bytes()
            .zip(stored_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
