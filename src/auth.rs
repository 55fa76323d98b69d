use sha3::{Digest, Sha3_256};

/// SHA3-256 hex digest of a password.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha3_256::default();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    hash_password(password) == stored_hash
}
