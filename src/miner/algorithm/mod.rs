// src/miner/algorithm/mod.rs
//! Hashing algorithm implementations
//!
//! All supported proof-of-work functions and their common interface. The
//! scheduler treats algorithms as opaque: bytes in, 32-byte digest out.

use crate::types::AlgorithmKind;
use crate::utils::error::MinerError;
use sha2::{Digest, Sha256};

/// Common interface for all mining algorithms
///
/// Implementations take the 76-byte header base plus a nonce and produce
/// the proof-of-work digest the target comparison runs against.
pub trait Algorithm: Send + Sync {
    /// Computes the hash for a header base and nonce
    ///
    /// # Arguments
    /// * `base` - The block header with the nonce field left out
    /// * `nonce` - Appended little-endian in the nonce slot
    ///
    /// # Returns
    /// 32-byte digest or an error if computation fails
    fn hash(&self, base: &[u8], nonce: u32) -> Result<[u8; 32], MinerError>;

    /// The algorithm variant being computed
    fn kind(&self) -> AlgorithmKind;
}

/// Double SHA-256 over an 80-byte bitcoin-style header
pub struct Sha256dAlgo;

impl Sha256dAlgo {
    pub fn new() -> Self {
        Sha256dAlgo
    }
}

impl Default for Sha256dAlgo {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Sha256dAlgo {
    fn hash(&self, base: &[u8], nonce: u32) -> Result<[u8; 32], MinerError> {
        if base.len() != 76 {
            return Err(MinerError::AlgorithmError(format!(
                "sha256d expects a 76 byte header base, got {}",
                base.len()
            )));
        }
        let mut header = [0u8; 80];
        header[..76].copy_from_slice(base);
        header[76..].copy_from_slice(&nonce.to_le_bytes());
        Ok(sha256d(&header))
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Sha256d
    }
}

/// SHA-256 applied twice
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Single SHA-256, used by the alternative coinbase hashing mode
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_matches_known_vector() {
        // sha256d("hello") is a widely published test value.
        let digest = sha256d(b"hello");
        assert_eq!(
            hex::encode(digest),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn header_base_must_be_76_bytes() {
        let algo = Sha256dAlgo::new();
        assert!(algo.hash(&[0u8; 75], 0).is_err());
        assert!(algo.hash(&[0u8; 76], 0).is_ok());
    }

    #[test]
    fn nonce_lands_little_endian_in_the_last_word() {
        let algo = Sha256dAlgo::new();
        let base = [0u8; 76];
        let mut manual = [0u8; 80];
        manual[76..].copy_from_slice(&0xA1B2C3D4u32.to_le_bytes());
        assert_eq!(algo.hash(&base, 0xA1B2C3D4).unwrap(), sha256d(&manual));
    }
}
