// src/types.rs
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported mining algorithms
///
/// This enum represents the proof-of-work algorithms the compute backend
/// can run. Pools whose configured `algo` does not match the active
/// algorithm are kept disconnected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum AlgorithmKind {
    /// Double SHA-256 (bitcoin-style headers)
    ///
    /// Hashes an 80-byte block header twice through SHA-256.
    /// The only algorithm currently wired to the CPU backend.
    #[clap(name = "sha256d")]
    Sha256d,
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmKind::Sha256d => write!(f, "sha256d"),
        }
    }
}

impl FromStr for AlgorithmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256d" | "sha-256d" => Ok(AlgorithmKind::Sha256d),
            _ => Err(format!("Unknown algorithm: {}", s)),
        }
    }
}

/// How a pool's announced difficulty translates into a share target
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffMode {
    /// Bitcoin-style difficulty-one target (0xFFFF << 208)
    #[serde(rename = "btc")]
    Btc,
    /// NeoScrypt-style difficulty-one target, 65536 times larger
    #[serde(rename = "neoScrypt")]
    NeoScrypt,
}

impl FromStr for DiffMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc" => Ok(DiffMode::Btc),
            "neoScrypt" => Ok(DiffMode::NeoScrypt),
            _ => Err(format!("Unknown difficulty calculation mode: \"{}\"", s)),
        }
    }
}

/// How the coinbase transaction is hashed before merkle folding
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MerkleMode {
    /// Double SHA-256 of the coinbase, the common case
    #[serde(rename = "SHA256D")]
    Sha256d,
    /// Single SHA-256 of the coinbase
    #[serde(rename = "singleSHA256")]
    SingleSha256,
}

impl FromStr for MerkleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA256D" => Ok(MerkleMode::Sha256d),
            "singleSHA256" => Ok(MerkleMode::SingleSha256),
            _ => Err(format!("Unknown merkle mode: \"{}\"", s)),
        }
    }
}
