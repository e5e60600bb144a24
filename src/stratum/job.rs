// src/stratum/job.rs
//! Job templates and difficulty arithmetic
//!
//! A `mining.notify` turns into a [`JobTemplate`]; combined with the
//! session's extranonce and a chosen extranonce2 it yields the 76-byte
//! header base the compute backend scans. Difficulty handling is
//! parameterized twice per pool: `diffMode` picks the difficulty-one
//! constant, `diffMultipliers` scale the announced and reported values.

use crate::config::DiffMultipliers;
use crate::types::{DiffMode, MerkleMode};
use crate::utils::error::MinerError;
use crate::miner::algorithm::{sha256, sha256d};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde_json::Value;

/// One unit of work from a pool, as announced by `mining.notify`
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub id: String,
    pub prev_hash: [u8; 32],
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
}

impl JobTemplate {
    /// Parses the nine `mining.notify` params
    pub fn from_notify(params: &[Value]) -> Result<JobTemplate, MinerError> {
        if params.len() < 9 {
            return Err(MinerError::ProtocolError(format!(
                "mining.notify carries {} params, expected 9",
                params.len()
            )));
        }
        fn text<'a>(params: &'a [Value], index: usize, what: &str) -> Result<&'a str, MinerError> {
            params[index]
                .as_str()
                .ok_or_else(|| MinerError::ProtocolError(format!("mining.notify: bad {}", what)))
        }

        let id = text(params, 0, "job id")?.to_string();
        let prev_hash = fixed32(text(params, 1, "prevhash")?)?;
        let coinb1 = hex::decode(text(params, 2, "coinb1")?)?;
        let coinb2 = hex::decode(text(params, 3, "coinb2")?)?;
        let branch = params[4]
            .as_array()
            .ok_or_else(|| MinerError::ProtocolError("mining.notify: bad merkle branch".into()))?;
        let mut merkle_branch = Vec::with_capacity(branch.len());
        for node in branch {
            let node = node.as_str().ok_or_else(|| {
                MinerError::ProtocolError("mining.notify: bad merkle branch entry".into())
            })?;
            merkle_branch.push(fixed32(node)?);
        }
        let version = hex_u32(text(params, 5, "version")?)?;
        let nbits = hex_u32(text(params, 6, "nbits")?)?;
        let ntime = hex_u32(text(params, 7, "ntime")?)?;
        let clean_jobs = params[8].as_bool().unwrap_or(false);

        Ok(JobTemplate {
            id,
            prev_hash,
            coinb1,
            coinb2,
            merkle_branch,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }

    /// Computes the merkle root for one coinbase instantiation
    ///
    /// The coinbase is `coinb1 ∥ extranonce1 ∥ extranonce2 ∥ coinb2`, hashed
    /// per the pool's merkle mode, then folded with the branch nodes using
    /// double SHA-256.
    pub fn merkle_root(
        &self,
        extranonce1: &[u8],
        extranonce2: &[u8],
        mode: MerkleMode,
    ) -> [u8; 32] {
        let mut coinbase =
            Vec::with_capacity(self.coinb1.len() + extranonce1.len() + extranonce2.len() + self.coinb2.len());
        coinbase.extend_from_slice(&self.coinb1);
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&self.coinb2);

        let mut hash = match mode {
            MerkleMode::Sha256d => sha256d(&coinbase),
            MerkleMode::SingleSha256 => sha256(&coinbase),
        };
        for node in &self.merkle_branch {
            let mut pair = [0u8; 64];
            pair[..32].copy_from_slice(&hash);
            pair[32..].copy_from_slice(node);
            hash = sha256d(&pair);
        }
        hash
    }

    /// Lays out the 76-byte header base the nonce gets appended to
    pub fn header_base(&self, merkle_root: &[u8; 32]) -> [u8; 76] {
        let mut header = [0u8; 76];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(merkle_root);
        header[68..72].copy_from_slice(&self.ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.nbits.to_le_bytes());
        header
    }

    /// Expands the compact `nbits` into the 256-bit network target
    pub fn network_target(&self) -> [u8; 32] {
        let exponent = (self.nbits >> 24) as i64;
        let mantissa = BigUint::from(self.nbits & 0x00FF_FFFF);
        let target = if exponent <= 3 {
            mantissa >> (8 * (3 - exponent) as u64)
        } else {
            mantissa << (8 * (exponent - 3) as u64)
        };
        to_be_32(&target)
    }
}

/// Derives the share target for an announced difficulty
///
/// # Returns
/// The 256-bit big-endian target plus the effective difficulty the target
/// corresponds to after the stratum multiplier.
pub fn target_from_diff(
    announced: f64,
    mode: DiffMode,
    muls: &DiffMultipliers,
) -> ([u8; 32], f64) {
    let effective = (announced * muls.stratum / muls.one).max(1e-12);
    let one = diff_one(mode);
    // Fixed-point divide keeps precision for fractional difficulties.
    let denominator = (effective * 4_294_967_296.0).max(1.0) as u128;
    let target = (one << 32u32) / BigUint::from(denominator);
    (to_be_32(&target), announced * muls.stratum)
}

/// Difficulty actually reached by a hash, scaled against its share target
///
/// Both values are big-endian 256-bit numbers; the ratio against the target
/// scales the target difficulty up to what this hash would have met.
pub fn scaled_hash_diff(value: &[u8; 32], target: &[u8; 32], target_diff: f64) -> f64 {
    let value = BigUint::from_bytes_be(value);
    if value == BigUint::default() {
        return f64::MAX;
    }
    let target = BigUint::from_bytes_be(target);
    let ratio = target.to_f64().unwrap_or(f64::MAX) / value.to_f64().unwrap_or(f64::MAX);
    target_diff * ratio
}

/// Encodes an extranonce2 value into the pool-announced byte width
///
/// Big-endian, so the bytes hex-encode to the same string `mining.submit`
/// sends for this value.
pub fn extranonce2_bytes(nonce2: u32, size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size];
    let be = nonce2.to_be_bytes();
    let take = size.min(4);
    out[size - take..].copy_from_slice(&be[4 - take..]);
    out
}

fn diff_one(mode: DiffMode) -> BigUint {
    match mode {
        DiffMode::Btc => BigUint::from(0xFFFFu32) << 208u32,
        DiffMode::NeoScrypt => BigUint::from(0xFFFFu32) << 224u32,
    }
}

fn to_be_32(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return [0xFF; 32];
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn fixed32(hex_text: &str) -> Result<[u8; 32], MinerError> {
    let bytes = hex::decode(hex_text)?;
    if bytes.len() != 32 {
        return Err(MinerError::ProtocolError(format!(
            "expected a 32 byte hex field, got {} bytes",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn hex_u32(hex_text: &str) -> Result<u32, MinerError> {
    u32::from_str_radix(hex_text, 16)
        .map_err(|e| MinerError::ProtocolError(format!("bad hex integer \"{}\": {}", hex_text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_notify() -> Vec<Value> {
        serde_json::json!([
            "ae6812eb4cd7735a302a8a9dd95cf71f",
            "e2b5bc4ed02e8d93b1a7739931c9d0a77c0123456789abcdef0123456789abcd",
            "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008",
            "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000",
            ["999d8ecb2b8ab15ed1ca7a1f867eb1ae0127da06efcbf24d002ed7d6f844a2d7"],
            "00000002",
            "1c2ac4af",
            "504e86b9",
            false
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    #[test]
    fn notify_params_parse_into_a_template() {
        let job = JobTemplate::from_notify(&sample_notify()).unwrap();
        assert_eq!(job.id, "ae6812eb4cd7735a302a8a9dd95cf71f");
        assert_eq!(job.version, 2);
        assert_eq!(job.nbits, 0x1c2ac4af);
        assert_eq!(job.ntime, 0x504e86b9);
        assert_eq!(job.merkle_branch.len(), 1);
        assert!(!job.clean_jobs);
    }

    #[test]
    fn short_notify_is_a_protocol_error() {
        let mut params = sample_notify();
        params.truncate(5);
        assert!(JobTemplate::from_notify(&params).is_err());
    }

    #[test]
    fn merkle_root_with_empty_branch_is_the_coinbase_hash() {
        let mut job = JobTemplate::from_notify(&sample_notify()).unwrap();
        job.merkle_branch.clear();
        let xn1 = [0xAAu8; 4];
        let xn2 = [0x01u8, 0x02, 0x03, 0x04];
        let mut coinbase = job.coinb1.clone();
        coinbase.extend_from_slice(&xn1);
        coinbase.extend_from_slice(&xn2);
        coinbase.extend_from_slice(&job.coinb2);

        let double = job.merkle_root(&xn1, &xn2, MerkleMode::Sha256d);
        assert_eq!(double, sha256d(&coinbase));
        let single = job.merkle_root(&xn1, &xn2, MerkleMode::SingleSha256);
        assert_eq!(single, sha256(&coinbase));
        assert_ne!(double, single);
    }

    #[test]
    fn header_base_layout_is_fixed() {
        let job = JobTemplate::from_notify(&sample_notify()).unwrap();
        let root = [0x42u8; 32];
        let header = job.header_base(&root);
        assert_eq!(&header[0..4], &2u32.to_le_bytes());
        assert_eq!(&header[4..36], &job.prev_hash);
        assert_eq!(&header[36..68], &root);
        assert_eq!(&header[68..72], &job.ntime.to_le_bytes());
        assert_eq!(&header[72..76], &job.nbits.to_le_bytes());
    }

    #[test]
    fn compact_bits_expand_to_the_classic_diff_one_target() {
        let mut job = JobTemplate::from_notify(&sample_notify()).unwrap();
        job.nbits = 0x1d00ffff;
        let target = job.network_target();
        let mut expect = [0u8; 32];
        expect[4] = 0xFF;
        expect[5] = 0xFF;
        assert_eq!(target, expect);
    }

    #[test]
    fn unit_difficulty_matches_the_mode_constant() {
        let muls = DiffMultipliers {
            one: 1.0,
            share: 1.0,
            stratum: 1.0,
        };
        let (btc, effective) = target_from_diff(1.0, DiffMode::Btc, &muls);
        assert_eq!(effective, 1.0);
        assert_eq!(BigUint::from_bytes_be(&btc), BigUint::from(0xFFFFu32) << 208u32);

        let (neo, _) = target_from_diff(1.0, DiffMode::NeoScrypt, &muls);
        assert_eq!(
            BigUint::from_bytes_be(&neo),
            BigUint::from(0xFFFFu32) << 224u32
        );
    }

    #[test]
    fn higher_difficulty_means_a_smaller_target() {
        let muls = DiffMultipliers {
            one: 1.0,
            share: 1.0,
            stratum: 1.0,
        };
        let (easy, _) = target_from_diff(1.0, DiffMode::Btc, &muls);
        let (hard, _) = target_from_diff(16.0, DiffMode::Btc, &muls);
        assert!(BigUint::from_bytes_be(&hard) < BigUint::from_bytes_be(&easy));
        // Exactly sixteen times smaller.
        assert_eq!(
            BigUint::from_bytes_be(&hard) * BigUint::from(16u32),
            BigUint::from_bytes_be(&easy)
        );
    }

    #[test]
    fn stratum_multiplier_scales_the_announced_difficulty() {
        let muls = DiffMultipliers {
            one: 1.0,
            share: 1.0,
            stratum: 4.0,
        };
        let (scaled, effective) = target_from_diff(1.0, DiffMode::Btc, &muls);
        let (plain, _) = target_from_diff(
            4.0,
            DiffMode::Btc,
            &DiffMultipliers {
                one: 1.0,
                share: 1.0,
                stratum: 1.0,
            },
        );
        assert_eq!(scaled, plain);
        assert_eq!(effective, 4.0);
    }

    #[test]
    fn extranonce2_bytes_match_the_submit_encoding() {
        assert_eq!(hex::encode(extranonce2_bytes(10, 4)), "0000000a");
        assert_eq!(hex::encode(extranonce2_bytes(0xBEEF, 2)), "beef");
        assert_eq!(
            hex::encode(extranonce2_bytes(7, 8)),
            format!("{:016x}", 7)
        );
    }

    #[test]
    fn hash_on_target_reports_the_target_difficulty() {
        let muls = DiffMultipliers {
            one: 1.0,
            share: 1.0,
            stratum: 1.0,
        };
        let (target, effective) = target_from_diff(8.0, DiffMode::Btc, &muls);
        let diff = scaled_hash_diff(&target, &target, effective);
        assert!((diff - 8.0).abs() < 1e-6);

        // A hash numerically half the target doubles the reported difficulty.
        let half = {
            let value = BigUint::from_bytes_be(&target) >> 1u32;
            let bytes = value.to_bytes_be();
            let mut out = [0u8; 32];
            out[32 - bytes.len()..].copy_from_slice(&bytes);
            out
        };
        let diff = scaled_hash_diff(&half, &target, effective);
        assert!((diff - 16.0).abs() < 1e-5);
    }
}
