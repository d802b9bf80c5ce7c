// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Inference Flight Record (IFR) codec.
//
// V2 is a fixed 136-byte record whose trailing 32 bytes are the SHA-256 of
// everything before them. V3 extends the scheme with a hash chain: a record
// hash over the first 180 bytes plus a chain hash binding the previous
// record's chain hash and the sealing digests. Signature bytes are carried
// but not verified here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::proto::{timestamp_usec, IFR_MAGIC};

pub const IFR_VERSION_V2: u16 = 2;
pub const IFR_VERSION_V3: u16 = 3;
pub const IFR_PROFILE_MAX: usize = 16;

pub const IFR_V2_SIZE: usize = 136;
pub const IFR_V2_HASH_OFFSET: usize = 104;
pub const IFR_V3_SIZE: usize = 308;
pub const IFR_V3_HASH_OFFSET: usize = 180;

/// Parsed V2 record.
#[derive(Debug, Clone, PartialEq)]
pub struct IfrV2 {
    pub flags: u16,
    pub job_id: u32,
    pub episode_id: u32,
    pub model_id: u32,
    pub record_size: u32,
    pub ts_usec: u64,
    pub goodput: f32,
    pub profile_len: u16,
    pub profile: Vec<f32>,
    pub hash: [u8; 32],
    pub hash_ok: bool,
}

/// Parsed V3 record.
#[derive(Debug, Clone, PartialEq)]
pub struct IfrV3 {
    pub flags: u16,
    pub record_size: u32,
    pub job_id: u32,
    pub episode_id: u32,
    pub model_id: u32,
    pub ts_usec: u64,
    pub goodput: f32,
    pub nonce: [u8; 16],
    pub model_digest: [u8; 32],
    pub policy_digest: [u8; 32],
    pub flightrec_seal_hash: [u8; 32],
    pub prev_chain_hash: [u8; 32],
    pub ifr_hash: [u8; 32],
    pub chain_hash: [u8; 32],
    pub sig_classical: [u8; 64],
    pub ifr_ok: bool,
    pub chain_ok: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IfrRecord {
    V2(IfrV2),
    V3(IfrV3),
}

impl IfrRecord {
    pub fn version(&self) -> u16 {
        match self {
            Self::V2(_) => IFR_VERSION_V2,
            Self::V3(_) => IFR_VERSION_V3,
        }
    }

    pub fn job_id(&self) -> u32 {
        match self {
            Self::V2(r) => r.job_id,
            Self::V3(r) => r.job_id,
        }
    }

    pub fn episode_id(&self) -> u32 {
        match self {
            Self::V2(r) => r.episode_id,
            Self::V3(r) => r.episode_id,
        }
    }

    pub fn model_id(&self) -> u32 {
        match self {
            Self::V2(r) => r.model_id,
            Self::V3(r) => r.model_id,
        }
    }

    pub fn record_size(&self) -> u32 {
        match self {
            Self::V2(r) => r.record_size,
            Self::V3(r) => r.record_size,
        }
    }

    /// Overall integrity verdict: the V2 hash, or both V3 equalities.
    pub fn hash_ok(&self) -> bool {
        match self {
            Self::V2(r) => r.hash_ok,
            Self::V3(r) => r.ifr_ok && r.chain_ok,
        }
    }

    /// Human-readable projection. `serde_json::Map` is a BTreeMap, so keys
    /// come out sorted; digests are lowercase hex.
    pub fn to_json(&self) -> Value {
        let mut map: BTreeMap<&str, Value> = BTreeMap::new();
        match self {
            Self::V2(r) => {
                map.insert("version", json!(IFR_VERSION_V2));
                map.insert("flags", json!(r.flags));
                map.insert("job_id", json!(r.job_id));
                map.insert("episode_id", json!(r.episode_id));
                map.insert("model_id", json!(r.model_id));
                map.insert("record_size", json!(r.record_size));
                map.insert("ts_usec", json!(r.ts_usec));
                map.insert("goodput", json!(r.goodput));
                map.insert("profile_len", json!(r.profile_len));
                map.insert("profile", json!(r.profile));
                map.insert("hash", json!(hex::encode(r.hash)));
                map.insert("hash_ok", json!(r.hash_ok));
            }
            Self::V3(r) => {
                map.insert("version", json!(IFR_VERSION_V3));
                map.insert("flags", json!(r.flags));
                map.insert("job_id", json!(r.job_id));
                map.insert("episode_id", json!(r.episode_id));
                map.insert("model_id", json!(r.model_id));
                map.insert("record_size", json!(r.record_size));
                map.insert("ts_usec", json!(r.ts_usec));
                map.insert("goodput", json!(r.goodput));
                map.insert("nonce", json!(hex::encode(r.nonce)));
                map.insert("model_digest", json!(hex::encode(r.model_digest)));
                map.insert("policy_digest", json!(hex::encode(r.policy_digest)));
                map.insert(
                    "flightrec_seal_hash",
                    json!(hex::encode(r.flightrec_seal_hash)),
                );
                map.insert("prev_chain_hash", json!(hex::encode(r.prev_chain_hash)));
                map.insert("ifr_hash", json!(hex::encode(r.ifr_hash)));
                map.insert("chain_hash", json!(hex::encode(r.chain_hash)));
                map.insert("sig_classical", json!(hex::encode(r.sig_classical)));
                map.insert("hash_ok", json!(r.ifr_ok && r.chain_ok));
                map.insert("chain_ok", json!(r.chain_ok));
            }
        }
        json!(map)
    }
}

fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

fn f32_at(data: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn bytes_at<const N: usize>(data: &[u8], off: usize) -> [u8; N] {
    let mut b = [0u8; N];
    b.copy_from_slice(&data[off..off + N]);
    b
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Parse and verify an IFR record. Returns `None` for anything that is not
/// a well-formed record; a well-formed record with a failing hash parses
/// with `hash_ok = false`.
pub fn parse_ifr(data: &[u8]) -> Option<IfrRecord> {
    if data.len() < 8 {
        return None;
    }
    if u32_at(data, 0) != IFR_MAGIC {
        return None;
    }

    match u16_at(data, 4) {
        IFR_VERSION_V2 if data.len() >= IFR_V2_SIZE => parse_v2(data),
        IFR_VERSION_V3 if data.len() >= IFR_V3_SIZE => parse_v3(data),
        _ => None,
    }
}

fn parse_v2(data: &[u8]) -> Option<IfrRecord> {
    let record_size = u32_at(data, 20);
    let profile_len = u16_at(data, 36);
    if record_size as usize != IFR_V2_SIZE || profile_len as usize > IFR_PROFILE_MAX {
        return None;
    }

    let mut profile = Vec::with_capacity(profile_len as usize);
    for i in 0..profile_len as usize {
        profile.push(f32_at(data, 40 + i * 4));
    }

    let hash: [u8; 32] = bytes_at(data, IFR_V2_HASH_OFFSET);
    let hash_ok = sha256(&data[..IFR_V2_HASH_OFFSET]) == hash;

    Some(IfrRecord::V2(IfrV2 {
        flags: u16_at(data, 6),
        job_id: u32_at(data, 8),
        episode_id: u32_at(data, 12),
        model_id: u32_at(data, 16),
        record_size,
        ts_usec: u64_at(data, 24),
        goodput: f32_at(data, 32),
        profile_len,
        profile,
        hash,
        hash_ok,
    }))
}

fn parse_v3(data: &[u8]) -> Option<IfrRecord> {
    let record_size = u32_at(data, 8);
    if record_size as usize != IFR_V3_SIZE {
        return None;
    }

    let nonce: [u8; 16] = bytes_at(data, 36);
    let model_digest: [u8; 32] = bytes_at(data, 52);
    let policy_digest: [u8; 32] = bytes_at(data, 84);
    let flightrec_seal_hash: [u8; 32] = bytes_at(data, 116);
    let prev_chain_hash: [u8; 32] = bytes_at(data, 148);
    let ifr_hash: [u8; 32] = bytes_at(data, IFR_V3_HASH_OFFSET);
    let chain_hash: [u8; 32] = bytes_at(data, 212);
    let sig_classical: [u8; 64] = bytes_at(data, 244);

    let ifr_ok = sha256(&data[..IFR_V3_HASH_OFFSET]) == ifr_hash;

    let mut ctx = Sha256::new();
    ctx.update(prev_chain_hash);
    ctx.update(ifr_hash);
    ctx.update(flightrec_seal_hash);
    ctx.update(nonce);
    ctx.update(model_digest);
    ctx.update(policy_digest);
    let expected_chain: [u8; 32] = ctx.finalize().into();
    let chain_ok = expected_chain == chain_hash;

    Some(IfrRecord::V3(IfrV3 {
        flags: u16_at(data, 6),
        record_size,
        job_id: u32_at(data, 12),
        episode_id: u32_at(data, 16),
        model_id: u32_at(data, 20),
        ts_usec: u64_at(data, 24),
        goodput: f32_at(data, 32),
        nonce,
        model_digest,
        policy_digest,
        flightrec_seal_hash,
        prev_chain_hash,
        ifr_hash,
        chain_hash,
        sig_classical,
        ifr_ok,
        chain_ok,
    }))
}

/// Persist a record as `ifr-<job>-<episode>-<unix>.bin` (raw record bytes)
/// and a sibling `.json` projection. Returns both paths.
pub fn persist_record(dir: &Path, raw: &[u8], record: &IfrRecord) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let stem = format!(
        "ifr-{}-{}-{}",
        record.job_id(),
        record.episode_id(),
        timestamp_usec() / 1_000_000
    );
    let bin_path = dir.join(format!("{stem}.bin"));
    let json_path = dir.join(format!("{stem}.json"));

    let record_len = (record.record_size() as usize).min(raw.len());
    std::fs::write(&bin_path, &raw[..record_len])?;

    let json = serde_json::to_string_pretty(&record.to_json())
        .map_err(|e| crate::error::BridgeError::Decode(e.to_string()))?;
    std::fs::write(&json_path, json)?;

    Ok((bin_path, json_path))
}

// ---------------------------------------------------------------------------
// Record builders (tests and the demo peer)
// ---------------------------------------------------------------------------

/// Build a V2 record with a correct trailing hash.
pub fn build_v2(job_id: u32, episode_id: u32, model_id: u32, profile: &[f32]) -> Vec<u8> {
    assert!(profile.len() <= IFR_PROFILE_MAX);
    let mut buf = vec![0u8; IFR_V2_SIZE];
    buf[0..4].copy_from_slice(&IFR_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&IFR_VERSION_V2.to_le_bytes());
    buf[8..12].copy_from_slice(&job_id.to_le_bytes());
    buf[12..16].copy_from_slice(&episode_id.to_le_bytes());
    buf[16..20].copy_from_slice(&model_id.to_le_bytes());
    buf[20..24].copy_from_slice(&(IFR_V2_SIZE as u32).to_le_bytes());
    buf[24..32].copy_from_slice(&timestamp_usec().to_le_bytes());
    buf[32..36].copy_from_slice(&1.0f32.to_le_bytes());
    buf[36..38].copy_from_slice(&(profile.len() as u16).to_le_bytes());
    for (i, v) in profile.iter().enumerate() {
        buf[40 + i * 4..44 + i * 4].copy_from_slice(&v.to_le_bytes());
    }
    let hash = sha256(&buf[..IFR_V2_HASH_OFFSET]);
    buf[IFR_V2_HASH_OFFSET..IFR_V2_SIZE].copy_from_slice(&hash);
    buf
}

/// Build a V3 record with correct record and chain hashes.
pub fn build_v3(
    job_id: u32,
    episode_id: u32,
    model_id: u32,
    prev_chain_hash: [u8; 32],
) -> Vec<u8> {
    let mut buf = vec![0u8; IFR_V3_SIZE];
    buf[0..4].copy_from_slice(&IFR_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&IFR_VERSION_V3.to_le_bytes());
    buf[8..12].copy_from_slice(&(IFR_V3_SIZE as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&job_id.to_le_bytes());
    buf[16..20].copy_from_slice(&episode_id.to_le_bytes());
    buf[20..24].copy_from_slice(&model_id.to_le_bytes());
    buf[24..32].copy_from_slice(&timestamp_usec().to_le_bytes());
    buf[32..36].copy_from_slice(&1.0f32.to_le_bytes());
    // nonce and digests: deterministic fill so records differ per episode
    for (i, b) in buf[36..52].iter_mut().enumerate() {
        *b = (episode_id as u8).wrapping_add(i as u8);
    }
    buf[148..180].copy_from_slice(&prev_chain_hash);

    let ifr_hash = sha256(&buf[..IFR_V3_HASH_OFFSET]);
    buf[180..212].copy_from_slice(&ifr_hash);

    let mut ctx = Sha256::new();
    ctx.update(prev_chain_hash);
    ctx.update(ifr_hash);
    ctx.update(&buf[116..148]); // flightrec_seal_hash
    ctx.update(&buf[36..52]); // nonce
    ctx.update(&buf[52..84]); // model_digest
    ctx.update(&buf[84..116]); // policy_digest
    let chain_hash: [u8; 32] = ctx.finalize().into();
    buf[212..244].copy_from_slice(&chain_hash);
    buf
}
