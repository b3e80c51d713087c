// IMEI normalization and virtual/physical shard addressing
use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Total number of virtual IMEI shards. Physical shards each cover a
/// contiguous range of these.
pub const NUM_VIRT_SHARDS: u64 = 100;

/// Normalize a raw IMEI: keep the first 14 characters uppercased, dropping
/// the check digit / SVN. Values shorter than 14 characters are uppercased
/// whole.
pub fn normalize_imei(imei: &str) -> String {
    if imei.chars().count() > 14 {
        imei.chars().take(14).collect::<String>().to_uppercase()
    } else {
        imei.to_uppercase()
    }
}

/// Basic string hash: start from 7, multiply by 31 and add each UTF-8 byte,
/// reduced mod 2^63 - 1. Trivially reproducible in any language, so every
/// component that needs to agree on shard placement can compute it.
pub fn hash_string_64bit(s: &str) -> u64 {
    const MODULUS: u128 = (1u128 << 63) - 1;
    let mut hash: u128 = 7;
    for b in s.as_bytes() {
        hash = (hash * 31 + *b as u128) % MODULUS;
    }
    hash as u64
}

/// 64-bit content hash for HLL elements. SipHash-1-3 with a fixed zero key
/// so sketches stay mergeable across writers and versions.
pub fn hash_content_64bit(s: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// Hash of an (imei_norm, imsi, msisdn) triplet with NULLs distinguished
/// from empty strings and from each other.
pub fn hash_triplet(imei_norm: Option<&str>, imsi: Option<&str>, msisdn: Option<&str>) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    for part in [imei_norm, imsi, msisdn] {
        match part {
            Some(v) => {
                hasher.write_u8(1);
                hasher.write(v.as_bytes());
            }
            None => hasher.write_u8(0),
        }
    }
    hasher.finish()
}

/// Virtual shard in [0, 100) for a normalized IMEI. NULL IMEIs are treated
/// as the empty string so that every staging row has a home shard.
pub fn calc_virt_imei_shard(imei_norm: Option<&str>) -> u32 {
    (hash_string_64bit(imei_norm.unwrap_or("")) % NUM_VIRT_SHARDS) as u32
}

/// Virtual IMEI shard ranges covered by each physical shard: N half-open
/// contiguous intervals over [0, 100) whose lengths differ by at most one.
pub fn virt_imei_shard_bounds(num_physical_shards: u32) -> Vec<(u32, u32)> {
    assert!(num_physical_shards >= 1 && num_physical_shards <= 100);
    let k = 100 / num_physical_shards;
    let m = 100 % num_physical_shards;
    (0..num_physical_shards)
        .map(|i| (i * k + i.min(m), (i + 1) * k + (i + 1).min(m)))
        .collect()
}

/// Name of the physical shard partition covering [range_start, range_end).
pub fn imei_shard_name(base_name: &str, range_start: u32, range_end: u32) -> String {
    let name = format!("{}_{}_{}", base_name, range_start, range_end - 1);
    assert!(name.len() < 64, "shard name too long: {}", name);
    name
}
