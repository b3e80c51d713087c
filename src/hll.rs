// HyperLogLog cardinality sketches for daily per-operator ID counts
use serde::{Deserialize, Serialize};

use crate::shard::hash_content_64bit;

/// log2 of the register count. Fixed so that sketches written by different
/// workers (and different versions) stay mergeable.
pub const LOG2M: u32 = 11;

const NUM_REGISTERS: usize = 1 << LOG2M;

/// Theoretical relative error bound for this register count: 1.04 / sqrt(2^log2m).
pub fn hll_error_bound() -> f64 {
    1.04 / ((1u64 << LOG2M) as f64).sqrt()
}

/// Dense HyperLogLog sketch with 2048 one-byte registers.
///
/// Elements are hashed with SipHash-1-3 (fixed zero key): the low `LOG2M`
/// bits select the register, the rank is the number of trailing zeros of
/// the remaining bits plus one. Union is register-wise max, so merges are
/// commutative and idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hll {
    registers: Vec<u8>,
}

impl Default for Hll {
    fn default() -> Self {
        Hll::new()
    }
}

impl Hll {
    pub fn new() -> Self {
        Hll {
            registers: vec![0u8; NUM_REGISTERS],
        }
    }

    /// Add one element to the sketch.
    pub fn add(&mut self, value: &str) {
        self.add_hash(hash_content_64bit(value));
    }

    pub fn add_hash(&mut self, hash: u64) {
        let idx = (hash & (NUM_REGISTERS as u64 - 1)) as usize;
        let rest = hash >> LOG2M;
        // 64 - LOG2M bits remain; an all-zero remainder gets the max rank.
        let rank = if rest == 0 {
            (64 - LOG2M + 1) as u8
        } else {
            (rest.trailing_zeros() + 1) as u8
        };
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Register-wise max merge with another sketch.
    pub fn union(&mut self, other: &Hll) {
        for (r, o) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *o > *r {
                *r = *o;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|r| *r == 0)
    }

    /// Estimated cardinality with the standard small/large range corrections.
    pub fn cardinality(&self) -> f64 {
        let m = NUM_REGISTERS as f64;
        // alpha_m for m >= 128
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let mut sum = 0.0;
        let mut zeros = 0usize;
        for r in &self.registers {
            sum += 1.0 / ((1u64 << *r) as f64);
            if *r == 0 {
                zeros += 1;
            }
        }
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting for the small range
            m * (m / zeros as f64).ln()
        } else if raw > (1.0 / 30.0) * 2f64.powi(64) {
            -(2f64.powi(64)) * (1.0 - raw / 2f64.powi(64)).ln()
        } else {
            raw
        }
    }
}

/// Union a sequence of sketches into a fresh one.
pub fn hll_union_agg<'a, I>(sketches: I) -> Hll
where
    I: IntoIterator<Item = &'a Hll>,
{
    let mut out = Hll::new();
    for s in sketches {
        out.union(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sketch() {
        let hll = Hll::new();
        assert!(hll.is_empty());
        assert_eq!(hll.cardinality().round() as u64, 0);
    }

    #[test]
    fn test_small_counts_exactish() {
        let mut hll = Hll::new();
        for i in 0..100 {
            hll.add(&format!("imei-{}", i));
        }
        let est = hll.cardinality();
        // Linear counting range: should be very close for small sets
        assert!((est - 100.0).abs() < 5.0, "estimate was {}", est);
    }

    #[test]
    fn test_error_bound_large_count() {
        let mut hll = Hll::new();
        let n = 100_000;
        for i in 0..n {
            hll.add(&format!("356938035643{:06}", i));
        }
        let est = hll.cardinality();
        let bound = hll_error_bound();
        let rel_err = (est - n as f64).abs() / n as f64;
        // Allow 3 sigma over the theoretical bound
        assert!(
            rel_err < 3.0 * bound,
            "relative error {} exceeds 3x bound {}",
            rel_err,
            bound
        );
    }

    #[test]
    fn test_duplicates_do_not_inflate() {
        let mut hll = Hll::new();
        for _ in 0..10 {
            for i in 0..50 {
                hll.add(&format!("imsi-{}", i));
            }
        }
        let est = hll.cardinality();
        assert!((est - 50.0).abs() < 5.0, "estimate was {}", est);
    }

    #[test]
    fn test_union_matches_combined() {
        let mut a = Hll::new();
        let mut b = Hll::new();
        let mut combined = Hll::new();
        for i in 0..500 {
            a.add(&format!("a-{}", i));
            combined.add(&format!("a-{}", i));
        }
        for i in 0..500 {
            b.add(&format!("b-{}", i));
            combined.add(&format!("b-{}", i));
        }
        let mut unioned = a.clone();
        unioned.union(&b);
        assert_eq!(unioned, combined);
    }

    #[test]
    fn test_union_idempotent() {
        let mut a = Hll::new();
        for i in 0..100 {
            a.add(&format!("x-{}", i));
        }
        let mut twice = a.clone();
        twice.union(&a);
        assert_eq!(twice, a);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut a = Hll::new();
        for i in 0..1000 {
            a.add(&format!("msisdn-{}", i));
        }
        let bytes = bincode::serialize(&a).unwrap();
        let back: Hll = bincode::deserialize(&bytes).unwrap();
        assert_eq!(a, back);
    }
}
