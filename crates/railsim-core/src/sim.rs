//! Simulation time and state hashing.
//!
//! Time is continuous and measured in seconds. The kernel orders events by
//! `(time, revision)`, so time needs a total order; [`OrderedTime`] provides
//! one through `f64::total_cmp`.

use std::cmp::Ordering;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Simulation time in seconds.
pub type SimTime = f64;

/// A time value with a total order, usable as a map key.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct OrderedTime(pub SimTime);

impl PartialEq for OrderedTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrderedTime {}

impl PartialOrd for OrderedTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of simulation state for replay verification.
///
/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Start a new hash.
    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    /// Feed an f64 by its bit pattern, so `-0.0` and `0.0` hash differently.
    pub fn write_f64(&mut self, v: f64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write(&[v as u8]);
    }

    /// Finalize and return the hash value.
    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn ordered_time_sorts_numerically() {
        let set: BTreeSet<OrderedTime> = [3.5, -1.0, 0.0, 42.0]
            .into_iter()
            .map(OrderedTime)
            .collect();
        let sorted: Vec<f64> = set.into_iter().map(|t| t.0).collect();
        assert_eq!(sorted, vec![-1.0, 0.0, 3.5, 42.0]);
    }

    #[test]
    fn ordered_time_tuple_breaks_ties_with_second_key() {
        let a = (OrderedTime(1.0), 2u64);
        let b = (OrderedTime(1.0), 1u64);
        assert!(b < a);
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        h1.write_f64(7.25);

        let mut h2 = StateHash::new();
        h2.write_u64(42);
        h2.write_f64(7.25);

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_order_matters() {
        let mut h1 = StateHash::new();
        h1.write_u32(1);
        h1.write_u32(2);

        let mut h2 = StateHash::new();
        h2.write_u32(2);
        h2.write_u32(1);

        assert_ne!(h1.finish(), h2.finish());
    }
}
