//! Identifier and id-zone types
//!
//! Objects are identified by a positive integer `Oid`, assigned at first
//! insert and immutable thereafter. Each data ring declares up to three
//! insert zones over the id space, bounded by monotonically non-decreasing
//! thresholds, plus an optional residue-class shard over the sharded zone.

use serde::{Deserialize, Serialize};

/// Object identifier. Strictly positive for persisted objects; 0 is never
/// a valid id.
pub type Oid = u64;

/// Residue-class predicate `id ≡ offset (mod base)`.
///
/// Rings use one to partition their sharded insert zone; blocks may carry
/// their own, in which case the effective predicate is the intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Residue of the accepted class
    pub offset: u64,
    /// Modulus; must be >= 1
    pub base: u64,
}

impl Shard {
    /// The trivial shard accepting every id
    pub const ALL: Shard = Shard { offset: 0, base: 1 };

    /// Create a shard predicate. `base` must be >= 1.
    pub fn new(offset: u64, base: u64) -> Self {
        assert!(base >= 1, "shard base must be >= 1");
        Shard {
            offset: offset % base,
            base,
        }
    }

    /// Test whether `id` belongs to this residue class
    pub fn matches(&self, id: Oid) -> bool {
        id % self.base == self.offset
    }

    /// Whether some id satisfies both predicates.
    ///
    /// By CRT, the two congruences have a common solution iff the offsets
    /// agree modulo `gcd(base_a, base_b)`; solutions, if any, are infinite,
    /// so a single witness means the classes overlap.
    pub fn overlaps(&self, other: &Shard) -> bool {
        let g = gcd(self.base, other.base);
        self.offset % g == other.offset % g
    }

    /// Smallest id >= `from` in this residue class
    pub fn next_at_or_after(&self, from: Oid) -> Oid {
        let rem = from % self.base;
        if rem == self.offset {
            from
        } else if rem < self.offset {
            from + (self.offset - rem)
        } else {
            from + (self.base - rem) + self.offset
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Insert-zone thresholds of a data ring.
///
/// Three monotonically non-decreasing thresholds produce up to three zones:
///
/// - exclusive zone `[exclusive_min, forbidden_min)`, present iff
///   `exclusive_min` is set;
/// - forbidden zone `[forbidden_min, sharded_min)`, never used for inserts;
/// - sharded zone `[sharded_min, ∞)`, where inserts must satisfy the ring's
///   shard predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertZones {
    /// Lower bound of the exclusive zone (`A`); absent means no exclusive zone
    pub exclusive_min: Option<Oid>,
    /// Lower bound of the forbidden zone (`B`); meaningful only with an
    /// exclusive zone
    pub forbidden_min: Option<Oid>,
    /// Lower bound of the sharded zone (`C`)
    pub sharded_min: Oid,
    /// Shard predicate over the sharded zone; `None` accepts every id there
    pub shard: Option<Shard>,
}

impl InsertZones {
    /// Upper bound (exclusive) of the exclusive zone
    pub fn exclusive_end(&self) -> Oid {
        self.forbidden_min.unwrap_or(self.sharded_min)
    }

    /// The ring's shard, or the trivial all-accepting shard
    pub fn effective_shard(&self) -> Shard {
        self.shard.unwrap_or(Shard::ALL)
    }

    /// Check threshold ordering `A <= B <= C` and shard sanity. Fatal at
    /// ring open.
    pub fn check_ordering(&self) -> std::result::Result<(), String> {
        if let Some(shard) = self.shard {
            if shard.base == 0 {
                return Err("shard base must be >= 1".into());
            }
            if shard.offset >= shard.base {
                return Err(format!(
                    "shard offset {} must be below base {}",
                    shard.offset, shard.base
                ));
            }
        }
        let a = self.exclusive_min;
        let b = self.forbidden_min;
        let c = self.sharded_min;
        if let Some(a) = a {
            let b = b.unwrap_or(c);
            if a > b {
                return Err(format!("exclusive_min {} > forbidden_min {}", a, b));
            }
            if b > c {
                return Err(format!("forbidden_min {} > sharded_min {}", b, c));
            }
        } else if let Some(b) = b {
            if b > c {
                return Err(format!("forbidden_min {} > sharded_min {}", b, c));
            }
        }
        Ok(())
    }

    /// Whether a fresh insert may be assigned `id` in this ring
    pub fn valid_insert_id(&self, id: Oid) -> bool {
        if id == 0 {
            return false;
        }
        if let Some(a) = self.exclusive_min {
            if id >= a && id < self.exclusive_end() {
                return true;
            }
        }
        id >= self.sharded_min && self.effective_shard().matches(id)
    }

    /// Whether the exclusive zone `[A, B)` intersects the interval
    /// `[lo, hi)`; degenerate zones never intersect anything.
    pub fn exclusive_intersects(&self, lo: Oid, hi: Oid) -> bool {
        match self.exclusive_min {
            Some(a) => {
                let b = self.exclusive_end();
                a < b && a < hi && lo < b
            }
            None => false,
        }
    }

    /// Smallest id >= `lo` inside the sharded zone of this ring, if any
    /// below `hi` (exclusive)
    pub fn sharded_witness_below(&self, lo: Oid, hi: Oid) -> Option<Oid> {
        let from = lo.max(self.sharded_min);
        let id = self.effective_shard().next_at_or_after(from);
        if id < hi {
            Some(id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_matches() {
        let s = Shard::new(2, 3);
        assert!(s.matches(2));
        assert!(s.matches(5));
        assert!(!s.matches(3));
        assert!(Shard::ALL.matches(7));
    }

    #[test]
    fn test_shard_next_at_or_after() {
        let s = Shard::new(2, 3);
        assert_eq!(s.next_at_or_after(2), 2);
        assert_eq!(s.next_at_or_after(3), 5);
        assert_eq!(s.next_at_or_after(4), 5);
        assert_eq!(s.next_at_or_after(6), 8);

        let s0 = Shard::new(0, 3);
        assert_eq!(s0.next_at_or_after(1), 3);
        assert_eq!(s0.next_at_or_after(3), 3);
    }

    #[test]
    fn test_shard_overlap() {
        // Same base, different offsets: disjoint
        assert!(!Shard::new(0, 3).overlaps(&Shard::new(1, 3)));
        // Coprime bases always overlap
        assert!(Shard::new(0, 3).overlaps(&Shard::new(1, 4)));
        // gcd(6, 4) = 2: offsets 1 and 3 agree mod 2 -> overlap (e.g. 7)
        assert!(Shard::new(1, 6).overlaps(&Shard::new(3, 4)));
        // offsets 0 and 1 differ mod 2 -> disjoint
        assert!(!Shard::new(0, 6).overlaps(&Shard::new(1, 4)));
        // The trivial shard overlaps everything
        assert!(Shard::ALL.overlaps(&Shard::new(2, 3)));
    }

    #[test]
    fn test_zone_ordering() {
        let zones = InsertZones {
            exclusive_min: Some(1000),
            forbidden_min: Some(2000),
            sharded_min: 2000,
            shard: None,
        };
        assert!(zones.check_ordering().is_ok());

        let bad = InsertZones {
            exclusive_min: Some(3000),
            forbidden_min: Some(2000),
            sharded_min: 2000,
            shard: None,
        };
        assert!(bad.check_ordering().is_err());
    }

    #[test]
    fn test_valid_insert_id() {
        let zones = InsertZones {
            exclusive_min: Some(1000),
            forbidden_min: Some(2000),
            sharded_min: 3000,
            shard: Some(Shard::new(0, 3)),
        };
        // Exclusive zone
        assert!(zones.valid_insert_id(1000));
        assert!(zones.valid_insert_id(1999));
        // Forbidden zone
        assert!(!zones.valid_insert_id(2000));
        assert!(!zones.valid_insert_id(2999));
        // Sharded zone, shard 0 mod 3
        assert!(zones.valid_insert_id(3000));
        assert!(!zones.valid_insert_id(3001));
        assert!(zones.valid_insert_id(3003));
        // Below everything
        assert!(!zones.valid_insert_id(1));
        assert!(!zones.valid_insert_id(0));
    }

    #[test]
    fn test_exclusive_intersects() {
        let zones = InsertZones {
            exclusive_min: Some(100),
            forbidden_min: Some(200),
            sharded_min: 300,
            shard: None,
        };
        assert!(zones.exclusive_intersects(150, 160));
        assert!(zones.exclusive_intersects(0, 101));
        assert!(!zones.exclusive_intersects(200, 400));
        assert!(!zones.exclusive_intersects(0, 100));
    }

    #[test]
    fn test_sharded_witness() {
        let zones = InsertZones {
            exclusive_min: None,
            forbidden_min: None,
            sharded_min: 2000,
            shard: Some(Shard::new(1, 3)),
        };
        // First match at or after 2000 with id % 3 == 1 is 2002
        assert_eq!(zones.sharded_witness_below(0, 10_000), Some(2002));
        assert_eq!(zones.sharded_witness_below(0, 2002), None);
        assert_eq!(zones.sharded_witness_below(2003, 10_000), Some(2005));
    }
}
