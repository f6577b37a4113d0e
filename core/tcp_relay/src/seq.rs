//! Sequence-space arithmetic
//!
//! TCP sequence and acknowledgment numbers live in a circular 32-bit space.
//! Every comparison in the relay goes through the serial-number helpers here
//! (RFC 1982 / RFC 793 §3.3) so bookkeeping keeps working across wrap-around.
//!
//! [`SeqMap`] is the ordered translation cache used for `unachk`, `ackchk`,
//! `rexmit` and `remote_special`. It prunes everything serially below a bound
//! in O(log n) and remembers the highest bound it was ever pruned at, so a
//! stale copy merged back in later cannot resurrect entries.

use std::collections::BTreeMap;

/// Half of the sequence space; the serial comparison horizon
const HALF_SPACE: u32 = 1 << 31;

// ============================================================================
// Serial Arithmetic
// ============================================================================

/// `a < b` in sequence space
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a > b` in sequence space
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// The serially greater of two sequence numbers
#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_lt(a, b) {
        b
    } else {
        a
    }
}

/// Offset a sequence number by a signed byte delta (e.g. a negative hacklen)
#[inline]
pub fn seq_offset(seq: u32, delta: isize) -> u32 {
    seq.wrapping_add(delta as u32)
}

/// Signed distance from `base` to `seq`, for diagnostics
#[inline]
pub fn seq_distance(seq: u32, base: u32) -> i64 {
    seq.wrapping_sub(base) as i32 as i64
}

// ============================================================================
// SeqMap
// ============================================================================

/// Ordered map keyed by sequence number with serial-order pruning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqMap<V> {
    entries: BTreeMap<u32, V>,
    /// Highest bound this map (or any copy it was merged with) was pruned at
    floor: Option<u32>,
}

impl<V> Default for SeqMap<V> {
    fn default() -> Self {
        SeqMap {
            entries: BTreeMap::new(),
            floor: None,
        }
    }
}

impl<V: Clone> SeqMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, seq: u32) -> Option<&V> {
        self.entries.get(&seq)
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn insert(&mut self, seq: u32, value: V) -> Option<V> {
        self.entries.insert(seq, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prune floor, if the map was ever pruned
    pub fn floor(&self) -> Option<u32> {
        self.floor
    }

    /// Iterate in numeric key order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Remove every entry whose key is serially below `bound`.
    ///
    /// The floor only ever moves forward; a bound behind the current floor
    /// re-applies the floor instead. Returns the number of entries removed.
    pub fn prune_below(&mut self, bound: u32) -> usize {
        let floor = match self.floor {
            Some(current) => seq_max(current, bound),
            None => bound,
        };
        self.floor = Some(floor);

        let before = self.entries.len();
        let upper = floor.wrapping_add(HALF_SPACE);

        // Keys that survive are [floor, floor + 2^31) in circular order
        let mut keep = self.entries.split_off(&floor);
        if floor < upper {
            let _ = keep.split_off(&upper);
            self.entries = keep;
        } else {
            // Window wraps: [floor, u32::MAX] ∪ [0, upper)
            let _ = self.entries.split_off(&upper);
            self.entries.append(&mut keep);
        }

        before - self.entries.len()
    }

    /// Union of two copies of the same cache.
    ///
    /// `preferred` wins on key conflicts. The result carries the higher of
    /// the two floors and is pruned at it.
    pub fn merged(preferred: &SeqMap<V>, other: &SeqMap<V>) -> SeqMap<V> {
        let mut out = preferred.clone();
        for (seq, value) in &other.entries {
            out.entries.entry(*seq).or_insert_with(|| value.clone());
        }

        out.floor = match (preferred.floor, other.floor) {
            (Some(a), Some(b)) => Some(seq_max(a, b)),
            (a, b) => a.or(b),
        };
        if let Some(floor) = out.floor {
            out.prune_below(floor);
        }

        out
    }
}

// ============================================================================
// Tests
// ============================================================================
