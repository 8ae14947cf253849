//! Fixed-width bitsets for component presence, change tracking, and query
//! masks.
//!
//! Wraps `bit_set::BitSet` with the set-algebra operations the query engine
//! and planner need (`ComponentMask::matches`, `ComponentMask::intersects`)
//! instead of exposing the raw bitset directly.

use bit_set::BitSet;

/// A growable bitset indexed by entity index or component-type id.
#[derive(Debug, Clone, Default)]
pub struct Bitset {
    bits: BitSet,
}

impl Bitset {
    pub fn new() -> Self {
        Bitset { bits: BitSet::new() }
    }

    pub fn with_capacity(bits: usize) -> Self {
        Bitset {
            bits: BitSet::with_capacity(bits),
        }
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        self.bits.insert(index);
    }

    #[inline]
    pub fn clear_bit(&mut self, index: usize) {
        self.bits.remove(index);
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.bits.contains(index)
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter()
    }

    pub fn union_with(&mut self, other: &Bitset) {
        self.bits.union_with(&other.bits);
    }

    pub fn intersect_with(&mut self, other: &Bitset) {
        self.bits.intersect_with(&other.bits);
    }

    pub fn difference_with(&mut self, other: &Bitset) {
        self.bits.difference_with(&other.bits);
    }

    pub fn intersects(&self, other: &Bitset) -> bool {
        self.bits.iter().any(|i| other.bits.contains(i))
    }
}

/// A compiled `with ∧ ¬without` filter over component-presence bitsets.
/// `matches` is the hot-path predicate used both for on-demand query
/// evaluation and for re-testing membership when the shape journal is
/// flushed.
#[derive(Debug, Clone, Default)]
pub struct ComponentMask {
    pub with: Bitset,
    pub without: Bitset,
}

impl ComponentMask {
    pub fn new() -> Self {
        ComponentMask::default()
    }

    pub fn require(mut self, type_idx: usize) -> Self {
        self.with.set(type_idx);
        self
    }

    pub fn exclude(mut self, type_idx: usize) -> Self {
        self.without.set(type_idx);
        self
    }

    /// `presence ⊇ with ∧ presence ∩ without = ∅`.
    pub fn matches(&self, presence: &Bitset) -> bool {
        for bit in self.with.iter() {
            if !presence.get(bit) {
                return false;
            }
        }
        for bit in self.without.iter() {
            if presence.get(bit) {
                return false;
            }
        }
        true
    }

    /// The trigger set: component bits that can flip this filter's result.
    pub fn trigger_set(&self) -> Bitset {
        let mut bits = self.with.clone();
        bits.union_with(&self.without);
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_matches_with_and_without() {
        let mask = ComponentMask::new().require(0).require(2).exclude(1);
        let mut presence = Bitset::new();
        presence.set(0);
        presence.set(2);
        assert!(mask.matches(&presence));
        presence.set(1);
        assert!(!mask.matches(&presence));
    }

    #[test]
    fn union_and_intersection() {
        let mut a = Bitset::new();
        a.set(0);
        a.set(1);
        let mut b = Bitset::new();
        b.set(1);
        b.set(2);
        assert!(a.intersects(&b));
        let mut c = a.clone();
        c.intersect_with(&b);
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![1]);
    }
}
