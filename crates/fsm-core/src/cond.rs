//! Interned condition spaces and bitmask arithmetic over them.
//!
//! A condition space is a set of boolean guards (condition actions). A
//! concrete condition value is an n-bit mask: value `v` satisfies guard
//! `g` iff `v & (1 << pos(g))`, where a guard's position is its index in
//! the space's sorted guard set. Spaces are interned per context and
//! outlive the machines that reference them.

use crate::action::ActionId;

/// A concrete assignment of the guards of one condition space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct CondVal(pub u32);

/// Index into the context's interned condition-space arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CondSpaceId(pub u32);

/// Guard-count ceiling for a single space. A merged space past this limit
/// aborts the operation with `TransDensity`.
pub const COND_DENSITY_LIMIT: usize = 16;

/// Replication budget per cost id for cost-marked guards.
pub const COND_COST_LIMIT: i64 = 1 << 16;

/// An interned set of boolean guards, sorted by action id. Position in
/// the set is the guard's bit position.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CondSpace {
    pub cond_set: Vec<ActionId>,
}

impl CondSpace {
    pub fn full_size(&self) -> u64 {
        1u64 << self.cond_set.len()
    }

    pub fn pos_of(&self, action: ActionId) -> Option<usize> {
        self.cond_set.binary_search(&action).ok()
    }
}

/// Sorted union of two guard sets.
pub fn merge_cond_sets(a: &[ActionId], b: &[ActionId]) -> Vec<ActionId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if b[j] < a[i] {
            out.push(b[j]);
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Reposition the bits of `val` from `old_set` into `new_set`, leaving the
/// bits of guards absent from `old_set` clear. `old_set` must be a subset
/// of `new_set`.
pub fn translate_value(val: CondVal, old_set: &[ActionId], new_set: &[ActionId]) -> CondVal {
    let mut out = 0u32;
    for (old_pos, guard) in old_set.iter().enumerate() {
        if val.0 & (1 << old_pos) != 0 {
            let new_pos = new_set
                .binary_search(guard)
                .expect("guard missing from expanded condition space");
            out |= 1 << new_pos;
        }
    }
    CondVal(out)
}

/// Project `val` from `full_set` down onto `sub_set`, dropping the bits
/// of guards outside the subset.
pub fn project_value(val: CondVal, full_set: &[ActionId], sub_set: &[ActionId]) -> CondVal {
    let mut out = 0u32;
    for (sub_pos, guard) in sub_set.iter().enumerate() {
        let full_pos = full_set
            .binary_search(guard)
            .expect("guard missing from enclosing condition space");
        if val.0 & (1 << full_pos) != 0 {
            out |= 1 << sub_pos;
        }
    }
    CondVal(out)
}

/// Cartesian-product expansion of one value from `old_set` into
/// `new_set`: the translated base value replicated over every assignment
/// of the guards present only in `new_set`. Sorted ascending.
pub fn expansion_values(val: CondVal, old_set: &[ActionId], new_set: &[ActionId]) -> Vec<CondVal> {
    let base = translate_value(val, old_set, new_set);
    let free: Vec<usize> = new_set
        .iter()
        .enumerate()
        .filter(|(_, g)| old_set.binary_search(g).is_err())
        .map(|(pos, _)| pos)
        .collect();

    let mut out = Vec::with_capacity(1 << free.len());
    for combo in 0u32..(1 << free.len()) {
        let mut v = base.0;
        for (i, pos) in free.iter().enumerate() {
            if combo & (1 << i) != 0 {
                v |= 1 << pos;
            }
        }
        out.push(CondVal(v));
    }
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u32]) -> Vec<ActionId> {
        v.iter().map(|&i| ActionId(i)).collect()
    }

    #[test]
    fn test_merge_cond_sets() {
        let merged = merge_cond_sets(&ids(&[0, 2]), &ids(&[1, 2, 5]));
        assert_eq!(merged, ids(&[0, 1, 2, 5]));
    }

    #[test]
    fn test_translate_value_repositions_bits() {
        // Guard 5 sits at position 1 in {0,5} but position 2 in {0,1,5}.
        let old = ids(&[0, 5]);
        let new = ids(&[0, 1, 5]);
        assert_eq!(translate_value(CondVal(0b10), &old, &new), CondVal(0b100));
        assert_eq!(translate_value(CondVal(0b01), &old, &new), CondVal(0b001));
    }

    #[test]
    fn test_expansion_doubles_per_new_guard() {
        let old = ids(&[1, 2]);
        let new = ids(&[1, 2, 3]);
        // Value 0b11 over {1,2} expands over guard 3 free bit.
        let vals = expansion_values(CondVal(0b11), &old, &new);
        assert_eq!(vals, vec![CondVal(0b011), CondVal(0b111)]);
    }

    #[test]
    fn test_project_value_inverts_expansion() {
        let old = ids(&[1, 2]);
        let new = ids(&[1, 2, 3]);
        for v in expansion_values(CondVal(0b10), &old, &new) {
            assert_eq!(project_value(v, &new, &old), CondVal(0b10));
        }
    }
}
