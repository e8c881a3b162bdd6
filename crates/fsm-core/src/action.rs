//! Named side-effects and the ordered tables that attach them to the graph.
//!
//! Actions live in the context arena and are referenced by [`ActionId`];
//! a table is a sorted vector of `(ordering, id)` pairs with set-insert
//! merge semantics, so combining two tables takes the union by ordering
//! and structural equality is plain vector equality.

use std::cell::Cell;

use crate::error::{FsmError, FsmResult};

/// Index into the context's action arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ActionId(pub u32);

/// Index into the context's longest-match part arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LmId(pub u32);

/// Where in the input text an action was written. Used as the display
/// name when the action itself is unnamed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct InputLoc {
    pub line: u32,
    pub col: u32,
}

/// A named side-effect. Identity is the name; the reference counters are
/// bookkeeping mutated only by the attach/detach/embed helpers and are
/// reported (never recovered) on mismatch.
#[derive(Debug)]
pub struct Action {
    pub name: String,
    pub loc: InputLoc,
    /// Guard id when the action is usable as a boolean condition.
    pub cond_id: Option<u32>,
    pub cost_mark: bool,
    pub cost_id: i64,

    pub num_trans_refs: Cell<i64>,
    pub num_to_state_refs: Cell<i64>,
    pub num_from_state_refs: Cell<i64>,
    pub num_eof_refs: Cell<i64>,
    pub num_cond_refs: Cell<i64>,
    pub num_nfa_refs: Cell<i64>,
}

impl Action {
    pub fn new(name: &str, loc: InputLoc) -> Action {
        Action {
            name: name.to_owned(),
            loc,
            cond_id: None,
            cost_mark: false,
            cost_id: 0,
            num_trans_refs: Cell::new(0),
            num_to_state_refs: Cell::new(0),
            num_from_state_refs: Cell::new(0),
            num_eof_refs: Cell::new(0),
            num_cond_refs: Cell::new(0),
            num_nfa_refs: Cell::new(0),
        }
    }

    /// Name for diagnostic emission: the action's name, or `line:col` for
    /// anonymous blocks.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}:{}", self.loc.line, self.loc.col)
        } else {
            self.name.clone()
        }
    }
}

/// One embedding of an action at a given ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ActionTableEl {
    pub ordering: i32,
    pub action: ActionId,
}

/// Ordered action table. Orderings are unique per machine instantiation,
/// so the sort key is the `(ordering, action)` pair.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ActionTable {
    list: Vec<ActionTableEl>,
}

impl ActionTable {
    pub fn new() -> ActionTable {
        ActionTable { list: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ActionTableEl> {
        self.list.iter()
    }

    pub fn set_action(&mut self, ordering: i32, action: ActionId) {
        let el = ActionTableEl { ordering, action };
        if let Err(pos) = self.list.binary_search(&el) {
            self.list.insert(pos, el);
        }
    }

    /// Union by ordering; later orderings sort after earlier ones.
    pub fn set_actions(&mut self, other: &ActionTable) {
        for el in &other.list {
            self.set_action(el.ordering, el.action);
        }
    }

    pub fn has_action(&self, action: ActionId) -> bool {
        self.list.iter().any(|el| el.action == action)
    }

    /// Shift every ordering so the smallest becomes `from_order` and the
    /// rest follow in units of one. Returns the next free ordering.
    pub fn shift_orderings(&mut self, from_order: i32) -> i32 {
        let mut next = from_order;
        for el in &mut self.list {
            el.ordering = next;
            next += 1;
        }
        next
    }
}

/// Longest-match variant of the action table, keyed the same way.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct LmActionTableEl {
    pub ordering: i32,
    pub lm_part: LmId,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct LmActionTable {
    list: Vec<LmActionTableEl>,
}

impl LmActionTable {
    pub fn new() -> LmActionTable {
        LmActionTable { list: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LmActionTableEl> {
        self.list.iter()
    }

    pub fn set_action(&mut self, ordering: i32, lm_part: LmId) {
        let el = LmActionTableEl { ordering, lm_part };
        if let Err(pos) = self.list.binary_search(&el) {
            self.list.insert(pos, el);
        }
    }

    pub fn set_actions(&mut self, other: &LmActionTable) {
        for el in &other.list {
            self.set_action(el.ordering, el.lm_part);
        }
    }
}

/// Error-action table element. Carries the transfer point encoding where
/// the action moves when error actions are folded onto transitions and
/// the EOF table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ErrActionTableEl {
    pub ordering: i32,
    pub action: ActionId,
    pub transfer_point: i32,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ErrActionTable {
    list: Vec<ErrActionTableEl>,
}

impl ErrActionTable {
    pub fn new() -> ErrActionTable {
        ErrActionTable { list: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ErrActionTableEl> {
        self.list.iter()
    }

    pub fn set_action(&mut self, ordering: i32, action: ActionId, transfer_point: i32) {
        let el = ErrActionTableEl { ordering, action, transfer_point };
        if let Err(pos) = self.list.binary_search(&el) {
            self.list.insert(pos, el);
        }
    }

    pub fn set_actions(&mut self, other: &ErrActionTable) {
        for el in &other.list {
            self.set_action(el.ordering, el.action, el.transfer_point);
        }
    }
}

/// A priority descriptor: the identity object under which two priorities
/// compete. Priorities with different keys never interact.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PriorDesc {
    pub id: u32,
    pub key: i64,
    pub priority: i32,
}

/// An instantiation of a priority on a transition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PriorEl {
    pub ordering: i32,
    pub desc: PriorDesc,
}

/// Set of priorities sorted by descriptor key. At most one entry per key;
/// merging keeps the entry already present.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PriorTable {
    list: Vec<PriorEl>,
}

impl PriorTable {
    pub fn new() -> PriorTable {
        PriorTable { list: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PriorEl> {
        self.list.iter()
    }

    pub fn set_prior(&mut self, ordering: i32, desc: PriorDesc) {
        match self.list.binary_search_by(|el| el.desc.key.cmp(&desc.key)) {
            Ok(_) => {}
            Err(pos) => self.list.insert(pos, PriorEl { ordering, desc }),
        }
    }

    pub fn set_priors(&mut self, other: &PriorTable) {
        for el in &other.list {
            self.set_prior(el.ordering, el.desc);
        }
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }
}

/// Determine the relative priority of two transitions' tables.
///
/// Walks both tables by descriptor key. On the first shared key with
/// differing values the larger value wins; a shared key with equal values
/// under two distinct descriptors is a semantic conflict and aborts the
/// operation with [`FsmError::PriorInteraction`] carrying that key.
pub fn compare_prior(table1: &PriorTable, table2: &PriorTable) -> FsmResult<std::cmp::Ordering> {
    use std::cmp::Ordering;

    let mut it1 = table1.iter().peekable();
    let mut it2 = table2.iter().peekable();
    while let (Some(p1), Some(p2)) = (it1.peek(), it2.peek()) {
        if p1.desc.key < p2.desc.key {
            it1.next();
        } else if p2.desc.key < p1.desc.key {
            it2.next();
        } else {
            if p1.desc.priority < p2.desc.priority {
                return Ok(Ordering::Less);
            } else if p1.desc.priority > p2.desc.priority {
                return Ok(Ordering::Greater);
            } else if p1.desc.id != p2.desc.id {
                return Err(FsmError::PriorInteraction(p1.desc.key));
            }
            it1.next();
            it2.next();
        }
    }
    Ok(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_table_merge_by_ordering() {
        let mut a = ActionTable::new();
        a.set_action(2, ActionId(0));
        a.set_action(0, ActionId(1));

        let mut b = ActionTable::new();
        b.set_action(1, ActionId(2));
        b.set_action(2, ActionId(0));

        a.set_actions(&b);
        let orderings: Vec<i32> = a.iter().map(|el| el.ordering).collect();
        assert_eq!(orderings, vec![0, 1, 2]);
        assert!(a.has_action(ActionId(2)));
    }

    #[test]
    fn test_action_table_structural_equality() {
        let mut a = ActionTable::new();
        let mut b = ActionTable::new();
        a.set_action(0, ActionId(3));
        b.set_action(0, ActionId(3));
        assert_eq!(a, b);
        b.set_action(1, ActionId(4));
        assert_ne!(a, b);
    }

    #[test]
    fn test_prior_table_one_entry_per_key() {
        let d1 = PriorDesc { id: 0, key: 7, priority: 1 };
        let d2 = PriorDesc { id: 1, key: 7, priority: 9 };
        let mut t = PriorTable::new();
        t.set_prior(0, d1);
        t.set_prior(1, d2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.iter().next().map(|el| el.desc.priority), Some(1));
    }

    #[test]
    fn test_compare_prior_higher_value_wins() {
        let lo = PriorDesc { id: 0, key: 3, priority: 1 };
        let hi = PriorDesc { id: 1, key: 3, priority: 5 };
        let mut t1 = PriorTable::new();
        let mut t2 = PriorTable::new();
        t1.set_prior(0, lo);
        t2.set_prior(1, hi);
        assert_eq!(compare_prior(&t1, &t2), Ok(std::cmp::Ordering::Less));
        assert_eq!(compare_prior(&t2, &t1), Ok(std::cmp::Ordering::Greater));
    }

    #[test]
    fn test_compare_prior_disjoint_keys_equal() {
        let d1 = PriorDesc { id: 0, key: 1, priority: 4 };
        let d2 = PriorDesc { id: 1, key: 2, priority: 9 };
        let mut t1 = PriorTable::new();
        let mut t2 = PriorTable::new();
        t1.set_prior(0, d1);
        t2.set_prior(1, d2);
        assert_eq!(compare_prior(&t1, &t2), Ok(std::cmp::Ordering::Equal));
    }

    #[test]
    fn test_compare_prior_interaction() {
        let d1 = PriorDesc { id: 0, key: 11, priority: 2 };
        let d2 = PriorDesc { id: 1, key: 11, priority: 2 };
        let mut t1 = PriorTable::new();
        let mut t2 = PriorTable::new();
        t1.set_prior(0, d1);
        t2.set_prior(1, d2);
        assert_eq!(compare_prior(&t1, &t2), Err(FsmError::PriorInteraction(11)));
    }

    #[test]
    fn test_compare_prior_same_desc_no_interaction() {
        let d = PriorDesc { id: 0, key: 11, priority: 2 };
        let mut t1 = PriorTable::new();
        let mut t2 = PriorTable::new();
        t1.set_prior(0, d);
        t2.set_prior(0, d);
        assert_eq!(compare_prior(&t1, &t2), Ok(std::cmp::Ordering::Equal));
    }

    #[test]
    fn test_display_name_falls_back_to_loc() {
        let named = Action::new("emit", InputLoc { line: 3, col: 9 });
        let anon = Action::new("", InputLoc { line: 3, col: 9 });
        assert_eq!(named.display_name(), "emit");
        assert_eq!(anon.display_name(), "3:9");
    }
}
