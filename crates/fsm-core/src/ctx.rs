//! Process-scoped context shared by every machine that may be combined.
//!
//! The context owns the alphabet configuration, the minimization policy,
//! the optional state ceiling, and the arenas for entities that outlive
//! individual machines: actions, longest-match parts, priority-descriptor
//! identities and interned condition spaces. Two machines compose only
//! when they hold the same context (`Rc` identity).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::action::{Action, ActionId, InputLoc, LmId, PriorDesc};
use crate::cond::{CondSpace, CondSpaceId, COND_COST_LIMIT};
use crate::error::{FsmError, FsmResult};
use crate::key::KeyOps;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MinimizeLevel {
    /// Fuse states with identical out-structures until a fixed point.
    Approx,
    /// Pairwise mark table, O(n^2) space, guaranteed minimal.
    Stable,
    /// Partition refinement, full rounds.
    Partition1,
    /// Partition refinement with a split-candidate worklist.
    Partition2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MinimizeOpt {
    /// Never minimize.
    None,
    /// Minimize only at the end of a construction sequence.
    End,
    /// Minimize after every operator except the last of a sequence.
    MostOps,
    /// Minimize after every operator.
    EveryOp,
}

/// A longest-match alternative referenced by scanner constructions.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LmPart {
    pub name: String,
}

/// Immutable settings plus context-lifetime arenas. Wrap in `Rc` and hand
/// the same handle to every machine of one construction.
pub struct FsmCtx {
    pub key_ops: KeyOps,
    pub minimize_level: MinimizeLevel,
    pub minimize_opt: MinimizeOpt,
    pub state_limit: Option<usize>,
    pub nfa_term_check: bool,

    actions: RefCell<Vec<Rc<Action>>>,
    lm_parts: RefCell<Vec<Rc<LmPart>>>,
    cond_spaces: RefCell<Vec<Rc<CondSpace>>>,
    cond_space_map: RefCell<FxHashMap<Vec<ActionId>, CondSpaceId>>,
    cond_costs: RefCell<FxHashMap<i64, i64>>,
    next_prior_desc: Cell<u32>,
    next_cond_id: Cell<u32>,
}

impl FsmCtx {
    pub fn new(key_ops: KeyOps) -> FsmCtx {
        FsmCtx {
            key_ops,
            minimize_level: MinimizeLevel::Stable,
            minimize_opt: MinimizeOpt::EveryOp,
            state_limit: None,
            nfa_term_check: false,
            actions: RefCell::new(Vec::new()),
            lm_parts: RefCell::new(Vec::new()),
            cond_spaces: RefCell::new(Vec::new()),
            cond_space_map: RefCell::new(FxHashMap::default()),
            cond_costs: RefCell::new(FxHashMap::default()),
            next_prior_desc: Cell::new(0),
            next_cond_id: Cell::new(0),
        }
    }

    pub fn with_minimize(mut self, level: MinimizeLevel, opt: MinimizeOpt) -> FsmCtx {
        self.minimize_level = level;
        self.minimize_opt = opt;
        self
    }

    pub fn with_state_limit(mut self, limit: usize) -> FsmCtx {
        self.state_limit = Some(limit);
        self
    }

    pub fn with_nfa_term_check(mut self) -> FsmCtx {
        self.nfa_term_check = true;
        self
    }

    pub fn shared(self) -> Rc<FsmCtx> {
        Rc::new(self)
    }

    pub fn new_action(&self, name: &str, loc: InputLoc) -> ActionId {
        let mut actions = self.actions.borrow_mut();
        let id = ActionId(actions.len() as u32);
        actions.push(Rc::new(Action::new(name, loc)));
        id
    }

    /// Create an action usable as a boolean guard.
    pub fn new_cond_action(&self, name: &str, loc: InputLoc) -> ActionId {
        let mut action = Action::new(name, loc);
        action.cond_id = Some(self.next_cond_id.get());
        self.next_cond_id.set(self.next_cond_id.get() + 1);
        let mut actions = self.actions.borrow_mut();
        let id = ActionId(actions.len() as u32);
        actions.push(Rc::new(action));
        id
    }

    /// Guard action carrying a cost tag charged on replication.
    pub fn new_cost_cond_action(&self, name: &str, loc: InputLoc, cost_id: i64) -> ActionId {
        let mut action = Action::new(name, loc);
        action.cond_id = Some(self.next_cond_id.get());
        self.next_cond_id.set(self.next_cond_id.get() + 1);
        action.cost_mark = true;
        action.cost_id = cost_id;
        let mut actions = self.actions.borrow_mut();
        let id = ActionId(actions.len() as u32);
        actions.push(Rc::new(action));
        id
    }

    pub fn action(&self, id: ActionId) -> Rc<Action> {
        Rc::clone(&self.actions.borrow()[id.0 as usize])
    }

    pub fn new_lm_part(&self, name: &str) -> LmId {
        let mut parts = self.lm_parts.borrow_mut();
        let id = LmId(parts.len() as u32);
        parts.push(Rc::new(LmPart { name: name.to_owned() }));
        id
    }

    pub fn lm_part(&self, id: LmId) -> Rc<LmPart> {
        Rc::clone(&self.lm_parts.borrow()[id.0 as usize])
    }

    pub fn new_prior_desc(&self, key: i64, priority: i32) -> PriorDesc {
        let id = self.next_prior_desc.get();
        self.next_prior_desc.set(id + 1);
        PriorDesc { id, key, priority }
    }

    /// Intern a guard set, returning the canonical space. The set is
    /// sorted here; callers pass guards in any order.
    pub fn add_cond_space(&self, mut cond_set: Vec<ActionId>) -> CondSpaceId {
        cond_set.sort_unstable();
        cond_set.dedup();
        if let Some(&id) = self.cond_space_map.borrow().get(&cond_set) {
            return id;
        }
        let mut spaces = self.cond_spaces.borrow_mut();
        let id = CondSpaceId(spaces.len() as u32);
        spaces.push(Rc::new(CondSpace { cond_set: cond_set.clone() }));
        self.cond_space_map.borrow_mut().insert(cond_set, id);
        id
    }

    pub fn cond_space(&self, id: CondSpaceId) -> Rc<CondSpace> {
        Rc::clone(&self.cond_spaces.borrow()[id.0 as usize])
    }

    /// Report reference counters that went negative. The library never
    /// recovers from count mismatches, only surfaces them.
    pub fn warn_negative_refs(&self) {
        for action in self.actions.borrow().iter() {
            let counts = [
                ("trans", action.num_trans_refs.get()),
                ("to-state", action.num_to_state_refs.get()),
                ("from-state", action.num_from_state_refs.get()),
                ("eof", action.num_eof_refs.get()),
                ("cond", action.num_cond_refs.get()),
                ("nfa", action.num_nfa_refs.get()),
            ];
            for (kind, n) in counts {
                if n < 0 {
                    log::warn!(
                        "action {} has a negative {} reference count: {}",
                        action.display_name(),
                        kind,
                        n
                    );
                }
            }
        }
    }

    /// Charge `copies` replications of every cost-marked guard in the
    /// space against its cost budget.
    pub fn charge_cond_cost(&self, space: CondSpaceId, copies: i64) -> FsmResult<()> {
        let space = self.cond_space(space);
        for &guard in &space.cond_set {
            let action = self.action(guard);
            if !action.cost_mark {
                continue;
            }
            let mut costs = self.cond_costs.borrow_mut();
            let total = costs.entry(action.cost_id).or_insert(0);
            *total += copies;
            if *total > COND_COST_LIMIT {
                return Err(FsmError::CondCostTooHigh(action.cost_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyOps;

    #[test]
    fn test_cond_space_interning() {
        let ctx = FsmCtx::new(KeyOps::octet());
        let c1 = ctx.new_cond_action("c1", InputLoc::default());
        let c2 = ctx.new_cond_action("c2", InputLoc::default());

        let a = ctx.add_cond_space(vec![c2, c1]);
        let b = ctx.add_cond_space(vec![c1, c2]);
        assert_eq!(a, b);
        assert_eq!(ctx.cond_space(a).full_size(), 4);
    }

    #[test]
    fn test_prior_desc_ids_unique() {
        let ctx = FsmCtx::new(KeyOps::octet());
        let d1 = ctx.new_prior_desc(0, 1);
        let d2 = ctx.new_prior_desc(0, 1);
        assert_ne!(d1.id, d2.id);
    }

    #[test]
    fn test_cond_cost_budget() {
        let ctx = FsmCtx::new(KeyOps::octet());
        let g = ctx.new_cost_cond_action("g", InputLoc::default(), 42);
        let space = ctx.add_cond_space(vec![g]);
        assert!(ctx.charge_cond_cost(space, 10).is_ok());
        assert_eq!(
            ctx.charge_cond_cost(space, COND_COST_LIMIT),
            Err(FsmError::CondCostTooHigh(42))
        );
    }
}
