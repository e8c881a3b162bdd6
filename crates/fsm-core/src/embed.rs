//! Embedding actions, priorities and conditions into a built machine.
//!
//! These are the write surface the generator's parse layer drives: put an
//! action on the transitions leaving the start state, on every
//! transition, on the transitions entering final states (through the
//! in-lists), or on the pending out tables that concatenation transfers
//! onto whatever follows. State-table embeddings take a [`StateSelect`]
//! instead of one method per state subset.

use crate::action::{ActionId, LmId, PriorDesc};
use crate::cond::{expansion_values, merge_cond_sets, CondVal, COND_DENSITY_LIMIT};
use crate::determinize::MergeData;
use crate::error::{FsmError, FsmResult};
use crate::graph::{Fsm, RefKind, StateId, TransBody, TransId, TransSlot};

/// Which states a state-table embedding lands on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateSelect {
    Start,
    All,
    Final,
    NotStart,
    NotFinal,
    Middle,
}

impl Fsm {
    fn selected_states(&self, sel: StateSelect) -> Vec<StateId> {
        let start = self.start_state;
        self.state_list
            .iter()
            .copied()
            .filter(|&s| {
                let is_start = Some(s) == start;
                let is_final = self.state(s).is_final();
                match sel {
                    StateSelect::Start => is_start,
                    StateSelect::All => true,
                    StateSelect::Final => is_final,
                    StateSelect::NotStart => !is_start,
                    StateSelect::NotFinal => !is_final,
                    StateSelect::Middle => !is_start && !is_final,
                }
            })
            .collect()
    }

    fn embed_action_in_slot(&mut self, slot: TransSlot, ordering: i32, action: ActionId) {
        let data = self.slot_data(slot);
        let fresh = !data.action_table.iter().any(|el| el.action == action && el.ordering == ordering);
        if fresh {
            self.bump_action_ref(action, RefKind::Trans, 1);
        }
        self.slot_data_mut(slot).action_table.set_action(ordering, action);
    }

    /// Isolate the start state and run the interning machinery so the
    /// isolation merge settles before an embedding reads the out-list.
    fn isolate_for_embedding(&mut self) -> FsmResult<()> {
        let mut md = MergeData::new();
        self.set_misfit_accounting(true);
        self.isolate_start_state(&mut md)?;
        self.fill_in_states(&mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /*
     * Transition actions.
     */

    /// Embed on every transition leaving the start state.
    pub fn start_fsm_action(&mut self, ordering: i32, action: ActionId) -> FsmResult<()> {
        self.isolate_for_embedding()?;
        let start = self.start_state.expect("machine has no start state");
        for tid in self.state(start).out_list.clone() {
            for slot in self.slots_of(tid) {
                self.embed_action_in_slot(slot, ordering, action);
            }
        }
        Ok(())
    }

    /// Embed on every transition of the machine.
    pub fn all_trans_action(&mut self, ordering: i32, action: ActionId) {
        for state in self.state_list.clone() {
            for tid in self.state(state).out_list.clone() {
                for slot in self.slots_of(tid) {
                    self.embed_action_in_slot(slot, ordering, action);
                }
            }
        }
    }

    /// Embed on every transition entering a final state.
    pub fn finish_fsm_action(&mut self, ordering: i32, action: ActionId) {
        for fin in self.final_states.clone() {
            for tid in self.state(fin).in_plain.clone() {
                self.embed_action_in_slot(TransSlot::Plain(tid), ordering, action);
            }
            for (tid, val) in self.state(fin).in_cond.clone() {
                self.embed_action_in_slot(TransSlot::Cond(tid, val), ordering, action);
            }
        }
    }

    /// Put on the pending out table of every final state, to be
    /// transferred onto whatever is concatenated after.
    pub fn leave_fsm_action(&mut self, ordering: i32, action: ActionId) {
        for fin in self.final_states.clone() {
            self.state_mut(fin).out_action_table.set_action(ordering, action);
        }
    }

    /*
     * Transition priorities.
     */

    pub fn start_fsm_prior(&mut self, ordering: i32, desc: PriorDesc) -> FsmResult<()> {
        self.isolate_for_embedding()?;
        let start = self.start_state.expect("machine has no start state");
        for tid in self.state(start).out_list.clone() {
            for slot in self.slots_of(tid) {
                self.slot_data_mut(slot).prior_table.set_prior(ordering, desc);
            }
        }
        Ok(())
    }

    pub fn all_trans_prior(&mut self, ordering: i32, desc: PriorDesc) {
        for state in self.state_list.clone() {
            for tid in self.state(state).out_list.clone() {
                for slot in self.slots_of(tid) {
                    self.slot_data_mut(slot).prior_table.set_prior(ordering, desc);
                }
            }
        }
    }

    pub fn finish_fsm_prior(&mut self, ordering: i32, desc: PriorDesc) {
        for fin in self.final_states.clone() {
            for tid in self.state(fin).in_plain.clone() {
                self.slot_data_mut(TransSlot::Plain(tid)).prior_table.set_prior(ordering, desc);
            }
            for (tid, val) in self.state(fin).in_cond.clone() {
                self.slot_data_mut(TransSlot::Cond(tid, val)).prior_table.set_prior(ordering, desc);
            }
        }
    }

    pub fn leave_fsm_prior(&mut self, ordering: i32, desc: PriorDesc) {
        for fin in self.final_states.clone() {
            self.state_mut(fin).out_prior_table.set_prior(ordering, desc);
        }
    }

    /*
     * Conditions.
     */

    /// Guard every transition leaving the start state.
    pub fn start_fsm_condition(&mut self, cond: ActionId, sense: bool) -> FsmResult<()> {
        self.isolate_for_embedding()?;
        let start = self.start_state.expect("machine has no start state");
        self.embed_condition(start, cond, sense)
    }

    pub fn all_trans_condition(&mut self, cond: ActionId, sense: bool) -> FsmResult<()> {
        for state in self.state_list.clone() {
            self.embed_condition(state, cond, sense)?;
        }
        Ok(())
    }

    /// Add to the pending out conditions of every final state.
    pub fn leave_fsm_condition(&mut self, cond: ActionId, sense: bool) -> FsmResult<()> {
        for fin in self.final_states.clone() {
            let (old_set, old_vals) = match self.state(fin).out_cond_space {
                Some(space) => (
                    self.ctx.cond_space(space).cond_set.clone(),
                    self.state(fin).out_cond_vals.clone(),
                ),
                None => (Vec::new(), vec![CondVal(0)]),
            };
            let merged_set = merge_cond_sets(&old_set, &[cond]);
            if merged_set.len() > COND_DENSITY_LIMIT {
                return Err(FsmError::TransDensity);
            }
            let merged_space = self.ctx.add_cond_space(merged_set.clone());
            let pos = merged_set
                .binary_search(&cond)
                .expect("guard missing from its own space");

            let mut vals: Vec<CondVal> = Vec::new();
            for v in old_vals {
                for expanded in expansion_values(v, &old_set, &merged_set) {
                    if ((expanded.0 >> pos) & 1 == 1) == sense {
                        vals.push(expanded);
                    }
                }
            }
            vals.sort_unstable();
            vals.dedup();

            let state = self.state_mut(fin);
            state.out_cond_space = Some(merged_space);
            state.out_cond_vals = vals;
        }
        Ok(())
    }

    /// Guard every transition out of one state.
    pub fn embed_condition(&mut self, state: StateId, cond: ActionId, sense: bool) -> FsmResult<()> {
        for tid in self.state(state).out_list.clone() {
            self.embed_condition_in_trans(tid, cond, sense)?;
        }
        Ok(())
    }

    /// Add one guard to a transition: the space grows by the guard and
    /// the branches whose guard bit disagrees with `sense` drop to error.
    pub(crate) fn embed_condition_in_trans(
        &mut self,
        tid: TransId,
        cond: ActionId,
        sense: bool,
    ) -> FsmResult<()> {
        self.convert_to_cond(tid);
        let own_space = self.trans(tid).cond_space().expect("conversion to conditional failed");
        let own_set = self.ctx.cond_space(own_space).cond_set.clone();
        let merged_set = merge_cond_sets(&own_set, &[cond]);
        if merged_set.len() > COND_DENSITY_LIMIT {
            return Err(FsmError::TransDensity);
        }
        let merged_space = self.ctx.add_cond_space(merged_set.clone());
        self.expand_conds(tid, merged_space)?;

        let pos = merged_set.binary_search(&cond).expect("guard missing from its own space");
        let branches = match &self.trans(tid).body {
            TransBody::Cond { branches, .. } => branches.clone(),
            TransBody::Plain(_) => unreachable!("conversion to conditional failed"),
        };
        for b in branches {
            if ((b.key.0 >> pos) & 1 == 1) != sense {
                self.detach_slot(TransSlot::Cond(tid, b.key));
                self.remove_cond_branch(tid, b.key);
            }
        }
        Ok(())
    }

    /*
     * State-table embeddings.
     */

    pub fn embed_eof_action(&mut self, sel: StateSelect, ordering: i32, action: ActionId) {
        for state in self.selected_states(sel) {
            let fresh = !self
                .state(state)
                .eof_action_table
                .iter()
                .any(|el| el.action == action && el.ordering == ordering);
            if fresh {
                self.bump_action_ref(action, RefKind::Eof, 1);
            }
            self.state_mut(state).eof_action_table.set_action(ordering, action);
        }
    }

    pub fn embed_to_state_action(&mut self, sel: StateSelect, ordering: i32, action: ActionId) {
        for state in self.selected_states(sel) {
            let fresh = !self
                .state(state)
                .to_state_action_table
                .iter()
                .any(|el| el.action == action && el.ordering == ordering);
            if fresh {
                self.bump_action_ref(action, RefKind::ToState, 1);
            }
            self.state_mut(state).to_state_action_table.set_action(ordering, action);
        }
    }

    pub fn embed_from_state_action(&mut self, sel: StateSelect, ordering: i32, action: ActionId) {
        for state in self.selected_states(sel) {
            let fresh = !self
                .state(state)
                .from_state_action_table
                .iter()
                .any(|el| el.action == action && el.ordering == ordering);
            if fresh {
                self.bump_action_ref(action, RefKind::FromState, 1);
            }
            self.state_mut(state).from_state_action_table.set_action(ordering, action);
        }
    }

    pub fn embed_error_action(
        &mut self,
        sel: StateSelect,
        ordering: i32,
        action: ActionId,
        transfer_point: i32,
    ) {
        for state in self.selected_states(sel) {
            self.state_mut(state)
                .err_action_table
                .set_action(ordering, action, transfer_point);
        }
    }

    /*
     * Longest-match support.
     */

    /// Record a longest-match alternative on every transition entering a
    /// final state; the most recently succeeded alternative wins at scan
    /// time.
    pub fn longest_match_action(&mut self, ordering: i32, lm: LmId) {
        for fin in self.final_states.clone() {
            for tid in self.state(fin).in_plain.clone() {
                self.slot_data_mut(TransSlot::Plain(tid))
                    .lm_action_table
                    .set_action(ordering, lm);
            }
            for (tid, val) in self.state(fin).in_cond.clone() {
                self.slot_data_mut(TransSlot::Cond(tid, val))
                    .lm_action_table
                    .set_action(ordering, lm);
            }
        }
    }

    pub fn add_lm_item(&mut self, state: StateId, lm: LmId) {
        self.state_mut(state).lm_item_set.insert(lm);
    }

    /*
     * Ordering maintenance.
     */

    /// Renumber the action orderings on the start state's out transitions
    /// to begin at `from_order`. Returns the next free ordering. Done
    /// before a star so the repeated actions keep their relative order.
    pub fn shift_start_action_order(&mut self, from_order: i32) -> i32 {
        let start = self.start_state.expect("machine has no start state");
        let mut next = from_order;
        for tid in self.state(start).out_list.clone() {
            for slot in self.slots_of(tid) {
                let shifted = self.slot_data_mut(slot).action_table.shift_orderings(next);
                if shifted > next {
                    next = shifted;
                }
            }
        }
        next
    }

    /// Strip every priority table in the machine, so stale priorities do
    /// not block fusing during final compression.
    pub fn clear_all_priorities(&mut self) {
        for state in self.all_live_states() {
            self.state_mut(state).out_prior_table.clear();
            for tid in self.state(state).out_list.clone() {
                for slot in self.slots_of(tid) {
                    self.slot_data_mut(slot).prior_table.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::FsmCtx;
    use crate::key::{Key, KeyOps};
    use std::rc::Rc;

    fn ctx() -> Rc<FsmCtx> {
        FsmCtx::new(KeyOps::octet()).shared()
    }

    fn k(c: char) -> Key {
        Key::from_char(c)
    }

    #[test]
    fn test_all_trans_action_lands_everywhere() {
        let c = ctx();
        let act = c.new_action("emit", Default::default());
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        fsm.all_trans_action(0, act);
        for state in fsm.state_list.clone() {
            for tid in fsm.state(state).out_list.clone() {
                assert!(fsm.slot_data(TransSlot::Plain(tid)).action_table.has_action(act));
            }
        }
        assert_eq!(c.action(act).num_trans_refs.get(), 2);
    }

    #[test]
    fn test_finish_action_uses_in_lists() {
        let c = ctx();
        let act = c.new_action("done", Default::default());
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        fsm.finish_fsm_action(0, act);

        // Only the b transition enters the final state.
        let start = fsm.start_state.unwrap();
        let t_a = fsm.state(start).out_list[0];
        assert!(!fsm.slot_data(TransSlot::Plain(t_a)).action_table.has_action(act));

        let fin = *fsm.final_states.iter().next().unwrap();
        let t_b = fsm.state(fin).in_plain[0];
        assert!(fsm.slot_data(TransSlot::Plain(t_b)).action_table.has_action(act));
    }

    #[test]
    fn test_leave_action_transfers_on_concat() {
        let c = ctx();
        let act = c.new_action("leave", Default::default());
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        fsm.leave_fsm_action(0, act);
        fsm.concat_op(Fsm::concat_fsm(Rc::clone(&c), &[k('b')])).unwrap();

        // The pending out action landed on the stitched b transition.
        let fin = *fsm.final_states.iter().next().unwrap();
        let t_b = fsm.state(fin).in_plain[0];
        assert!(fsm.slot_data(TransSlot::Plain(t_b)).action_table.has_action(act));
        assert!(fsm.accepts_str("ab"));
    }

    #[test]
    fn test_embed_condition_creates_branches() {
        let c = ctx();
        let guard = c.new_cond_action("c1", Default::default());
        let mut fsm = Fsm::range_fsm(Rc::clone(&c), k('a'), k('z'));
        let start = fsm.start_state.unwrap();
        fsm.embed_condition(start, guard, true).unwrap();

        let tid = fsm.state(start).out_list[0];
        match &fsm.trans(tid).body {
            TransBody::Cond { space, branches } => {
                assert_eq!(c.cond_space(*space).full_size(), 2);
                assert_eq!(branches.len(), 1);
                assert_eq!(branches[0].key, CondVal(1));
                assert!(branches[0].data.to_state.is_some());
            }
            TransBody::Plain(_) => panic!("expected a conditional transition"),
        }
    }

    #[test]
    fn test_cond_space_expansion_replicates_entries() {
        // Scenario: {C1, C2} with entries 00 -> s1 and 11 -> s2; adding a
        // third guard replicates each entry over C3, yielding four.
        let c = ctx();
        let g1 = c.new_cond_action("C1", Default::default());
        let g2 = c.new_cond_action("C2", Default::default());
        let g3 = c.new_cond_action("C3", Default::default());

        let mut fsm = Fsm::new(Rc::clone(&c));
        let s0 = fsm.add_state();
        let s1 = fsm.add_state();
        let s2 = fsm.add_state();
        fsm.set_start_state(s0);

        let tid = fsm.attach_new_trans(s0, None, k('a'), k('z'));
        fsm.convert_to_cond(tid);
        let space12 = c.add_cond_space(vec![g1, g2]);
        fsm.expand_conds(tid, space12).unwrap();
        // The empty-space branch expanded over both guards; rebuild the
        // enumeration as the scenario wants it: 00 -> s1, 11 -> s2.
        match &fsm.trans(tid).body {
            TransBody::Cond { branches, .. } => assert_eq!(branches.len(), 4),
            TransBody::Plain(_) => unreachable!(),
        }
        for val in [CondVal(0b01), CondVal(0b10)] {
            fsm.detach_slot(TransSlot::Cond(tid, val));
            fsm.remove_cond_branch(tid, val);
        }
        fsm.attach_slot(TransSlot::Cond(tid, CondVal(0b00)), Some(s1));
        fsm.attach_slot(TransSlot::Cond(tid, CondVal(0b11)), Some(s2));

        let space123 = c.add_cond_space(vec![g1, g2, g3]);
        fsm.expand_conds(tid, space123).unwrap();
        match &fsm.trans(tid).body {
            TransBody::Cond { space, branches } => {
                assert_eq!(*space, space123);
                assert_eq!(branches.len(), 4);
                let to_s1 = branches.iter().filter(|b| b.data.to_state == Some(s1)).count();
                let to_s2 = branches.iter().filter(|b| b.data.to_state == Some(s2)).count();
                assert_eq!(to_s1, 2);
                assert_eq!(to_s2, 2);
            }
            TransBody::Plain(_) => unreachable!(),
        }
    }

    #[test]
    fn test_embed_eof_selectors() {
        let c = ctx();
        let act = c.new_action("eof", Default::default());
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        fsm.embed_eof_action(StateSelect::Middle, 0, act);

        let start = fsm.start_state.unwrap();
        let fin = *fsm.final_states.iter().next().unwrap();
        assert!(fsm.state(start).eof_action_table.is_empty());
        assert!(fsm.state(fin).eof_action_table.is_empty());
        let middle: Vec<_> = fsm
            .state_list
            .iter()
            .filter(|&&s| s != start && s != fin)
            .collect();
        assert_eq!(middle.len(), 1);
        assert!(!fsm.state(*middle[0]).eof_action_table.is_empty());
        assert_eq!(c.action(act).num_eof_refs.get(), 1);
    }

    #[test]
    fn test_longest_match_action() {
        let c = ctx();
        let lm = c.new_lm_part("word");
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        fsm.longest_match_action(0, lm);
        let fin = *fsm.final_states.iter().next().unwrap();
        let tid = fsm.state(fin).in_plain[0];
        assert!(!fsm.slot_data(TransSlot::Plain(tid)).lm_action_table.is_empty());
    }
}
