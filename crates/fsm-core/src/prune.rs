//! Reachability pruning and self-consistency checks.
//!
//! Invoked after every structural change that may leave misfits: forward
//! marking removes states no path can enter, reverse marking removes
//! dead ends that no word can accept through, and the misfit pass
//! reclaims states that lost their last in-edge while accounting was on.

use crate::graph::{Fsm, StateId, TransBody, SB_ISFINAL, SB_ISMARKED};

impl Fsm {
    fn clear_marks(&mut self) {
        for id in self.all_live_states() {
            self.state_mut(id).bits &= !SB_ISMARKED;
        }
    }

    /// Forward depth-first marking over out-transitions and NFA edges.
    pub fn mark_reachable_from_here(&mut self, from: StateId) {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if self.state(id).bits & SB_ISMARKED != 0 {
                continue;
            }
            self.state_mut(id).bits |= SB_ISMARKED;
            for tid in self.state(id).out_list.clone() {
                match &self.trans(tid).body {
                    TransBody::Plain(data) => stack.extend(data.to_state),
                    TransBody::Cond { branches, .. } => {
                        stack.extend(branches.iter().filter_map(|b| b.data.to_state));
                    }
                }
            }
            if let Some(edges) = &self.state(id).nfa_out {
                stack.extend(edges.iter().map(|e| e.to_state));
            }
        }
    }

    /// Reverse marking through the in-lists and NFA in-edges.
    pub fn mark_reachable_from_here_reverse(&mut self, from: StateId) {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if self.state(id).bits & SB_ISMARKED != 0 {
                continue;
            }
            self.state_mut(id).bits |= SB_ISMARKED;
            let state = self.state(id);
            let mut preds: Vec<StateId> = state
                .in_plain
                .iter()
                .map(|&t| self.trans(t).from_state)
                .collect();
            preds.extend(state.in_cond.iter().map(|&(t, _)| self.trans(t).from_state));
            preds.extend(state.nfa_in.iter().copied());
            stack.extend(preds);
        }
    }

    /// Remove states no path from the start state or an entry point can
    /// reach.
    pub fn remove_unreachable_states(&mut self) {
        self.clear_marks();
        if let Some(start) = self.start_state {
            self.mark_reachable_from_here(start);
        }
        for states in self.entry_points.clone().values() {
            for &state in states {
                self.mark_reachable_from_here(state);
            }
        }
        if let Some(err) = self.error_state {
            self.state_mut(err).bits |= SB_ISMARKED;
        }
        self.sweep_unmarked();
    }

    /// Remove states with no path to a final state. The start state, the
    /// error state and entry points are kept regardless.
    pub fn remove_dead_end_states(&mut self) {
        self.clear_marks();
        for fin in self.final_states.clone() {
            self.mark_reachable_from_here_reverse(fin);
        }
        if let Some(start) = self.start_state {
            self.state_mut(start).bits |= SB_ISMARKED;
        }
        if let Some(err) = self.error_state {
            self.state_mut(err).bits |= SB_ISMARKED;
        }
        for states in self.entry_points.clone().values() {
            for &state in states {
                self.state_mut(state).bits |= SB_ISMARKED;
            }
        }
        self.sweep_unmarked();
    }

    fn sweep_unmarked(&mut self) {
        let dead: Vec<StateId> = self
            .all_live_states()
            .into_iter()
            .filter(|&s| self.state(s).bits & SB_ISMARKED == 0)
            .collect();
        if !dead.is_empty() {
            log::trace!("pruning {} states", dead.len());
        }
        for id in dead {
            self.delete_state(id);
        }
        self.clear_marks();
    }

    /// Delete everything sitting on the misfit list, cascading: removing
    /// a misfit may orphan its targets onto the list in turn.
    pub fn remove_misfits(&mut self) {
        let mut removed = 0usize;
        while let Some(&id) = self.misfit_list.first() {
            self.delete_state(id);
            removed += 1;
        }
        if removed > 0 {
            log::trace!("removed {} misfit states", removed);
        }
    }

    /*
     * Self-consistency checks. Violations are programmer bugs and abort.
     */

    /// Assert every structural invariant of the graph at rest.
    pub fn verify_integrity(&self) {
        let ops = self.ctx.key_ops;
        let live = self.all_live_states();

        for &id in &live {
            let state = self.state(id);

            /* Ranges are well-formed, strictly ordered, disjoint. */
            let mut prev_high: Option<crate::key::Key> = None;
            for &tid in &state.out_list {
                let trans = self.trans(tid);
                assert_eq!(trans.from_state, id, "transition in the wrong out-list");
                assert!(ops.le(trans.low_key, trans.high_key), "inverted range");
                if let Some(prev) = prev_high {
                    assert!(ops.lt(prev, trans.low_key), "out-list ranges overlap");
                }
                prev_high = Some(trans.high_key);

                match &trans.body {
                    TransBody::Plain(data) => {
                        if let Some(to) = data.to_state {
                            let hits = self
                                .state(to)
                                .in_plain
                                .iter()
                                .filter(|&&t| t == tid)
                                .count();
                            assert_eq!(hits, 1, "in-list reciprocity broken");
                        }
                    }
                    TransBody::Cond { branches, .. } => {
                        let mut prev_key = None;
                        for branch in branches {
                            if let Some(prev) = prev_key {
                                assert!(prev < branch.key, "condition branches out of order");
                            }
                            prev_key = Some(branch.key);
                            if let Some(to) = branch.data.to_state {
                                let hits = self
                                    .state(to)
                                    .in_cond
                                    .iter()
                                    .filter(|&&e| e == (tid, branch.key))
                                    .count();
                                assert_eq!(hits, 1, "in-list reciprocity broken");
                            }
                        }
                    }
                }
            }

            /* Every in-list entry has its reciprocal out-list slot. */
            for &tid in &state.in_plain {
                let trans = self.trans(tid);
                assert!(
                    self.state(trans.from_state).out_list.contains(&tid),
                    "in-list references a transition not in its owner's out-list"
                );
                match &trans.body {
                    TransBody::Plain(data) => {
                        assert_eq!(data.to_state, Some(id), "in-list entry targets elsewhere")
                    }
                    TransBody::Cond { .. } => panic!("plain in-list holds a conditional"),
                }
            }
            for &(tid, val) in &state.in_cond {
                let trans = self.trans(tid);
                assert!(
                    self.state(trans.from_state).out_list.contains(&tid),
                    "in-list references a transition not in its owner's out-list"
                );
                match &trans.body {
                    TransBody::Cond { branches, .. } => {
                        let branch = branches
                            .iter()
                            .find(|b| b.key == val)
                            .expect("in-list references a missing branch");
                        assert_eq!(
                            branch.data.to_state,
                            Some(id),
                            "in-list entry targets elsewhere"
                        );
                    }
                    TransBody::Plain(_) => panic!("cond in-list holds a plain transition"),
                }
            }

            /* Finality bit and final set agree. */
            assert_eq!(
                state.bits & SB_ISFINAL != 0,
                self.final_states.contains(&id),
                "final bit and final set disagree"
            );
        }

        /* Entry map values are states of this machine. */
        for states in self.entry_points.values() {
            for state in states {
                assert!(live.contains(state), "entry point references a dead state");
            }
        }
        if let Some(start) = self.start_state {
            assert!(live.contains(&start), "start state is dead");
        }
        for fin in &self.final_states {
            assert!(live.contains(fin), "final set references a dead state");
        }

        self.ctx.warn_negative_refs();
    }

    /// Post-condition: every state is reachable from the start state or
    /// an entry point.
    pub fn verify_reachability(&mut self) {
        self.clear_marks();
        if let Some(start) = self.start_state {
            self.mark_reachable_from_here(start);
        }
        for states in self.entry_points.clone().values() {
            for &state in states {
                self.mark_reachable_from_here(state);
            }
        }
        for id in self.state_list.clone() {
            if Some(id) == self.error_state {
                continue;
            }
            assert!(
                self.state(id).bits & SB_ISMARKED != 0,
                "unreachable state survived pruning"
            );
        }
        self.clear_marks();
    }

    /// Post-condition: every state except the start and error states can
    /// reach a final state.
    pub fn verify_no_dead_end_states(&mut self) {
        self.clear_marks();
        for fin in self.final_states.clone() {
            self.mark_reachable_from_here_reverse(fin);
        }
        for id in self.state_list.clone() {
            if Some(id) == self.start_state || Some(id) == self.error_state {
                continue;
            }
            assert!(
                self.state(id).bits & SB_ISMARKED != 0,
                "dead-end state survived pruning"
            );
        }
        self.clear_marks();
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
    fn test_remove_unreachable() {
        let c = ctx();
        let mut fsm = Fsm::new(Rc::clone(&c));
        let s0 = fsm.add_state();
        let s1 = fsm.add_state();
        let lost = fsm.add_state();
        fsm.set_start_state(s0);
        fsm.set_fin_state(s1);
        fsm.attach_new_trans(s0, Some(s1), k('a'), k('a'));
        fsm.attach_new_trans(lost, Some(s1), k('b'), k('b'));

        fsm.remove_unreachable_states();
        assert_eq!(fsm.state_list.len(), 2);
        fsm.verify_integrity();
        fsm.verify_reachability();
    }

    #[test]
    fn test_remove_dead_ends_keeps_start() {
        let c = ctx();
        let mut fsm = Fsm::new(Rc::clone(&c));
        let s0 = fsm.add_state();
        let s1 = fsm.add_state();
        let pit = fsm.add_state();
        fsm.set_start_state(s0);
        fsm.set_fin_state(s1);
        fsm.attach_new_trans(s0, Some(s1), k('a'), k('a'));
        fsm.attach_new_trans(s0, Some(pit), k('b'), k('b'));
        fsm.attach_new_trans(pit, Some(pit), k('b'), k('b'));

        fsm.remove_dead_end_states();
        assert_eq!(fsm.state_list.len(), 2);
        fsm.verify_integrity();
        fsm.verify_no_dead_end_states();
        // The transition into the pit is gone with it.
        assert_eq!(fsm.state(s0).out_list.len(), 1);
    }

    #[test]
    fn test_remove_misfits_cascades() {
        let c = ctx();
        let mut fsm = Fsm::new(Rc::clone(&c));
        let s0 = fsm.add_state();
        fsm.set_start_state(s0);
        fsm.set_misfit_accounting(true);
        // A chain hanging off nothing: a -> b, both born as misfits, b
        // temporarily rescued by the in-edge from a.
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.attach_new_trans(a, Some(b), k('x'), k('x'));
        assert!(fsm.state(a).on_misfit_list());
        assert!(!fsm.state(b).on_misfit_list());

        fsm.remove_misfits();
        assert_eq!(fsm.state_list, vec![s0]);
        assert!(fsm.misfit_list.is_empty());
        fsm.verify_integrity();
    }

    #[test]
    fn test_verify_integrity_passes_on_built_machine() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        let other = Fsm::range_fsm(Rc::clone(&c), k('0'), k('9'));
        fsm.union_op(other).unwrap();
        fsm.verify_integrity();
        fsm.verify_reachability();
        fsm.verify_no_dead_end_states();
    }
}
