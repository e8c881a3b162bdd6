//! Basic machines and the operators that combine them.
//!
//! Operators work by moving the operand's states into `self`, merging the
//! relevant states through the subset-construction machinery, and letting
//! misfit accounting reclaim whatever lost its reason to live. Every
//! operator post-conditions with the context's minimization policy.

use std::rc::Rc;

use crate::action::{ActionId, ActionTable};
use crate::ctx::{FsmCtx, MinimizeOpt};
use crate::determinize::{MergeData, NfaRoundVect};
use crate::error::{FsmError, FsmResult};
use crate::graph::{EntryId, Fsm, NfaEdge, StateId, SB_BOTH, SB_GRAPH1, SB_GRAPH2};
use crate::key::Key;

/// The action bundle a counted NFA repetition is decorated with.
#[derive(Clone, Copy, Debug)]
pub struct NfaRepeatActions {
    pub init: ActionId,
    pub min: ActionId,
    pub max: ActionId,
    pub push: ActionId,
    pub pop: ActionId,
}

impl Fsm {
    /*
     * Basic machines.
     */

    /// Accepts nothing.
    pub fn empty_fsm(ctx: Rc<FsmCtx>) -> Fsm {
        let mut fsm = Fsm::new(ctx);
        let start = fsm.add_state();
        fsm.set_start_state(start);
        fsm
    }

    /// Accepts only the empty word.
    pub fn lambda_fsm(ctx: Rc<FsmCtx>) -> Fsm {
        let mut fsm = Fsm::new(ctx);
        let start = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(start);
        fsm
    }

    /// Accepts exactly the given key sequence.
    pub fn concat_fsm(ctx: Rc<FsmCtx>, keys: &[Key]) -> Fsm {
        let mut fsm = Fsm::new(ctx);
        let mut prev = fsm.add_state();
        fsm.set_start_state(prev);
        for &key in keys {
            let next = fsm.add_state();
            fsm.attach_new_trans(prev, Some(next), key, key);
            prev = next;
        }
        fsm.set_fin_state(prev);
        fsm
    }

    /// Key sequence accepted case-insensitively: at every position both
    /// the lower and upper case of a letter advance the machine.
    pub fn concat_fsm_ci(ctx: Rc<FsmCtx>, keys: &[Key]) -> Fsm {
        let mut fsm = Fsm::new(ctx);
        let mut prev = fsm.add_state();
        fsm.set_start_state(prev);
        for &key in keys {
            let next = fsm.add_state();
            fsm.attach_new_trans(prev, Some(next), key, key);
            let v = key.val();
            let other = if (b'a' as i64..=b'z' as i64).contains(&v) {
                Some(Key(v - 0x20))
            } else if (b'A' as i64..=b'Z' as i64).contains(&v) {
                Some(Key(v + 0x20))
            } else {
                None
            };
            if let Some(other) = other {
                fsm.attach_new_trans(prev, Some(next), other, other);
            }
            prev = next;
        }
        fsm.set_fin_state(prev);
        fsm
    }

    /// Accepts any single key of the set.
    pub fn or_fsm(ctx: Rc<FsmCtx>, set: &[Key]) -> Fsm {
        let mut keys: Vec<Key> = set.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let mut fsm = Fsm::new(ctx);
        let start = fsm.add_state();
        let fin = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(fin);
        for key in keys {
            fsm.attach_new_trans(start, Some(fin), key, key);
        }
        fsm
    }

    /// Accepts any single key in `[low, high]`.
    pub fn range_fsm(ctx: Rc<FsmCtx>, low: Key, high: Key) -> Fsm {
        let mut fsm = Fsm::new(ctx);
        let start = fsm.add_state();
        let fin = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(fin);
        fsm.attach_new_trans(start, Some(fin), low, high);
        fsm
    }

    /// Kleene star of a range: one state looping on `[low, high]`.
    pub fn range_star_fsm(ctx: Rc<FsmCtx>, low: Key, high: Key) -> Fsm {
        let mut fsm = Fsm::new(ctx);
        let start = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(start);
        fsm.attach_new_trans(start, Some(start), low, high);
        fsm
    }

    /*
     * Operators.
     */

    /// Kleene star: graft the start state's transitions onto every final
    /// state, then make the start state final.
    pub fn star_op(&mut self) -> FsmResult<()> {
        let mut md = MergeData::new();
        self.set_misfit_accounting(true);
        self.isolate_start_state(&mut md)?;

        let start = self.start_state.expect("star operand has no start state");
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for fin in finals {
            if fin != start {
                self.merge_states_leaving(&mut md, fin, start)?;
            }
        }
        /* The start state merges into itself last, so its transitions are
         * not doubled into the other final states. */
        if self.state(start).is_final() {
            self.merge_states_leaving(&mut md, start, start)?;
        }
        self.set_fin_state(start);

        self.fill_in_states(&mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        self.after_op_minimize();
        Ok(())
    }

    /// Exactly `times` repetitions; zero repetitions accept nothing.
    pub fn repeat_op(&mut self, times: usize) -> FsmResult<()> {
        if times == 0 {
            *self = Fsm::empty_fsm(Rc::clone(&self.ctx));
            return Ok(());
        }
        let copy = self.clone();
        for _ in 1..times {
            self.do_concat(copy.clone(), None, false)?;
        }
        self.after_op_minimize();
        Ok(())
    }

    /// Up to `times` repetitions, the empty word included.
    pub fn optional_repeat_op(&mut self, times: usize) -> FsmResult<()> {
        if times == 0 {
            *self = Fsm::lambda_fsm(Rc::clone(&self.ctx));
            return Ok(());
        }
        let copy = self.clone();
        for _ in 1..times {
            /* Optional concatenation keeps the earlier finals final, so
             * shorter repetition counts stay accepted. */
            self.do_concat(copy.clone(), None, true)?;
        }

        /* Accept the empty word: isolate the start, then make it final. */
        let mut md = MergeData::new();
        self.set_misfit_accounting(true);
        self.isolate_start_state(&mut md)?;
        self.fill_in_states(&mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        let start = self.start_state.expect("machine lost its start state");
        self.set_fin_state(start);
        self.after_op_minimize();
        Ok(())
    }

    pub fn concat_op(&mut self, other: Fsm) -> FsmResult<()> {
        self.do_concat(other, None, false)?;
        self.after_op_minimize();
        Ok(())
    }

    pub fn union_op(&mut self, other: Fsm) -> FsmResult<()> {
        self.do_or(other)?;
        self.after_op_minimize();
        Ok(())
    }

    /// Accept-language intersection: both operands must accept.
    pub fn intersect_op(&mut self, mut other: Fsm) -> FsmResult<()> {
        self.set_fin_bits(SB_GRAPH1);
        other.set_fin_bits(SB_GRAPH2);
        self.do_or(other)?;
        self.unset_incomplete_finals();
        self.remove_dead_end_states();
        self.unset_fin_bits(SB_BOTH);
        self.after_op_minimize();
        Ok(())
    }

    /// Accept-language subtraction: words of `other` stop being accepted.
    pub fn subtract_op(&mut self, mut other: Fsm) -> FsmResult<()> {
        other.set_fin_bits(SB_GRAPH1);
        self.do_or(other)?;
        self.unset_killed_finals();
        self.remove_dead_end_states();
        self.unset_fin_bits(SB_BOTH);
        self.after_op_minimize();
        Ok(())
    }

    /// Mark every final state as continuing at the named entry point.
    /// Finality moves to wherever the entry leads once epsilons resolve.
    pub fn epsilon_trans(&mut self, id: EntryId) {
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for fin in finals {
            self.state_mut(fin).epsilon_trans.push(id);
            self.unset_fin_state(fin);
        }
    }

    /// Multi-entry machine composition used to build scanners: bring all
    /// machines together, resolve the epsilon transitions drawn between
    /// their named entry points, start at `start_id` and accept at
    /// `final_id`.
    pub fn join_op(
        &mut self,
        start_id: EntryId,
        final_id: EntryId,
        others: Vec<Fsm>,
    ) -> FsmResult<()> {
        self.set_misfit_accounting(true);
        self.unset_start_state();
        for mut other in others {
            assert!(self.same_ctx(&other), "machines built under different contexts");
            other.set_misfit_accounting(true);
            other.unset_start_state();
            self.bring_in_other(&mut other);
        }

        let new_start = self.add_state();
        self.set_start_state(new_start);
        self.state_mut(new_start).epsilon_trans.push(start_id);

        let mut md = MergeData::new();
        self.resolve_epsilon_trans(&mut md)?;

        if let Some(states) = self.entry_points.get(&final_id).cloned() {
            for state in states {
                self.set_fin_state(state);
            }
        }

        self.fill_in_states(&mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        self.after_op_minimize();
        Ok(())
    }

    /// Merge into every state carrying epsilon transitions the entry
    /// states they lead to, transitively.
    pub(crate) fn resolve_epsilon_trans(&mut self, md: &mut MergeData) -> FsmResult<()> {
        let carriers: Vec<StateId> = self
            .all_live_states()
            .into_iter()
            .filter(|&s| !self.state(s).epsilon_trans.is_empty())
            .collect();

        for state in carriers {
            let mut targets: Vec<StateId> = Vec::new();
            let mut seen: Vec<StateId> = vec![state];
            let mut queue: Vec<EntryId> = self.state(state).epsilon_trans.clone();
            while let Some(id) = queue.pop() {
                let entries = match self.entry_points.get(&id) {
                    Some(e) => e.clone(),
                    None => continue,
                };
                for entry in entries {
                    if !seen.contains(&entry) {
                        seen.push(entry);
                        targets.push(entry);
                        queue.extend(self.state(entry).epsilon_trans.iter().copied());
                    }
                }
            }
            for target in targets {
                self.merge_states_leaving(md, state, target)?;
            }
            self.state_mut(state).epsilon_trans.clear();
        }
        Ok(())
    }

    /// Union that deliberately leaves the graph nondeterministic: a new
    /// start state fans out over NFA edges to every operand. A nonzero
    /// `depth` bounds how many condensation rounds may run.
    pub fn nfa_union_op(&mut self, others: Vec<Fsm>, depth: usize) -> FsmResult<NfaRoundVect> {
        self.set_misfit_accounting(true);
        let self_start = self.start_state.expect("union operand has no start state");
        self.unset_start_state();

        let mut starts = vec![self_start];
        for mut other in others {
            assert!(self.same_ctx(&other), "machines built under different contexts");
            other.set_misfit_accounting(true);
            let other_start = other.start_state.expect("union operand has no start state");
            other.unset_start_state();
            let map = self.bring_in_other(&mut other);
            starts.push(map[other_start.0 as usize].expect("operand start state died"));
        }

        let new_start = self.add_state();
        self.set_start_state(new_start);
        for (order, &start) in starts.iter().enumerate() {
            self.attach_to_nfa(
                new_start,
                NfaEdge {
                    to_state: start,
                    order: order as i32,
                    push_table: ActionTable::new(),
                    pop_table: ActionTable::new(),
                    pop_test: ActionTable::new(),
                },
            );
        }

        let mut rounds = NfaRoundVect::new();
        if depth > 0 {
            let mut md = MergeData::new();
            rounds = self.nfa_fill_in_states(&mut md, depth)?;
        }
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(rounds)
    }

    /// Counted repetition as an NFA frame: the repetition counter lives
    /// in the runtime stack, not in the graph shape. The loop alternative
    /// is explored before the exit alternative (greedy).
    pub fn nfa_repeat_op(&mut self, acts: NfaRepeatActions) -> FsmResult<()> {
        self.nfa_repeat_frame(acts, true)
    }

    /// Like [`Fsm::nfa_repeat_op`] but the exit alternative is explored
    /// before the loop alternative (non-greedy).
    pub fn nfa_repeat_op2(&mut self, acts: NfaRepeatActions) -> FsmResult<()> {
        self.nfa_repeat_frame(acts, false)
    }

    fn nfa_repeat_frame(&mut self, acts: NfaRepeatActions, loop_first: bool) -> FsmResult<()> {
        let old_start = self.start_state.expect("repeat operand has no start state");
        if self.ctx.nfa_term_check && self.state(old_start).is_final() {
            /* Repeating a machine that accepts the empty word cannot be
             * bounded by a counter. */
            return Err(FsmError::RepetitionError);
        }

        self.unset_start_state();
        let new_start = self.add_state();
        let new_final = self.add_state();

        let mut entry_push = ActionTable::new();
        entry_push.set_action(0, acts.push);
        entry_push.set_action(1, acts.init);
        self.attach_to_nfa(
            new_start,
            NfaEdge {
                to_state: old_start,
                order: 0,
                push_table: entry_push,
                pop_table: ActionTable::new(),
                pop_test: ActionTable::new(),
            },
        );

        let (loop_order, exit_order) = if loop_first { (0, 1) } else { (1, 0) };
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for fin in finals {
            let mut loop_push = ActionTable::new();
            loop_push.set_action(0, acts.push);
            let mut loop_test = ActionTable::new();
            loop_test.set_action(0, acts.max);
            self.attach_to_nfa(
                fin,
                NfaEdge {
                    to_state: old_start,
                    order: loop_order,
                    push_table: loop_push,
                    pop_table: ActionTable::new(),
                    pop_test: loop_test,
                },
            );

            let mut exit_pop = ActionTable::new();
            exit_pop.set_action(0, acts.pop);
            let mut exit_test = ActionTable::new();
            exit_test.set_action(0, acts.min);
            self.attach_to_nfa(
                fin,
                NfaEdge {
                    to_state: new_final,
                    order: exit_order,
                    push_table: ActionTable::new(),
                    pop_table: exit_pop,
                    pop_test: exit_test,
                },
            );
            self.unset_fin_state(fin);
        }

        self.set_start_state(new_start);
        self.set_fin_state(new_final);
        Ok(())
    }

    /*
     * Operator workers.
     */

    /// Concatenation worker. Grafts `other`'s start onto `from_states`
    /// (the final states when not given), transferring pending out data
    /// onto the stitched transitions. `optional` keeps the old finals
    /// final.
    pub(crate) fn do_concat(
        &mut self,
        mut other: Fsm,
        from_states: Option<Vec<StateId>>,
        optional: bool,
    ) -> FsmResult<()> {
        assert!(self.same_ctx(&other), "machines built under different contexts");
        self.set_misfit_accounting(true);
        other.set_misfit_accounting(true);

        let from_states =
            from_states.unwrap_or_else(|| self.final_states.iter().copied().collect());
        if !optional {
            self.unset_all_fin_states();
        }

        let other_start_old = other.start_state.expect("concat operand has no start state");
        other.unset_start_state();
        let map = self.bring_in_other(&mut other);
        let other_start = map[other_start_old.0 as usize].expect("operand start state died");

        let mut md = MergeData::new();
        for state in from_states {
            self.merge_states_leaving(&mut md, state, other_start)?;
            /* A stitch point that did not become final again hands its
             * pending out data to the transitions just copied in. */
            if !self.state(state).is_final() {
                self.clear_out_data(state);
            }
        }

        self.fill_in_states(&mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Union worker: a fresh start state representing both old start
    /// states, filled in by subset construction.
    pub(crate) fn do_or(&mut self, mut other: Fsm) -> FsmResult<()> {
        assert!(self.same_ctx(&other), "machines built under different contexts");
        self.set_misfit_accounting(true);
        other.set_misfit_accounting(true);

        let self_start = self.start_state.expect("union operand has no start state");
        let other_start_old = other.start_state.expect("union operand has no start state");
        other.unset_start_state();
        let map = self.bring_in_other(&mut other);
        let other_start = map[other_start_old.0 as usize].expect("operand start state died");

        self.unset_start_state();
        let mut md = MergeData::new();
        let rep = self.dict_rep(&mut md, vec![self_start, other_start]);
        self.set_start_state(rep);

        self.fill_in_states(&mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Give the start state a life of its own: when it has in-edges or
    /// entry points, a fresh copy takes over start-state duty so grafts
    /// onto it cannot change the language entered elsewhere.
    pub(crate) fn isolate_start_state(&mut self, md: &mut MergeData) -> FsmResult<()> {
        if self.is_start_state_isolated() {
            return Ok(());
        }
        let old = self.start_state.expect("machine has no start state");
        self.unset_start_state();
        let new = self.add_state();
        self.set_start_state(new);
        self.merge_state_pair(md, new, old)
    }

    /// After an intersection, only states final in both operands stay
    /// final.
    pub(crate) fn unset_incomplete_finals(&mut self) {
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for fin in finals {
            let bits = self.state(fin).bits;
            if bits & SB_GRAPH1 == 0 || bits & SB_GRAPH2 == 0 {
                self.unset_fin_state(fin);
            }
        }
    }

    /// After a subtraction, states containing a final of the subtrahend
    /// stop being final.
    pub(crate) fn unset_killed_finals(&mut self) {
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for fin in finals {
            if self.state(fin).bits & SB_GRAPH1 != 0 {
                self.unset_fin_state(fin);
            }
        }
    }

    /// Apply the context's per-operator minimization policy.
    pub(crate) fn after_op_minimize(&mut self) {
        match self.ctx.minimize_opt {
            MinimizeOpt::EveryOp | MinimizeOpt::MostOps => self.minimize(),
            MinimizeOpt::None | MinimizeOpt::End => {}
        }
    }

    /// End-of-construction pass: pending out actions fold into the EOF
    /// tables, the machine minimizes per policy, and states get their
    /// stable numbers.
    pub fn finalize_machine(&mut self) {
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for fin in finals {
            self.transfer_out_actions(fin);
        }
        if self.ctx.minimize_opt != MinimizeOpt::None {
            self.minimize();
        }
        self.set_state_numbers(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::MinimizeLevel;
    use crate::key::KeyOps;

    fn ctx() -> Rc<FsmCtx> {
        FsmCtx::new(KeyOps::octet()).shared()
    }

    fn k(c: char) -> Key {
        Key::from_char(c)
    }

    #[test]
    fn test_literal_machine() {
        // "ab": three states in a chain, last one final.
        let fsm = Fsm::concat_fsm(ctx(), &[k('a'), k('b')]);
        assert_eq!(fsm.state_list.len(), 3);
        assert!(fsm.accepts_str("ab"));
        assert!(!fsm.accepts_str("a"));
        assert!(!fsm.accepts_str("abb"));
        assert!(!fsm.accepts_str(""));
    }

    #[test]
    fn test_lambda_and_empty() {
        let lambda = Fsm::lambda_fsm(ctx());
        assert!(lambda.accepts_str(""));
        assert!(!lambda.accepts_str("a"));

        let empty = Fsm::empty_fsm(ctx());
        assert!(!empty.accepts_str(""));
        assert!(!empty.accepts_str("a"));
    }

    #[test]
    fn test_case_insensitive_literal() {
        let fsm = Fsm::concat_fsm_ci(ctx(), &[k('a'), k('B')]);
        assert!(fsm.accepts_str("ab"));
        assert!(fsm.accepts_str("AB"));
        assert!(fsm.accepts_str("aB"));
        assert!(fsm.accepts_str("Ab"));
        assert!(!fsm.accepts_str("aa"));
    }

    #[test]
    fn test_or_fsm() {
        let fsm = Fsm::or_fsm(ctx(), &[k('x'), k('a'), k('x')]);
        assert!(fsm.accepts_str("a"));
        assert!(fsm.accepts_str("x"));
        assert!(!fsm.accepts_str("b"));
        assert!(!fsm.accepts_str("ax"));
    }

    #[test]
    fn test_union_of_ranges() {
        let c = ctx();
        let mut fsm = Fsm::range_fsm(Rc::clone(&c), k('a'), k('z'));
        let upper = Fsm::range_fsm(Rc::clone(&c), k('A'), k('Z'));
        fsm.union_op(upper).unwrap();

        // Two states: start and the fused final state, with one
        // transition per case range. The ranges are not adjacent, so
        // compression keeps them separate.
        assert_eq!(fsm.state_list.len(), 2);
        let start = fsm.start_state.unwrap();
        assert_eq!(fsm.state(start).out_list.len(), 2);
        assert!(fsm.accepts_str("q"));
        assert!(fsm.accepts_str("Q"));
        assert!(!fsm.accepts_str("1"));
    }

    #[test]
    fn test_concat_star_digits() {
        let c = ctx();
        let mut digits = Fsm::range_fsm(Rc::clone(&c), k('0'), k('9'));
        let mut star = Fsm::range_fsm(Rc::clone(&c), k('0'), k('9'));
        star.star_op().unwrap();
        digits.concat_op(star).unwrap();

        assert!(digits.accepts_str("0"));
        assert!(digits.accepts_str("42"));
        assert!(digits.accepts_str("007"));
        assert!(!digits.accepts_str(""));
        assert!(!digits.accepts_str("a"));
        assert!(!digits.accepts_str("4a"));
    }

    #[test]
    fn test_intersect_ranges() {
        let c = ctx();
        let mut fsm = Fsm::range_fsm(Rc::clone(&c), k('a'), k('z'));
        let narrow = Fsm::range_fsm(Rc::clone(&c), k('m'), k('p'));
        fsm.intersect_op(narrow).unwrap();

        assert!(fsm.accepts_str("m"));
        assert!(fsm.accepts_str("p"));
        assert!(!fsm.accepts_str("l"));
        assert!(!fsm.accepts_str("q"));

        // A single [m..p] transition to the final state.
        let start = fsm.start_state.unwrap();
        let out = &fsm.state(start).out_list;
        assert_eq!(out.len(), 1);
        assert_eq!(fsm.trans(out[0]).low_key, k('m'));
        assert_eq!(fsm.trans(out[0]).high_key, k('p'));
    }

    #[test]
    fn test_intersect_with_self_is_identity() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        let same = fsm.clone();
        fsm.intersect_op(same).unwrap();
        assert!(fsm.accepts_str("ab"));
        assert!(!fsm.accepts_str("a"));
        assert_eq!(fsm.state_list.len(), 3);
    }

    #[test]
    fn test_subtract_self_is_empty() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        let same = fsm.clone();
        fsm.subtract_op(same).unwrap();
        assert!(!fsm.accepts_str("ab"));
        assert!(!fsm.accepts_str(""));
    }

    #[test]
    fn test_subtract_narrowing() {
        let c = ctx();
        let mut fsm = Fsm::range_fsm(Rc::clone(&c), k('a'), k('z'));
        let vowels = Fsm::or_fsm(Rc::clone(&c), &[k('a'), k('e'), k('i'), k('o'), k('u')]);
        fsm.subtract_op(vowels).unwrap();
        assert!(fsm.accepts_str("b"));
        assert!(fsm.accepts_str("z"));
        assert!(!fsm.accepts_str("e"));
        assert!(!fsm.accepts_str("u"));
    }

    #[test]
    fn test_concat_lambda_identity() {
        let c = ctx();

        let mut left = Fsm::lambda_fsm(Rc::clone(&c));
        left.concat_op(Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')])).unwrap();
        assert!(left.accepts_str("ab"));
        assert!(!left.accepts_str(""));
        assert!(!left.accepts_str("b"));

        let mut right = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        right.concat_op(Fsm::lambda_fsm(Rc::clone(&c))).unwrap();
        assert!(right.accepts_str("ab"));
        assert!(!right.accepts_str(""));
        assert!(!right.accepts_str("a"));
    }

    #[test]
    fn test_union_commutes() {
        let c = ctx();
        let mk = |a: &str, b: &str| {
            let mut l = Fsm::concat_fsm(
                Rc::clone(&c),
                &a.chars().map(Key::from_char).collect::<Vec<_>>(),
            );
            let r = Fsm::concat_fsm(
                Rc::clone(&c),
                &b.chars().map(Key::from_char).collect::<Vec<_>>(),
            );
            l.union_op(r).unwrap();
            l
        };
        let ab_cd = mk("ab", "cd");
        let cd_ab = mk("cd", "ab");
        for w in ["ab", "cd", "ac", "", "abcd"] {
            assert_eq!(ab_cd.accepts_str(w), cd_ab.accepts_str(w), "word {:?}", w);
        }
        assert_eq!(ab_cd.state_list.len(), cd_ab.state_list.len());
    }

    #[test]
    fn test_repeat_op() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        fsm.repeat_op(3).unwrap();
        assert!(fsm.accepts_str("aaa"));
        assert!(!fsm.accepts_str("aa"));
        assert!(!fsm.accepts_str("aaaa"));

        let mut zero = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        zero.repeat_op(0).unwrap();
        assert!(!zero.accepts_str(""));
        assert!(!zero.accepts_str("a"));
    }

    #[test]
    fn test_optional_repeat_op() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        fsm.optional_repeat_op(3).unwrap();
        for (w, want) in [("", true), ("a", true), ("aa", true), ("aaa", true), ("aaaa", false)] {
            assert_eq!(fsm.accepts_str(w), want, "word {:?}", w);
        }
    }

    #[test]
    fn test_star_self_loop() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        fsm.star_op().unwrap();
        for (w, want) in [("", true), ("ab", true), ("abab", true), ("aba", false)] {
            assert_eq!(fsm.accepts_str(w), want, "word {:?}", w);
        }
    }

    #[test]
    fn test_join_op_scanner() {
        let c = ctx();
        // Entry 1: "a" continuing at entry 2; entry 2: "b" continuing at
        // the accepting point, entry 3.
        let mut one = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        one.epsilon_trans(2);
        let one_start = one.start_state.unwrap();
        one.set_entry(1, one_start);

        let mut two = Fsm::concat_fsm(Rc::clone(&c), &[k('b')]);
        let two_start = two.start_state.unwrap();
        two.set_entry(2, two_start);
        two.epsilon_trans(3);

        let mut accept = Fsm::lambda_fsm(Rc::clone(&c));
        let accept_start = accept.start_state.unwrap();
        accept.set_entry(3, accept_start);

        one.join_op(1, 3, vec![two, accept]).unwrap();
        assert!(one.accepts_str("ab"));
        assert!(!one.accepts_str("a"));
        assert!(!one.accepts_str("b"));
    }

    #[test]
    fn test_nfa_union_structure() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        let other = Fsm::concat_fsm(Rc::clone(&c), &[k('b')]);
        let rounds = fsm.nfa_union_op(vec![other], 0).unwrap();
        assert!(rounds.is_empty());

        let start = fsm.start_state.unwrap();
        let edges = fsm.state(start).nfa_out.as_ref().unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].order, 0);
        assert_eq!(edges[1].order, 1);
        assert_eq!(fsm.nfa_list, vec![start]);
    }

    #[test]
    fn test_nfa_union_condense() {
        let c = ctx();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        let other = Fsm::concat_fsm(Rc::clone(&c), &[k('b')]);
        let rounds = fsm.nfa_union_op(vec![other], 4).unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].groups, 1);
        assert!(fsm.nfa_list.is_empty());
        assert!(fsm.accepts_str("a"));
        assert!(fsm.accepts_str("b"));
        assert!(!fsm.accepts_str("ab"));
    }

    #[test]
    fn test_nfa_repeat_orders_differ() {
        let c = ctx();
        let init = c.new_action("init", Default::default());
        let min = c.new_action("min", Default::default());
        let max = c.new_action("max", Default::default());
        let push = c.new_action("push", Default::default());
        let pop = c.new_action("pop", Default::default());
        let acts = NfaRepeatActions { init, min, max, push, pop };

        let mut greedy = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        greedy.nfa_repeat_op(acts).unwrap();
        let mut lazy = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        lazy.nfa_repeat_op2(acts).unwrap();

        let edge_orders = |fsm: &Fsm| -> Vec<(bool, i32)> {
            // (goes to the new final, order) per inner-final edge
            let fin = *fsm.final_states.iter().next().unwrap();
            fsm.all_live_states()
                .iter()
                .filter_map(|&s| fsm.state(s).nfa_out.clone())
                .flatten()
                .map(|e| (e.to_state == fin, e.order))
                .collect()
        };
        let g = edge_orders(&greedy);
        let l = edge_orders(&lazy);
        assert!(g.contains(&(true, 1)), "greedy exits second: {:?}", g);
        assert!(l.contains(&(true, 0)), "lazy exits first: {:?}", l);
    }

    #[test]
    fn test_priority_conflict_in_union() {
        let c = ctx();
        let d1 = c.new_prior_desc(7, 3);
        let d2 = c.new_prior_desc(7, 3);

        let mut a = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        a.all_trans_prior(0, d1);
        let mut b = Fsm::concat_fsm(Rc::clone(&c), &[k('a')]);
        b.all_trans_prior(1, d2);

        assert_eq!(a.union_op(b), Err(FsmError::PriorInteraction(7)));
    }

    #[test]
    fn test_priority_resolution_in_union() {
        let c = FsmCtx::new(KeyOps::octet())
            .with_minimize(MinimizeLevel::Stable, MinimizeOpt::None)
            .shared();
        let d_hi = c.new_prior_desc(7, 5);
        let d_lo = c.new_prior_desc(7, 1);

        // "ab" at high priority unioned with "ac" at low priority: the
        // high side owns the 'a' transition, so "ac" is cut off.
        let mut a = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        a.all_trans_prior(0, d_hi);
        let mut b = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('c')]);
        b.all_trans_prior(1, d_lo);

        a.union_op(b).unwrap();
        assert!(a.accepts_str("ab"));
        assert!(!a.accepts_str("ac"));
    }

    #[test]
    fn test_too_many_states() {
        let c = FsmCtx::new(KeyOps::octet()).with_state_limit(3).shared();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b'), k('c')]);
        let other = Fsm::concat_fsm(Rc::clone(&c), &[k('x'), k('y'), k('z')]);
        assert_eq!(fsm.union_op(other), Err(FsmError::TooManyStates(3)));
    }

    #[test]
    fn test_nfa_repeat_rejects_lambda_operand() {
        let c = FsmCtx::new(KeyOps::octet()).with_nfa_term_check().shared();
        let init = c.new_action("i", Default::default());
        let acts = NfaRepeatActions { init, min: init, max: init, push: init, pop: init };
        let mut fsm = Fsm::lambda_fsm(Rc::clone(&c));
        assert_eq!(fsm.nfa_repeat_op(acts), Err(FsmError::RepetitionError));
    }
}
