//! Subset construction and the transition-merging machinery behind every
//! two-operand operator.
//!
//! Merging is driven by [`MergeData`]: an interning dictionary mapping a
//! sorted set of source states to the destination state that represents
//! it, plus a queue of freshly created representatives whose
//! out-transitions have not been filled in yet (the misfit states).
//! [`Fsm::fill_in_states`] drains the queue, copying and crossing the
//! out-lists of each representative's source set with the range-pair
//! iterator; crossing two transitions combines their tables and sends the
//! result to the representative of the union of their target sets.

use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::action::compare_prior;
use crate::cond::{
    expansion_values, merge_cond_sets, CondSpaceId, CondVal, COND_DENSITY_LIMIT,
};
use crate::error::{FsmError, FsmResult};
use crate::graph::{
    CondBranch, Fsm, RefKind, StateId, Trans, TransBody, TransData, TransId, TransSlot, SB_BOTH,
    SB_ISFINAL,
};
use crate::pairiter::{RangePairIter, RangeRef, ValPairIter, ValRef};

/// Scratch for one merge operation.
#[derive(Default)]
pub struct MergeData {
    state_dict: FxHashMap<Rc<Vec<StateId>>, StateId>,
    fill_queue: VecDeque<StateId>,
    filled: Vec<StateId>,
}

impl MergeData {
    pub fn new() -> MergeData {
        MergeData::default()
    }
}

/// One bounded NFA condensation round: which round and how many NFA
/// groups were live going in. Used to prove termination under the
/// context's `nfa_term_check`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NfaRound {
    pub depth: usize,
    pub groups: usize,
}

pub type NfaRoundVect = Vec<NfaRound>;

impl Fsm {
    /// The state representing `set`, creating a pending misfit state on a
    /// dictionary miss.
    pub(crate) fn dict_rep(&mut self, md: &mut MergeData, mut set: Vec<StateId>) -> StateId {
        set.sort_unstable();
        set.dedup();
        let set = Rc::new(set);
        if let Some(&rep) = md.state_dict.get(&set) {
            return rep;
        }
        let rep = self.add_state();
        self.state_mut(rep).dict_set = Some(Rc::clone(&set));
        md.state_dict.insert(set, rep);
        md.fill_queue.push_back(rep);
        rep
    }

    /// Drain the worklist of states whose out-transitions are pending,
    /// merging in the out-lists of every state of their source sets. New
    /// representatives created along the way join the queue; the process
    /// terminates when no misfits remain or the state ceiling is hit.
    pub fn fill_in_states(&mut self, md: &mut MergeData) -> FsmResult<()> {
        let mut filled = 0usize;
        while let Some(id) = md.fill_queue.pop_front() {
            if let Some(limit) = self.ctx.state_limit {
                if self.live_state_count() > limit {
                    return Err(FsmError::TooManyStates(limit));
                }
            }
            let set = self
                .state(id)
                .dict_set
                .clone()
                .expect("fill queue holds a state without a source set");
            self.merge_states_into(md, id, &set)?;
            self.ensure_on_main_list(id);
            md.filled.push(id);

            filled += 1;
            if filled % 1000 == 0 {
                log::debug!(
                    "fill_in_states: filled={} pending={} states={}",
                    filled,
                    md.fill_queue.len(),
                    self.live_state_count()
                );
            }
        }

        /* The dictionary is per-operation scratch; later operations see
         * every state as a singleton again. */
        for id in md.filled.drain(..) {
            self.state_mut(id).dict_set = None;
        }
        md.state_dict.clear();
        Ok(())
    }

    /// Merge a set of source states into `dest`.
    pub(crate) fn merge_states_into(
        &mut self,
        md: &mut MergeData,
        dest: StateId,
        srcs: &[StateId],
    ) -> FsmResult<()> {
        for &src in srcs {
            self.merge_state_pair(md, dest, src)?;
        }
        Ok(())
    }

    /// Draw everything `src` has into `dest`: out-transitions (crossed
    /// against what `dest` already has), pending out conditions, epsilon
    /// and NFA edges, state action tables, and the final-state data when
    /// `src` is final.
    pub(crate) fn merge_state_pair(
        &mut self,
        md: &mut MergeData,
        dest: StateId,
        src: StateId,
    ) -> FsmResult<()> {
        if dest == src {
            return Ok(());
        }

        let src_out = self.state(src).out_list.clone();
        self.out_trans_copy(md, dest, &src_out)?;
        self.merge_out_conds(dest, src)?;

        let eps = self.state(src).epsilon_trans.clone();
        self.state_mut(dest).epsilon_trans.extend(eps);

        if let Some(edges) = self.state(src).nfa_out.clone() {
            for edge in edges {
                let present = self
                    .state(dest)
                    .nfa_out
                    .as_ref()
                    .map(|es| es.contains(&edge))
                    .unwrap_or(false);
                if !present {
                    self.attach_to_nfa(dest, edge);
                }
            }
        }

        /* State tables that belong to the state regardless of finality. */
        let src_state = self.state(src);
        let to_tbl = src_state.to_state_action_table.clone();
        let from_tbl = src_state.from_state_action_table.clone();
        let err_tbl = src_state.err_action_table.clone();
        self.merge_counted(dest, &to_tbl, |s| &mut s.to_state_action_table, RefKind::ToState);
        self.merge_counted(dest, &from_tbl, |s| &mut s.from_state_action_table, RefKind::FromState);
        self.state_mut(dest).err_action_table.set_actions(&err_tbl);

        if self.state(src).is_final() {
            self.set_fin_state(dest);
            let src_state = self.state(src);
            let out_tbl = src_state.out_action_table.clone();
            let out_prior = src_state.out_prior_table.clone();
            let eof_tbl = src_state.eof_action_table.clone();
            let lm: Vec<_> = src_state.lm_item_set.iter().copied().collect();
            let bits = src_state.bits & SB_BOTH;

            self.state_mut(dest).out_action_table.set_actions(&out_tbl);
            self.state_mut(dest).out_prior_table.set_priors(&out_prior);
            self.merge_counted(dest, &eof_tbl, |s| &mut s.eof_action_table, RefKind::Eof);
            self.state_mut(dest).lm_item_set.extend(lm);
            self.state_mut(dest).bits |= bits;
        }
        Ok(())
    }

    /// Merge `src` into `dest` while honouring `dest`'s pending out data:
    /// when `dest` carries out actions, priorities or conditions, an
    /// intermediate copy of `src` takes the pending data onto its
    /// transitions first, so the data lands on exactly the transitions
    /// that leave through `dest`.
    pub(crate) fn merge_states_leaving(
        &mut self,
        md: &mut MergeData,
        dest: StateId,
        src: StateId,
    ) -> FsmResult<()> {
        if !self.has_out_data(dest) {
            return self.merge_state_pair(md, dest, src);
        }

        let copy = self.copy_state_for_expansion(src);

        let out_actions = self.state(dest).out_action_table.clone();
        let out_priors = self.state(dest).out_prior_table.clone();
        let out_space = self.state(dest).out_cond_space;
        let out_vals = self.state(dest).out_cond_vals.clone();

        let pending = TransData {
            to_state: None,
            action_table: out_actions,
            prior_table: out_priors,
            lm_action_table: Default::default(),
        };
        let copy_out = self.state(copy).out_list.clone();
        for tid in copy_out {
            for slot in self.slots_of(tid) {
                self.add_in_trans(slot, &pending);
            }
            if let Some(space) = out_space {
                self.embed_out_conds_in_trans(tid, space, &out_vals)?;
            }
        }

        self.merge_state_pair(md, dest, copy)
    }

    /// Every destination-bearing slot of a transition.
    pub(crate) fn slots_of(&self, tid: TransId) -> Vec<TransSlot> {
        match &self.trans(tid).body {
            TransBody::Plain(_) => vec![TransSlot::Plain(tid)],
            TransBody::Cond { branches, .. } => branches
                .iter()
                .map(|b| TransSlot::Cond(tid, b.key))
                .collect(),
        }
    }

    /// A free-standing duplicate of a state: same tables and finality
    /// bits, duplicated out-transitions to the same targets. No entry
    /// points and no list reasons, so it is reclaimed by the misfit pass
    /// once merged from.
    pub(crate) fn copy_state_for_expansion(&mut self, src: StateId) -> StateId {
        let id = self.add_state();

        let s = self.state(src).clone();
        {
            let n = self.state_mut(id);
            n.bits |= s.bits & (SB_ISFINAL | SB_BOTH);
            n.epsilon_trans = s.epsilon_trans.clone();
            n.out_prior_table = s.out_prior_table;
            n.to_state_action_table = s.to_state_action_table;
            n.from_state_action_table = s.from_state_action_table;
            n.out_action_table = s.out_action_table;
            n.out_cond_space = s.out_cond_space;
            n.out_cond_vals = s.out_cond_vals;
            n.err_action_table = s.err_action_table;
            n.eof_action_table = s.eof_action_table;
            n.lm_item_set = s.lm_item_set;
        }
        if self.state(id).bits & SB_ISFINAL != 0 {
            self.final_states.insert(id);
        }

        for tid in self.state(src).out_list.clone() {
            let dup = self.dup_trans(id, tid);
            self.state_mut(id).out_list.push(dup);
        }
        if let Some(edges) = self.state(src).nfa_out.clone() {
            for edge in edges {
                self.attach_to_nfa(id, edge);
            }
        }
        id
    }

    /// Duplicate a transition for a new owner, attached to the same
    /// targets. Not inserted into any out-list; the caller places it.
    pub(crate) fn dup_trans(&mut self, from: StateId, src: TransId) -> TransId {
        let src_trans = self.trans(src).clone();

        /* Strip the attachments, remembering the targets by slot key. */
        let mut plain_target: Option<StateId> = None;
        let mut cond_targets: Vec<(CondVal, StateId)> = Vec::new();
        let body = match src_trans.body {
            TransBody::Plain(mut data) => {
                plain_target = data.to_state.take();
                TransBody::Plain(data)
            }
            TransBody::Cond { space, mut branches } => {
                for b in branches.iter_mut() {
                    if let Some(to) = b.data.to_state.take() {
                        cond_targets.push((b.key, to));
                    }
                }
                TransBody::Cond { space, branches }
            }
        };

        let tid = self.alloc_trans(Trans {
            from_state: from,
            low_key: src_trans.low_key,
            high_key: src_trans.high_key,
            body,
        });
        if let Some(to) = plain_target {
            self.attach_slot(TransSlot::Plain(tid), Some(to));
        }
        for (val, to) in cond_targets {
            self.attach_slot(TransSlot::Cond(tid, val), Some(to));
        }
        tid
    }

    /// Copy `src_list` into `dest`'s out-list, walking both range-sorted
    /// lists with the pair iterator. Non-overlapping source ranges are
    /// duplicated in; overlaps are crossed; on a break of the dest side
    /// the dest transition is duplicated so both halves own their data.
    pub(crate) fn out_trans_copy(
        &mut self,
        md: &mut MergeData,
        dest: StateId,
        src_list: &[TransId],
    ) -> FsmResult<()> {
        let ops = self.ctx.key_ops;
        let snapshot = |fsm: &Fsm, list: &[TransId]| -> Vec<RangeRef<TransId>> {
            list.iter()
                .map(|&t| {
                    let trans = fsm.trans(t);
                    RangeRef { low: trans.low_key, high: trans.high_key, val: t }
                })
                .collect()
        };
        let s1 = snapshot(self, &self.state(dest).out_list);
        let s2 = snapshot(self, src_list);

        let mut it = RangePairIter::new(ops, s1, s2);
        let mut new_out: Vec<TransId> = Vec::new();
        while let Some(ev) = it.next() {
            if ev.in_s1_only() {
                let r = *it.s1();
                let trans = self.trans_mut(r.val);
                trans.low_key = r.low;
                trans.high_key = r.high;
                new_out.push(r.val);
            } else if ev.in_s2_only() {
                let r = *it.s2();
                let dup = self.dup_trans(dest, r.val);
                let trans = self.trans_mut(dup);
                trans.low_key = r.low;
                trans.high_key = r.high;
                new_out.push(dup);
            } else if ev.overlap() {
                let d = *it.s1();
                let s = *it.s2();
                let merged = self.cross_transitions(md, dest, d.val, s.val)?;
                let trans = self.trans_mut(merged);
                trans.low_key = d.low;
                trans.high_key = d.high;
                new_out.push(merged);
            } else if ev.breaks_s1() {
                /* The dest transition is about to be consumed in two
                 * pieces; give the first piece its own copy. The saved
                 * second half keeps the original. */
                let dup = self.dup_trans(dest, it.s1().val);
                it.set_s1_val(dup);
            }
            /* breaks_s2: the source side is only a template, never
             * mutated, so one transition may serve both pieces. */
        }
        self.state_mut(dest).out_list = new_out;
        Ok(())
    }

    /// Cross a source transition into the dest transition occupying the
    /// same range. Returns the surviving dest transition id.
    pub(crate) fn cross_transitions(
        &mut self,
        md: &mut MergeData,
        from: StateId,
        dest_tid: TransId,
        src_tid: TransId,
    ) -> FsmResult<TransId> {
        if dest_tid == src_tid {
            /* Merging a state with itself; the transition already carries
             * everything it needs. */
            return Ok(dest_tid);
        }

        if self.trans(dest_tid).plain() && self.trans(src_tid).plain() {
            self.cross_plain(md, from, dest_tid, src_tid)?;
            return Ok(dest_tid);
        }

        /* At least one side is conditional: unify over the merged space,
         * expand both enumerations, then cross the value lists. */
        self.convert_to_cond(dest_tid);
        let dest_space = self
            .trans(dest_tid)
            .cond_space()
            .expect("conversion to conditional failed");
        let src_set = match self.trans(src_tid).cond_space() {
            Some(space) => self.ctx.cond_space(space).cond_set.clone(),
            None => Vec::new(),
        };
        let dest_set = self.ctx.cond_space(dest_space).cond_set.clone();
        let merged_set = merge_cond_sets(&dest_set, &src_set);
        if merged_set.len() > COND_DENSITY_LIMIT {
            return Err(FsmError::TransDensity);
        }
        let merged_space = self.ctx.add_cond_space(merged_set.clone());

        self.expand_conds(dest_tid, merged_space)?;

        /* Effective source branches over the merged space. */
        let src_branches: Vec<(CondVal, TransData)> = match self.trans(src_tid).body.clone() {
            TransBody::Plain(data) => {
                let detached = data.detached();
                expansion_values(CondVal(0), &[], &merged_set)
                    .into_iter()
                    .map(|v| (v, detached.clone()))
                    .collect()
            }
            TransBody::Cond { branches, .. } => {
                let mut out = Vec::new();
                for b in branches {
                    let detached = b.data.detached();
                    for v in expansion_values(b.key, &src_set, &merged_set) {
                        out.push((v, detached.clone()));
                    }
                }
                out.sort_by_key(|e| e.0);
                out
            }
        };
        self.ctx.charge_cond_cost(merged_space, src_branches.len() as i64)?;

        /* Remember the original targets of the source branches; the
         * detached copies lost them. */
        let src_targets: FxHashMap<CondVal, Option<StateId>> = match &self.trans(src_tid).body {
            TransBody::Plain(data) => expansion_values(CondVal(0), &[], &merged_set)
                .into_iter()
                .map(|v| (v, data.to_state))
                .collect(),
            TransBody::Cond { space, branches } => {
                let set = self.ctx.cond_space(*space).cond_set.clone();
                let mut out = FxHashMap::default();
                for b in branches {
                    for v in expansion_values(b.key, &set, &merged_set) {
                        out.insert(v, b.data.to_state);
                    }
                }
                out
            }
        };

        let dest_vals: Vec<ValRef<CondVal>> = match &self.trans(dest_tid).body {
            TransBody::Cond { branches, .. } => {
                branches.iter().map(|b| ValRef { key: b.key, val: b.key }).collect()
            }
            TransBody::Plain(_) => unreachable!("dest was converted to conditional"),
        };
        let src_vals: Vec<ValRef<CondVal>> =
            src_branches.iter().map(|(v, _)| ValRef { key: *v, val: *v }).collect();
        let src_data: FxHashMap<CondVal, TransData> = src_branches.into_iter().collect();

        let mut it = ValPairIter::new(dest_vals, src_vals);
        while let Some(ev) = it.next() {
            match ev {
                crate::pairiter::ValPairEvent::OnlyInS1 => {}
                crate::pairiter::ValPairEvent::OnlyInS2 => {
                    let val = it.s2().val;
                    let to = src_targets.get(&val).copied().flatten();
                    let data = src_data
                        .get(&val)
                        .expect("source branch vanished during crossing")
                        .clone();
                    self.attach_new_cond(dest_tid, None, val);
                    let slot = TransSlot::Cond(dest_tid, val);
                    self.add_data_refs(&data);
                    *self.slot_data_mut(slot) = data;
                    if let Some(to) = to {
                        self.attach_slot(slot, Some(to));
                    }
                }
                crate::pairiter::ValPairEvent::ExactOverlap => {
                    let val = it.s1().val;
                    let to = src_targets.get(&val).copied().flatten();
                    let mut data = src_data
                        .get(&val)
                        .expect("source branch vanished during crossing")
                        .clone();
                    data.to_state = to;
                    self.cross_slot(md, from, TransSlot::Cond(dest_tid, val), &data)?;
                }
            }
        }
        Ok(dest_tid)
    }

    /// Cross two plain transitions in place on the dest side.
    fn cross_plain(
        &mut self,
        md: &mut MergeData,
        from: StateId,
        dest_tid: TransId,
        src_tid: TransId,
    ) -> FsmResult<()> {
        let src_data = match &self.trans(src_tid).body {
            TransBody::Plain(data) => data.clone(),
            TransBody::Cond { .. } => unreachable!("cross_plain on conditional transition"),
        };
        self.cross_slot(md, from, TransSlot::Plain(dest_tid), &src_data)
    }

    /// Cross source data into one destination slot: resolve priorities,
    /// then either overwrite, keep, or merge the slot, sending a merged
    /// destination to the representative of the union of target sets.
    fn cross_slot(
        &mut self,
        md: &mut MergeData,
        _from: StateId,
        slot: TransSlot,
        src_data: &TransData,
    ) -> FsmResult<()> {
        use std::cmp::Ordering;

        let cmp = compare_prior(&self.slot_data(slot).prior_table, &src_data.prior_table)?;
        match cmp {
            Ordering::Less => {
                /* Source priority wins outright; the slot takes the source
                 * data wholesale. */
                self.detach_slot(slot);
                let old = std::mem::take(self.slot_data_mut(slot));
                self.drop_data_refs(&old);
                let replacement = src_data.detached();
                self.add_data_refs(&replacement);
                *self.slot_data_mut(slot) = replacement;
                if let Some(to) = src_data.to_state {
                    self.attach_slot(slot, Some(to));
                }
                Ok(())
            }
            Ordering::Greater => Ok(()),
            Ordering::Equal => self.merge_into_slot(md, slot, src_data),
        }
    }

    /// Merge source data into a slot of equal priority. Error
    /// destinations absorb into real ones; two real destinations go to
    /// the state representing the union of their source sets.
    fn merge_into_slot(
        &mut self,
        md: &mut MergeData,
        slot: TransSlot,
        src_data: &TransData,
    ) -> FsmResult<()> {
        let dest_to = self.slot_data(slot).to_state;
        match (dest_to, src_data.to_state) {
            (None, Some(to)) => {
                /* Non-error added into error keeps the non-error. */
                self.redirect_error_trans(slot, to);
            }
            (Some(d), Some(s)) if d != s => {
                let mut set: Vec<StateId> = self.state_set_of(d).as_ref().clone();
                set.extend(self.state_set_of(s).iter().copied());
                let rep = self.dict_rep(md, set);
                self.move_slot(slot, Some(rep));
            }
            /* Error into error, error into non-error, or identical
             * destinations: the destination stands. */
            _ => {}
        }
        self.add_in_trans(slot, src_data);
        Ok(())
    }

    /// Draw the properties of source transition data into a slot: action
    /// and longest-match tables merge by ordering, priorities union.
    pub(crate) fn add_in_trans(&mut self, slot: TransSlot, src: &TransData) {
        /* Count only the actions actually inserted. */
        let dest = self.slot_data(slot);
        let fresh: Vec<_> = src
            .action_table
            .iter()
            .filter(|el| !dest.action_table.iter().any(|d| d == *el))
            .copied()
            .collect();
        for el in &fresh {
            let a = self.ctx.action(el.action);
            a.num_trans_refs.set(a.num_trans_refs.get() + 1);
        }
        let data = self.slot_data_mut(slot);
        data.action_table.set_actions(&src.action_table);
        data.lm_action_table.set_actions(&src.lm_action_table);
        data.prior_table.set_priors(&src.prior_table);
    }

    /// Expand a conditional transition's enumeration from its current
    /// space to `merged_space`, replicating every branch over the added
    /// guards.
    pub(crate) fn expand_conds(
        &mut self,
        tid: TransId,
        merged_space: CondSpaceId,
    ) -> FsmResult<()> {
        self.convert_to_cond(tid);
        let (old_space, old_branches) = match &self.trans(tid).body {
            TransBody::Cond { space, branches } => (*space, branches.clone()),
            TransBody::Plain(_) => unreachable!("conversion to conditional failed"),
        };
        if old_space == merged_space {
            return Ok(());
        }
        let old_set = self.ctx.cond_space(old_space).cond_set.clone();
        let new_set = self.ctx.cond_space(merged_space).cond_set.clone();

        /* Detach everything, rebuild the enumeration, reattach. */
        let mut targets: Vec<(CondVal, Option<StateId>)> = Vec::new();
        for b in &old_branches {
            self.detach_slot(TransSlot::Cond(tid, b.key));
            self.drop_data_refs(&b.data);
        }
        for &guard in &old_set {
            let a = self.ctx.action(guard);
            a.num_cond_refs.set(a.num_cond_refs.get() - 1);
        }

        let mut new_branches: Vec<CondBranch> = Vec::new();
        for b in &old_branches {
            let detached = b.data.detached();
            for v in expansion_values(b.key, &old_set, &new_set) {
                targets.push((v, b.data.to_state));
                new_branches.push(CondBranch { key: v, data: detached.clone() });
            }
        }
        new_branches.sort_by_key(|b| b.key);
        targets.sort_by_key(|t| t.0);

        let copies = new_branches.len() as i64 - old_branches.len() as i64;
        self.ctx.charge_cond_cost(merged_space, copies.max(0))?;

        for b in &new_branches {
            self.add_data_refs(&b.data);
        }
        for &guard in &new_set {
            let a = self.ctx.action(guard);
            a.num_cond_refs.set(a.num_cond_refs.get() + 1);
        }
        self.trans_mut(tid).body = TransBody::Cond { space: merged_space, branches: new_branches };
        for (val, to) in targets {
            if let Some(to) = to {
                self.attach_slot(TransSlot::Cond(tid, val), Some(to));
            }
        }
        Ok(())
    }

    /// Constrain a transition by a state's pending out conditions: the
    /// transition's space unions with the pending space and branches
    /// whose pending projection is not an allowed value go to error.
    pub(crate) fn embed_out_conds_in_trans(
        &mut self,
        tid: TransId,
        pending_space: CondSpaceId,
        allowed: &[CondVal],
    ) -> FsmResult<()> {
        self.convert_to_cond(tid);
        let own_space = self
            .trans(tid)
            .cond_space()
            .expect("conversion to conditional failed");
        let own_set = self.ctx.cond_space(own_space).cond_set.clone();
        let pending_set = self.ctx.cond_space(pending_space).cond_set.clone();
        let merged_set = merge_cond_sets(&own_set, &pending_set);
        if merged_set.len() > COND_DENSITY_LIMIT {
            return Err(FsmError::TransDensity);
        }
        let merged_space = self.ctx.add_cond_space(merged_set.clone());
        self.expand_conds(tid, merged_space)?;

        let branches = match &self.trans(tid).body {
            TransBody::Cond { branches, .. } => branches.clone(),
            TransBody::Plain(_) => unreachable!("conversion to conditional failed"),
        };
        for b in branches {
            let projected = crate::cond::project_value(b.key, &merged_set, &pending_set);
            if !allowed.contains(&projected) {
                self.detach_slot(TransSlot::Cond(tid, b.key));
            }
        }
        Ok(())
    }

    /// Merge `src`'s pending out conditions into `dest`'s.
    pub(crate) fn merge_out_conds(&mut self, dest: StateId, src: StateId) -> FsmResult<()> {
        let (src_space, src_vals) = {
            let s = self.state(src);
            match s.out_cond_space {
                Some(space) => (space, s.out_cond_vals.clone()),
                None => return Ok(()),
            }
        };
        let (dest_space, dest_vals) = {
            let d = self.state(dest);
            match d.out_cond_space {
                Some(space) => (space, d.out_cond_vals.clone()),
                None => {
                    let d = self.state_mut(dest);
                    d.out_cond_space = Some(src_space);
                    d.out_cond_vals = src_vals;
                    return Ok(());
                }
            }
        };

        let dest_set = self.ctx.cond_space(dest_space).cond_set.clone();
        let src_set = self.ctx.cond_space(src_space).cond_set.clone();
        let merged_set = merge_cond_sets(&dest_set, &src_set);
        if merged_set.len() > COND_DENSITY_LIMIT {
            return Err(FsmError::TransDensity);
        }
        let merged_space = self.ctx.add_cond_space(merged_set.clone());

        let mut vals: Vec<CondVal> = Vec::new();
        for v in dest_vals {
            vals.extend(expansion_values(v, &dest_set, &merged_set));
        }
        for v in src_vals {
            vals.extend(expansion_values(v, &src_set, &merged_set));
        }
        vals.sort_unstable();
        vals.dedup();

        let d = self.state_mut(dest);
        d.out_cond_space = Some(merged_space);
        d.out_cond_vals = vals;
        Ok(())
    }

    /// Re-run subset construction from the start state. On a machine that
    /// is already deterministic this is a fixed point: the state count is
    /// unchanged.
    pub fn determinize(&mut self) -> FsmResult<()> {
        let old_start = match self.start_state {
            Some(s) => s,
            None => return Ok(()),
        };
        self.set_misfit_accounting(true);
        let mut md = MergeData::new();

        self.unset_start_state();
        let new_start = self.dict_rep(&mut md, vec![old_start]);
        self.set_start_state(new_start);

        let entries: Vec<(i32, Vec<StateId>)> = self
            .entry_points
            .iter()
            .map(|(&id, states)| (id, states.clone()))
            .collect();
        for (id, states) in entries {
            for old in states {
                let rep = self.dict_rep(&mut md, vec![old]);
                self.change_entry(id, rep, old);
            }
        }

        self.fill_in_states(&mut md)?;
        self.remove_unreachable_states();
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Bounded NFA condensation: each round folds every NFA edge's target
    /// into its owner, then fills in the states the merges created. With
    /// `nfa_term_check` set, running out of rounds while NFA edges remain
    /// is reported as a non-terminating repetition.
    pub(crate) fn nfa_fill_in_states(
        &mut self,
        md: &mut MergeData,
        depth: usize,
    ) -> FsmResult<NfaRoundVect> {
        let mut rounds: NfaRoundVect = Vec::new();
        for round in 0..depth {
            let worklist = self.nfa_list.clone();
            if worklist.is_empty() {
                break;
            }
            rounds.push(NfaRound { depth: round, groups: worklist.len() });
            log::debug!("nfa round {}: {} groups", round, worklist.len());

            for state in worklist {
                let edges = match self.state(state).nfa_out.clone() {
                    Some(e) => e,
                    None => continue,
                };
                self.clear_nfa_out(state);
                for edge in edges {
                    self.merge_state_pair(md, state, edge.to_state)?;
                }
            }
            self.fill_in_states(md)?;
        }

        if self.ctx.nfa_term_check && !self.nfa_list.is_empty() && rounds.len() == depth {
            return Err(FsmError::RepetitionError);
        }
        Ok(rounds)
    }
}

impl TransData {
    /// A copy with no destination, for alloc/replace paths that manage
    /// attachment themselves.
    pub(crate) fn detached(&self) -> TransData {
        let mut data = self.clone();
        data.to_state = None;
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::FsmCtx;
    use crate::key::{Key, KeyOps};

    fn ctx() -> Rc<FsmCtx> {
        FsmCtx::new(KeyOps::octet()).shared()
    }

    #[test]
    fn test_dict_rep_interns() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        let mut md = MergeData::new();
        let r1 = fsm.dict_rep(&mut md, vec![b, a]);
        let r2 = fsm.dict_rep(&mut md, vec![a, b]);
        assert_eq!(r1, r2);
        assert_eq!(md.fill_queue.len(), 1);
    }

    #[test]
    fn test_out_trans_copy_disjoint() {
        let mut fsm = Fsm::new(ctx());
        let d = fsm.add_state();
        let s = fsm.add_state();
        let t1 = fsm.add_state();
        let t2 = fsm.add_state();
        fsm.attach_new_trans(d, Some(t1), Key(0), Key(9));
        fsm.attach_new_trans(s, Some(t2), Key(20), Key(29));

        let mut md = MergeData::new();
        let src = fsm.state(s).out_list.clone();
        fsm.out_trans_copy(&mut md, d, &src).unwrap();

        let out = fsm.state(d).out_list.clone();
        assert_eq!(out.len(), 2);
        assert_eq!(fsm.trans(out[0]).low_key, Key(0));
        assert_eq!(fsm.trans(out[1]).low_key, Key(20));
        assert_eq!(fsm.slot_data(TransSlot::Plain(out[1])).to_state, Some(t2));
    }

    #[test]
    fn test_out_trans_copy_overlap_creates_rep() {
        let mut fsm = Fsm::new(ctx());
        let d = fsm.add_state();
        let s = fsm.add_state();
        let t1 = fsm.add_state();
        let t2 = fsm.add_state();
        fsm.attach_new_trans(d, Some(t1), Key(0), Key(9));
        fsm.attach_new_trans(s, Some(t2), Key(5), Key(14));

        let mut md = MergeData::new();
        let src = fsm.state(s).out_list.clone();
        fsm.out_trans_copy(&mut md, d, &src).unwrap();

        let out = fsm.state(d).out_list.clone();
        // [0..4] -> t1, [5..9] -> rep{t1,t2}, [10..14] -> t2
        assert_eq!(out.len(), 3);
        let ranges: Vec<(i64, i64)> = out
            .iter()
            .map(|&t| (fsm.trans(t).low_key.0, fsm.trans(t).high_key.0))
            .collect();
        assert_eq!(ranges, vec![(0, 4), (5, 9), (10, 14)]);

        let rep = fsm.slot_data(TransSlot::Plain(out[1])).to_state.unwrap();
        assert_eq!(fsm.state_set_of(rep).as_ref(), &vec![t1, t2]);
        assert_eq!(md.fill_queue.len(), 1);
    }

    #[test]
    fn test_determinize_is_a_fixed_point() {
        use crate::ctx::{MinimizeLevel, MinimizeOpt};
        let c = FsmCtx::new(KeyOps::octet())
            .with_minimize(MinimizeLevel::Stable, MinimizeOpt::None)
            .shared();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[Key::from_char('a'), Key::from_char('b')]);
        let other = Fsm::concat_fsm(Rc::clone(&c), &[Key::from_char('a'), Key::from_char('c')]);
        fsm.union_op(other).unwrap();

        let before = fsm.state_list.len();
        fsm.determinize().unwrap();
        assert_eq!(fsm.state_list.len(), before);
        assert!(fsm.accepts_str("ab"));
        assert!(fsm.accepts_str("ac"));
        assert!(!fsm.accepts_str("a"));

        fsm.determinize().unwrap();
        assert_eq!(fsm.state_list.len(), before);
        fsm.verify_integrity();
    }

    #[test]
    fn test_merge_into_slot_error_absorbs() {
        let mut fsm = Fsm::new(ctx());
        let d = fsm.add_state();
        let t = fsm.add_state();
        let tid = fsm.attach_new_trans(d, None, Key(0), Key(0));

        let mut md = MergeData::new();
        let mut src = TransData::default();
        src.to_state = Some(t);
        fsm.merge_into_slot(&mut md, TransSlot::Plain(tid), &src).unwrap();
        assert_eq!(fsm.slot_data(TransSlot::Plain(tid)).to_state, Some(t));
    }
}
