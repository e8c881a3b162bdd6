//! The state/transition graph and its attachment discipline.
//!
//! States and transitions live in slab arenas owned by the machine and are
//! referenced by stable ids, so state sets, in-lists and the interning
//! dictionary never chase lifetimes through the cyclic graph. Transitions
//! are created only through the `attach_*` helpers and destroyed only
//! through the `detach_*` helpers; that single choke point is what keeps
//! the reciprocal in-lists consistent for every other operator.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::action::{ActionTable, ErrActionTable, LmActionTable, LmId, PriorTable};
use crate::cond::{CondSpaceId, CondVal};
use crate::ctx::FsmCtx;
use crate::key::Key;

pub type EntryId = i32;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StateId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TransId(pub u32);

/* State bits. */
pub const SB_GRAPH1: u32 = 0x01;
pub const SB_GRAPH2: u32 = 0x02;
pub const SB_BOTH: u32 = 0x03;
pub const SB_ISFINAL: u32 = 0x04;
pub const SB_ISMARKED: u32 = 0x08;
pub const SB_ONMISFIT: u32 = 0x10;
pub const SB_NFA_REP: u32 = 0x20;

/// The reference kinds an action embedding is counted under.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RefKind {
    Trans,
    ToState,
    FromState,
    Eof,
}

/// Per-state scratch slot, driven by the phase of the algorithm that owns
/// it: duplication uses the state map, partition minimization the
/// partition index, numbering the sequential state number.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Scratch {
    #[default]
    None,
    StateMap(StateId),
    Partition(u32),
    Number(u32),
}

impl Scratch {
    pub fn number(self) -> u32 {
        match self {
            Scratch::Number(n) => n,
            _ => panic!("state scratch does not hold a number"),
        }
    }

    pub fn partition(self) -> u32 {
        match self {
            Scratch::Partition(p) => p,
            _ => panic!("state scratch does not hold a partition"),
        }
    }
}

/// An edge left deliberately nondeterministic, consumed at runtime with an
/// explicit stack. `order` fixes the exploration order among a state's
/// alternatives.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NfaEdge {
    pub to_state: StateId,
    pub order: i32,
    pub push_table: ActionTable,
    pub pop_table: ActionTable,
    pub pop_test: ActionTable,
}

/// The destination and tables shared by plain transitions and the
/// branches of conditional ones. `to_state == None` means the error
/// destination.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct TransData {
    pub to_state: Option<StateId>,
    pub action_table: ActionTable,
    pub prior_table: PriorTable,
    pub lm_action_table: LmActionTable,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CondBranch {
    pub key: CondVal,
    pub data: TransData,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TransBody {
    Plain(TransData),
    Cond {
        space: CondSpaceId,
        /// Sorted by condition value; an absent value means error.
        branches: Vec<CondBranch>,
    },
}

/// A transition occupying the range `[low_key, high_key]` of its owner's
/// out-list.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Trans {
    pub from_state: StateId,
    pub low_key: Key,
    pub high_key: Key,
    pub body: TransBody,
}

impl Trans {
    pub fn plain(&self) -> bool {
        matches!(self.body, TransBody::Plain(_))
    }

    pub fn cond_space(&self) -> Option<CondSpaceId> {
        match self.body {
            TransBody::Plain(_) => None,
            TransBody::Cond { space, .. } => Some(space),
        }
    }
}

/// Addressing for one destination-bearing slot of a transition: the
/// transition itself when plain, or one conditional branch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransSlot {
    Plain(TransId),
    Cond(TransId, CondVal),
}

impl TransSlot {
    pub fn trans_id(self) -> TransId {
        match self {
            TransSlot::Plain(t) | TransSlot::Cond(t, _) => t,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct State {
    /// Outgoing transitions, sorted by low key, ranges disjoint.
    pub out_list: Vec<TransId>,
    /// Plain transitions of other states (or this one) targeting this
    /// state. Kept reciprocal with the out-lists for O(1) detachment.
    pub in_plain: Vec<TransId>,
    /// Conditional branches targeting this state.
    pub in_cond: Vec<(TransId, CondVal)>,

    pub entry_ids: BTreeSet<EntryId>,
    /// Epsilon transitions, by entry-point name.
    pub epsilon_trans: Vec<EntryId>,

    pub nfa_out: Option<Vec<NfaEdge>>,
    pub nfa_in: Vec<StateId>,

    pub bits: u32,
    pub scratch: Scratch,
    /// The source-state set this state represents during subset
    /// construction, when it is an interning-dictionary product.
    pub dict_set: Option<Rc<Vec<StateId>>>,

    pub out_prior_table: PriorTable,
    pub to_state_action_table: ActionTable,
    pub from_state_action_table: ActionTable,
    /// Pending actions transferred onto future out transitions.
    pub out_action_table: ActionTable,
    /// Pending conditions transferred onto future out transitions.
    pub out_cond_space: Option<CondSpaceId>,
    pub out_cond_vals: Vec<CondVal>,
    pub err_action_table: ErrActionTable,
    pub eof_action_table: ActionTable,
    pub lm_item_set: BTreeSet<LmId>,
}

impl State {
    pub fn is_final(&self) -> bool {
        self.bits & SB_ISFINAL != 0
    }

    pub fn on_misfit_list(&self) -> bool {
        self.bits & SB_ONMISFIT != 0
    }
}

/// The graph. Owns its states and transitions exclusively; the context is
/// shared among every machine of one construction.
#[derive(Clone)]
pub struct Fsm {
    pub ctx: Rc<FsmCtx>,

    states: Vec<Option<State>>,
    transes: Vec<Option<Trans>>,

    /// Main state list, in creation/bring-in order.
    pub state_list: Vec<StateId>,
    /// States with no current reason to live, collected while misfit
    /// accounting is on.
    pub misfit_list: Vec<StateId>,
    /// States carrying NFA out-edges.
    pub nfa_list: Vec<StateId>,

    pub entry_points: BTreeMap<EntryId, Vec<StateId>>,
    pub start_state: Option<StateId>,
    pub error_state: Option<StateId>,
    pub final_states: BTreeSet<StateId>,

    misfit_accounting: bool,
}

impl Fsm {
    pub fn new(ctx: Rc<FsmCtx>) -> Fsm {
        Fsm {
            ctx,
            states: Vec::new(),
            transes: Vec::new(),
            state_list: Vec::new(),
            misfit_list: Vec::new(),
            nfa_list: Vec::new(),
            entry_points: BTreeMap::new(),
            start_state: None,
            error_state: None,
            final_states: BTreeSet::new(),
            misfit_accounting: false,
        }
    }

    pub fn same_ctx(&self, other: &Fsm) -> bool {
        Rc::ptr_eq(&self.ctx, &other.ctx)
    }

    /*
     * Arena access. A vacant slot is a structural violation.
     */

    pub fn state(&self, id: StateId) -> &State {
        match &self.states[id.0 as usize] {
            Some(s) => s,
            None => panic!("vacant state slot {:?}", id),
        }
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut State {
        match &mut self.states[id.0 as usize] {
            Some(s) => s,
            None => panic!("vacant state slot {:?}", id),
        }
    }

    pub fn trans(&self, id: TransId) -> &Trans {
        match &self.transes[id.0 as usize] {
            Some(t) => t,
            None => panic!("vacant transition slot {:?}", id),
        }
    }

    pub fn trans_mut(&mut self, id: TransId) -> &mut Trans {
        match &mut self.transes[id.0 as usize] {
            Some(t) => t,
            None => panic!("vacant transition slot {:?}", id),
        }
    }

    pub fn live_state_count(&self) -> usize {
        self.state_list.len() + self.misfit_list.len()
    }

    /*
     * Misfit accounting.
     */

    pub fn set_misfit_accounting(&mut self, val: bool) {
        self.misfit_accounting = val;
    }

    /// Whether anything keeps this state in the graph: being the start
    /// state, owning an entry point, or an in-edge from another state.
    fn has_reason_to_live(&self, id: StateId) -> bool {
        if self.start_state == Some(id) {
            return true;
        }
        let state = self.state(id);
        if !state.entry_ids.is_empty() {
            return true;
        }
        if state.in_plain.iter().any(|&t| self.trans(t).from_state != id) {
            return true;
        }
        if state.in_cond.iter().any(|&(t, _)| self.trans(t).from_state != id) {
            return true;
        }
        state.nfa_in.iter().any(|&s| s != id)
    }

    pub(crate) fn ensure_on_main_list(&mut self, id: StateId) {
        if self.state(id).on_misfit_list() {
            self.misfit_list.retain(|&s| s != id);
            self.state_mut(id).bits &= !SB_ONMISFIT;
            self.state_list.push(id);
        }
    }

    /// Move a state that just lost its last reason to live onto the
    /// misfit list, when accounting is on.
    pub(crate) fn consider_misfit(&mut self, id: StateId) {
        if !self.misfit_accounting || self.state(id).on_misfit_list() {
            return;
        }
        if !self.has_reason_to_live(id) {
            self.state_list.retain(|&s| s != id);
            self.state_mut(id).bits |= SB_ONMISFIT;
            self.misfit_list.push(id);
        }
    }

    /*
     * State allocation and deletion.
     */

    pub fn add_state(&mut self) -> StateId {
        let id = StateId(self.states.len() as u32);
        let mut state = State::default();
        if self.misfit_accounting {
            state.bits |= SB_ONMISFIT;
            self.states.push(Some(state));
            self.misfit_list.push(id);
        } else {
            self.states.push(Some(state));
            self.state_list.push(id);
        }
        id
    }

    /// Detach a state from everything around it, then free it. Foreign
    /// transitions into it are removed from their owners' out-lists
    /// (an absent range and an error transition mean the same thing).
    pub fn delete_state(&mut self, id: StateId) {
        self.remove_in_trans_of(id);
        self.detach_state(id);

        if self.start_state == Some(id) {
            self.start_state = None;
        }
        if self.error_state == Some(id) {
            self.error_state = None;
        }
        self.final_states.remove(&id);
        let entry_ids: Vec<EntryId> = self.state(id).entry_ids.iter().copied().collect();
        for eid in entry_ids {
            self.unset_entry(eid, id);
        }

        if self.state(id).on_misfit_list() {
            self.misfit_list.retain(|&s| s != id);
        } else {
            self.state_list.retain(|&s| s != id);
        }
        self.nfa_list.retain(|&s| s != id);
        self.states[id.0 as usize] = None;
    }

    /// Remove every foreign transition into a state from its owner's
    /// out-list. A conditional transition loses only the branches that
    /// target the state; it is freed when no branches remain.
    pub(crate) fn remove_in_trans_of(&mut self, id: StateId) {
        let in_plain: Vec<TransId> = self
            .state(id)
            .in_plain
            .iter()
            .copied()
            .filter(|&t| self.trans(t).from_state != id)
            .collect();
        for tid in in_plain {
            let owner = self.trans(tid).from_state;
            self.detach_slot(TransSlot::Plain(tid));
            self.state_mut(owner).out_list.retain(|&t| t != tid);
            self.free_trans(tid);
        }

        let in_cond: Vec<(TransId, CondVal)> = self
            .state(id)
            .in_cond
            .iter()
            .copied()
            .filter(|&(t, _)| self.trans(t).from_state != id)
            .collect();
        for (tid, val) in in_cond {
            self.detach_slot(TransSlot::Cond(tid, val));
            self.remove_cond_branch(tid, val);
        }
    }

    /// Drop one detached branch from a conditional transition, freeing
    /// the whole transition when it was the last.
    pub(crate) fn remove_cond_branch(&mut self, tid: TransId, val: CondVal) {
        let owner = self.trans(tid).from_state;
        let empty = match &mut self.trans_mut(tid).body {
            TransBody::Cond { branches, .. } => {
                let pos = branches
                    .binary_search_by(|b| b.key.cmp(&val))
                    .unwrap_or_else(|_| panic!("missing condition branch {:?}", val));
                assert!(
                    branches[pos].data.to_state.is_none(),
                    "removing an attached condition branch"
                );
                let branch = branches.remove(pos);
                branch.data
            }
            TransBody::Plain(_) => panic!("cond branch removal on plain transition"),
        };
        self.drop_data_refs(&empty);
        let remaining = match &self.trans(tid).body {
            TransBody::Cond { branches, .. } => branches.len(),
            TransBody::Plain(_) => unreachable!(),
        };
        if remaining == 0 {
            self.state_mut(owner).out_list.retain(|&t| t != tid);
            self.free_trans(tid);
        }
    }

    /// Detach all edges touching this state, leaving it isolated but
    /// allocated.
    pub fn detach_state(&mut self, id: StateId) {
        /* Out transitions are destroyed outright. */
        let out = std::mem::take(&mut self.state_mut(id).out_list);
        for tid in out {
            self.detach_and_free_trans(tid);
        }

        /* Foreign in transitions are turned into error transitions. */
        let in_plain = self.state(id).in_plain.clone();
        for tid in in_plain {
            self.detach_slot(TransSlot::Plain(tid));
        }
        let in_cond = self.state(id).in_cond.clone();
        for (tid, val) in in_cond {
            self.detach_slot(TransSlot::Cond(tid, val));
        }

        /* NFA edges both ways. */
        if self.state(id).nfa_out.is_some() {
            self.clear_nfa_out(id);
        }
        let nfa_in = std::mem::take(&mut self.state_mut(id).nfa_in);
        for src in nfa_in {
            if src == id {
                continue;
            }
            if let Some(edges) = &mut self.state_mut(src).nfa_out {
                edges.retain(|e| e.to_state != id);
            }
        }
    }

    /// Detach every slot of a transition and free its arena slot. The
    /// owning out-list entry is the caller's to drop.
    pub fn detach_and_free_trans(&mut self, tid: TransId) {
        match &self.trans(tid).body {
            TransBody::Plain(_) => self.detach_slot(TransSlot::Plain(tid)),
            TransBody::Cond { branches, .. } => {
                let vals: Vec<CondVal> = branches.iter().map(|b| b.key).collect();
                for val in vals {
                    self.detach_slot(TransSlot::Cond(tid, val));
                }
            }
        }
        self.free_trans(tid);
    }

    fn free_trans(&mut self, tid: TransId) {
        let trans = self.transes[tid.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("vacant transition slot {:?}", tid));
        match &trans.body {
            TransBody::Plain(data) => self.drop_data_refs(data),
            TransBody::Cond { space, branches } => {
                for branch in branches {
                    self.drop_data_refs(&branch.data);
                }
                let space = self.ctx.cond_space(*space);
                for &guard in &space.cond_set {
                    let a = self.ctx.action(guard);
                    a.num_cond_refs.set(a.num_cond_refs.get() - 1);
                }
            }
        }
    }

    /// Which reference-count field of an action a table embedding charges.
    pub(crate) fn bump_action_ref(&self, id: crate::action::ActionId, kind: RefKind, delta: i64) {
        let a = self.ctx.action(id);
        let cell = match kind {
            RefKind::Trans => &a.num_trans_refs,
            RefKind::ToState => &a.num_to_state_refs,
            RefKind::FromState => &a.num_from_state_refs,
            RefKind::Eof => &a.num_eof_refs,
        };
        cell.set(cell.get() + delta);
    }

    /// Merge an action table into one of a state's tables, charging the
    /// reference counts of the actions actually inserted.
    pub(crate) fn merge_counted(
        &mut self,
        dest: StateId,
        src: &ActionTable,
        pick: impl Fn(&mut State) -> &mut ActionTable,
        kind: RefKind,
    ) {
        let existing = pick(self.state_mut(dest)).clone();
        let fresh: Vec<crate::action::ActionId> = src
            .iter()
            .filter(|el| !existing.iter().any(|d| d == *el))
            .map(|el| el.action)
            .collect();
        for id in fresh {
            self.bump_action_ref(id, kind, 1);
        }
        pick(self.state_mut(dest)).set_actions(src);
    }

    pub(crate) fn add_data_refs(&self, data: &TransData) {
        for el in data.action_table.iter() {
            let a = self.ctx.action(el.action);
            a.num_trans_refs.set(a.num_trans_refs.get() + 1);
        }
    }

    pub(crate) fn drop_data_refs(&self, data: &TransData) {
        for el in data.action_table.iter() {
            let a = self.ctx.action(el.action);
            a.num_trans_refs.set(a.num_trans_refs.get() - 1);
        }
    }

    /*
     * Slot-level attachment. Everything that changes a destination goes
     * through these two, so the in-lists stay reciprocal.
     */

    pub fn slot_data(&self, slot: TransSlot) -> &TransData {
        match slot {
            TransSlot::Plain(tid) => match &self.trans(tid).body {
                TransBody::Plain(data) => data,
                TransBody::Cond { .. } => panic!("plain slot on conditional transition"),
            },
            TransSlot::Cond(tid, val) => match &self.trans(tid).body {
                TransBody::Cond { branches, .. } => {
                    match branches.binary_search_by(|b| b.key.cmp(&val)) {
                        Ok(pos) => &branches[pos].data,
                        Err(_) => panic!("missing condition branch {:?}", val),
                    }
                }
                TransBody::Plain(_) => panic!("cond slot on plain transition"),
            },
        }
    }

    pub fn slot_data_mut(&mut self, slot: TransSlot) -> &mut TransData {
        match slot {
            TransSlot::Plain(tid) => match &mut self.trans_mut(tid).body {
                TransBody::Plain(data) => data,
                TransBody::Cond { .. } => panic!("plain slot on conditional transition"),
            },
            TransSlot::Cond(tid, val) => match &mut self.trans_mut(tid).body {
                TransBody::Cond { branches, .. } => {
                    match branches.binary_search_by(|b| b.key.cmp(&val)) {
                        Ok(pos) => &mut branches[pos].data,
                        Err(_) => panic!("missing condition branch {:?}", val),
                    }
                }
                TransBody::Plain(_) => panic!("cond slot on plain transition"),
            },
        }
    }

    /// Point a slot at a destination, maintaining the in-list.
    pub fn attach_slot(&mut self, slot: TransSlot, to: Option<StateId>) {
        assert!(
            self.slot_data(slot).to_state.is_none(),
            "attaching an already attached transition"
        );
        self.slot_data_mut(slot).to_state = to;
        if let Some(to) = to {
            match slot {
                TransSlot::Plain(tid) => self.state_mut(to).in_plain.push(tid),
                TransSlot::Cond(tid, val) => self.state_mut(to).in_cond.push((tid, val)),
            }
            self.ensure_on_main_list(to);
        }
    }

    /// Unhook a slot from its destination, leaving it an error slot.
    pub fn detach_slot(&mut self, slot: TransSlot) {
        let to = self.slot_data(slot).to_state;
        self.slot_data_mut(slot).to_state = None;
        if let Some(to) = to {
            match slot {
                TransSlot::Plain(tid) => {
                    let in_list = &mut self.state_mut(to).in_plain;
                    let pos = in_list
                        .iter()
                        .position(|&t| t == tid)
                        .expect("in-list missing a reciprocal entry");
                    in_list.swap_remove(pos);
                }
                TransSlot::Cond(tid, val) => {
                    let in_list = &mut self.state_mut(to).in_cond;
                    let pos = in_list
                        .iter()
                        .position(|&e| e == (tid, val))
                        .expect("in-list missing a reciprocal entry");
                    in_list.swap_remove(pos);
                }
            }
            self.consider_misfit(to);
        }
    }

    /// Give an error slot a real destination.
    pub fn redirect_error_trans(&mut self, slot: TransSlot, to: StateId) {
        assert!(
            self.slot_data(slot).to_state.is_none(),
            "redirecting a transition that is not an error transition"
        );
        self.attach_slot(slot, Some(to));
    }

    /// Detach and reattach in one move.
    pub fn move_slot(&mut self, slot: TransSlot, to: Option<StateId>) {
        self.detach_slot(slot);
        if to.is_some() {
            self.attach_slot(slot, to);
        }
    }

    /*
     * Transition creation.
     */

    /// New plain transition covering `[low, high]`. Panics if the range
    /// inverts or overlaps an existing range of the out-list.
    pub fn attach_new_trans(
        &mut self,
        from: StateId,
        to: Option<StateId>,
        low: Key,
        high: Key,
    ) -> TransId {
        let ops = self.ctx.key_ops;
        assert!(ops.le(low, high), "inverted transition range");

        let tid = TransId(self.transes.len() as u32);
        self.transes.push(Some(Trans {
            from_state: from,
            low_key: low,
            high_key: high,
            body: TransBody::Plain(TransData::default()),
        }));

        let pos = self.out_insert_pos(from, low, high);
        self.state_mut(from).out_list.insert(pos, tid);
        self.attach_slot(TransSlot::Plain(tid), to);
        tid
    }

    /// Insert a transition id built elsewhere (duplication, crossing)
    /// into an out-list position. The caller owns range discipline.
    pub fn alloc_trans(&mut self, trans: Trans) -> TransId {
        let tid = TransId(self.transes.len() as u32);
        match &trans.body {
            TransBody::Plain(data) => {
                assert!(data.to_state.is_none(), "alloc_trans takes detached data");
                self.add_data_refs(data);
            }
            TransBody::Cond { space, branches } => {
                for branch in branches {
                    assert!(branch.data.to_state.is_none(), "alloc_trans takes detached data");
                    self.add_data_refs(&branch.data);
                }
                let space = self.ctx.cond_space(*space);
                for &guard in &space.cond_set {
                    let a = self.ctx.action(guard);
                    a.num_cond_refs.set(a.num_cond_refs.get() + 1);
                }
            }
        }
        self.transes.push(Some(trans));
        tid
    }

    fn out_insert_pos(&self, from: StateId, low: Key, high: Key) -> usize {
        let ops = self.ctx.key_ops;
        let out = &self.state(from).out_list;
        let pos = out.partition_point(|&t| ops.lt(self.trans(t).low_key, low));
        if pos > 0 {
            let prev = self.trans(out[pos - 1]);
            assert!(
                ops.lt(prev.high_key, low),
                "transition range overlaps an existing range"
            );
        }
        if pos < out.len() {
            let next = self.trans(out[pos]);
            assert!(
                ops.lt(high, next.low_key),
                "transition range overlaps an existing range"
            );
        }
        pos
    }

    /// New conditional branch within an existing conditional transition.
    pub fn attach_new_cond(&mut self, tid: TransId, to: Option<StateId>, val: CondVal) {
        match &mut self.trans_mut(tid).body {
            TransBody::Cond { branches, .. } => {
                match branches.binary_search_by(|b| b.key.cmp(&val)) {
                    Ok(_) => panic!("duplicate condition value {:?}", val),
                    Err(pos) => {
                        branches.insert(pos, CondBranch { key: val, data: TransData::default() })
                    }
                }
            }
            TransBody::Plain(_) => panic!("attaching a condition branch to a plain transition"),
        }
        self.attach_slot(TransSlot::Cond(tid, val), to);
    }

    /// Convert a plain transition into a conditional one over the empty
    /// space: one branch at value zero carrying the old data. Expansion
    /// to a real space goes through the merge machinery afterwards.
    pub fn convert_to_cond(&mut self, tid: TransId) {
        let data = match &self.trans(tid).body {
            TransBody::Cond { .. } => return,
            TransBody::Plain(data) => data.clone(),
        };
        let to = data.to_state;
        if to.is_some() {
            self.detach_slot(TransSlot::Plain(tid));
        }
        let mut detached = data;
        detached.to_state = None;
        let space = self.ctx.add_cond_space(Vec::new());
        self.trans_mut(tid).body = TransBody::Cond {
            space,
            branches: vec![CondBranch { key: CondVal(0), data: detached }],
        };
        if to.is_some() {
            self.attach_slot(TransSlot::Cond(tid, CondVal(0)), to);
        }
    }

    /*
     * NFA edges.
     */

    pub fn attach_to_nfa(&mut self, from: StateId, edge: NfaEdge) {
        let to = edge.to_state;
        for el in edge.push_table.iter().chain(edge.pop_table.iter()).chain(edge.pop_test.iter()) {
            let a = self.ctx.action(el.action);
            a.num_nfa_refs.set(a.num_nfa_refs.get() + 1);
        }
        let state = self.state_mut(from);
        if state.nfa_out.is_none() {
            state.nfa_out = Some(Vec::new());
            state.bits |= SB_NFA_REP;
            self.nfa_list.push(from);
        }
        self.state_mut(from)
            .nfa_out
            .as_mut()
            .expect("nfa out list just created")
            .push(edge);
        self.state_mut(to).nfa_in.push(from);
        self.ensure_on_main_list(to);
    }

    pub fn clear_nfa_out(&mut self, from: StateId) {
        let edges = match self.state_mut(from).nfa_out.take() {
            Some(e) => e,
            None => return,
        };
        self.state_mut(from).bits &= !SB_NFA_REP;
        self.nfa_list.retain(|&s| s != from);
        for edge in edges {
            for el in
                edge.push_table.iter().chain(edge.pop_table.iter()).chain(edge.pop_test.iter())
            {
                let a = self.ctx.action(el.action);
                a.num_nfa_refs.set(a.num_nfa_refs.get() - 1);
            }
            let to = edge.to_state;
            let nfa_in = &mut self.state_mut(to).nfa_in;
            if let Some(pos) = nfa_in.iter().position(|&s| s == from) {
                nfa_in.swap_remove(pos);
            }
            self.consider_misfit(to);
        }
    }

    /*
     * Start, final and entry bookkeeping.
     */

    pub fn set_start_state(&mut self, id: StateId) {
        assert!(self.start_state.is_none(), "start state already set");
        self.start_state = Some(id);
        self.ensure_on_main_list(id);
    }

    pub fn unset_start_state(&mut self) {
        if let Some(old) = self.start_state.take() {
            self.consider_misfit(old);
        }
    }

    /// The explicit error state, created on first use. No transitions
    /// point to it until gaps are filled before emission.
    pub fn ensure_error_state(&mut self) -> StateId {
        if let Some(err) = self.error_state {
            return err;
        }
        let err = self.add_state();
        self.error_state = Some(err);
        self.ensure_on_main_list(err);
        err
    }

    pub fn set_fin_state(&mut self, id: StateId) {
        self.state_mut(id).bits |= SB_ISFINAL;
        self.final_states.insert(id);
    }

    pub fn unset_fin_state(&mut self, id: StateId) {
        self.state_mut(id).bits &= !SB_ISFINAL;
        self.final_states.remove(&id);
    }

    pub fn unset_all_fin_states(&mut self) {
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for id in finals {
            self.unset_fin_state(id);
        }
    }

    /// Set the given graph bit on all final states.
    pub fn set_fin_bits(&mut self, bits: u32) {
        let finals: Vec<StateId> = self.final_states.iter().copied().collect();
        for id in finals {
            self.state_mut(id).bits |= bits;
        }
    }

    pub fn unset_fin_bits(&mut self, bits: u32) {
        for slot in self.states.iter_mut().flatten() {
            slot.bits &= !bits;
        }
    }

    pub fn set_entry(&mut self, id: EntryId, state: StateId) {
        self.entry_points.entry(id).or_default().push(state);
        self.state_mut(state).entry_ids.insert(id);
        self.ensure_on_main_list(state);
    }

    pub fn unset_entry(&mut self, id: EntryId, state: StateId) {
        if let Some(states) = self.entry_points.get_mut(&id) {
            states.retain(|&s| s != state);
            if states.is_empty() {
                self.entry_points.remove(&id);
            }
        }
        self.state_mut(state).entry_ids.remove(&id);
        self.consider_misfit(state);
    }

    /// Move an entry point from one state to another.
    pub fn change_entry(&mut self, id: EntryId, to: StateId, from: StateId) {
        self.unset_entry(id, from);
        self.set_entry(id, to);
    }

    /*
     * Queries used by operators.
     */

    /// The start state has no entry points and no in-edges from other
    /// states, so operators may graft onto it without changing the
    /// language entered elsewhere.
    pub fn is_start_state_isolated(&self) -> bool {
        let start = self.start_state.expect("machine has no start state");
        let state = self.state(start);
        if !state.entry_ids.is_empty() {
            return false;
        }
        if state.in_plain.iter().any(|&t| self.trans(t).from_state != start) {
            return false;
        }
        if state.in_cond.iter().any(|&(t, _)| self.trans(t).from_state != start) {
            return false;
        }
        !state.nfa_in.iter().any(|&s| s != start)
    }

    /// Pending out data that a following machine would inherit.
    pub fn has_out_data(&self, id: StateId) -> bool {
        let state = self.state(id);
        !state.out_action_table.is_empty()
            || !state.out_prior_table.is_empty()
            || state.out_cond_space.is_some()
            || !state.err_action_table.is_empty()
    }

    pub fn clear_out_data(&mut self, id: StateId) {
        let state = self.state_mut(id);
        state.out_action_table = ActionTable::new();
        state.out_prior_table = PriorTable::new();
        state.out_cond_space = None;
        state.out_cond_vals.clear();
    }

    /// Fold a final state's pending out actions into its EOF table. Done
    /// once at the end of construction.
    pub fn transfer_out_actions(&mut self, id: StateId) {
        let out = std::mem::take(&mut self.state_mut(id).out_action_table);
        let inserted: Vec<_> = out.iter().copied().collect();
        self.state_mut(id).eof_action_table.set_actions(&out);
        for el in inserted {
            let a = self.ctx.action(el.action);
            a.num_eof_refs.set(a.num_eof_refs.get() + 1);
        }
    }

    /// The set of source states this state stands for: its dictionary set
    /// when it is a subset-construction product, else itself.
    pub fn state_set_of(&self, id: StateId) -> Rc<Vec<StateId>> {
        match &self.state(id).dict_set {
            Some(set) => Rc::clone(set),
            None => Rc::new(vec![id]),
        }
    }

    /// The transition covering `key`, if any.
    pub fn trans_on(&self, id: StateId, key: Key) -> Option<TransId> {
        let ops = self.ctx.key_ops;
        let out = &self.state(id).out_list;
        let pos = out.partition_point(|&t| ops.lt(self.trans(t).high_key, key));
        let tid = *out.get(pos)?;
        let trans = self.trans(tid);
        if ops.le(trans.low_key, key) && ops.le(key, trans.high_key) {
            Some(tid)
        } else {
            None
        }
    }

    /// Whether the out-list covers the whole alphabet with no gaps.
    pub fn out_list_covers(&self, id: StateId) -> bool {
        let ops = self.ctx.key_ops;
        let mut next = ops.min_key;
        let mut more = true;
        for &tid in &self.state(id).out_list {
            let trans = self.trans(tid);
            if !more || ops.lt(next, trans.low_key) {
                return false;
            }
            next = trans.high_key;
            more = ops.increment(&mut next);
        }
        !more
    }

    /// Make every implicit gap an explicit transition to the error state
    /// (the registered error state when one exists).
    pub fn fill_gaps(&mut self, id: StateId) {
        let ops = self.ctx.key_ops;
        let err = self.error_state;

        let mut gaps: Vec<(Key, Key)> = Vec::new();
        let mut next = ops.min_key;
        let mut more = true;
        let out = self.state(id).out_list.clone();
        for tid in out {
            let trans = self.trans(tid);
            if more && ops.lt(next, trans.low_key) {
                let mut hi = trans.low_key;
                ops.decrement(&mut hi);
                gaps.push((next, hi));
            }
            next = trans.high_key;
            more = ops.increment(&mut next);
        }
        if more {
            gaps.push((next, ops.max_key));
        }

        for (lo, hi) in gaps {
            self.attach_new_trans(id, err, lo, hi);
        }
    }

    /*
     * Numbering and ordering.
     */

    /// Assign sequential state numbers starting at `base`, in list order.
    pub fn set_state_numbers(&mut self, base: u32) {
        let ids: Vec<StateId> = self.state_list.iter().copied().collect();
        for (i, id) in ids.into_iter().enumerate() {
            self.state_mut(id).scratch = Scratch::Number(base + i as u32);
        }
    }

    /// Reorder the state list depth-first from the start state, so the
    /// emission view walks states in traversal order.
    pub fn depth_first_ordering(&mut self) {
        let mut order: Vec<StateId> = Vec::with_capacity(self.state_list.len());
        let mut seen: BTreeSet<StateId> = BTreeSet::new();
        let mut stack: Vec<StateId> = Vec::new();

        let mut roots: Vec<StateId> = Vec::new();
        if let Some(start) = self.start_state {
            roots.push(start);
        }
        for states in self.entry_points.values() {
            roots.extend(states.iter().copied());
        }
        roots.extend(self.state_list.iter().copied());

        for root in roots {
            if seen.insert(root) {
                stack.push(root);
            }
            while let Some(id) = stack.pop() {
                order.push(id);
                let mut targets: Vec<StateId> = Vec::new();
                for &tid in self.state(id).out_list.iter().rev() {
                    match &self.trans(tid).body {
                        TransBody::Plain(data) => targets.extend(data.to_state),
                        TransBody::Cond { branches, .. } => {
                            for b in branches.iter().rev() {
                                targets.extend(b.data.to_state);
                            }
                        }
                    }
                }
                if let Some(edges) = &self.state(id).nfa_out {
                    for e in edges.iter().rev() {
                        targets.push(e.to_state);
                    }
                }
                for t in targets {
                    if seen.insert(t) {
                        stack.push(t);
                    }
                }
            }
        }

        /* Keep only live main-list states, in the new order. */
        let main: BTreeSet<StateId> = self.state_list.iter().copied().collect();
        self.state_list = order.into_iter().filter(|s| main.contains(s)).collect();
    }

    /*
     * Whole-machine surgery.
     */

    /// Move every state and transition of `other` into this machine,
    /// remapping ids. Returns the state map indexed by `other`'s ids.
    /// Entry points, finals and list membership come along; `other`'s
    /// start state status does not.
    pub fn bring_in_other(&mut self, other: &mut Fsm) -> Vec<Option<StateId>> {
        assert!(self.same_ctx(other), "machines built under different contexts");

        let state_base = self.states.len() as u32;
        let trans_base = self.transes.len() as u32;
        let smap: Vec<Option<StateId>> = (0..other.states.len())
            .map(|i| other.states[i].as_ref().map(|_| StateId(state_base + i as u32)))
            .collect();
        let tmap = |t: TransId| TransId(trans_base + t.0);

        for slot in other.transes.drain(..) {
            let moved = slot.map(|mut trans| {
                trans.from_state = smap[trans.from_state.0 as usize]
                    .expect("transition owned by a dead state");
                match &mut trans.body {
                    TransBody::Plain(data) => {
                        data.to_state = data.to_state.map(|s| {
                            smap[s.0 as usize].expect("transition targets a dead state")
                        });
                    }
                    TransBody::Cond { branches, .. } => {
                        for b in branches.iter_mut() {
                            b.data.to_state = b.data.to_state.map(|s| {
                                smap[s.0 as usize].expect("transition targets a dead state")
                            });
                        }
                    }
                }
                trans
            });
            self.transes.push(moved);
        }

        for slot in other.states.drain(..) {
            let moved = slot.map(|mut state| {
                for t in state.out_list.iter_mut() {
                    *t = tmap(*t);
                }
                for t in state.in_plain.iter_mut() {
                    *t = tmap(*t);
                }
                for e in state.in_cond.iter_mut() {
                    e.0 = tmap(e.0);
                }
                if let Some(edges) = &mut state.nfa_out {
                    for e in edges.iter_mut() {
                        e.to_state =
                            smap[e.to_state.0 as usize].expect("nfa edge targets a dead state");
                    }
                }
                for s in state.nfa_in.iter_mut() {
                    *s = smap[s.0 as usize].expect("nfa edge from a dead state");
                }
                /* Dictionary sets are per-operation scratch. */
                state.dict_set = None;
                state.scratch = Scratch::None;
                state
            });
            self.states.push(moved);
        }

        let remap = |v: &mut Vec<StateId>| {
            for s in v.iter_mut() {
                *s = smap[s.0 as usize].expect("list references a dead state");
            }
        };
        let mut list = std::mem::take(&mut other.state_list);
        remap(&mut list);
        self.state_list.extend(list);
        let mut list = std::mem::take(&mut other.misfit_list);
        remap(&mut list);
        self.misfit_list.extend(list);
        let mut list = std::mem::take(&mut other.nfa_list);
        remap(&mut list);
        self.nfa_list.extend(list);

        for old in std::mem::take(&mut other.final_states) {
            let new = smap[old.0 as usize].expect("final set references a dead state");
            self.final_states.insert(new);
        }

        self.copy_in_entry_points_mapped(other, &smap);
        other.start_state = None;
        other.error_state = None;

        smap
    }

    fn copy_in_entry_points_mapped(&mut self, other: &mut Fsm, map: &[Option<StateId>]) {
        let entries: Vec<(EntryId, Vec<StateId>)> = other
            .entry_points
            .iter()
            .map(|(&id, states)| (id, states.clone()))
            .collect();
        for (id, states) in entries {
            for old in states {
                let new = map[old.0 as usize].expect("entry point maps to a dead state");
                self.entry_points.entry(id).or_default().push(new);
            }
        }
        other.entry_points.clear();
    }

    /// Iterate live state ids, main list first.
    pub fn all_live_states(&self) -> Vec<StateId> {
        let mut out = self.state_list.clone();
        out.extend(self.misfit_list.iter().copied());
        out
    }
}

#[cfg(test)]
impl Fsm {
    /// Test helper: run a plain-transition machine over an input.
    pub(crate) fn accepts(&self, input: &[Key]) -> bool {
        let mut cur = match self.start_state {
            Some(s) => s,
            None => return false,
        };
        for &key in input {
            let tid = match self.trans_on(cur, key) {
                Some(t) => t,
                None => return false,
            };
            cur = match &self.trans(tid).body {
                TransBody::Plain(data) => match data.to_state {
                    Some(s) => s,
                    None => return false,
                },
                TransBody::Cond { .. } => panic!("accepts() only runs plain machines"),
            };
        }
        self.state(cur).is_final()
    }

    pub(crate) fn accepts_str(&self, input: &str) -> bool {
        let keys: Vec<Key> = input.chars().map(Key::from_char).collect();
        self.accepts(&keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyOps;

    fn ctx() -> Rc<FsmCtx> {
        FsmCtx::new(KeyOps::octet()).shared()
    }

    #[test]
    fn test_attach_maintains_in_list() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(a, Some(b), Key(10), Key(20));
        assert_eq!(fsm.state(b).in_plain, vec![t]);

        fsm.detach_slot(TransSlot::Plain(t));
        assert!(fsm.state(b).in_plain.is_empty());
        assert_eq!(fsm.slot_data(TransSlot::Plain(t)).to_state, None);
    }

    #[test]
    fn test_out_list_sorted_by_low_key() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.attach_new_trans(a, Some(b), Key(50), Key(60));
        fsm.attach_new_trans(a, Some(b), Key(0), Key(9));
        fsm.attach_new_trans(a, Some(b), Key(20), Key(30));
        let lows: Vec<i64> = fsm
            .state(a)
            .out_list
            .iter()
            .map(|&t| fsm.trans(t).low_key.0)
            .collect();
        assert_eq!(lows, vec![0, 20, 50]);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlap_aborts() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.attach_new_trans(a, Some(b), Key(10), Key(20));
        fsm.attach_new_trans(a, Some(b), Key(20), Key(25));
    }

    #[test]
    fn test_delete_state_drops_foreign_in_trans() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.attach_new_trans(a, Some(b), Key(1), Key(1));
        fsm.delete_state(b);
        assert!(fsm.state(a).out_list.is_empty());
        assert_eq!(fsm.state_list, vec![a]);
    }

    #[test]
    fn test_fill_gaps_covers_alphabet() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.attach_new_trans(a, Some(b), Key(10), Key(20));
        fsm.attach_new_trans(a, Some(b), Key(30), Key(40));
        assert!(!fsm.out_list_covers(a));
        fsm.fill_gaps(a);
        assert!(fsm.out_list_covers(a));
        assert_eq!(fsm.state(a).out_list.len(), 5);
    }

    #[test]
    fn test_fill_gaps_targets_error_state() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.set_start_state(a);
        fsm.attach_new_trans(a, Some(b), Key(10), Key(20));
        let err = fsm.ensure_error_state();
        fsm.fill_gaps(a);
        for &tid in &fsm.state(a).out_list {
            let to = fsm.slot_data(TransSlot::Plain(tid)).to_state;
            assert!(to == Some(b) || to == Some(err));
        }
        assert_eq!(fsm.state(err).in_plain.len(), 2);
    }

    #[test]
    fn test_misfit_accounting_on_detach() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.set_start_state(a);
        let t = fsm.attach_new_trans(a, Some(b), Key(1), Key(1));

        fsm.set_misfit_accounting(true);
        fsm.detach_slot(TransSlot::Plain(t));
        assert!(fsm.state(b).on_misfit_list());
        assert_eq!(fsm.misfit_list, vec![b]);

        // Gaining an in transition brings it back.
        fsm.attach_slot(TransSlot::Plain(t), Some(b));
        assert!(!fsm.state(b).on_misfit_list());
    }

    #[test]
    fn test_self_loop_is_not_a_reason_to_live() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.set_start_state(a);
        let t = fsm.attach_new_trans(a, Some(b), Key(1), Key(1));
        fsm.attach_new_trans(b, Some(b), Key(2), Key(2));

        fsm.set_misfit_accounting(true);
        fsm.detach_slot(TransSlot::Plain(t));
        assert!(fsm.state(b).on_misfit_list());
    }

    #[test]
    fn test_bring_in_other_remaps() {
        let c = ctx();
        let mut a = Fsm::new(Rc::clone(&c));
        let s0 = a.add_state();
        a.set_start_state(s0);

        let mut b = Fsm::new(Rc::clone(&c));
        let b0 = b.add_state();
        let b1 = b.add_state();
        b.set_start_state(b0);
        b.attach_new_trans(b0, Some(b1), Key(5), Key(5));
        b.set_fin_state(b1);
        b.unset_start_state();

        let map = a.bring_in_other(&mut b);
        let nb0 = map[b0.0 as usize].unwrap();
        let nb1 = map[b1.0 as usize].unwrap();
        assert_eq!(a.state_list.len(), 3);
        assert!(a.final_states.contains(&nb1));
        let t = a.state(nb0).out_list[0];
        assert_eq!(a.trans(t).from_state, nb0);
        assert_eq!(a.slot_data(TransSlot::Plain(t)).to_state, Some(nb1));
    }

    #[test]
    fn test_trans_on() {
        let mut fsm = Fsm::new(ctx());
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(a, Some(b), Key(10), Key(20));
        assert_eq!(fsm.trans_on(a, Key(15)), Some(t));
        assert_eq!(fsm.trans_on(a, Key(9)), None);
        assert_eq!(fsm.trans_on(a, Key(21)), None);
    }
}
