//! Read-only emission view of a machine.
//!
//! The flowchart serializer and other diagnostic consumers read the graph
//! through this surface: states in stable numeric order with their
//! finality, EOF tables and pending out conditions; transitions either
//! plain or as `(condition value, actions, destination)` triples; the
//! entry map; and display names for actions. Key formatting follows the
//! alphabet configuration: printable keys are quoted and escaped, space
//! renders as `SP`, and everything else falls back to a signed or
//! unsigned integer.

use crate::action::{ActionId, ActionTable};
use crate::cond::{CondSpaceId, CondVal};
use crate::graph::{EntryId, Fsm, NfaEdge, StateId, TransBody, TransId};
use crate::key::{Key, KeyOps, Signedness};

/// Format one key for display.
pub fn format_key(ops: &KeyOps, key: Key) -> String {
    if ops.is_printable(key) {
        let c = key.val() as u8 as char;
        return match c {
            '"' | '\\' => format!("'\\{}'", c),
            ' ' => "SP".to_owned(),
            _ => format!("'{}'", c),
        };
    }
    let escape = match key.val() {
        0x07 => Some('a'),
        0x08 => Some('b'),
        0x09 => Some('t'),
        0x0a => Some('n'),
        0x0b => Some('v'),
        0x0c => Some('f'),
        0x0d => Some('r'),
        _ => None,
    };
    if let Some(letter) = escape {
        return format!("'\\\\{}'", letter);
    }
    match ops.signedness {
        Signedness::Signed => format!("{}", key.val()),
        Signedness::Unsigned => format!("{}", key.val() as u64 & ((1u64 << ops.bit_width) - 1)),
    }
}

/// Format an inclusive range: a single key, or `lo..hi`.
pub fn format_range(ops: &KeyOps, low: Key, high: Key) -> String {
    if ops.eq(low, high) {
        format_key(ops, low)
    } else {
        format!("{}..{}", format_key(ops, low), format_key(ops, high))
    }
}

/// A stable snapshot view over a machine. Constructing it assigns state
/// numbers in list order.
pub struct FsmView<'a> {
    fsm: &'a Fsm,
}

impl Fsm {
    pub fn view(&mut self) -> FsmView<'_> {
        self.set_state_numbers(0);
        FsmView { fsm: self }
    }
}

impl<'a> FsmView<'a> {
    /// States in stable numeric order.
    pub fn states(&self) -> impl Iterator<Item = StateView<'a>> + '_ {
        let fsm = self.fsm;
        fsm.state_list.iter().map(move |&id| StateView { fsm, id })
    }

    pub fn start_state(&self) -> Option<u32> {
        self.fsm.start_state.map(|s| self.fsm.state(s).scratch.number())
    }

    /// The read-only entry map, as (entry id, state number) pairs.
    pub fn entry_points(&self) -> Vec<(EntryId, u32)> {
        let mut out = Vec::new();
        for (&id, states) in &self.fsm.entry_points {
            for &state in states {
                out.push((id, self.fsm.state(state).scratch.number()));
            }
        }
        out
    }

    /// Display name of an action: its name, or `line:col` when unnamed.
    pub fn action_name(&self, id: ActionId) -> String {
        self.fsm.ctx.action(id).display_name()
    }

    /// Names of the actions of a table, in ordering order.
    pub fn action_names(&self, table: &ActionTable) -> Vec<String> {
        table.iter().map(|el| self.action_name(el.action)).collect()
    }

    /// Render a condition value against its space: negated guards get a
    /// leading `!`.
    pub fn cond_spec(&self, space: CondSpaceId, val: CondVal) -> String {
        let space = self.fsm.ctx.cond_space(space);
        let parts: Vec<String> = space
            .cond_set
            .iter()
            .enumerate()
            .map(|(pos, &guard)| {
                let name = self.action_name(guard);
                if val.0 & (1 << pos) != 0 {
                    name
                } else {
                    format!("!{}", name)
                }
            })
            .collect();
        format!("({})", parts.join(", "))
    }
}

pub struct StateView<'a> {
    fsm: &'a Fsm,
    id: StateId,
}

impl<'a> StateView<'a> {
    pub fn number(&self) -> u32 {
        self.fsm.state(self.id).scratch.number()
    }

    pub fn is_final(&self) -> bool {
        self.fsm.state(self.id).is_final()
    }

    pub fn eof_actions(&self) -> &'a ActionTable {
        &self.fsm.state(self.id).eof_action_table
    }

    pub fn from_state_actions(&self) -> &'a ActionTable {
        &self.fsm.state(self.id).from_state_action_table
    }

    pub fn out_cond(&self) -> Option<(CondSpaceId, &'a [CondVal])> {
        let state = self.fsm.state(self.id);
        state.out_cond_space.map(|space| (space, state.out_cond_vals.as_slice()))
    }

    pub fn transitions(&self) -> impl Iterator<Item = TransView<'a>> + '_ {
        let fsm = self.fsm;
        fsm.state(self.id).out_list.iter().map(move |&tid| TransView { fsm, tid })
    }

    pub fn nfa_edges(&self) -> &'a [NfaEdge] {
        match &self.fsm.state(self.id).nfa_out {
            Some(edges) => edges.as_slice(),
            None => &[],
        }
    }
}

/// One branch of a transition as the emitter wants it: the condition
/// value (when conditional), the actions, and the destination's state
/// number (`None` is the error destination).
pub struct BranchView<'a> {
    pub cond_val: Option<CondVal>,
    pub actions: &'a ActionTable,
    pub dest: Option<u32>,
}

pub struct TransView<'a> {
    fsm: &'a Fsm,
    tid: TransId,
}

impl<'a> TransView<'a> {
    pub fn low_key(&self) -> Key {
        self.fsm.trans(self.tid).low_key
    }

    pub fn high_key(&self) -> Key {
        self.fsm.trans(self.tid).high_key
    }

    /// The range label, formatted per the alphabet configuration.
    pub fn label(&self) -> String {
        let trans = self.fsm.trans(self.tid);
        format_range(&self.fsm.ctx.key_ops, trans.low_key, trans.high_key)
    }

    pub fn is_plain(&self) -> bool {
        self.fsm.trans(self.tid).plain()
    }

    pub fn cond_space(&self) -> Option<CondSpaceId> {
        self.fsm.trans(self.tid).cond_space()
    }

    /// The destination branches: one for a plain transition, one per
    /// condition value for a conditional one.
    pub fn branches(&self) -> Vec<BranchView<'a>> {
        let fsm = self.fsm;
        let number = |to: Option<StateId>| to.map(|s| fsm.state(s).scratch.number());
        match &fsm.trans(self.tid).body {
            TransBody::Plain(data) => vec![BranchView {
                cond_val: None,
                actions: &data.action_table,
                dest: number(data.to_state),
            }],
            TransBody::Cond { branches, .. } => branches
                .iter()
                .map(|b| BranchView {
                    cond_val: Some(b.key),
                    actions: &b.data.action_table,
                    dest: number(b.data.to_state),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::FsmCtx;
    use crate::key::KeyOps;
    use std::rc::Rc;

    fn k(c: char) -> Key {
        Key::from_char(c)
    }

    #[test]
    fn test_format_key_printables() {
        let ops = KeyOps::octet();
        assert_eq!(format_key(&ops, k('a')), "'a'");
        assert_eq!(format_key(&ops, k(' ')), "SP");
        assert_eq!(format_key(&ops, k('"')), "'\\\"'");
        assert_eq!(format_key(&ops, k('\\')), "'\\\\'");
    }

    #[test]
    fn test_format_key_escape_letters() {
        let ops = KeyOps::octet();
        assert_eq!(format_key(&ops, Key(0x09)), "'\\\\t'");
        assert_eq!(format_key(&ops, Key(0x0a)), "'\\\\n'");
    }

    #[test]
    fn test_format_key_integers_by_signedness() {
        let signed = KeyOps::signed(8);
        let unsigned = KeyOps::unsigned(8);
        assert_eq!(format_key(&signed, Key(-1)), "-1");
        assert_eq!(format_key(&unsigned, Key(255)), "255");
        assert_eq!(format_key(&unsigned, Key(0x7f)), "127");
    }

    #[test]
    fn test_format_range() {
        let ops = KeyOps::octet();
        assert_eq!(format_range(&ops, k('a'), k('a')), "'a'");
        assert_eq!(format_range(&ops, k('a'), k('z')), "'a'..'z'");
    }

    #[test]
    fn test_view_walk() {
        let c = FsmCtx::new(KeyOps::octet()).shared();
        let mut fsm = Fsm::concat_fsm(Rc::clone(&c), &[k('a'), k('b')]);
        let view = fsm.view();

        let states: Vec<_> = view.states().collect();
        assert_eq!(states.len(), 3);
        assert_eq!(view.start_state(), Some(states[0].number()));
        assert!(!states[0].is_final());
        assert!(states[2].is_final());

        let trans: Vec<_> = states[0].transitions().collect();
        assert_eq!(trans.len(), 1);
        assert_eq!(trans[0].label(), "'a'");
        let branches = trans[0].branches();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].dest, Some(states[1].number()));
        assert!(branches[0].cond_val.is_none());
    }

    #[test]
    fn test_cond_spec_rendering() {
        let c = FsmCtx::new(KeyOps::octet()).shared();
        let g1 = c.new_cond_action("p", Default::default());
        let g2 = c.new_cond_action("", crate::action::InputLoc { line: 4, col: 2 });
        let space = c.add_cond_space(vec![g1, g2]);

        let mut fsm = Fsm::new(Rc::clone(&c));
        let s = fsm.add_state();
        fsm.set_start_state(s);
        let view = fsm.view();
        assert_eq!(view.cond_spec(space, CondVal(0b01)), "(p, !4:2)");
        assert_eq!(view.cond_spec(space, CondVal(0b10)), "(!p, 4:2)");
    }
}
