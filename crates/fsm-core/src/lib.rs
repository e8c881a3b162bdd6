//! Finite-state-machine construction and manipulation core.
//!
//! The graph data structure and the algorithms a parser/lexer generator
//! builds machines with: basic machines and regular operators, NFA to
//! DFA subset construction with actions, priorities and conditions, and
//! DFA minimization. Single-owner, single-threaded, in-memory.

pub mod action;
pub mod cond;
pub mod construct;
pub mod ctx;
pub mod determinize;
pub mod embed;
pub mod error;
pub mod graph;
pub mod key;
pub mod minimize;
pub mod pairiter;
pub mod prune;
pub mod view;

pub use action::{
    Action, ActionId, ActionTable, ErrActionTable, InputLoc, LmActionTable, LmId, PriorDesc,
    PriorTable,
};
pub use cond::{CondSpace, CondSpaceId, CondVal};
pub use construct::NfaRepeatActions;
pub use ctx::{FsmCtx, LmPart, MinimizeLevel, MinimizeOpt};
pub use determinize::{MergeData, NfaRound, NfaRoundVect};
pub use embed::StateSelect;
pub use error::{FsmError, FsmResult};
pub use graph::{
    CondBranch, EntryId, Fsm, NfaEdge, Scratch, State, StateId, Trans, TransBody, TransData,
    TransId, TransSlot,
};
pub use key::{Key, KeyOps, Signedness};
pub use pairiter::{RangePairEvent, RangePairIter, RangeRef, ValPairEvent, ValPairIter, ValRef};
pub use view::{format_key, format_range, BranchView, FsmView, StateView, TransView};
