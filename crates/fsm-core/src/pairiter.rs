//! Synchronized walk of two range-sorted lists.
//!
//! Every two-operand operation on the graph (union crossing, subtraction,
//! concatenation stitching, the determinizer's out-transition copy)
//! reduces to a left-to-right sweep of two states' out-lists. The
//! iterator emits alignment events; on the `*Break` events the caller is
//! given a chance to duplicate the split side's payload before the two
//! halves are consumed separately, which matters because transition data
//! carries action tables that must appear on both halves.
//!
//! The original expressed this as a co-routine with labelled re-entry;
//! here the labels are an explicit state enum and [`RangePairIter::next`]
//! resumes in place. Iterators walk snapshot vectors and are invalidated
//! by any structural change to the lists they were cut from.

use crate::cond::CondVal;
use crate::key::{Key, KeyOps};

/// One range item of a snapshot: the covered interval plus a payload
/// (usually a transition id).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RangeRef<T> {
    pub low: Key,
    pub high: Key,
    pub val: T,
}

/// Alignment events, in sweep order. The `*SticksOut` pair fires when one
/// range begins before the other; the `*DragsBehind` pair fires when one
/// range ends before the other and the longer side is split so the
/// overlapping prefix can be emitted as an overlap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RangePairEvent {
    OnlyInS1,
    OnlyInS2,
    /// S1 begins first; S1 is being split. Duplicate S1's payload now.
    S1SticksOutBreak,
    /// The non-overlapping prefix of S1.
    S1SticksOut,
    S2SticksOutBreak,
    S2SticksOut,
    /// S1 ends first; S2 is being split. Duplicate S2's payload now.
    S1DragsBehindBreak,
    /// The overlapping prefix, emitted as an overlap of both sides.
    S1DragsBehind,
    S2DragsBehindBreak,
    S2DragsBehind,
    ExactOverlap,
}

impl RangePairEvent {
    /// The current S1 item alone covers the emitted interval.
    pub fn in_s1_only(self) -> bool {
        matches!(self, RangePairEvent::OnlyInS1 | RangePairEvent::S1SticksOut)
    }

    pub fn in_s2_only(self) -> bool {
        matches!(self, RangePairEvent::OnlyInS2 | RangePairEvent::S2SticksOut)
    }

    /// Both current items cover the emitted interval.
    pub fn overlap(self) -> bool {
        matches!(
            self,
            RangePairEvent::ExactOverlap
                | RangePairEvent::S1DragsBehind
                | RangePairEvent::S2DragsBehind
        )
    }

    /// The S1 item is about to be consumed in two pieces.
    pub fn breaks_s1(self) -> bool {
        matches!(
            self,
            RangePairEvent::S1SticksOutBreak | RangePairEvent::S2DragsBehindBreak
        )
    }

    pub fn breaks_s2(self) -> bool {
        matches!(
            self,
            RangePairEvent::S2SticksOutBreak | RangePairEvent::S1DragsBehindBreak
        )
    }

    pub fn is_break(self) -> bool {
        self.breaks_s1() || self.breaks_s2()
    }
}

/// What to do when `next` is called again. Re-entry labels of the
/// original co-routine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IterState {
    Begin,
    Scan,
    AdvanceS1,
    AdvanceS2,
    AdvanceBoth,
    EmitS1SticksOut,
    RestoreS1,
    EmitS2SticksOut,
    RestoreS2,
    EmitOverlapThenRestoreS2,
    RestoreS2AdvanceS1,
    EmitOverlapThenRestoreS1,
    RestoreS1AdvanceS2,
    End,
}

struct Cursor<T> {
    items: Vec<RangeRef<T>>,
    idx: usize,
    cur: Option<RangeRef<T>>,
}

impl<T: Copy> Cursor<T> {
    fn new(items: Vec<RangeRef<T>>) -> Cursor<T> {
        let cur = items.first().copied();
        Cursor { items, idx: 0, cur }
    }

    fn advance(&mut self) {
        self.idx += 1;
        self.cur = self.items.get(self.idx).copied();
    }
}

pub struct RangePairIter<T> {
    ops: KeyOps,
    s1: Cursor<T>,
    s2: Cursor<T>,
    state: IterState,
    bottom1: Option<RangeRef<T>>,
    bottom2: Option<RangeRef<T>>,
}

impl<T: Copy> RangePairIter<T> {
    pub fn new(ops: KeyOps, list1: Vec<RangeRef<T>>, list2: Vec<RangeRef<T>>) -> RangePairIter<T> {
        RangePairIter {
            ops,
            s1: Cursor::new(list1),
            s2: Cursor::new(list2),
            state: IterState::Begin,
            bottom1: None,
            bottom2: None,
        }
    }

    /// Current S1 item, with split-adjusted keys. Valid after any event
    /// touching S1.
    pub fn s1(&self) -> &RangeRef<T> {
        self.s1.cur.as_ref().expect("range pair iterator has no current s1 item")
    }

    pub fn s2(&self) -> &RangeRef<T> {
        self.s2.cur.as_ref().expect("range pair iterator has no current s2 item")
    }

    /// Replace the S1 payload. Used by callers on `breaks_s1` events to
    /// substitute a duplicate for the first half; the saved second half
    /// keeps the original payload.
    pub fn set_s1_val(&mut self, val: T) {
        self.s1.cur.as_mut().expect("range pair iterator has no current s1 item").val = val;
    }

    pub fn set_s2_val(&mut self, val: T) {
        self.s2.cur.as_mut().expect("range pair iterator has no current s2 item").val = val;
    }

    /// Advance to the next event, or `None` when both lists are consumed.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<RangePairEvent> {
        loop {
            match self.state {
                IterState::Begin => {
                    self.state = IterState::Scan;
                }
                IterState::Scan => {
                    if let Some(ev) = self.scan() {
                        return Some(ev);
                    }
                    if self.state == IterState::End {
                        return None;
                    }
                }
                IterState::AdvanceS1 => {
                    self.s1.advance();
                    self.state = IterState::Scan;
                }
                IterState::AdvanceS2 => {
                    self.s2.advance();
                    self.state = IterState::Scan;
                }
                IterState::AdvanceBoth => {
                    self.s1.advance();
                    self.s2.advance();
                    self.state = IterState::Scan;
                }
                IterState::EmitS1SticksOut => {
                    self.state = IterState::RestoreS1;
                    return Some(RangePairEvent::S1SticksOut);
                }
                IterState::RestoreS1 => {
                    self.s1.cur = self.bottom1.take();
                    self.state = IterState::Scan;
                }
                IterState::EmitS2SticksOut => {
                    self.state = IterState::RestoreS2;
                    return Some(RangePairEvent::S2SticksOut);
                }
                IterState::RestoreS2 => {
                    self.s2.cur = self.bottom2.take();
                    self.state = IterState::Scan;
                }
                IterState::EmitOverlapThenRestoreS2 => {
                    self.state = IterState::RestoreS2AdvanceS1;
                    return Some(RangePairEvent::S1DragsBehind);
                }
                IterState::RestoreS2AdvanceS1 => {
                    self.s2.cur = self.bottom2.take();
                    self.s1.advance();
                    self.state = IterState::Scan;
                }
                IterState::EmitOverlapThenRestoreS1 => {
                    self.state = IterState::RestoreS1AdvanceS2;
                    return Some(RangePairEvent::S2DragsBehind);
                }
                IterState::RestoreS1AdvanceS2 => {
                    self.s1.cur = self.bottom1.take();
                    self.s2.advance();
                    self.state = IterState::Scan;
                }
                IterState::End => return None,
            }
        }
    }

    /// The main dispatch: classify the relationship of the two current
    /// ranges, splitting where they misalign.
    fn scan(&mut self) -> Option<RangePairEvent> {
        let ops = self.ops;
        let (c1, c2) = match (self.s1.cur, self.s2.cur) {
            (None, None) => {
                self.state = IterState::End;
                return None;
            }
            (Some(_), None) => {
                self.state = IterState::AdvanceS1;
                return Some(RangePairEvent::OnlyInS1);
            }
            (None, Some(_)) => {
                self.state = IterState::AdvanceS2;
                return Some(RangePairEvent::OnlyInS2);
            }
            (Some(c1), Some(c2)) => (c1, c2),
        };

        if ops.lt(c1.high, c2.low) {
            /* No overlap, s1 entirely in front. */
            self.state = IterState::AdvanceS1;
            Some(RangePairEvent::OnlyInS1)
        } else if ops.lt(c2.high, c1.low) {
            self.state = IterState::AdvanceS2;
            Some(RangePairEvent::OnlyInS2)
        } else if ops.lt(c1.low, c2.low) {
            /* S1 sticks out front. Split s1; the top half is s1-only, the
             * saved bottom half re-enters the scan. */
            self.bottom1 = Some(RangeRef { low: c2.low, high: c1.high, val: c1.val });
            let mut top_high = c2.low;
            self.ops.decrement(&mut top_high);
            let s1 = self.s1.cur.as_mut().expect("s1 item vanished during split");
            s1.high = top_high;
            self.state = IterState::EmitS1SticksOut;
            Some(RangePairEvent::S1SticksOutBreak)
        } else if ops.lt(c2.low, c1.low) {
            self.bottom2 = Some(RangeRef { low: c1.low, high: c2.high, val: c2.val });
            let mut top_high = c1.low;
            self.ops.decrement(&mut top_high);
            let s2 = self.s2.cur.as_mut().expect("s2 item vanished during split");
            s2.high = top_high;
            self.state = IterState::EmitS2SticksOut;
            Some(RangePairEvent::S2SticksOutBreak)
        } else if ops.lt(c1.high, c2.high) {
            /* Low ends even, s1 ends first. Split s2 so the prefix is an
             * exact overlap; s2's saved tail re-enters the scan. */
            let mut bottom_low = c1.high;
            self.ops.increment(&mut bottom_low);
            self.bottom2 = Some(RangeRef { low: bottom_low, high: c2.high, val: c2.val });
            let s2 = self.s2.cur.as_mut().expect("s2 item vanished during split");
            s2.high = c1.high;
            self.state = IterState::EmitOverlapThenRestoreS2;
            Some(RangePairEvent::S1DragsBehindBreak)
        } else if ops.lt(c2.high, c1.high) {
            let mut bottom_low = c2.high;
            self.ops.increment(&mut bottom_low);
            self.bottom1 = Some(RangeRef { low: bottom_low, high: c1.high, val: c1.val });
            let s1 = self.s1.cur.as_mut().expect("s1 item vanished during split");
            s1.high = c2.high;
            self.state = IterState::EmitOverlapThenRestoreS1;
            Some(RangePairEvent::S2DragsBehindBreak)
        } else {
            self.state = IterState::AdvanceBoth;
            Some(RangePairEvent::ExactOverlap)
        }
    }
}

/// Point-keyed variant for the condition lists inside a conditional
/// transition. No splitting, so only three event kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValPairEvent {
    OnlyInS1,
    OnlyInS2,
    ExactOverlap,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ValRef<T> {
    pub key: CondVal,
    pub val: T,
}

pub struct ValPairIter<T> {
    list1: Vec<ValRef<T>>,
    list2: Vec<ValRef<T>>,
    i1: usize,
    i2: usize,
    pending: Option<ValPairEvent>,
}

impl<T: Copy> ValPairIter<T> {
    pub fn new(list1: Vec<ValRef<T>>, list2: Vec<ValRef<T>>) -> ValPairIter<T> {
        ValPairIter { list1, list2, i1: 0, i2: 0, pending: None }
    }

    pub fn s1(&self) -> &ValRef<T> {
        &self.list1[self.i1]
    }

    pub fn s2(&self) -> &ValRef<T> {
        &self.list2[self.i2]
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<ValPairEvent> {
        /* Consume the item(s) of the previously returned event. */
        match self.pending.take() {
            Some(ValPairEvent::OnlyInS1) => self.i1 += 1,
            Some(ValPairEvent::OnlyInS2) => self.i2 += 1,
            Some(ValPairEvent::ExactOverlap) => {
                self.i1 += 1;
                self.i2 += 1;
            }
            None => {}
        }

        let ev = match (self.list1.get(self.i1), self.list2.get(self.i2)) {
            (None, None) => return None,
            (Some(_), None) => ValPairEvent::OnlyInS1,
            (None, Some(_)) => ValPairEvent::OnlyInS2,
            (Some(a), Some(b)) => {
                if a.key < b.key {
                    ValPairEvent::OnlyInS1
                } else if b.key < a.key {
                    ValPairEvent::OnlyInS2
                } else {
                    ValPairEvent::ExactOverlap
                }
            }
        };
        self.pending = Some(ev);
        Some(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(ranges: &[(i64, i64)]) -> Vec<RangeRef<usize>> {
        ranges
            .iter()
            .enumerate()
            .map(|(i, &(lo, hi))| RangeRef { low: Key(lo), high: Key(hi), val: i })
            .collect()
    }

    fn run(list1: &[(i64, i64)], list2: &[(i64, i64)]) -> Vec<(RangePairEvent, i64, i64)> {
        let mut it = RangePairIter::new(KeyOps::octet(), refs(list1), refs(list2));
        let mut out = Vec::new();
        while let Some(ev) = it.next() {
            if ev.is_break() {
                continue;
            }
            let (lo, hi) = if ev.in_s2_only() {
                (it.s2().low.0, it.s2().high.0)
            } else {
                (it.s1().low.0, it.s1().high.0)
            };
            out.push((ev, lo, hi));
        }
        out
    }

    #[test]
    fn test_disjoint_ranges() {
        use RangePairEvent::*;
        let evs = run(&[(0, 4)], &[(10, 12)]);
        assert_eq!(evs, vec![(OnlyInS1, 0, 4), (OnlyInS2, 10, 12)]);
    }

    #[test]
    fn test_exact_overlap() {
        use RangePairEvent::*;
        let evs = run(&[(3, 7)], &[(3, 7)]);
        assert_eq!(evs, vec![(ExactOverlap, 3, 7)]);
    }

    #[test]
    fn test_s1_sticks_out_front() {
        use RangePairEvent::*;
        // S1 [0..9], S2 [5..9]: prefix [0..4] is s1-only, rest aligns.
        let evs = run(&[(0, 9)], &[(5, 9)]);
        assert_eq!(evs, vec![(S1SticksOut, 0, 4), (ExactOverlap, 5, 9)]);
    }

    #[test]
    fn test_s1_drags_behind() {
        use RangePairEvent::*;
        // S1 [0..4], S2 [0..9]: s1 ends first, s2 is split.
        let evs = run(&[(0, 4)], &[(0, 9)]);
        assert_eq!(evs, vec![(S1DragsBehind, 0, 4), (OnlyInS2, 5, 9)]);
    }

    #[test]
    fn test_staggered_ranges() {
        use RangePairEvent::*;
        // S1 [2..8], S2 [5..11].
        let evs = run(&[(2, 8)], &[(5, 11)]);
        assert_eq!(
            evs,
            vec![(S1SticksOut, 2, 4), (S2DragsBehind, 5, 8), (OnlyInS2, 9, 11)]
        );
    }

    #[test]
    fn test_break_payload_substitution() {
        let mut it = RangePairIter::new(KeyOps::octet(), refs(&[(0, 9)]), refs(&[(5, 9)]));
        assert_eq!(it.next(), Some(RangePairEvent::S1SticksOutBreak));
        it.set_s1_val(99);
        assert_eq!(it.next(), Some(RangePairEvent::S1SticksOut));
        assert_eq!(it.s1().val, 99);
        // The saved bottom half keeps the original payload.
        assert_eq!(it.next(), Some(RangePairEvent::ExactOverlap));
        assert_eq!(it.s1().val, 0);
    }

    #[test]
    fn test_val_pair_iter() {
        use ValPairEvent::*;
        let l1: Vec<ValRef<u32>> = [0u32, 2, 3]
            .iter()
            .map(|&k| ValRef { key: CondVal(k), val: k })
            .collect();
        let l2: Vec<ValRef<u32>> = [1u32, 3]
            .iter()
            .map(|&k| ValRef { key: CondVal(k), val: k })
            .collect();
        let mut it = ValPairIter::new(l1, l2);
        let mut evs = Vec::new();
        while let Some(ev) = it.next() {
            evs.push(ev);
        }
        assert_eq!(evs, vec![OnlyInS1, OnlyInS2, OnlyInS1, ExactOverlap]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Build a well-formed range list from (gap, len) pairs.
    fn build_list(parts: &[(i64, i64)]) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        let mut next = 0i64;
        for &(gap, len) in parts {
            let lo = next + gap;
            let hi = lo + len;
            if hi > 200 {
                break;
            }
            out.push((lo, hi));
            next = hi + 1;
        }
        out
    }

    fn arb_list() -> impl Strategy<Value = Vec<(i64, i64)>> {
        proptest::collection::vec((0i64..4, 0i64..6), 0..8).prop_map(|v| build_list(&v))
    }

    proptest! {
        /// The emitted intervals partition the union of the inputs: every
        /// covered key appears in exactly one non-break event.
        #[test]
        fn prop_events_partition_union(l1 in arb_list(), l2 in arb_list()) {
            let mut expected = vec![0u32; 201];
            for &(lo, hi) in l1.iter().chain(l2.iter()) {
                for k in lo..=hi {
                    expected[k as usize] = 1;
                }
            }

            let refs = |l: &Vec<(i64, i64)>| {
                l.iter()
                    .map(|&(lo, hi)| RangeRef { low: Key(lo), high: Key(hi), val: () })
                    .collect::<Vec<_>>()
            };
            let mut it = RangePairIter::new(KeyOps::unsigned(16), refs(&l1), refs(&l2));

            let mut seen = vec![0u32; 201];
            let mut prev_high = -1i64;
            while let Some(ev) = it.next() {
                if ev.is_break() {
                    continue;
                }
                let (lo, hi) = if ev.in_s2_only() {
                    (it.s2().low.0, it.s2().high.0)
                } else {
                    (it.s1().low.0, it.s1().high.0)
                };
                prop_assert!(lo <= hi);
                prop_assert!(lo > prev_high, "events must advance left to right");
                prev_high = hi;
                for k in lo..=hi {
                    seen[k as usize] += 1;
                }
            }
            prop_assert_eq!(seen, expected);
        }
    }
}
