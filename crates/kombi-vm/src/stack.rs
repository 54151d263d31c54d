//! Segmented, copy-on-write value stack.
//!
//! The stack is a chain of fixed-size segments linked towards the bottom.
//! Segments are reference counted: the active chain, every continuation and
//! every newer segment's `prev` link each hold one reference. Capturing the
//! stack is therefore a single increment; a shared segment is copied only
//! when it is about to be written.
//!
//! Every segment below the head is full.

use std::mem;

use crate::error::{LoadError, LoadResult, VmError, VmResult};
use crate::pool::{Pending, Pool};
use crate::value::Value;

/// Index of a stack segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub(crate) u32);

#[derive(Debug, Default)]
struct Segment {
    elems: Vec<Value>,
    prev: Option<SegmentId>,
    refcnt: u32,
    /// Depth of the chain below this segment.
    base: u32,
}

/// The VM stack.
#[derive(Debug)]
pub struct Stack {
    segments: Vec<Segment>,
    holes: Vec<u32>,
    active: SegmentId,
    seg_len: usize,
    peak: u32,
}

impl Stack {
    /// Empty stack with `seg_len` values per segment (at least one).
    pub fn new(seg_len: u32) -> LoadResult<Self> {
        let seg_len = seg_len.max(1) as usize;
        let mut stack = Self { segments: Vec::new(), holes: Vec::new(), active: SegmentId(0), seg_len, peak: 0 };
        stack.active = stack
            .alloc_segment(None, 0)
            .map_err(|_| LoadError::Alloc { bytes: seg_len * mem::size_of::<Value>() })?;
        Ok(stack)
    }

    /// Values per segment.
    pub const fn segment_len(&self) -> usize { self.seg_len }

    /// Current number of values.
    pub fn depth(&self) -> u32 {
        self.segments
            .get(self.active.0 as usize)
            .map_or(0, |s| s.base + s.elems.len() as u32)
    }

    /// Deepest the stack has been since it was last emptied by a reset.
    pub const fn peak_depth(&self) -> u32 { self.peak }

    /// Number of live segments, saved ones included.
    pub fn segments(&self) -> usize { self.segments.len() - self.holes.len() }

    fn alloc_segment(&mut self, prev: Option<SegmentId>, base: u32) -> VmResult<SegmentId> {
        let index = match self.holes.pop() {
            Some(i) => i as usize,
            None => {
                self.segments.push(Segment::default());
                self.segments.len() - 1
            }
        };
        let seg_len = self.seg_len;
        let seg = &mut self.segments[index];
        if seg.elems.capacity() < seg_len && seg.elems.try_reserve_exact(seg_len).is_err() {
            self.holes.push(index as u32);
            return Err(VmError::Alloc { bytes: seg_len * mem::size_of::<Value>() });
        }
        seg.prev = prev;
        seg.refcnt = 1;
        seg.base = base;
        Ok(SegmentId(index as u32))
    }

    fn seg(&self, id: SegmentId) -> VmResult<&Segment> {
        match self.segments.get(id.0 as usize) {
            Some(s) if s.refcnt > 0 => Ok(s),
            _ => Err(VmError::InvalidHandle { kind: "stack segment", index: id.0 }),
        }
    }

    fn seg_mut(&mut self, id: SegmentId) -> VmResult<&mut Segment> {
        match self.segments.get_mut(id.0 as usize) {
            Some(s) if s.refcnt > 0 => Ok(s),
            _ => Err(VmError::InvalidHandle { kind: "stack segment", index: id.0 }),
        }
    }

    pub(crate) fn retain(&mut self, id: SegmentId) -> VmResult<()> {
        self.seg_mut(id)?.refcnt += 1;
        Ok(())
    }

    /// Drops one reference; a freed segment queues its values and its `prev`.
    pub(crate) fn unref(&mut self, id: SegmentId, work: &mut Vec<Pending>) -> VmResult<()> {
        let seg = self.seg_mut(id)?;
        seg.refcnt -= 1;
        if seg.refcnt > 0 {
            return Ok(());
        }
        work.extend(seg.elems.drain(..).filter_map(Value::handle).map(Pending::Elem));
        if let Some(prev) = seg.prev.take() {
            work.push(Pending::Segment(prev));
        }
        self.holes.push(id.0);
        Ok(())
    }

    /// Private copy of `id` sharing its `prev` chain.
    pub(crate) fn dup(&mut self, id: SegmentId, pool: &mut Pool) -> VmResult<SegmentId> {
        let (prev, base) = {
            let s = self.seg(id)?;
            (s.prev, s.base)
        };
        let copy = self.alloc_segment(prev, base)?;
        if let Some(p) = prev {
            self.retain(p)?;
        }
        let mut elems = mem::take(&mut self.segments[copy.0 as usize].elems);
        elems.extend_from_slice(&self.segments[id.0 as usize].elems);
        for &v in &elems {
            pool.retain(v)?;
        }
        self.segments[copy.0 as usize].elems = elems;
        Ok(copy)
    }

    /// Makes the head segment writable, copying it if it is shared.
    fn make_exclusive(&mut self, pool: &mut Pool) -> VmResult<SegmentId> {
        let head = self.active;
        if self.seg(head)?.refcnt > 1 {
            let copy = self.dup(head, pool)?;
            self.segments[head.0 as usize].refcnt -= 1;
            self.active = copy;
        }
        Ok(self.active)
    }

    /// Steps down to `prev` while the head is empty.
    fn settle(&mut self, pool: &mut Pool) -> VmResult<()> {
        let head = self.seg(self.active)?;
        if !head.elems.is_empty() {
            return Ok(());
        }
        let old = self.active;
        let prev = head.prev.ok_or(VmError::StackUnderflow)?;
        self.retain(prev)?;
        self.active = prev;
        pool.release_segment(old, self)
    }

    /// Pushes `v`, taking over its reference.
    pub fn push(&mut self, v: Value, pool: &mut Pool) -> VmResult<()> {
        let head = self.seg(self.active)?;
        let (len, base) = (head.elems.len(), head.base);
        let id = if len >= self.seg_len {
            let id = self.alloc_segment(Some(self.active), base + len as u32)?;
            self.active = id;
            id
        } else {
            self.make_exclusive(pool)?
        };
        self.segments[id.0 as usize].elems.push(v);
        self.peak = self.peak.max(self.depth());
        Ok(())
    }

    /// Pushes in order; the last value ends on top.
    pub fn push_all<const N: usize>(&mut self, values: [Value; N], pool: &mut Pool) -> VmResult<()> {
        values.into_iter().try_for_each(|v| self.push(v, pool))
    }

    /// Pops the top value; its reference moves to the caller.
    pub fn pop(&mut self, pool: &mut Pool) -> VmResult<Value> {
        self.settle(pool)?;
        let id = self.make_exclusive(pool)?;
        self.segments[id.0 as usize].elems.pop().ok_or(VmError::StackUnderflow)
    }

    /// Swaps `v` with the value just beneath the top and returns the latter.
    pub fn xch(&mut self, v: Value, pool: &mut Pool) -> VmResult<Value> {
        self.settle(pool)?;
        let id = self.make_exclusive(pool)?;
        let len = self.segments[id.0 as usize].elems.len();
        if len >= 2 {
            return Ok(mem::replace(&mut self.segments[id.0 as usize].elems[len - 2], v));
        }
        let mut prev = self.segments[id.0 as usize].prev.ok_or(VmError::StackUnderflow)?;
        if self.seg(prev)?.refcnt > 1 {
            let copy = self.dup(prev, pool)?;
            self.segments[prev.0 as usize].refcnt -= 1;
            self.segments[id.0 as usize].prev = Some(copy);
            prev = copy;
        }
        let slot = self.seg_mut(prev)?.elems.last_mut().ok_or(VmError::StackUnderflow)?;
        Ok(mem::replace(slot, v))
    }

    /// Captures the whole stack in O(1). The returned reference belongs to the caller.
    pub fn save(&mut self) -> VmResult<SegmentId> {
        self.retain(self.active)?;
        Ok(self.active)
    }

    /// Replaces the stack with a captured one, taking over the caller's
    /// reference on `seg`.
    pub fn resume(&mut self, seg: SegmentId, pool: &mut Pool) -> VmResult<()> {
        self.seg(seg)?;
        let old = mem::replace(&mut self.active, seg);
        pool.release_segment(old, self)?;
        self.peak = self.peak.max(self.depth());
        Ok(())
    }

    /// Drops every value and starts over with an empty bottom segment.
    pub fn clear(&mut self, pool: &mut Pool) -> VmResult<()> {
        let old = self.active;
        pool.release_segment(old, self)?;
        self.active = self.alloc_segment(None, 0)?;
        Ok(())
    }

    /// Forgets every segment. Only meaningful together with a pool reset.
    pub(crate) fn forget(&mut self) -> VmResult<()> {
        self.segments.clear();
        self.holes.clear();
        self.active = self.alloc_segment(None, 0)?;
        self.peak = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn fixture(seg_len: u32) -> (Stack, Pool) {
        (Stack::new(seg_len).unwrap(), Pool::new(64, 8).unwrap())
    }

    fn drain(stack: &mut Stack, pool: &mut Pool) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(v) = stack.pop(pool) {
            out.push(v);
        }
        out
    }

    #[test]
    fn lifo_across_segments() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(2);
        stack.push_all([Value::K, Value::S, Value::I, Value::V, Value::C], &mut pool)?;
        assert_eq!(stack.depth(), 5);
        assert_eq!(stack.segments(), 3);
        assert_eq!(drain(&mut stack, &mut pool), vec![Value::C, Value::V, Value::I, Value::S, Value::K]);
        assert_eq!(stack.segments(), 1);
        assert_eq!(stack.peak_depth(), 5);
        Ok(())
    }

    #[test]
    fn zero_length_segments_hold_one_value() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(0);
        assert_eq!(stack.segment_len(), 1);
        stack.push_all([Value::K, Value::S], &mut pool)?;
        assert_eq!(stack.segments(), 2);
        assert_eq!(drain(&mut stack, &mut pool), vec![Value::S, Value::K]);
        Ok(())
    }

    #[test]
    fn pop_on_empty_underflows() {
        let (mut stack, mut pool) = fixture(4);
        assert!(matches!(stack.pop(&mut pool), Err(VmError::StackUnderflow)));
    }

    #[test]
    fn xch_reaches_into_previous_segment() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(2);
        stack.push_all([Value::K, Value::S, Value::I], &mut pool)?;
        assert_eq!(stack.xch(Value::V, &mut pool)?, Value::S);
        assert_eq!(drain(&mut stack, &mut pool), vec![Value::I, Value::V, Value::K]);
        Ok(())
    }

    #[test]
    fn xch_needs_two_values() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(2);
        stack.push(Value::K, &mut pool)?;
        assert!(matches!(stack.xch(Value::V, &mut pool), Err(VmError::StackUnderflow)));
        Ok(())
    }

    #[test]
    fn saved_stack_is_isolated_from_later_writes() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(2);
        stack.push_all([Value::K, Value::S, Value::I], &mut pool)?;
        let saved = stack.save()?;
        assert_eq!(stack.pop(&mut pool)?, Value::I);
        assert_eq!(stack.xch(Value::E, &mut pool)?, Value::K);
        stack.push_all([Value::V, Value::C, Value::D], &mut pool)?;

        stack.resume(saved, &mut pool)?;
        assert_eq!(drain(&mut stack, &mut pool), vec![Value::I, Value::S, Value::K]);
        assert_eq!(stack.segments(), 1);
        Ok(())
    }

    #[test]
    fn shared_values_are_retained_by_copies() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(4);
        let h = pool.alloc1(Value::I)?;
        stack.push(Value::K1(h), &mut pool)?;
        let saved = stack.save()?;
        stack.push(Value::V, &mut pool)?;
        assert_eq!(pool.refcount(h), Some(2));
        pool.release_segment(saved, &mut stack)?;
        assert_eq!(pool.refcount(h), Some(1));
        stack.clear(&mut pool)?;
        assert_eq!(pool.live(), 0);
        assert_eq!(stack.segments(), 1);
        Ok(())
    }

    #[test]
    fn deep_chain_clears_without_recursion() -> VmResult<()> {
        let (mut stack, mut pool) = fixture(1);
        for _ in 0..100_000 {
            stack.push(Value::I, &mut pool)?;
        }
        assert_eq!(stack.segments(), 100_000);
        stack.clear(&mut pool)?;
        assert_eq!(stack.segments(), 1);
        assert_eq!(stack.depth(), 0);
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u8),
        Pop,
        Xch(u8),
        Save,
        Resume(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<u8>().prop_map(Op::Push),
            3 => Just(Op::Pop),
            2 => any::<u8>().prop_map(Op::Xch),
            1 => Just(Op::Save),
            1 => any::<usize>().prop_map(Op::Resume),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_vec(seg_len in 1u32..5, ops in proptest::collection::vec(op(), 0..200)) {
            let (mut stack, mut pool) = fixture(seg_len);
            let mut model: Vec<Value> = Vec::new();
            let mut saved: Vec<(SegmentId, Vec<Value>)> = Vec::new();
            for op in ops {
                match op {
                    Op::Push(c) => {
                        stack.push(Value::Out(c), &mut pool).unwrap();
                        model.push(Value::Out(c));
                    }
                    Op::Pop => match model.pop() {
                        Some(v) => prop_assert_eq!(stack.pop(&mut pool).unwrap(), v),
                        None => prop_assert!(stack.pop(&mut pool).is_err()),
                    },
                    Op::Xch(c) if model.len() >= 2 => {
                        let at = model.len() - 2;
                        let old = mem::replace(&mut model[at], Value::Cmp(c));
                        prop_assert_eq!(stack.xch(Value::Cmp(c), &mut pool).unwrap(), old);
                    }
                    Op::Xch(c) => prop_assert!(stack.xch(Value::Cmp(c), &mut pool).is_err()),
                    Op::Save => saved.push((stack.save().unwrap(), model.clone())),
                    Op::Resume(i) if !saved.is_empty() => {
                        let (seg, snapshot) = saved[i % saved.len()].clone();
                        stack.retain(seg).unwrap();
                        stack.resume(seg, &mut pool).unwrap();
                        model = snapshot;
                    }
                    Op::Resume(_) => {}
                }
                prop_assert_eq!(stack.depth() as usize, model.len());
            }
            for (seg, _) in saved {
                pool.release_segment(seg, &mut stack).unwrap();
            }
            stack.clear(&mut pool).unwrap();
            prop_assert_eq!(stack.segments(), 1);
        }
    }
}
