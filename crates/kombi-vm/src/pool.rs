//! Fixed-capacity, reference-counted object pool.
//!
//! Each element holds either one or two values, or a saved stack segment
//! plus a resume address (a continuation). Freed slots go to a hole list
//! and are reused before the high-water mark grows. Releasing never
//! recurses: dependents are queued on a worklist shared with the stack.

use crate::error::{LoadError, LoadResult, VmError, VmResult};
use crate::stack::{SegmentId, Stack};
use crate::value::{Addr, Handle, Value};

/// Something whose reference count must drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    Elem(Handle),
    Segment(SegmentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Values(Value, Value),
    Continuation { segment: SegmentId, resume: Addr },
}

#[derive(Debug, Clone, Copy)]
struct Elem {
    refcnt: u32,
    slot: Slot,
}

/// The object pool.
#[derive(Debug)]
pub struct Pool {
    elems: Vec<Elem>,
    holes: Vec<u32>,
    worklist: Vec<Pending>,
    capacity: u32,
    live: u32,
    peak: u32,
    epoch: u32,
}

impl Pool {
    /// Pool of `capacity` elements. `hint` sizes the release worklist
    /// (the instruction count is a good guess).
    pub fn new(capacity: u32, hint: usize) -> LoadResult<Self> {
        let mut elems = Vec::new();
        elems.try_reserve_exact(capacity as usize).map_err(|_| LoadError::Alloc {
            bytes: capacity as usize * std::mem::size_of::<Elem>(),
        })?;
        let mut holes = Vec::new();
        holes
            .try_reserve_exact(capacity as usize)
            .map_err(|_| LoadError::Alloc { bytes: capacity as usize * std::mem::size_of::<u32>() })?;
        let mut worklist = Vec::new();
        worklist
            .try_reserve(hint)
            .map_err(|_| LoadError::Alloc { bytes: hint * std::mem::size_of::<Pending>() })?;
        Ok(Self { elems, holes, worklist, capacity, live: 0, peak: 0, epoch: 0 })
    }

    /// Maximum number of live elements.
    pub const fn capacity(&self) -> u32 { self.capacity }

    /// Number of live elements.
    pub const fn live(&self) -> u32 { self.live }

    /// Most elements live at once since the last [`Pool::clear`].
    pub const fn peak_live(&self) -> u32 { self.peak }

    /// Reference count of a live element, `None` once freed or cleared.
    pub fn refcount(&self, h: Handle) -> Option<u32> { self.elem(h).ok().map(|e| e.refcnt) }

    fn stale(h: Handle) -> VmError { VmError::InvalidHandle { kind: "pool element", index: h.index } }

    fn elem_mut(&mut self, h: Handle) -> VmResult<&mut Elem> {
        if h.epoch != self.epoch {
            return Err(Self::stale(h));
        }
        match self.elems.get_mut(h.index as usize) {
            Some(e) if e.refcnt > 0 => Ok(e),
            _ => Err(Self::stale(h)),
        }
    }

    fn alloc(&mut self, slot: Slot) -> VmResult<Handle> {
        let elem = Elem { refcnt: 1, slot };
        let index = if let Some(i) = self.holes.pop() {
            self.elems[i as usize] = elem;
            i
        } else if (self.elems.len() as u64) < u64::from(self.capacity) {
            self.elems.push(elem);
            (self.elems.len() - 1) as u32
        } else {
            return Err(VmError::PoolExhausted { capacity: self.capacity });
        };
        self.live += 1;
        self.peak = self.peak.max(self.live);
        Ok(Handle::new(index, self.epoch))
    }

    /// Stores one value. Ownership of `v` moves into the pool.
    pub fn alloc1(&mut self, v: Value) -> VmResult<Handle> { self.alloc(Slot::Values(v, Value::Empty)) }

    /// Stores two values. Ownership of both moves into the pool.
    pub fn alloc2(&mut self, v1: Value, v2: Value) -> VmResult<Handle> { self.alloc(Slot::Values(v1, v2)) }

    /// Stores a continuation. The caller's reference on `segment` moves into the pool.
    pub fn alloc_continuation(&mut self, segment: SegmentId, resume: Addr) -> VmResult<Handle> {
        self.alloc(Slot::Continuation { segment, resume })
    }

    fn elem(&self, h: Handle) -> VmResult<&Elem> {
        if h.epoch != self.epoch {
            return Err(Self::stale(h));
        }
        match self.elems.get(h.index as usize) {
            Some(e) if e.refcnt > 0 => Ok(e),
            _ => Err(Self::stale(h)),
        }
    }

    fn values(&self, h: Handle) -> VmResult<(Value, Value)> {
        match self.elem(h)?.slot {
            Slot::Values(a, b) => Ok((a, b)),
            _ => Err(Self::stale(h)),
        }
    }

    /// First value, borrowed (no reference taken).
    pub fn get1(&self, h: Handle) -> VmResult<Value> { self.values(h).map(|(a, _)| a) }

    /// Both values, borrowed (no reference taken).
    pub fn get2(&self, h: Handle) -> VmResult<(Value, Value)> { self.values(h) }

    /// Saved segment and resume address of a continuation, borrowed.
    pub fn continuation(&self, h: Handle) -> VmResult<(SegmentId, Addr)> {
        match self.elem(h)?.slot {
            Slot::Continuation { segment, resume } => Ok((segment, resume)),
            _ => Err(Self::stale(h)),
        }
    }

    /// Saved segment and resume address of a continuation, with a segment
    /// reference owned by the caller. A continuation that other values still
    /// point at hands out a private copy of its head segment instead.
    pub fn get2_separate(&mut self, h: Handle, stack: &mut Stack) -> VmResult<(SegmentId, Addr)> {
        let (segment, resume) = self.continuation(h)?;
        let owned = if self.elem(h)?.refcnt > 1 {
            stack.dup(segment, self)?
        } else {
            stack.retain(segment)?;
            segment
        };
        Ok((owned, resume))
    }

    /// Takes one more reference on a live element.
    pub fn addref(&mut self, h: Handle) -> VmResult<()> {
        self.elem_mut(h)?.refcnt += 1;
        Ok(())
    }

    /// Takes one more reference on whatever `v` owns and hands `v` back.
    pub fn retain(&mut self, v: Value) -> VmResult<Value> {
        if let Some(h) = v.handle() {
            self.addref(h)?;
        }
        Ok(v)
    }

    /// Drops the reference owned by `v`, cascading to everything that
    /// becomes unreachable.
    pub fn release(&mut self, v: Value, stack: &mut Stack) -> VmResult<()> {
        match v.handle() {
            Some(h) => self.drain(Pending::Elem(h), stack),
            None => Ok(()),
        }
    }

    /// Drops one reference on a stack segment, cascading like [`Pool::release`].
    pub fn release_segment(&mut self, id: SegmentId, stack: &mut Stack) -> VmResult<()> {
        self.drain(Pending::Segment(id), stack)
    }

    fn drain(&mut self, first: Pending, stack: &mut Stack) -> VmResult<()> {
        let mut work = std::mem::take(&mut self.worklist);
        work.push(first);
        let mut result = Ok(());
        while let Some(next) = work.pop() {
            let step = match next {
                Pending::Elem(h) => self.unref(h, &mut work),
                Pending::Segment(id) => stack.unref(id, &mut work),
            };
            if let Err(e) = step {
                result = Err(e);
                work.clear();
            }
        }
        self.worklist = work;
        result
    }

    fn unref(&mut self, h: Handle, work: &mut Vec<Pending>) -> VmResult<()> {
        let elem = self.elem_mut(h)?;
        elem.refcnt -= 1;
        if elem.refcnt > 0 {
            return Ok(());
        }
        match std::mem::replace(&mut elem.slot, Slot::Free) {
            Slot::Values(a, b) => {
                work.extend([a, b].into_iter().filter_map(Value::handle).map(Pending::Elem));
            }
            Slot::Continuation { segment, .. } => work.push(Pending::Segment(segment)),
            Slot::Free => {}
        }
        self.holes.push(h.index);
        self.live -= 1;
        Ok(())
    }

    /// Forgets every element. Only meaningful together with a stack reset.
    /// Handles given out before the call are rejected afterwards.
    pub fn clear(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.elems.clear();
        self.holes.clear();
        self.worklist.clear();
        self.live = 0;
        self.peak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture(capacity: u32) -> (Pool, Stack) {
        (Pool::new(capacity, 8).unwrap(), Stack::new(4).unwrap())
    }

    #[test]
    fn alloc_reuses_holes() -> VmResult<()> {
        let (mut pool, mut stack) = fixture(2);
        let a = pool.alloc1(Value::K)?;
        let b = pool.alloc2(Value::S, Value::I)?;
        assert!(matches!(pool.alloc1(Value::V), Err(VmError::PoolExhausted { capacity: 2 })));
        pool.release(Value::K1(a), &mut stack)?;
        assert_eq!(pool.live(), 1);
        let c = pool.alloc1(Value::V)?;
        assert_eq!(c, a);
        assert_eq!(pool.get2(b)?, (Value::S, Value::I));
        assert_eq!(pool.get1(c)?, Value::V);
        Ok(())
    }

    #[test]
    fn refcount_tracks_retains() -> VmResult<()> {
        let (mut pool, mut stack) = fixture(4);
        let h = pool.alloc1(Value::I)?;
        let v = pool.retain(Value::K1(h))?;
        assert_eq!(pool.refcount(h), Some(2));
        pool.release(v, &mut stack)?;
        assert_eq!(pool.refcount(h), Some(1));
        pool.release(v, &mut stack)?;
        assert_eq!(pool.refcount(h), None);
        assert!(matches!(pool.get1(h), Err(VmError::InvalidHandle { kind: "pool element", .. })));
        assert!(matches!(pool.release(v, &mut stack), Err(VmError::InvalidHandle { .. })));
        Ok(())
    }

    #[test]
    fn new_reserves_every_buffer() {
        let (pool, _) = fixture(16);
        assert!(pool.elems.capacity() >= 16);
        assert!(pool.holes.capacity() >= 16);
        assert!(pool.worklist.capacity() >= 8);
    }

    #[test]
    fn clear_invalidates_old_handles() -> VmResult<()> {
        let (mut pool, mut stack) = fixture(2);
        let old = pool.alloc1(Value::I)?;
        pool.clear();
        let new = pool.alloc1(Value::V)?;
        assert_eq!(new.index(), old.index());
        assert_ne!(new.epoch(), old.epoch());
        assert_eq!(pool.refcount(old), None);
        assert!(matches!(pool.get1(old), Err(VmError::InvalidHandle { .. })));
        assert!(matches!(pool.addref(old), Err(VmError::InvalidHandle { .. })));
        assert!(matches!(pool.release(Value::K1(old), &mut stack), Err(VmError::InvalidHandle { .. })));
        assert_eq!(pool.refcount(new), Some(1));
        assert_eq!(pool.get1(new)?, Value::V);
        Ok(())
    }

    #[test]
    fn release_cascades_through_children() -> VmResult<()> {
        let (mut pool, mut stack) = fixture(8);
        let leaf = pool.alloc1(Value::I)?;
        let shared = pool.alloc1(Value::V)?;
        pool.addref(shared)?;
        let pair = pool.alloc2(Value::K1(leaf), Value::S1(shared))?;
        let outer = pool.alloc1(Value::S2(pair))?;
        pool.release(Value::K1(outer), &mut stack)?;
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.refcount(shared), Some(1));
        Ok(())
    }

    #[test]
    fn long_chains_release_without_recursion() -> VmResult<()> {
        let n = 200_000;
        let (mut pool, mut stack) = fixture(n);
        let mut v = Value::I;
        for _ in 0..n {
            v = Value::K1(pool.alloc1(v)?);
        }
        assert_eq!(pool.live(), n);
        pool.release(v, &mut stack)?;
        assert_eq!(pool.live(), 0);
        Ok(())
    }

    #[test]
    fn continuation_owns_its_segment() -> VmResult<()> {
        let (mut pool, mut stack) = fixture(4);
        let held = pool.alloc1(Value::I)?;
        stack.push(Value::K1(held), &mut pool)?;
        let seg = stack.save()?;
        let c = pool.alloc_continuation(seg, 42)?;
        assert_eq!(pool.continuation(c)?, (seg, 42));
        stack.clear(&mut pool)?;
        assert_eq!(pool.refcount(held), Some(1));
        pool.release(Value::C1(c), &mut stack)?;
        assert_eq!(pool.live(), 0);
        Ok(())
    }

    #[test]
    fn shared_continuation_separates_on_resume() -> VmResult<()> {
        let (mut pool, mut stack) = fixture(4);
        stack.push(Value::I, &mut pool)?;
        let seg = stack.save()?;
        let c = pool.alloc_continuation(seg, 7)?;
        pool.addref(c)?;

        let (copy, resume) = pool.get2_separate(c, &mut stack)?;
        assert_ne!(copy, seg);
        assert_eq!(resume, 7);

        pool.release(Value::C1(c), &mut stack)?;
        let (own, _) = pool.get2_separate(c, &mut stack)?;
        assert_eq!(own, seg);
        stack.resume(own, &mut pool)?;
        pool.release(Value::C1(c), &mut stack)?;
        pool.release_segment(copy, &mut stack)?;
        assert_eq!(pool.live(), 0);
        assert_eq!(stack.segments(), 1);
        Ok(())
    }
}
