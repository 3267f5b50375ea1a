//! The object pool: a fixed array of refcounted slots.
//!
//! Nothing in here ever frees anything. A decrement that drives a count to zero
//! only *reports* that it did; the caller puts the object on the pending-free
//! queue and the collector reclaims it while the world is stopped.

use core::sync::atomic::{
    AtomicBool, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::backoff::Backoff;
use crate::error::{PoolExhausted, StaleHandle};

/// A non-owning reference to a pool slot. Holding a handle whose object has a
/// refcount of at least one is the only license to use that object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    pub fn from_raw(slot: u32) -> Handle {
        Handle(slot)
    }

    pub fn into_raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a successful decrement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other references remain.
    Shared,
    /// This call took the count from one to zero and enqueued the object.
    Last,
}

/// One reclaimable object.
///
/// CORRECTNESS: `refcount > 0` implies `allocated`. `queued` is set by exactly
/// one thread per zero crossing and only the collector clears it.
#[derive(Debug, Default)]
pub(crate) struct Object {
    refcount: AtomicUsize,
    allocated: AtomicBool,
    queued: AtomicBool,
}

/// A racy read of a slot, for tests and quiescent inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub refcount: usize,
    pub allocated: bool,
    pub queued: bool,
}

#[derive(Debug)]
pub(crate) struct Pool {
    slots: Box<[Object]>,
    sweeps: usize,
    backoff: Backoff,
}

impl Pool {
    pub(crate) fn new(capacity: usize, sweeps: usize, backoff: Backoff) -> Pool {
        Pool {
            slots: (0..capacity).map(|_| Object::default()).collect(),
            sweeps,
            backoff,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn object(&self, h: Handle) -> Result<&Object, StaleHandle> {
        // a handle past the end never denoted a live object
        self.slots.get(h.index()).ok_or(StaleHandle { slot: h.0 })
    }

    /// Claim a free slot, starting the scan at `start`.
    // HOTPATH
    pub(crate) fn allocate(&self, start: usize) -> Result<Handle, PoolExhausted> {
        let cap = self.slots.len();
        let mut spinner = self.backoff.spinner();
        for _ in 0..self.sweeps {
            for k in 0..cap {
                let ix = (start + k) % cap;
                let obj = &self.slots[ix];
                // cheap load first so a full pool doesn't hammer every line
                if obj.allocated.load(Relaxed) {
                    continue;
                }
                if obj
                    .allocated
                    .compare_exchange(false, true, AcqRel, Acquire)
                    .is_ok()
                {
                    obj.refcount.store(1, Release);
                    tracing::trace!(slot = ix, "allocated");
                    return Ok(Handle(ix as u32));
                }
            }
            spinner.snooze();
        }
        Err(PoolExhausted {
            capacity: cap,
            sweeps: self.sweeps,
        })
    }

    // HOTPATH
    pub(crate) fn increment(&self, h: Handle) -> Result<(), StaleHandle> {
        let obj = self.object(h)?;
        let mut spinner = self.backoff.spinner();
        loop {
            let seen = obj.refcount.load(Acquire);
            if seen == 0 {
                // lost the race against the zero crossing. never resurrect.
                return Err(StaleHandle { slot: h.0 });
            }
            match obj
                .refcount
                .compare_exchange_weak(seen, seen + 1, AcqRel, Acquire)
            {
                Ok(_) => return Ok(()),
                Err(_) => spinner.snooze(),
            }
        }
    }

    /// Drop one reference. On `Released::Last` the caller owns the job of
    /// enqueueing `h`; the `queued` flag has already been taken.
    // HOTPATH
    pub(crate) fn decrement(&self, h: Handle) -> Result<Released, StaleHandle> {
        let obj = self.object(h)?;
        let mut spinner = self.backoff.spinner();
        loop {
            let seen = obj.refcount.load(Acquire);
            if seen == 0 {
                return Err(StaleHandle { slot: h.0 });
            }
            match obj
                .refcount
                .compare_exchange_weak(seen, seen - 1, AcqRel, Acquire)
            {
                Ok(1) => {
                    if obj.queued.swap(true, AcqRel) {
                        desync!("slot {} crossed zero while already queued", h);
                    }
                    tracing::trace!(slot = h.0, "refcount reached zero");
                    return Ok(Released::Last);
                }
                Ok(_) => return Ok(Released::Shared),
                Err(_) => spinner.snooze(),
            }
        }
    }

    /// Return a queued, zero-count slot to the free pool.
    ///
    /// SAFETY (logical): only the collector calls this, while every other
    /// thread is parked or departed.
    pub(crate) fn reclaim(&self, h: Handle) {
        let obj = match self.slots.get(h.index()) {
            Some(obj) => obj,
            None => desync!("pending-free queue names slot {} outside the pool", h),
        };
        let refcount = obj.refcount.load(Acquire);
        if refcount != 0 {
            desync!("reclaiming slot {} with a live refcount of {}", h, refcount);
        }
        if !obj.queued.load(Acquire) {
            desync!("reclaiming slot {} twice in one cycle", h);
        }
        if !obj.allocated.load(Acquire) {
            desync!("reclaiming slot {} that was never allocated", h);
        }
        obj.refcount.store(0, Relaxed);
        obj.queued.store(false, Relaxed);
        // freeing it is the publication point for allocators
        obj.allocated.store(false, Release);
    }

    /// The three fields are read one after another, so a snapshot taken while
    /// the slot is changing can mix states (a count of one on a slot that was
    /// reclaimed in between, say). That's not a breach.
    pub(crate) fn snapshot(&self, h: Handle) -> Option<SlotSnapshot> {
        self.slots.get(h.index()).map(|obj| SlotSnapshot {
            refcount: obj.refcount.load(Acquire),
            allocated: obj.allocated.load(Acquire),
            queued: obj.queued.load(Acquire),
        })
    }

    /// Number of allocated slots.
    pub(crate) fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|obj| obj.allocated.load(Acquire))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(cap: usize) -> Pool {
        Pool::new(cap, 1, Backoff::Spin)
    }

    #[test]
    fn allocate_sets_count_to_one() {
        let p = pool(4);
        let h = p.allocate(0).expect("empty pool can't be exhausted");
        assert_eq!(
            p.snapshot(h),
            Some(SlotSnapshot {
                refcount: 1,
                allocated: true,
                queued: false
            })
        );
    }

    #[test]
    fn allocate_wraps_from_start() {
        let p = pool(3);
        assert_eq!(p.allocate(2), Ok(Handle(2)));
        assert_eq!(p.allocate(2), Ok(Handle(0)));
        assert_eq!(p.allocate(2), Ok(Handle(1)));
        assert_eq!(
            p.allocate(2),
            Err(PoolExhausted {
                capacity: 3,
                sweeps: 1
            })
        );
    }

    #[test]
    fn zero_crossing_is_terminal_until_reclaimed() {
        let p = pool(1);
        let h = p.allocate(0).unwrap();
        p.increment(h).unwrap();
        assert_eq!(p.decrement(h), Ok(Released::Shared));
        assert_eq!(p.decrement(h), Ok(Released::Last));
        assert_eq!(p.increment(h), Err(StaleHandle { slot: 0 }));
        assert_eq!(p.decrement(h), Err(StaleHandle { slot: 0 }));
        // still allocated: nobody reclaimed it yet
        assert!(p.allocate(0).is_err());
        p.reclaim(h);
        assert_eq!(p.allocate(0), Ok(h));
    }

    #[test]
    fn out_of_range_handles_are_stale() {
        let p = pool(2);
        assert_eq!(p.increment(Handle(7)), Err(StaleHandle { slot: 7 }));
        assert_eq!(p.snapshot(Handle(7)), None);
    }

    #[test]
    #[should_panic(expected = "desync")]
    fn reclaiming_a_live_slot_is_fatal() {
        let p = pool(1);
        let h = p.allocate(0).unwrap();
        p.reclaim(h);
    }

    #[test]
    fn snapshots_race_with_churn_without_panicking() {
        let p = Arc::new(pool(1));
        let stop = Arc::new(core::sync::atomic::AtomicBool::new(false));
        let observer = {
            let (p, stop) = (p.clone(), stop.clone());
            std::thread::spawn(move || {
                let mut seen = 0usize;
                while !stop.load(Acquire) {
                    seen += p.snapshot(Handle(0)).map_or(0, |s| s.refcount);
                }
                seen
            })
        };
        for _ in 0..20_000 {
            let h = p.allocate(0).unwrap();
            assert_eq!(p.decrement(h), Ok(Released::Last));
            p.reclaim(h);
        }
        stop.store(true, Release);
        observer.join().unwrap();
    }

    #[test]
    fn contended_slot_crosses_zero_once() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2000;
        let p = Arc::new(Pool::new(1, 1, Backoff::default()));
        let h = p.allocate(0).unwrap();
        for _ in 1..THREADS {
            p.increment(h).unwrap();
        }
        let lasts: usize = (0..THREADS)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        p.increment(h).unwrap();
                        assert_eq!(p.decrement(h), Ok(Released::Shared));
                    }
                    match p.decrement(h).unwrap() {
                        Released::Last => 1,
                        Released::Shared => 0,
                    }
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .sum();
        assert_eq!(lasts, 1);
        let snap = p.snapshot(h).unwrap();
        assert_eq!(snap.refcount, 0);
        assert!(snap.queued);
    }
}
