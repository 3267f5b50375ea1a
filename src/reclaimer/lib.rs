//! A stop-the-world reclaimer for a fixed pool of refcounted objects.
//!
//! T worker threads share a pool of slots. Allocation, increments and
//! decrements are lock-free CAS loops on the slots themselves. Nothing is freed
//! when a refcount hits zero: the thread whose decrement took the count from
//! one to zero appends the object to a lock-free pending-free queue, and only a
//! collection cycle empties that queue.
//!
//! A cycle is a stop-the-world handshake. Any thread may ask for one and become
//! its initiator. Every other thread acknowledges at its next checkpoint and
//! parks; once all of them have, the initiator drains the queue with nobody
//! else looking, then lets them go. There is no tracing and no reachability
//! analysis: a cycle only reclaims objects that are already known to be dead.
//!
//! ## Using
//!
//! ```
//! use reclaimer::{Collector, CycleOutcome, PoolConfig, Released};
//!
//! let collector = Collector::new(PoolConfig::default().with_threads(1)).unwrap();
//! let reg = collector.register().unwrap();
//!
//! let h = reg.allocate().unwrap();
//! reg.increment(h).unwrap();
//! assert_eq!(reg.decrement(h), Ok(Released::Shared));
//! assert_eq!(reg.decrement(h), Ok(Released::Last));
//! reg.checkpoint();
//!
//! match reg.request_collection_cycle() {
//!     CycleOutcome::Accepted(report) => assert_eq!(report.reclaimed, 1),
//!     CycleOutcome::AlreadyInProgress => unreachable!("we're the only thread"),
//! }
//! ```
//!
//! Each thread must call [`Registration::checkpoint`] regularly. A thread that
//! stops checkpointing without dropping its registration stalls every cycle
//! after it.

extern crate alloc;

/// A protocol invariant broke. Log it and bring everything down.
macro_rules! desync {
    ($($arg:tt)*) => {{
        let what = format!($($arg)*);
        tracing::error!(%what, "reclamation protocol invariant breached");
        panic!("desync: {}", what)
    }};
}

mod api;
mod backoff;
mod collector;
mod config;
mod error;
mod handshake;
mod pool;
mod queue;

pub use api::Registration;
pub use backoff::{Backoff, Spinner};
pub use collector::{Collector, CycleOutcome, CycleReport, CycleStats};
pub use config::PoolConfig;
pub use error::*;
pub use handshake::Phase;
pub use pool::{Handle, Released, SlotSnapshot};

/// Run `f`, timing it.
fn instrument<T>(label: &'static str, f: impl FnOnce() -> T) -> (T, std::time::Duration) {
    let start = std::time::Instant::now();
    let res = f();
    let took = start.elapsed();
    tracing::trace!(label, ?took, "timed");
    (res, took)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering::SeqCst};
    use quickcheck::{Arbitrary, Gen};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn smoke() {
        let c = Collector::new(PoolConfig::default()).unwrap();
        let reg = c.register().unwrap();
        let h = reg.allocate().expect("alloc failed? :(");
        reg.decrement(h).unwrap();
        reg.checkpoint();
        assert!(matches!(
            reg.request_collection_cycle(),
            CycleOutcome::Accepted(_)
        ));
    }

    /// A allocates, B shares, both let go, C collects.
    #[test]
    fn three_threads_one_object() {
        let c = Collector::new(PoolConfig::default().with_capacity(2).with_threads(3)).unwrap();
        let step = Arc::new(Barrier::new(3));
        let slot = Arc::new(AtomicU32::new(u32::MAX));
        // parties still checkpointing; C stops waiting on them once they leave
        let cycle_done = Arc::new(AtomicUsize::new(0));

        let a = {
            let (c, step, slot, cycle_done) =
                (c.clone(), step.clone(), slot.clone(), cycle_done.clone());
            thread::spawn(move || {
                let reg = c.register().unwrap();
                step.wait(); // everyone registered
                let h = reg.allocate().unwrap();
                assert_eq!(c.slot(h).unwrap().refcount, 1);
                slot.store(h.into_raw(), SeqCst);
                step.wait(); // A allocated
                step.wait(); // B incremented
                assert_eq!(reg.decrement(h), Ok(Released::Shared));
                assert_eq!(c.slot(h).unwrap().refcount, 1);
                step.wait(); // A decremented
                step.wait(); // B decremented
                while cycle_done.load(SeqCst) == 0 {
                    reg.checkpoint();
                    thread::yield_now();
                }
            })
        };
        let b = {
            let (c, step, slot, cycle_done) =
                (c.clone(), step.clone(), slot.clone(), cycle_done.clone());
            thread::spawn(move || {
                let reg = c.register().unwrap();
                step.wait();
                step.wait();
                let h = Handle::from_raw(slot.load(SeqCst));
                reg.increment(h).unwrap();
                assert_eq!(c.slot(h).unwrap().refcount, 2);
                step.wait();
                step.wait();
                assert_eq!(reg.decrement(h), Ok(Released::Last));
                step.wait();
                while cycle_done.load(SeqCst) == 0 {
                    reg.checkpoint();
                    thread::yield_now();
                }
            })
        };

        let reg = c.register().unwrap();
        for _ in 0..5 {
            step.wait();
        }
        let h = Handle::from_raw(slot.load(SeqCst));
        assert_eq!(
            c.slot(h).unwrap(),
            SlotSnapshot {
                refcount: 0,
                allocated: true,
                queued: true
            }
        );
        assert_eq!(c.pending(), 1);

        let report = match reg.request_collection_cycle() {
            CycleOutcome::Accepted(report) => report,
            CycleOutcome::AlreadyInProgress => panic!("nobody else requests cycles here"),
        };
        cycle_done.store(1, SeqCst);
        a.join().unwrap();
        b.join().unwrap();

        assert_eq!(report.reclaimed, 1);
        assert_eq!(
            c.slot(h).unwrap(),
            SlotSnapshot {
                refcount: 0,
                allocated: false,
                queued: false
            }
        );
        assert_eq!(c.pending(), 0);
        assert_eq!(c.phase(), Phase::Idle);
        assert_eq!(c.live(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc,
        Inc(u8),
        Dec(u8),
        Cycle,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Op {
            match u8::arbitrary(g) % 8 {
                0 | 1 => Op::Alloc,
                2 | 3 => Op::Inc(u8::arbitrary(g)),
                4 | 5 | 6 => Op::Dec(u8::arbitrary(g)),
                _ => Op::Cycle,
            }
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    struct Model {
        refcount: usize,
        allocated: bool,
        queued: bool,
    }

    /// Single-threaded runs against a straightforward model of a slot.
    #[quickcheck_macros::quickcheck]
    fn agrees_with_model(ops: Vec<Op>) -> bool {
        const CAP: usize = 6;
        let c = Collector::new(PoolConfig::default().with_capacity(CAP)).unwrap();
        let reg = c.register().unwrap();
        let mut model = [Model::default(); CAP];
        for op in ops {
            match op {
                Op::Alloc => match reg.allocate() {
                    Ok(h) => {
                        let m = &mut model[h.index()];
                        if m.allocated {
                            return false;
                        }
                        *m = Model {
                            refcount: 1,
                            allocated: true,
                            queued: false,
                        };
                    }
                    Err(_) => {
                        if model.iter().any(|m| !m.allocated) {
                            return false;
                        }
                    }
                },
                Op::Inc(ix) => {
                    let h = Handle::from_raw(ix as u32 % CAP as u32);
                    let m = &mut model[h.index()];
                    match reg.increment(h) {
                        Ok(()) if m.refcount > 0 => m.refcount += 1,
                        Err(_) if m.refcount == 0 => {}
                        _ => return false,
                    }
                }
                Op::Dec(ix) => {
                    let h = Handle::from_raw(ix as u32 % CAP as u32);
                    let m = &mut model[h.index()];
                    match reg.decrement(h) {
                        Ok(Released::Last) if m.refcount == 1 => {
                            m.refcount = 0;
                            m.queued = true;
                        }
                        Ok(Released::Shared) if m.refcount > 1 => m.refcount -= 1,
                        Err(_) if m.refcount == 0 => {}
                        _ => return false,
                    }
                }
                Op::Cycle => {
                    let expected = model.iter().filter(|m| m.queued).count();
                    match reg.request_collection_cycle() {
                        CycleOutcome::Accepted(r) if r.reclaimed == expected => {}
                        _ => return false,
                    }
                    for m in model.iter_mut().filter(|m| m.queued) {
                        *m = Model::default();
                    }
                }
            }
            reg.checkpoint();
            for (ix, m) in model.iter().enumerate() {
                let snap = c.slot(Handle::from_raw(ix as u32)).unwrap();
                if (snap.refcount, snap.allocated, snap.queued)
                    != (m.refcount, m.allocated, m.queued)
                {
                    return false;
                }
            }
        }
        c.pending() == model.iter().filter(|m| m.queued).count()
    }
}
