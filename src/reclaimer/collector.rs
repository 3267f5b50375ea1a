//! The shared coordination struct and the initiator's side of a cycle.

use alloc::sync::Arc;
use core::sync::atomic::{
    AtomicBool, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::time::Duration;

use parking_lot::Mutex;
use thread_local::ThreadLocal;
use tracing::{debug, info, instrument};

use crate::api::Registration;
use crate::config::PoolConfig;
use crate::error::{ConfigError, DrainError, PoolExhausted, RegisterError, StaleHandle};
use crate::handshake::{Handshake, Phase, NEVER};
use crate::pool::{Handle, Pool, Released, SlotSnapshot};
use crate::queue::PendingQueue;

/// What one registration knows about itself. Owned by the `Registration`, so
/// it dies with it even if the OS hands the thread's id to somebody else.
#[derive(Debug)]
pub(crate) struct Participant {
    /// order of registration, 0-based
    pub(crate) id: usize,
    /// epoch of the last cycle this thread acknowledged
    pub(crate) acked: AtomicU64,
    /// where the next allocation scan starts
    pub(crate) cursor: AtomicUsize,
}

/// The outcome of one collection cycle, as seen by its initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub epoch: u64,
    pub reclaimed: usize,
    /// how long the initiator waited for everybody to park
    pub stop_wait: Duration,
    /// how long the world was stopped for
    pub drain: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// We were the initiator and the cycle ran to completion.
    Accepted(CycleReport),
    /// Somebody else's cycle is in flight. Not an error: checkpoint and carry on.
    AlreadyInProgress,
}

/// Running totals over every completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub reclaimed: u64,
    pub longest_stop_wait: Duration,
    pub longest_drain: Duration,
}

impl CycleStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.reclaimed += report.reclaimed as u64;
        self.longest_stop_wait = self.longest_stop_wait.max(report.stop_wait);
        self.longest_drain = self.longest_drain.max(report.drain);
    }
}

/// A fixed pool of refcounted objects plus everything needed to reclaim them
/// safely: the pending-free queue and the stop-the-world handshake.
///
/// Create one with [`Collector::new`], hand an `Arc` of it to each of the
/// configured number of threads, and have each of them
/// [`register`](Collector::register). All protocol operations go through the
/// resulting [`Registration`].
#[derive(Debug)]
pub struct Collector {
    pub(crate) config: PoolConfig,
    pub(crate) pool: Pool,
    queue: PendingQueue,
    pub(crate) handshake: Handshake,
    /// whether the thread currently holds a live registration. `ThreadLocal`
    /// recycles the slots of exited threads, so this is cleared on departure.
    threads: ThreadLocal<AtomicBool>,
    joined: AtomicUsize,
    online: AtomicUsize,
    stats: Mutex<CycleStats>,
}

impl Collector {
    pub fn new(config: PoolConfig) -> Result<Arc<Collector>, ConfigError> {
        config.validate()?;
        info!(
            capacity = config.capacity,
            threads = config.threads,
            "creating object pool"
        );
        Ok(Arc::new(Collector {
            pool: Pool::new(config.capacity, config.alloc_sweeps, config.backoff),
            queue: PendingQueue::new(config.capacity, config.backoff),
            handshake: Handshake::new(config.threads),
            threads: ThreadLocal::new(),
            joined: AtomicUsize::new(0),
            online: AtomicUsize::new(0),
            stats: Mutex::new(CycleStats::default()),
            config,
        }))
    }

    /// Join the calling thread to this collector.
    ///
    /// At most `config.threads` registrations are ever handed out, and a
    /// thread holds at most one at a time. Cycles can't complete until every
    /// one of the configured threads has registered and reached a checkpoint
    /// (or departed).
    pub fn register(self: &Arc<Self>) -> Result<Registration, RegisterError> {
        let live = self.threads.get_or(|| AtomicBool::new(false));
        if live.load(Acquire) {
            return Err(RegisterError::AlreadyRegistered);
        }
        let threads = self.config.threads;
        let id = self
            .joined
            .fetch_update(AcqRel, Acquire, |n| if n < threads { Some(n + 1) } else { None })
            .map_err(|_| RegisterError::RegistryFull(threads))?;
        let capacity = self.config.capacity;
        let me = Arc::new(Participant {
            id,
            acked: AtomicU64::new(NEVER),
            // spread threads out over the pool so they don't all fight for slot 0
            cursor: AtomicUsize::new(id * capacity / threads),
        });
        live.store(true, Release);
        self.online.fetch_add(1, AcqRel);
        debug!(id, "thread registered");
        Ok(Registration::new(self.clone(), me))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    //#region mutator side

    pub(crate) fn allocate(&self, me: &Participant) -> Result<Handle, PoolExhausted> {
        let start = me.cursor.load(Relaxed);
        let h = self.pool.allocate(start)?;
        me.cursor.store(h.index() + 1, Relaxed);
        Ok(h)
    }

    pub(crate) fn increment(&self, h: Handle) -> Result<(), StaleHandle> {
        self.pool.increment(h)
    }

    pub(crate) fn decrement(&self, h: Handle) -> Result<Released, StaleHandle> {
        let released = self.pool.decrement(h)?;
        if let Released::Last = released {
            // we won the 1 -> 0 transition, so the enqueue is ours and only ours
            self.queue.push(h);
        }
        Ok(released)
    }

    pub(crate) fn checkpoint(&self, me: &Participant) {
        self.handshake.check(&me.acked, self.config.backoff);
    }

    /// CORRECTNESS: called exactly once per registration, on its own thread.
    pub(crate) fn depart(&self, me: &Participant) {
        self.handshake.depart(self.config.backoff);
        self.online.fetch_sub(1, AcqRel);
        if let Some(live) = self.threads.get() {
            live.store(false, Release);
        }
        debug!(id = me.id, "thread departed");
    }

    //#endregion

    //#region collector side

    pub(crate) fn request_cycle(&self) -> CycleOutcome {
        if !self.handshake.try_request() {
            return CycleOutcome::AlreadyInProgress;
        }
        CycleOutcome::Accepted(self.run_cycle())
    }

    /// The initiator's cycle body. We hold `requested`; nobody else is going
    /// to stop the world until we clear it.
    #[instrument(skip(self))]
    fn run_cycle(&self) -> CycleReport {
        let epoch = self.handshake.epoch();
        debug!(epoch, members = self.handshake.members(), "collection cycle requested");

        let ((), stop_wait) = crate::instrument("waiting for peers to park", || {
            self.handshake.wait_for_acks(self.config.backoff)
        });
        self.handshake.stop_world();
        let (reclaimed, drain) =
            crate::instrument("draining pending-free queue", || self.drain_queue());
        self.handshake.resume();

        let report = CycleReport {
            epoch,
            reclaimed,
            stop_wait,
            drain,
        };
        self.stats.lock().record(&report);
        debug!(epoch, reclaimed, ?stop_wait, ?drain, "collection cycle finished");
        report
    }

    // CORRECTNESS: world stopped, or no members left.
    fn drain_queue(&self) -> usize {
        let pool = &self.pool;
        self.queue.drain(|h| pool.reclaim(h))
    }

    /// Reclaim the pending-free queue after every thread has departed.
    ///
    /// Nobody is left to stop, so this just claims the cycle flag to keep
    /// registrations that might still be cycling (there shouldn't be any) out.
    pub fn drain_detached(&self) -> Result<CycleReport, DrainError> {
        if !self.handshake.try_request() {
            return Err(DrainError::CycleAlreadyInProgress);
        }
        let online = self.handshake.members();
        if online != 0 {
            self.handshake.cancel_request();
            return Err(DrainError::ThreadsOnline(online));
        }
        let epoch = self.handshake.epoch();
        let (reclaimed, drain) =
            crate::instrument("draining detached queue", || self.drain_queue());
        self.handshake.resume();
        let report = CycleReport {
            epoch,
            reclaimed,
            stop_wait: Duration::default(),
            drain,
        };
        self.stats.lock().record(&report);
        debug!(epoch, reclaimed, "detached drain finished");
        Ok(report)
    }

    //#endregion

    //#region inspection. racy unless the caller knows the pool is quiet.

    pub fn stats(&self) -> CycleStats {
        *self.stats.lock()
    }

    pub fn phase(&self) -> Phase {
        self.handshake.phase()
    }

    /// How many completed cycles (and detached drains) there have been.
    pub fn epoch(&self) -> u64 {
        self.handshake.epoch()
    }

    pub fn slot(&self, h: Handle) -> Option<SlotSnapshot> {
        self.pool.snapshot(h)
    }

    /// Objects waiting on the pending-free queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Allocated slots, including ones waiting to be reclaimed.
    pub fn live(&self) -> usize {
        self.pool.live()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Threads that registered and haven't departed.
    pub fn online(&self) -> usize {
        self.online.load(Acquire)
    }

    //#endregion
}
