use alloc::sync::Arc;
use core::marker::PhantomData;

use crate::collector::{Collector, CycleOutcome, Participant};
use crate::error::{PoolExhausted, StaleHandle};
use crate::pool::{Handle, Released};

/// Thread-local membership in a [`Collector`].
///
/// Every protocol operation goes through a registration. Operations never
/// checkpoint on their own: the owning thread decides where its safe points
/// are, and it has to reach one regularly or every collection cycle stalls
/// waiting for it. Between two checkpoints a thread may do any number of
/// operations.
///
/// Dropping the registration departs the thread for good. A departed thread
/// no longer holds up cycles.
pub struct Registration {
    collector: Arc<Collector>,
    me: Arc<Participant>,
    // bound to the thread that registered: departing clears that thread's
    // entry in the collector's thread-local table
    _not_send: PhantomData<*const ()>,
}

impl Registration {
    pub(crate) fn new(collector: Arc<Collector>, me: Arc<Participant>) -> Registration {
        Registration {
            collector,
            me,
            _not_send: PhantomData,
        }
    }

    fn me(&self) -> &Participant {
        &self.me
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Registration order of this thread, starting at 0.
    pub fn id(&self) -> usize {
        self.me().id
    }

    /// Claim a free slot with a refcount of one.
    ///
    /// `PoolExhausted` is transient: checkpoint (so a cycle can run), maybe
    /// request one, and try again.
    pub fn allocate(&self) -> Result<Handle, PoolExhausted> {
        self.collector.allocate(self.me())
    }

    /// Add a reference to a live object. Never brings a zero count back.
    pub fn increment(&self, h: Handle) -> Result<(), StaleHandle> {
        self.collector.increment(h)
    }

    /// Drop a reference. The call that takes the count to zero puts the object
    /// on the pending-free queue; it is reclaimed by the next cycle, not here.
    pub fn decrement(&self, h: Handle) -> Result<Released, StaleHandle> {
        self.collector.decrement(h)
    }

    /// Check in to see if a collection cycle needs our attention. If one is
    /// pending, acknowledge it and park until it's done.
    pub fn checkpoint(&self) {
        self.collector.checkpoint(self.me())
    }

    /// Run a collection cycle with this thread as the initiator.
    ///
    /// Blocks until every other member has parked at a checkpoint (or
    /// departed), reclaims everything on the pending-free queue, and lets
    /// everybody go again. If another cycle is already in flight this is a
    /// no-op; checkpoint next so that cycle can finish.
    pub fn request_collection_cycle(&self) -> CycleOutcome {
        self.collector.request_cycle()
    }
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str("Registration")
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.collector.depart(self.me());
    }
}
