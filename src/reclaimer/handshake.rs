use core::sync::atomic::{
    AtomicBool, AtomicU64, AtomicUsize,
    Ordering::{Relaxed, SeqCst},
};

use crate::backoff::Backoff;

/// Where the collection cycle is at, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// An initiator is waiting for every other thread to acknowledge.
    Requested,
    /// Everybody acknowledged; the initiator is draining the queue.
    Stopped,
}

/// The stop-the-world state shared by every thread.
///
/// The handshake acts a bit like a `std::sync::Barrier` that only the
/// initiator waits on: every other thread counts `countdown` down once per
/// cycle at its next checkpoint and then parks until the cycle is over.
///
/// Every access is `SeqCst`. The resume path is a chain of flag flips that the
/// parked threads read back in the opposite order, and that only works with a
/// single total order over all of them.
#[derive(Debug)]
pub(crate) struct Handshake {
    requested: AtomicBool,
    world_stopped: AtomicBool,
    /// acknowledgements still missing for the current cycle
    countdown: AtomicUsize,
    /// bumped once per completed cycle
    epoch: AtomicU64,
    /// threads that haven't departed yet, including ones yet to register
    members: AtomicUsize,
}

/// `acked` value of a thread that never acknowledged anything
pub(crate) const NEVER: u64 = u64::MAX;

impl Handshake {
    pub(crate) fn new(threads: usize) -> Handshake {
        Handshake {
            requested: AtomicBool::new(false),
            world_stopped: AtomicBool::new(false),
            countdown: AtomicUsize::new(threads - 1),
            epoch: AtomicU64::new(0),
            members: AtomicUsize::new(threads),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        if self.world_stopped.load(SeqCst) {
            Phase::Stopped
        } else if self.requested.load(SeqCst) {
            Phase::Requested
        } else {
            Phase::Idle
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(SeqCst)
    }

    pub(crate) fn members(&self) -> usize {
        self.members.load(SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn countdown(&self) -> usize {
        self.countdown.load(SeqCst)
    }

    /// Try to become the initiator of a new cycle. `false` means some other
    /// cycle is already in flight.
    pub(crate) fn try_request(&self) -> bool {
        self.requested
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok()
    }

    /// Take one off the countdown, unless it is already at zero.
    fn count_down(&self, backoff: Backoff) -> bool {
        let mut spinner = backoff.spinner();
        loop {
            let seen = self.countdown.load(SeqCst);
            if seen == 0 {
                return false;
            }
            match self
                .countdown
                .compare_exchange_weak(seen, seen - 1, SeqCst, SeqCst)
            {
                Ok(_) => return true,
                Err(_) => spinner.snooze(),
            }
        }
    }

    /// The safe point. Returns once this thread may touch the pool again.
    ///
    /// `acked` is the epoch this thread last acknowledged, owned by the caller.
    pub(crate) fn check(&self, acked: &AtomicU64, backoff: Backoff) {
        if self.world_stopped.load(SeqCst) {
            backoff
                .spinner()
                .until(|| !self.world_stopped.load(SeqCst));
            return;
        }
        // CORRECTNESS: epoch before requested. the initiator clears `requested`
        // before it bumps the epoch, so a `requested` read after this epoch
        // can only belong to the cycle numbered `epoch`, which can't finish
        // without us.
        let epoch = self.epoch.load(SeqCst);
        if !self.requested.load(SeqCst) || acked.load(Relaxed) == epoch {
            return;
        }
        if !self.count_down(backoff) {
            desync!("more threads acknowledged cycle {} than are members", epoch);
        }
        acked.store(epoch, Relaxed);
        tracing::trace!(epoch, "acknowledged stop request; parking");
        self.park(epoch, backoff);
    }

    /// Wait until the cycle numbered `epoch` is over and the world is running.
    fn park(&self, epoch: u64, backoff: Backoff) {
        backoff.spinner().until(|| {
            self.epoch.load(SeqCst) != epoch && !self.world_stopped.load(SeqCst)
        });
    }

    /// Initiator: block until every other member has acknowledged.
    pub(crate) fn wait_for_acks(&self, backoff: Backoff) {
        backoff
            .spinner()
            .until(|| self.countdown.load(SeqCst) == 0);
    }

    /// Initiator: every other member is parked.
    pub(crate) fn stop_world(&self) {
        if self.countdown.load(SeqCst) != 0 {
            desync!("stopping the world with acknowledgements outstanding");
        }
        self.world_stopped.store(true, SeqCst);
    }

    /// Initiator: end the cycle. Order matters: `world_stopped` is cleared
    /// last, so a parked thread can't leave before the initiator is done.
    pub(crate) fn resume(&self) {
        let members = self.members.load(SeqCst);
        self.countdown.store(members.saturating_sub(1), SeqCst);
        self.requested.store(false, SeqCst);
        self.epoch.fetch_add(1, SeqCst);
        self.world_stopped.store(false, SeqCst);
    }

    /// Initiator without a world to stop: nobody is left to acknowledge.
    pub(crate) fn cancel_request(&self) {
        self.requested.store(false, SeqCst);
    }

    /// A thread leaves for good. Its single countdown decrement doubles as its
    /// acknowledgement of a cycle in flight, and `members` keeps it out of the
    /// countdown of every later one.
    pub(crate) fn depart(&self, backoff: Backoff) {
        self.members.fetch_sub(1, SeqCst);
        // the last member out finds the countdown at zero already
        self.count_down(backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lone_thread_never_waits() {
        let hs = Handshake::new(1);
        assert!(hs.try_request());
        assert!(!hs.try_request());
        assert_eq!(hs.phase(), Phase::Requested);
        hs.wait_for_acks(Backoff::Spin);
        hs.stop_world();
        assert_eq!(hs.phase(), Phase::Stopped);
        hs.resume();
        assert_eq!(hs.phase(), Phase::Idle);
        assert_eq!(hs.epoch(), 1);
        assert_eq!(hs.countdown(), 0);
    }

    #[test]
    fn check_without_request_is_free() {
        let hs = Handshake::new(4);
        let acked = AtomicU64::new(NEVER);
        for _ in 0..10_000 {
            hs.check(&acked, Backoff::Spin);
        }
        assert_eq!(acked.load(Relaxed), NEVER);
        assert_eq!(hs.countdown(), 3);
    }

    #[test]
    fn peers_park_until_resume() {
        // 8 peers plus us as the initiator
        let hs = Arc::new(Handshake::new(9));
        let done = Arc::new(AtomicBool::new(false));
        assert!(hs.try_request());
        let peers: Vec<_> = (0..8)
            .map(|_| {
                let hs = hs.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let acked = AtomicU64::new(NEVER);
                    hs.check(&acked, Backoff::default());
                    // we only get here after the cycle completed
                    assert!(done.load(SeqCst));
                    assert_eq!(acked.load(Relaxed), 0);
                })
            })
            .collect();
        hs.wait_for_acks(Backoff::default());
        hs.stop_world();
        done.store(true, SeqCst);
        hs.resume();
        for p in peers {
            p.join().unwrap();
        }
        assert_eq!(hs.countdown(), 8);
    }

    #[test]
    fn departure_counts_as_acknowledgement() {
        let hs = Handshake::new(3);
        assert!(hs.try_request());
        hs.depart(Backoff::Spin);
        hs.depart(Backoff::Spin);
        hs.wait_for_acks(Backoff::Spin);
        hs.stop_world();
        hs.resume();
        assert_eq!(hs.members(), 1);
        assert_eq!(hs.countdown(), 0);
    }
}
