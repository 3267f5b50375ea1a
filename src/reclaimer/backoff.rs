//! How the protocol waits.
//!
//! Every place the protocol would otherwise write `while !cond {}` goes through
//! a [`Spinner`]. Real schedulers aren't fair, so the policy decides when a
//! waiting thread should stop burning its timeslice and let somebody else (most
//! likely the thread it is waiting on) make progress.

use std::time::Duration;

use crossbeam_utils::Backoff as Exponential;

/// A backoff policy for the spin points of the protocol: CAS retry loops, the
/// checkpoint park, and the initiator waiting on its countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Busy-loop forever, with exponentially longer spins up to a cap. Only
    /// sensible when every participant has its own core.
    Spin,
    /// Busy-loop `spins` times, then snooze: keep spinning a little longer and
    /// start yielding to the scheduler once that is exhausted.
    SpinThenYield { spins: u32 },
    /// Sleep between checks.
    Sleep(Duration),
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::SpinThenYield { spins: 64 }
    }
}

impl Backoff {
    /// Start a fresh wait.
    pub fn spinner(self) -> Spinner {
        Spinner {
            policy: self,
            rounds: 0,
            inner: Exponential::new(),
        }
    }
}

/// The state of one particular wait.
#[derive(Debug)]
pub struct Spinner {
    policy: Backoff,
    rounds: u32,
    inner: Exponential,
}

impl Spinner {
    /// Wait a little.
    // HOTPATH
    #[inline]
    pub fn snooze(&mut self) {
        self.rounds = self.rounds.saturating_add(1);
        match self.policy {
            Backoff::Spin => self.inner.spin(),
            Backoff::SpinThenYield { spins } if self.rounds <= spins => self.inner.spin(),
            Backoff::SpinThenYield { .. } => self.inner.snooze(),
            Backoff::Sleep(d) => std::thread::sleep(d),
        }
    }

    /// Whether snoozing has reached the point of yielding to the scheduler.
    /// Sleeping spinners always have.
    pub fn is_yielding(&self) -> bool {
        match self.policy {
            Backoff::Sleep(_) => true,
            Backoff::Spin => false,
            Backoff::SpinThenYield { spins } => self.rounds > spins && self.inner.is_completed(),
        }
    }

    /// How many times `snooze` has been called.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Spin until `done` says so.
    pub fn until(mut self, mut done: impl FnMut() -> bool) {
        while !done() {
            self.snooze();
        }
    }
}
