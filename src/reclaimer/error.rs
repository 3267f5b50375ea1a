use thiserror::Error;

/// The pool had no free slot after the configured number of sweeps. Transient:
/// back off, let a collection cycle run, try again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("object pool exhausted after {sweeps} sweeps over {capacity} slots")]
pub struct PoolExhausted {
    pub capacity: usize,
    pub sweeps: usize,
}

/// The handle's object already reached a refcount of zero. The handle no
/// longer denotes a live object and must be dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stale handle to slot {slot}: its refcount already reached zero")]
pub struct StaleHandle {
    pub slot: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the pool needs at least one slot")]
    EmptyPool,
    #[error("a pool of {} slots can't be addressed by 32-bit handles (the last index is reserved)", .0)]
    PoolTooLarge(usize),
    #[error("at least one thread has to use the pool")]
    NoThreads,
    #[error("allocation needs to sweep the pool at least once")]
    NoSweeps,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("all {} thread slots are taken", .0)]
    RegistryFull(usize),
    #[error("this thread is already registered with the collector")]
    AlreadyRegistered,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("{} threads are still registered; run a collection cycle instead", .0)]
    ThreadsOnline(usize),
    #[error("a collection cycle is already in progress")]
    CycleAlreadyInProgress,
}
