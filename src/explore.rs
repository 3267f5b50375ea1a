//! The exploration driver: worker threads that pick protocol operations at
//! random and hammer one shared pool with them.
//!
//! Each worker keeps a handful of variables, each holding one counted
//! reference, and moves references between them and across threads (through
//! the exchange board). Every step is followed by a checkpoint. At the end
//! everything is released and the pool has to come back completely empty.

use std::sync::atomic::{
    AtomicUsize,
    Ordering::{AcqRel, Acquire},
};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{bail, eyre, WrapErr};
use fnv::FnvHashMap as HashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reclaimer::{Collector, CycleOutcome, CycleStats, Handle, PoolConfig, Registration, Released};
use tracing::{debug, info, info_span, trace};

use crate::config::ExploreConfig;

const EMPTY: usize = usize::MAX;

/// Cells through which workers hand counted references to each other. A
/// reference sitting on the board is owned by the board.
struct Board {
    cells: Vec<AtomicUsize>,
}

impl Board {
    fn new(len: usize) -> Board {
        Board {
            cells: (0..len).map(|_| AtomicUsize::new(EMPTY)).collect(),
        }
    }

    /// Put `h` into `cell`, getting back whatever was there.
    fn swap(&self, cell: usize, h: Option<Handle>) -> Option<Handle> {
        let raw = h.map_or(EMPTY, |h| h.index());
        match self.cells[cell].swap(raw, AcqRel) {
            EMPTY => None,
            prev => Some(Handle::from_raw(prev as u32)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    New(usize),
    Copy(usize, usize),
    Drop(usize),
    Publish(usize, usize),
    Adopt(usize, usize),
    /// Take a reference to whatever lives in a slot we may know nothing about.
    Grab(usize, u32),
    Collect,
}

/// What happened over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExploreSummary {
    pub steps: usize,
    pub allocated: usize,
    pub exhausted: usize,
    pub copies: usize,
    pub drops: usize,
    /// decrements that took a count to zero
    pub zeroed: usize,
    pub published: usize,
    pub adopted: usize,
    /// grabs of a random slot that found a live object
    pub grabbed: usize,
    /// grabs that lost the race against a zero crossing (or found the slot free)
    pub stale: usize,
    /// cycles this run's workers initiated
    pub cycles_initiated: usize,
    /// requests that found a cycle already running
    pub cycles_joined: usize,
    pub stats: CycleStats,
}

impl ExploreSummary {
    fn absorb(&mut self, other: &ExploreSummary) {
        self.steps += other.steps;
        self.allocated += other.allocated;
        self.exhausted += other.exhausted;
        self.copies += other.copies;
        self.drops += other.drops;
        self.zeroed += other.zeroed;
        self.published += other.published;
        self.adopted += other.adopted;
        self.grabbed += other.grabbed;
        self.stale += other.stale;
        self.cycles_initiated += other.cycles_initiated;
        self.cycles_joined += other.cycles_joined;
    }
}

impl std::fmt::Display for ExploreSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "steps:            {}", self.steps)?;
        writeln!(
            f,
            "allocations:      {} ({} exhausted)",
            self.allocated, self.exhausted
        )?;
        writeln!(f, "copies / drops:   {} / {}", self.copies, self.drops)?;
        writeln!(f, "zero crossings:   {}", self.zeroed)?;
        writeln!(
            f,
            "published/adopted: {} / {}",
            self.published, self.adopted
        )?;
        writeln!(
            f,
            "grabbed / stale:  {} / {}",
            self.grabbed, self.stale
        )?;
        writeln!(
            f,
            "cycles:           {} initiated, {} already running",
            self.cycles_initiated, self.cycles_joined
        )?;
        writeln!(
            f,
            "reclaimed:        {} over {} cycles (longest stop {:?}, longest drain {:?})",
            self.stats.reclaimed,
            self.stats.cycles,
            self.stats.longest_stop_wait,
            self.stats.longest_drain
        )
    }
}

struct Worker<'a> {
    reg: Registration,
    board: &'a Board,
    vars: HashMap<usize, Handle>,
    rng: StdRng,
    config: &'a ExploreConfig,
    tally: ExploreSummary,
}

impl<'a> Worker<'a> {
    fn pick(&mut self) -> Action {
        let vars = self.config.vars;
        let cells = self.board.cells.len();
        let total = 100 + self.config.cycle_weight;
        let var = self.rng.gen_range(0..vars);
        match self.rng.gen_range(0..total) {
            0..=24 => Action::New(var),
            25..=44 => Action::Copy(var, self.rng.gen_range(0..vars)),
            45..=69 => Action::Drop(var),
            70..=79 => Action::Publish(var, self.rng.gen_range(0..cells)),
            80..=89 => Action::Adopt(var, self.rng.gen_range(0..cells)),
            90..=99 => {
                let slot = self.rng.gen_range(0..self.config.capacity);
                Action::Grab(var, slot as u32)
            }
            _ => Action::Collect,
        }
    }

    /// Give up the reference `var` holds, if any.
    fn release(&mut self, var: usize) -> eyre::Result<()> {
        if let Some(h) = self.vars.remove(&var) {
            self.give_up(h)?;
        }
        Ok(())
    }

    fn give_up(&mut self, h: Handle) -> eyre::Result<()> {
        // we held a counted reference, so this can't be stale
        let released = self
            .reg
            .decrement(h)
            .wrap_err("releasing a held reference")?;
        self.tally.drops += 1;
        if let Released::Last = released {
            self.tally.zeroed += 1;
        }
        Ok(())
    }

    fn collect(&mut self) {
        match self.reg.request_collection_cycle() {
            CycleOutcome::Accepted(report) => {
                trace!(epoch = report.epoch, reclaimed = report.reclaimed, "ran a cycle");
                self.tally.cycles_initiated += 1;
            }
            CycleOutcome::AlreadyInProgress => self.tally.cycles_joined += 1,
        }
    }

    fn step(&mut self, action: Action) -> eyre::Result<()> {
        trace!(?action);
        match action {
            Action::New(var) => {
                self.release(var)?;
                match self.reg.allocate() {
                    Ok(h) => {
                        self.tally.allocated += 1;
                        self.vars.insert(var, h);
                    }
                    Err(e) => {
                        trace!(%e, "backing off");
                        self.tally.exhausted += 1;
                        // whatever is queued won't come back without a cycle
                        self.collect();
                    }
                }
            }
            Action::Copy(src, dst) => {
                if let Some(&h) = self.vars.get(&src) {
                    self.reg
                        .increment(h)
                        .wrap_err("copying a held reference")?;
                    self.release(dst)?;
                    self.vars.insert(dst, h);
                    self.tally.copies += 1;
                }
            }
            Action::Drop(var) => self.release(var)?,
            Action::Publish(var, cell) => {
                if let Some(&h) = self.vars.get(&var) {
                    self.reg
                        .increment(h)
                        .wrap_err("publishing a held reference")?;
                    self.tally.published += 1;
                    if let Some(displaced) = self.board.swap(cell, Some(h)) {
                        self.give_up(displaced)?;
                    }
                }
            }
            Action::Adopt(var, cell) => {
                if let Some(h) = self.board.swap(cell, None) {
                    self.release(var)?;
                    self.vars.insert(var, h);
                    self.tally.adopted += 1;
                }
            }
            Action::Grab(var, slot) => {
                let h = Handle::from_raw(slot);
                match self.reg.increment(h) {
                    Ok(()) => {
                        self.release(var)?;
                        self.vars.insert(var, h);
                        self.tally.grabbed += 1;
                    }
                    Err(e) => {
                        // the slot's count already hit zero; forget about it
                        trace!(%e, "grab lost");
                        self.tally.stale += 1;
                    }
                }
            }
            Action::Collect => self.collect(),
        }
        self.tally.steps += 1;
        Ok(())
    }

    fn run(mut self, remaining: &AtomicUsize) -> eyre::Result<ExploreSummary> {
        for _ in 0..self.config.steps {
            let action = self.pick();
            self.step(action)?;
            self.reg.checkpoint();
        }
        let vars: Vec<usize> = self.vars.keys().copied().collect();
        for var in vars {
            self.release(var)?;
        }
        // the last one out empties the board; nobody can publish any more
        if remaining.fetch_sub(1, AcqRel) == 1 {
            for cell in 0..self.board.cells.len() {
                if let Some(h) = self.board.swap(cell, None) {
                    self.give_up(h)?;
                }
            }
        }
        self.reg.checkpoint();
        Ok(self.tally)
    }
}

type WorkerHandle = JoinHandle<eyre::Result<ExploreSummary>>;

/// Spawn `threads` workers, holding each at its gate until all of them exist.
///
/// The collector expects every one of them to register. If a spawn fails the
/// gates are dropped instead of opened, so the workers already running leave
/// without registering and nobody waits on the ones that never started.
fn launch<F>(threads: usize, mut spawn: F) -> eyre::Result<Vec<WorkerHandle>>
where
    F: FnMut(usize, Receiver<()>) -> std::io::Result<WorkerHandle>,
{
    let mut workers = Vec::with_capacity(threads);
    let mut gates = Vec::with_capacity(threads);
    for i in 0..threads {
        let (open, gate) = channel();
        match spawn(i, gate) {
            Ok(w) => {
                workers.push(w);
                gates.push(open);
            }
            Err(e) => {
                drop(gates);
                for w in workers {
                    let _ = w.join();
                }
                return Err(e).wrap_err_with(|| format!("spawning worker {}", i));
            }
        }
    }
    for open in gates {
        // a worker that already died shows up when it's joined
        let _ = open.send(());
    }
    Ok(workers)
}

/// Run one exploration. Fails if any worker saw the protocol misbehave or the
/// pool doesn't come back empty.
pub fn explore(config: &ExploreConfig) -> eyre::Result<ExploreSummary> {
    config.validate()?;
    info!(?config, "starting exploration");
    let collector = Collector::new(
        PoolConfig::default()
            .with_capacity(config.capacity)
            .with_threads(config.threads),
    )?;
    let board = Arc::new(Board::new(config.threads));
    let remaining = Arc::new(AtomicUsize::new(config.threads));

    let workers = launch(config.threads, |i, gate| {
        let collector = collector.clone();
        let board = board.clone();
        let remaining = remaining.clone();
        let config = config.clone();
        std::thread::Builder::new()
            .name(format!("refpool-worker-{}", i))
            .spawn(move || -> eyre::Result<ExploreSummary> {
                if gate.recv().is_err() {
                    // launch gave up on the run; we never registered
                    return Ok(ExploreSummary::default());
                }
                let reg = collector.register()?;
                let span = info_span!("worker", id = reg.id());
                let _enter = span.enter();
                let worker = Worker {
                    reg,
                    board: &board,
                    vars: HashMap::default(),
                    rng: StdRng::seed_from_u64(
                        config.seed ^ (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
                    ),
                    config: &config,
                    tally: ExploreSummary::default(),
                };
                let tally = worker.run(&remaining)?;
                debug!(steps = tally.steps, "worker done");
                Ok(tally)
            })
    })?;

    let mut summary = ExploreSummary::default();
    for w in workers {
        let tally = w
            .join()
            .map_err(|_| eyre!("a worker panicked; see its output above"))??;
        summary.absorb(&tally);
    }

    // every worker has departed by now
    let last = collector.drain_detached()?;
    debug!(reclaimed = last.reclaimed, "final drain");
    if collector.live() != 0 || collector.pending() != 0 {
        bail!(
            "pool not empty after exploration: {} live, {} pending",
            collector.live(),
            collector.pending()
        );
    }
    if board.cells.iter().any(|c| c.load(Acquire) != EMPTY) {
        bail!("exchange board still holds references");
    }
    summary.stats = collector.stats();
    info!(
        steps = summary.steps,
        cycles = summary.stats.cycles,
        reclaimed = summary.stats.reclaimed,
        "exploration finished"
    );
    Ok(summary)
}
