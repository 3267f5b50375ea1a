//! The pending-free queue.
//!
//! An append-only singly linked list living in a fixed arena of nodes. Links
//! are arena indices, `NIL` is the null link, and node 0 is the list root, so
//! "the head pointer" is just `nodes[0].next`.
//!
//! Appending walks from the root to the first node whose `next` is `NIL` and
//! CASes the new node in there. If somebody else got there first, the walk
//! restarts from the root. Under concurrent appends that is append order, but
//! not necessarily FIFO.
//!
//! Each object is queued at most once between reclamations, so an arena with
//! one node per pool slot can never run dry. If it does, the protocol is broken.

use core::sync::atomic::{
    AtomicBool, AtomicU32, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::backoff::Backoff;
use crate::pool::Handle;

const NIL: u32 = u32::MAX;
const ROOT: usize = 0;

#[derive(Debug)]
struct Node {
    occupied: AtomicBool,
    object: AtomicU32,
    next: AtomicU32,
}

impl Node {
    fn vacant() -> Node {
        Node {
            occupied: AtomicBool::new(false),
            object: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingQueue {
    nodes: Box<[Node]>,
    /// where the next node search starts; only a hint
    hint: AtomicUsize,
    backoff: Backoff,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize, backoff: Backoff) -> PendingQueue {
        let nodes: Box<[Node]> = (0..=capacity).map(|_| Node::vacant()).collect();
        nodes[ROOT].occupied.store(true, Relaxed);
        PendingQueue {
            nodes,
            hint: AtomicUsize::new(1),
            backoff,
        }
    }

    /// Take a vacant node out of the arena.
    fn claim_node(&self) -> usize {
        let slots = self.nodes.len() - 1;
        let start = self.hint.fetch_add(1, Relaxed);
        for k in 0..slots {
            let ix = 1 + (start + k) % slots;
            if self.nodes[ix]
                .occupied
                .compare_exchange(false, true, AcqRel, Acquire)
                .is_ok()
            {
                return ix;
            }
        }
        desync!("pending-free arena exhausted: some object was queued twice")
    }

    /// Append `object`. Lock-free; only contends with other appenders.
    // HOTPATH
    pub(crate) fn push(&self, object: Handle) {
        let node = self.claim_node();
        self.nodes[node].object.store(object.0, Relaxed);
        self.nodes[node].next.store(NIL, Relaxed);

        let mut spinner = self.backoff.spinner();
        loop {
            let mut last = ROOT;
            loop {
                let next = self.nodes[last].next.load(Acquire);
                if next == NIL {
                    break;
                }
                last = next as usize;
            }
            // the release here publishes the node's object
            match self.nodes[last]
                .next
                .compare_exchange(NIL, node as u32, AcqRel, Acquire)
            {
                Ok(_) => {
                    tracing::trace!(slot = object.0, node, "queued for reclamation");
                    return;
                }
                // somebody appended behind `last` meanwhile. start over.
                Err(_) => spinner.snooze(),
            }
        }
    }

    /// Unlink everything, handing each queued object to `reclaim` in list
    /// order, and return the nodes to the arena.
    ///
    /// CORRECTNESS: callers must have exclusive access to the queue (the world
    /// is stopped, or nobody is registered any more). Nodes are recycled here
    /// and a concurrent appender could be walking through them.
    pub(crate) fn drain(&self, mut reclaim: impl FnMut(Handle)) -> usize {
        let mut cursor = self.nodes[ROOT].next.swap(NIL, AcqRel);
        let mut count = 0;
        while cursor != NIL {
            let node = &self.nodes[cursor as usize];
            let next = node.next.load(Acquire);
            reclaim(Handle(node.object.load(Acquire)));
            node.object.store(NIL, Relaxed);
            node.next.store(NIL, Relaxed);
            node.occupied.store(false, Release);
            count += 1;
            cursor = next;
        }
        count
    }

    /// Number of queued objects. Racy against concurrent appends.
    pub(crate) fn len(&self) -> usize {
        let mut cursor = self.nodes[ROOT].next.load(Acquire);
        let mut count = 0;
        while cursor != NIL {
            count += 1;
            cursor = self.nodes[cursor as usize].next.load(Acquire);
        }
        count
    }
}
