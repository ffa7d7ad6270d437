//! Priority-ordered wait queues over the thread arena.
//!
//! A [`WaitQueue`] is a doubly-linked list threaded through the `link`
//! hooks of the thread control blocks, ordered ascending by effective
//! priority with FIFO order among equals. The same structure backs the
//! global ready list, the global wait channel, the irq-wait queue, and
//! every thread's mutex-waiter queue; a thread is linked into exactly one
//! of them at any time.
//!
//! The original intrusive design chained raw pointers through the control
//! blocks; here the links are arena indices, so every operation takes the
//! arena slice explicitly and no aliased pointers exist.

use crate::thread::{QueueId, Tcb, ThreadId};

/// Head and tail of one priority-ordered list.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WaitQueue {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            head: None,
            tail: None,
        }
    }

    /// Highest-priority entry (first in FIFO order among its equals).
    pub fn head(&self) -> Option<ThreadId> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Entry following `t`, in queue order.
    pub fn next<Ctx>(tcbs: &[Tcb<Ctx>], t: ThreadId) -> Option<ThreadId> {
        tcbs[t.index()].link.next
    }

    /// Insert `t` by priority, after all entries of equal priority.
    ///
    /// Records `qid` in the control block so the thread can later be
    /// removed (or re-sorted) without knowing how it got here.
    pub fn insert<Ctx>(&mut self, tcbs: &mut [Tcb<Ctx>], t: ThreadId, qid: QueueId) {
        let prio = tcbs[t.index()].prio;

        // Find the first entry with a strictly worse priority; inserting
        // before it preserves FIFO order among equals.
        let mut at = self.head;
        while let Some(cur) = at {
            if tcbs[cur.index()].prio > prio {
                break;
            }
            at = tcbs[cur.index()].link.next;
        }

        match at {
            Some(before) => {
                let prev = tcbs[before.index()].link.prev;
                tcbs[t.index()].link.prev = prev;
                tcbs[t.index()].link.next = Some(before);
                tcbs[before.index()].link.prev = Some(t);
                match prev {
                    Some(p) => tcbs[p.index()].link.next = Some(t),
                    None => self.head = Some(t),
                }
            }
            None => {
                // Append at the tail (possibly an empty queue).
                tcbs[t.index()].link.prev = self.tail;
                tcbs[t.index()].link.next = None;
                match self.tail {
                    Some(p) => tcbs[p.index()].link.next = Some(t),
                    None => self.head = Some(t),
                }
                self.tail = Some(t);
            }
        }

        tcbs[t.index()].queue = qid;
    }

    /// Unlink `t`. The caller is responsible for linking it somewhere else
    /// (a thread is never in limbo outside a queue for long).
    pub fn remove<Ctx>(&mut self, tcbs: &mut [Tcb<Ctx>], t: ThreadId) {
        let link = tcbs[t.index()].link;
        match link.prev {
            Some(p) => tcbs[p.index()].link.next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => tcbs[n.index()].link.prev = link.prev,
            None => self.tail = link.prev,
        }
        tcbs[t.index()].link = Default::default();
    }

    /// Re-sort `t` after a priority change, keeping it in this queue.
    pub fn requeue<Ctx>(&mut self, tcbs: &mut [Tcb<Ctx>], t: ThreadId) {
        let qid = tcbs[t.index()].queue;
        self.remove(tcbs, t);
        self.insert(tcbs, t, qid);
    }

    /// Walk the queue collecting up to `max` entries accepted by `pred`,
    /// without unlinking anything. `max < 0` means no limit.
    pub fn collect<Ctx, F>(&self, tcbs: &[Tcb<Ctx>], max: i32, mut pred: F) -> QueueMatches
    where
        F: FnMut(&Tcb<Ctx>) -> bool,
    {
        let mut found = QueueMatches::default();
        let mut at = self.head;
        while let Some(cur) = at {
            if max >= 0 && found.len as i32 >= max {
                break;
            }
            if pred(&tcbs[cur.index()]) {
                found.push(cur);
                if found.len as usize == found.ids.len() {
                    break;
                }
            }
            at = tcbs[cur.index()].link.next;
        }
        found
    }
}

/// Fixed-capacity result of a queue scan.
///
/// Scans are bounded by the number of threads, which is small on the
/// systems this kernel targets; the cap only bounds one unblock pass, and
/// callers that wake "all" re-scan until nothing matches.
#[derive(Debug)]
pub(crate) struct QueueMatches {
    ids: [ThreadId; Self::CAP],
    len: u8,
}

impl QueueMatches {
    const CAP: usize = 32;

    fn push(&mut self, t: ThreadId) {
        self.ids[self.len as usize] = t;
        self.len += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ids[..self.len as usize].iter().copied()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_full(&self) -> bool {
        self.len as usize == Self::CAP
    }
}

impl Default for QueueMatches {
    fn default() -> Self {
        QueueMatches {
            ids: [ThreadId(0); Self::CAP],
            len: 0,
        }
    }
}
