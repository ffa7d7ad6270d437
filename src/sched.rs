//! Scheduler state: the ready list, the current/deferred slots, and the
//! block/unblock primitives every synchronization object is built from.
//!
//! All of this runs single-core. The only lock in the design is interrupt
//! masking: every mutation happens while the caller holds the kernel state
//! lock with interrupts masked, so nothing here is atomic or re-entrant.
//! Decisions that require an actual context switch are returned to the
//! caller as a [`Switch`] record; the physical switch happens in
//! `kernel.rs` after the state lock is released.

use alloc::vec::Vec;

use crate::thread::{QueueId, Tcb, ThreadId, ThreadStatus};
use crate::timer::TickState;
use crate::waitqueue::WaitQueue;

/// Upper bound on one priority-inheritance chain walk.
///
/// Lock ordering is caller discipline; no deadlock detection is performed.
/// The walk stops after this many owner hops even if a (buggy) cyclic
/// chain would keep it going.
pub const PI_CHAIN_MAX: usize = 8;

/// Predicate selecting which waiters an unblock pass wakes.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wake {
    /// Wake regardless of token; the token is left as-is.
    Any,
    /// Wake waiters whose token equals the value.
    TokenEquals(u32),
    /// Wake waiters whose token intersects the mask; the token is replaced
    /// by the intersection.
    TokenMask(u32),
}

impl Wake {
    /// The token to hand back if `token` matches, or None.
    fn matched(self, token: u32) -> Option<u32> {
        match self {
            Wake::Any => Some(token),
            Wake::TokenEquals(v) => (token == v).then_some(v),
            Wake::TokenMask(m) => (token & m != 0).then_some(token & m),
        }
    }
}

/// A decided context switch: save into `prev`, resume `next`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Switch {
    pub prev: ThreadId,
    pub next: ThreadId,
}

/// Process-wide scheduler state, alive from init for the life of the
/// process. `Ctx` is the port's saved-context type.
pub(crate) struct KernelState<Ctx> {
    /// Thread control blocks, indexed by `ThreadId`. Push-only.
    pub tcbs: Vec<Tcb<Ctx>>,
    /// Priority-ordered list of every non-blocked thread (including the
    /// current one, paused ones, and Finished ones awaiting join).
    pub ready: WaitQueue,
    /// The thread whose context is executing.
    pub current: ThreadId,
    /// Switch decided in interrupt context, performed at interrupt return.
    pub deferred: Option<ThreadId>,
    /// Global wait channel shared by condvars, mailboxes, joins and sleeps;
    /// the token says why each thread is here.
    pub wait: WaitQueue,
    /// Threads blocked until specific interrupt bits fire.
    pub irq_wait: WaitQueue,
    /// Interrupt bits that fired with no waiter to consume them.
    pub irq_flags: u32,
    /// Timer-task list and tick high word.
    pub ticks: TickState<Ctx>,
}

impl<Ctx> KernelState<Ctx> {
    pub const fn new() -> Self {
        KernelState {
            tcbs: Vec::new(),
            ready: WaitQueue::new(),
            current: ThreadId(0),
            deferred: None,
            wait: WaitQueue::new(),
            irq_wait: WaitQueue::new(),
            irq_flags: 0,
            ticks: TickState::new(),
        }
    }

    pub fn tcb(&self, t: ThreadId) -> &Tcb<Ctx> {
        &self.tcbs[t.index()]
    }

    pub fn tcb_mut(&mut self, t: ThreadId) -> &mut Tcb<Ctx> {
        &mut self.tcbs[t.index()]
    }

    /// Detach one of the queues for mutation alongside the arena.
    ///
    /// `WaitQueue` is two indices, so this is a copy-out/copy-back, not a
    /// move of list nodes. The caller must put it back before touching the
    /// same queue through any other path.
    pub fn take_queue(&mut self, qid: QueueId) -> WaitQueue {
        match qid {
            QueueId::Ready => core::mem::take(&mut self.ready),
            QueueId::Wait => core::mem::take(&mut self.wait),
            QueueId::IrqWait => core::mem::take(&mut self.irq_wait),
            QueueId::Waiters(t) => core::mem::take(&mut self.tcbs[t.index()].waiters),
        }
    }

    pub fn put_queue(&mut self, qid: QueueId, q: WaitQueue) {
        match qid {
            QueueId::Ready => self.ready = q,
            QueueId::Wait => self.wait = q,
            QueueId::IrqWait => self.irq_wait = q,
            QueueId::Waiters(t) => self.tcbs[t.index()].waiters = q,
        }
    }

    /// Highest-priority runnable thread. The idle thread is always
    /// runnable, so this cannot come up empty on an initialized kernel.
    pub fn first_runnable(&self) -> ThreadId {
        let mut at = self.ready.head();
        while let Some(cur) = at {
            if self.tcb(cur).runnable() {
                return cur;
            }
            at = WaitQueue::next(&self.tcbs, cur);
        }
        panic!("ready list has no runnable thread");
    }

    /// Move the current thread from the ready list onto `qid` and pick the
    /// next thread to run. The universal "go to sleep" primitive; the wake
    /// token is read back from the control block after the switch.
    pub fn block_current(&mut self, qid: QueueId, token: u32, status: ThreadStatus) -> Switch {
        let cur = self.current;
        self.ready.remove(&mut self.tcbs, cur);
        {
            let tcb = self.tcb_mut(cur);
            tcb.status = status;
            tcb.token = token;
        }
        let mut q = self.take_queue(qid);
        q.insert(&mut self.tcbs, cur, qid);
        self.put_queue(qid, q);

        let next = self.first_runnable();
        self.current = next;
        Switch { prev: cur, next }
    }

    /// Wake up to `max` waiters (`max < 0` = all) matching `pred` on the
    /// given channel. Returns the number woken and the highest-priority
    /// thread woken, as a reschedule candidate for the caller.
    pub fn unblock(&mut self, qid: QueueId, max: i32, pred: Wake) -> (u32, Option<ThreadId>) {
        let mut woken = 0u32;
        let mut candidate: Option<ThreadId> = None;

        loop {
            let remaining = if max < 0 { -1 } else { max - woken as i32 };
            if remaining == 0 {
                break;
            }

            let mut q = self.take_queue(qid);
            let matches = q.collect(&self.tcbs, remaining, |t| pred.matched(t.token).is_some());
            if matches.len() == 0 {
                self.put_queue(qid, q);
                break;
            }

            for t in matches.iter() {
                q.remove(&mut self.tcbs, t);
                let tcb = &mut self.tcbs[t.index()];
                // matched() succeeded during collection
                tcb.token = pred.matched(tcb.token).unwrap_or(tcb.token);
                if !tcb.paused {
                    tcb.status = ThreadStatus::Running;
                    if candidate.is_none() {
                        // The wait queue is priority-ordered, so the first
                        // match of the first pass is the best one.
                        candidate = Some(t);
                    }
                } else {
                    tcb.status = ThreadStatus::Waiting;
                }
                self.ready.insert(&mut self.tcbs, t, QueueId::Ready);
                woken += 1;
            }
            let full = matches.is_full();
            self.put_queue(qid, q);
            if !full {
                break;
            }
        }

        (woken, candidate)
    }

    /// Decide whether waking `candidate` preempts the current thread.
    ///
    /// From thread context the switch is immediate (returned to the caller
    /// to perform); from interrupt context it is parked in the deferred
    /// slot, keeping whichever pending candidate has the better priority,
    /// and the interrupt return path drains it.
    pub fn resched(&mut self, candidate: ThreadId, from_irq: bool) -> Option<Switch> {
        if !self.tcb(candidate).runnable() {
            return None;
        }
        if self.tcb(candidate).prio >= self.tcb(self.current).prio {
            return None;
        }
        if from_irq {
            let better = match self.deferred {
                Some(d) => self.tcb(candidate).prio < self.tcb(d).prio,
                None => true,
            };
            if better {
                self.deferred = Some(candidate);
            }
            None
        } else {
            let prev = self.current;
            self.current = candidate;
            Some(Switch {
                prev,
                next: candidate,
            })
        }
    }

    /// Recompute a thread's effective priority from its base priority and
    /// the head of its waiter queue, propagating along the mutex-ownership
    /// chain while the thread itself is blocked on another owner.
    pub fn recompute_priority(&mut self, start: ThreadId) {
        let mut t = start;
        for _ in 0..PI_CHAIN_MAX {
            let tcb = self.tcb(t);
            let mut new = tcb.baseprio;
            if let Some(w) = tcb.waiters.head() {
                new = new.min(self.tcb(w).prio);
            }
            if new == tcb.prio {
                return;
            }

            let qid = tcb.queue;
            self.tcb_mut(t).prio = new;
            let mut q = self.take_queue(qid);
            q.requeue(&mut self.tcbs, t);
            self.put_queue(qid, q);

            match qid {
                // Blocked on a mutex: the new priority must be reflected in
                // the owner too. Walk up the chain.
                QueueId::Waiters(owner) => t = owner,
                _ => return,
            }
        }
    }

    /// Record interrupt bits: waiters whose mask intersects are woken with
    /// the intersection as their token; bits nobody consumed become sticky
    /// until some later `irq_wait` collects them.
    pub fn note_irq(&mut self, bits: u32) -> Option<ThreadId> {
        let (woken, candidate) = self.unblock_masked_collect(bits);
        self.irq_flags |= bits & !woken;
        candidate
    }

    fn unblock_masked_collect(&mut self, bits: u32) -> (u32, Option<ThreadId>) {
        if self.irq_wait.is_empty() {
            return (0, None);
        }
        let mut consumed = 0u32;
        let mut candidate: Option<ThreadId> = None;
        loop {
            let mut q = self.take_queue(QueueId::IrqWait);
            let matches = q.collect(&self.tcbs, -1, |t| t.token & bits != 0);
            if matches.len() == 0 {
                self.put_queue(QueueId::IrqWait, q);
                break;
            }
            for t in matches.iter() {
                q.remove(&mut self.tcbs, t);
                let tcb = &mut self.tcbs[t.index()];
                let matched = tcb.token & bits;
                consumed |= matched;
                tcb.token = matched;
                if !tcb.paused {
                    tcb.status = ThreadStatus::Running;
                    if candidate.is_none() {
                        candidate = Some(t);
                    }
                } else {
                    tcb.status = ThreadStatus::Waiting;
                }
                self.ready.insert(&mut self.tcbs, t, QueueId::Ready);
            }
            let full = matches.is_full();
            self.put_queue(QueueId::IrqWait, q);
            if !full {
                break;
            }
        }
        (consumed, candidate)
    }
}
