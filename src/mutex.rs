//! Mutexes with priority inheritance.
//!
//! A contended lock does not park the caller on a per-mutex queue.
//! Instead the caller is enqueued on the *owner thread's* waiter queue,
//! carrying the mutex token, so the owner's effective priority is always
//! `min(base priority, best waiter)` with no extra bookkeeping. Unlock
//! hands the mutex directly to the best matching waiter and migrates the
//! rest onto the new owner.
//!
//! Lock and unlock are thread-context operations only. Interrupt handlers
//! cannot block, so they get no mutex API at all.

use portable_atomic::{AtomicU32, Ordering};

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sched::{KernelState, Switch};
use crate::thread::{token, QueueId, ThreadId, ThreadStatus};
use crate::timer::TickSource;

/// A non-recursive mutex. Locking twice from the same thread is a bug and
/// panics rather than deadlocking silently.
pub struct Mutex {
    /// Wake token identifying this mutex on the owner's waiter queue.
    token: u32,
    /// Owning thread id plus one; 0 = unlocked. Only written under the
    /// kernel lock, readable anywhere.
    owner: AtomicU32,
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            token: token::next_sync_token(),
            owner: AtomicU32::new(0),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    fn owner_id(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            n => Some(ThreadId(n - 1)),
        }
    }

    /// Acquire the mutex, blocking while another thread owns it.
    ///
    /// While blocked, the caller's priority is inherited by the owner (and
    /// transitively by whatever the owner is itself blocked on).
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already owns the mutex.
    pub fn lock<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) {
        let irq = A::irq_lock();
        let mut st = k.state.lock();
        let me = st.current;

        match self.owner_id() {
            None => {
                self.owner.store(me.0 + 1, Ordering::Relaxed);
                drop(st);
                A::irq_unlock(irq);
            }
            Some(o) if o == me => {
                panic!("recursive lock of a non-recursive mutex");
            }
            Some(o) => {
                let s = &mut *st;
                s.ready.remove(&mut s.tcbs, me);
                {
                    let tcb = s.tcb_mut(me);
                    tcb.status = ThreadStatus::WaitingOnMutex;
                    tcb.token = self.token;
                }
                let qid = QueueId::Waiters(o);
                let mut q = s.take_queue(qid);
                q.insert(&mut s.tcbs, me, qid);
                s.put_queue(qid, q);

                if s.tcb(me).prio < s.tcb(o).prio {
                    s.recompute_priority(o);
                }

                // Hand the CPU to the owner when possible, so it can get
                // on with releasing the lock.
                let next = if s.tcb(o).runnable() {
                    o
                } else {
                    s.first_runnable()
                };
                s.current = next;
                k.commit(st, irq, Some(Switch { prev: me, next }));
                // Resumed here means unlock handed us the mutex.
            }
        }
    }

    /// Acquire the mutex if it is free. Never blocks and never inherits.
    pub fn try_lock<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) -> bool {
        let irq = A::irq_lock();
        let st = k.state.lock();
        let me = st.current;
        let got = if self.owner.load(Ordering::Relaxed) == 0 {
            self.owner.store(me.0 + 1, Ordering::Relaxed);
            true
        } else {
            false
        };
        drop(st);
        A::irq_unlock(irq);
        got
    }

    /// Release the mutex, handing it to the best waiter if any.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not own the mutex.
    pub fn unlock<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) {
        let irq = A::irq_lock();
        let mut st = k.state.lock();
        let me = st.current;
        if self.owner_id() != Some(me) {
            panic!("unlock of mutex not owned by the calling thread");
        }

        let new_owner = self.transfer_locked(&mut st);
        let sw = new_owner.and_then(|n| st.resched(n, false));
        k.commit(st, irq, sw);
    }

    /// Ownership-transfer bookkeeping, shared with condvar wait.
    ///
    /// Requires the kernel lock and that the current thread owns the
    /// mutex. Moves every waiter of this mutex off the current thread's
    /// waiter queue, promotes the best one to owner and migrates the rest
    /// onto it, then reverts any inherited priority. Returns the new
    /// owner, ready but not yet rescheduled.
    pub(crate) fn transfer_locked<Ctx>(&self, st: &mut KernelState<Ctx>) -> Option<ThreadId> {
        let me = match self.owner_id() {
            Some(o) => o,
            None => return None,
        };

        let mut new_owner: Option<ThreadId> = None;
        loop {
            let qid = QueueId::Waiters(me);
            let mut q = st.take_queue(qid);
            let matches = q.collect(&st.tcbs, -1, |t| t.token == self.token);
            if matches.len() == 0 {
                st.put_queue(qid, q);
                break;
            }
            for t in matches.iter() {
                q.remove(&mut st.tcbs, t);
                match new_owner {
                    None => {
                        // Waiter queues are priority-ordered, so the first
                        // match is the best waiter.
                        let tcb = &mut st.tcbs[t.index()];
                        tcb.status = if tcb.paused {
                            ThreadStatus::Waiting
                        } else {
                            ThreadStatus::Running
                        };
                        st.ready.insert(&mut st.tcbs, t, QueueId::Ready);
                        new_owner = Some(t);
                    }
                    Some(n) => {
                        // Still blocked, now on the new owner.
                        let nqid = QueueId::Waiters(n);
                        let mut nq = st.take_queue(nqid);
                        nq.insert(&mut st.tcbs, t, nqid);
                        st.put_queue(nqid, nq);
                    }
                }
            }
            let full = matches.is_full();
            st.put_queue(qid, q);
            if !full {
                break;
            }
        }

        match new_owner {
            Some(n) => {
                self.owner.store(n.0 + 1, Ordering::Relaxed);
                st.recompute_priority(n);
            }
            None => self.owner.store(0, Ordering::Relaxed),
        }
        // Inherited boost from the departed waiters ends now.
        st.recompute_priority(me);
        new_owner
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutex the owning thread may lock again. Each lock must be paired
/// with an unlock; the underlying mutex is released on the last one.
pub struct RecursiveMutex {
    inner: Mutex,
    /// Lock depth. Only ever touched by the owning thread.
    count: AtomicU32,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        RecursiveMutex {
            inner: Mutex::new(),
            count: AtomicU32::new(0),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn lock<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) {
        let irq = A::irq_lock();
        let st = k.state.lock();
        let me = st.current;
        if self.inner.owner_id() == Some(me) {
            self.count.fetch_add(1, Ordering::Relaxed);
            drop(st);
            A::irq_unlock(irq);
            return;
        }
        drop(st);
        A::irq_unlock(irq);

        self.inner.lock(k);
        self.count.store(1, Ordering::Relaxed);
    }

    /// # Panics
    ///
    /// Panics if the calling thread does not own the mutex.
    pub fn unlock<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) {
        let irq = A::irq_lock();
        let st = k.state.lock();
        if self.inner.owner_id() != Some(st.current) {
            panic!("unlock of mutex not owned by the calling thread");
        }
        drop(st);
        A::irq_unlock(irq);

        if self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.inner.unlock(k);
        }
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}
