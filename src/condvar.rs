//! Condition variables.
//!
//! A condvar is nothing but a wake token on the global wait channel. Wait
//! atomically releases the associated mutex and goes to sleep in one
//! kernel-lock section, so a signal between "unlock" and "sleep" cannot be
//! lost. Every wakeup corresponds to a signal or broadcast; callers still
//! re-check their predicate in a loop because another thread may take the
//! mutex and change it between the wake and the re-acquisition.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::mutex::Mutex;
use crate::sched::{Switch, Wake};
use crate::thread::{token, QueueId, ThreadStatus};
use crate::timer::TickSource;

pub struct CondVar {
    token: u32,
}

impl CondVar {
    pub fn new() -> Self {
        CondVar {
            token: token::next_sync_token(),
        }
    }

    /// Release `mutex`, block until signalled, then re-acquire `mutex`.
    ///
    /// The release and the block happen under one kernel-lock section.
    /// The caller must own `mutex`.
    pub fn wait<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>, mutex: &Mutex) {
        let irq = A::irq_lock();
        let mut st = k.state.lock();
        let me = st.current;

        {
            let s = &mut *st;
            s.ready.remove(&mut s.tcbs, me);
            {
                let tcb = s.tcb_mut(me);
                tcb.status = ThreadStatus::Waiting;
                tcb.token = self.token;
            }
            let mut q = s.take_queue(QueueId::Wait);
            q.insert(&mut s.tcbs, me, QueueId::Wait);
            s.put_queue(QueueId::Wait, q);
        }

        // Hand the mutex over; a promoted waiter lands in the ready list
        // and competes for the CPU we are about to give up.
        mutex.transfer_locked(&mut st);

        let next = st.first_runnable();
        st.current = next;
        k.commit(st, irq, Some(Switch { prev: me, next }));

        // Re-acquire after the wakeup. On the simulation port the call
        // returns while the thread is still suspended; the re-acquisition
        // belongs to whenever it actually resumes.
        let irq = A::irq_lock();
        let st = k.state.lock();
        let resumed = st.current == me;
        drop(st);
        A::irq_unlock(irq);
        if resumed {
            mutex.lock(k);
        }
    }

    /// Wake the best waiter, if any. Returns true if one woke.
    pub fn signal<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) -> bool {
        self.wake(k, 1) == 1
    }

    /// Wake every waiter. Returns how many woke.
    pub fn broadcast<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) -> u32 {
        self.wake(k, -1)
    }

    fn wake<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>, max: i32) -> u32 {
        let irq = A::irq_lock();
        let mut st = k.state.lock();
        let (n, candidate) = st.unblock(QueueId::Wait, max, Wake::TokenEquals(self.token));
        let sw = candidate.and_then(|c| st.resched(c, false));
        k.commit(st, irq, sw);
        n
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
