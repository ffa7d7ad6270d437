//! Kernel facade: thread lifecycle, yielding, interrupt waits, and the
//! interrupt-context capability handed to ISRs and timer callbacks.
//!
//! The kernel owns one [`KernelState`] behind a spin mutex. On hardware
//! every entry point masks interrupts around the lock; with a single core
//! the mask *is* the lock and the spin mutex never actually spins. Context
//! switches are decided while the lock is held and performed right after it
//! is released, with interrupts still masked.
//!
//! # The simulation port
//!
//! Blocking entry points cannot suspend a host caller, since the simulated
//! [`Arch::context_switch`](crate::arch::Arch::context_switch) is a no-op.
//! Whenever such a call blocks, the kernel's notion of the current thread
//! moves on and the call returns immediately (with a zero placeholder where
//! a wake value would be); all scheduler state is exactly as it would be on
//! hardware at the moment of suspension, which is what the test suite
//! inspects. On a real port these calls return only when the thread is
//! actually resumed.

use core::marker::PhantomData;
use portable_atomic::{AtomicBool, Ordering};
use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult};
use crate::sched::{KernelState, Switch, Wake};
use crate::thread::{token, QueueId, Tcb, ThreadEntry, ThreadId, ThreadStatus};
use crate::timer::TickSource;

/// Lowest possible priority, reserved for the idle thread.
pub const IDLE_PRIO: u8 = u8::MAX;

pub(crate) type StateGuard<'a, Ctx> = spin::MutexGuard<'a, KernelState<Ctx>>;

/// The threading kernel. One instance per core; this design assumes
/// exactly one executing core per instance.
///
/// # Type parameters
///
/// * `A` - Architecture port (context switching, interrupt masking)
/// * `T` - Hardware tick timer
pub struct Kernel<A: Arch, T: TickSource> {
    pub(crate) state: spin::Mutex<KernelState<A::Context>>,
    pub(crate) timer: T,
    initialized: AtomicBool,
    _arch: PhantomData<A>,
}

impl<A: Arch, T: TickSource> Kernel<A, T> {
    /// Create a kernel around the given tick timer. Nothing is scheduled
    /// until [`Kernel::init`] runs.
    pub const fn new(timer: T) -> Self {
        Kernel {
            state: spin::Mutex::new(KernelState::new()),
            timer,
            initialized: AtomicBool::new(false),
            _arch: PhantomData,
        }
    }

    /// Adopt the calling context as the main thread (at `main_prio`) and
    /// create the idle thread. Must run before any other operation.
    ///
    /// `idle_stack_top` is the initial stack pointer for the idle thread;
    /// the simulation port ignores it.
    ///
    /// Returns the main thread's id.
    pub fn init(&self, main_prio: u8, idle_stack_top: usize) -> KernelResult<ThreadId> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KernelError::AlreadyInitialized);
        }

        let irq = A::irq_lock();
        let mut st = self.state.lock();

        let s = &mut *st;

        // Main thread: the context currently executing. Its register
        // snapshot is filled in by the first switch away from it.
        let main = ThreadId(s.tcbs.len() as u32);
        let mut tcb = Tcb::new(A::Context::default(), main_prio);
        tcb.status = ThreadStatus::Running;
        s.tcbs.push(tcb);
        s.ready.insert(&mut s.tcbs, main, QueueId::Ready);
        s.current = main;

        // Idle thread: always runnable, so the scheduler never comes up
        // empty when everything else is blocked.
        let idle = ThreadId(s.tcbs.len() as u32);
        let ctx = A::init_context(idle_entry::<A>, 0, idle_stack_top);
        let mut tcb = Tcb::new(ctx, IDLE_PRIO);
        tcb.status = ThreadStatus::Running;
        s.tcbs.push(tcb);
        s.ready.insert(&mut s.tcbs, idle, QueueId::Ready);

        drop(st);
        A::irq_unlock(irq);
        Ok(main)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_init(&self) -> KernelResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(KernelError::NotInitialized)
        }
    }

    /// The hardware tick timer this kernel drives.
    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Id of the thread currently considered running.
    pub fn current_thread(&self) -> ThreadId {
        let irq = A::irq_lock();
        let cur = self.state.lock().current;
        A::irq_unlock(irq);
        cur
    }

    /// Release the state lock and perform the decided switch, if any.
    ///
    /// The raw context pointers stay valid across the unlock: control
    /// blocks are never freed, and the arena only reallocates from
    /// `thread_prepare`, which cannot run concurrently on a single core
    /// with interrupts masked.
    pub(crate) fn commit(
        &self,
        mut st: StateGuard<'_, A::Context>,
        irq: u32,
        sw: Option<Switch>,
    ) {
        if let Some(Switch { prev, next }) = sw {
            let prev_ctx: *mut A::Context = &mut st.tcbs[prev.index()].ctx;
            let next_ctx: *const A::Context = &st.tcbs[next.index()].ctx;
            drop(st);
            unsafe { A::context_switch(prev_ctx, next_ctx) };
        } else {
            drop(st);
        }
        A::irq_unlock(irq);
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Create a thread, paused. It occupies a ready-list slot at `prio`
    /// but will not be scheduled until [`Kernel::thread_start`].
    ///
    /// The control block is kernel-internal and lives forever; after the
    /// thread finishes, its slot keeps the return code for joiners.
    pub fn thread_prepare(
        &self,
        entry: ThreadEntry,
        arg: usize,
        stack_top: usize,
        prio: u8,
    ) -> KernelResult<ThreadId> {
        self.ensure_init()?;
        let irq = A::irq_lock();
        let mut st = self.state.lock();

        let s = &mut *st;
        let t = ThreadId(s.tcbs.len() as u32);
        let mut tcb = Tcb::new(A::init_context(entry, arg, stack_top), prio);
        tcb.status = ThreadStatus::Waiting;
        tcb.paused = true;
        s.tcbs.push(tcb);
        s.ready.insert(&mut s.tcbs, t, QueueId::Ready);

        drop(st);
        A::irq_unlock(irq);
        Ok(t)
    }

    /// Unpause a prepared thread. Switches to it at once if it outranks
    /// the caller.
    pub fn thread_start(&self, t: ThreadId) -> KernelResult<()> {
        self.ensure_init()?;
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        if t.index() >= st.tcbs.len() {
            drop(st);
            A::irq_unlock(irq);
            return Err(KernelError::InvalidThread);
        }
        if !st.tcb(t).paused {
            drop(st);
            A::irq_unlock(irq);
            return Err(KernelError::InvalidState);
        }

        {
            let tcb = st.tcb_mut(t);
            tcb.paused = false;
            if tcb.status == ThreadStatus::Waiting && matches!(tcb.queue, QueueId::Ready) {
                tcb.status = ThreadStatus::Running;
            }
        }
        let sw = st.resched(t, false);
        self.commit(st, irq, sw);
        Ok(())
    }

    /// Wait until `t` finishes and return its return code.
    ///
    /// The finished control block stays around, so joining an
    /// already-finished thread succeeds at any later time, repeatedly.
    pub fn thread_join(&self, t: ThreadId) -> KernelResult<u32> {
        self.ensure_init()?;
        let me = self.current_thread();
        loop {
            let irq = A::irq_lock();
            let mut st = self.state.lock();
            if t.index() >= st.tcbs.len() {
                drop(st);
                A::irq_unlock(irq);
                return Err(KernelError::InvalidThread);
            }
            if st.tcb(t).status == ThreadStatus::Finished {
                let rc = st.tcb(t).rc;
                drop(st);
                A::irq_unlock(irq);
                return Ok(rc);
            }
            if st.current != me {
                // Simulation port: the caller was suspended on an earlier
                // pass and control has notionally moved elsewhere.
                drop(st);
                A::irq_unlock(irq);
                return Ok(0);
            }
            let sw = st.block_current(QueueId::Wait, token::join(t), ThreadStatus::Waiting);
            self.commit(st, irq, Some(sw));
        }
    }

    /// Finish the calling thread with `rc`, waking all joiners and
    /// switching away. Returns only on the simulation port.
    pub fn thread_exit(&self, rc: u32) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        let cur = st.current;
        {
            let tcb = st.tcb_mut(cur);
            tcb.rc = rc;
            tcb.status = ThreadStatus::Finished;
        }
        // The slot stays in the ready list (skipped by the runnable scan)
        // so joiners can read the return code from it.
        st.unblock(QueueId::Wait, -1, Wake::TokenEquals(token::join(cur)));
        let next = st.first_runnable();
        st.current = next;
        self.commit(st, irq, Some(Switch { prev: cur, next }));
    }

    /// Hand the CPU to the next runnable thread of the same priority,
    /// without blocking. Re-inserts the caller behind its equals, so
    /// repeated yields rotate fairly.
    pub fn thread_yield(&self) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        let cur = st.current;
        {
            let s = &mut *st;
            s.ready.remove(&mut s.tcbs, cur);
            s.ready.insert(&mut s.tcbs, cur, QueueId::Ready);
        }
        let next = st.first_runnable();
        let sw = if next != cur {
            st.current = next;
            Some(Switch { prev: cur, next })
        } else {
            None
        };
        self.commit(st, irq, sw);
    }

    /// Change a thread's base priority; the effective priority follows
    /// unless an inheritance boost is pinning it higher.
    pub fn thread_set_priority(&self, t: ThreadId, prio: u8) -> KernelResult<()> {
        self.ensure_init()?;
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        if t.index() >= st.tcbs.len() {
            drop(st);
            A::irq_unlock(irq);
            return Err(KernelError::InvalidThread);
        }
        st.tcb_mut(t).baseprio = prio;
        st.recompute_priority(t);

        // The change may have promoted someone past the caller (or demoted
        // the caller past someone).
        let best = st.first_runnable();
        let sw = if best != st.current && st.tcb(best).prio < st.tcb(st.current).prio {
            let prev = st.current;
            st.current = best;
            Some(Switch { prev, next: best })
        } else {
            None
        };
        self.commit(st, irq, sw);
        Ok(())
    }

    /// Effective (possibly boosted) priority of a thread.
    pub fn thread_priority(&self, t: ThreadId) -> KernelResult<u8> {
        self.read_tcb(t, |tcb| tcb.prio)
    }

    /// Base priority of a thread, as configured by its owner.
    pub fn thread_base_priority(&self, t: ThreadId) -> KernelResult<u8> {
        self.read_tcb(t, |tcb| tcb.baseprio)
    }

    /// Scheduling status of a thread.
    pub fn thread_status(&self, t: ThreadId) -> KernelResult<ThreadStatus> {
        self.read_tcb(t, |tcb| tcb.status)
    }

    /// Wake token most recently delivered to a thread.
    pub fn thread_token(&self, t: ThreadId) -> KernelResult<u32> {
        self.read_tcb(t, |tcb| tcb.token)
    }

    fn read_tcb<R>(&self, t: ThreadId, f: impl FnOnce(&Tcb<A::Context>) -> R) -> KernelResult<R> {
        let irq = A::irq_lock();
        let st = self.state.lock();
        let r = if t.index() < st.tcbs.len() {
            Ok(f(st.tcb(t)))
        } else {
            Err(KernelError::InvalidThread)
        };
        drop(st);
        A::irq_unlock(irq);
        r
    }

    /// Forcibly pull `t` out of whatever wait queue it sits in and make it
    /// runnable with a zero token. Administrative teardown, not a
    /// general-purpose cancellation mechanism.
    pub fn thread_block_cancel(&self, t: ThreadId) -> KernelResult<()> {
        self.ensure_init()?;
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        if t.index() >= st.tcbs.len() {
            drop(st);
            A::irq_unlock(irq);
            return Err(KernelError::InvalidThread);
        }

        let qid = st.tcb(t).queue;
        let sw = match qid {
            QueueId::Ready => None,
            _ => {
                let mut q = st.take_queue(qid);
                q.remove(&mut st.tcbs, t);
                st.put_queue(qid, q);
                {
                    let tcb = st.tcb_mut(t);
                    tcb.token = 0;
                    tcb.status = if tcb.paused {
                        ThreadStatus::Waiting
                    } else {
                        ThreadStatus::Running
                    };
                }
                {
                    let s = &mut *st;
                    s.ready.insert(&mut s.tcbs, t, QueueId::Ready);
                }
                if let QueueId::Waiters(owner) = qid {
                    // It no longer contributes to the owner's boost.
                    st.recompute_priority(owner);
                }
                st.resched(t, false)
            }
        };
        self.commit(st, irq, sw);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Interrupt waits
    // ------------------------------------------------------------------

    /// Block until any of the interrupt bits in `mask` fires, returning
    /// the bits that did. Bits that fired earlier with nobody waiting are
    /// sticky and satisfy the wait immediately.
    pub fn irq_wait(&self, mask: u32) -> u32 {
        let irq = A::irq_lock();
        let mut st = self.state.lock();

        let pending = st.irq_flags & mask;
        if pending != 0 {
            st.irq_flags &= !pending;
            drop(st);
            A::irq_unlock(irq);
            return pending;
        }

        let me = st.current;
        let sw = st.block_current(QueueId::IrqWait, mask, ThreadStatus::Waiting);
        self.commit(st, irq, Some(sw));

        // Resumed (on hardware): the matched bits were stored as our token.
        let irq = A::irq_lock();
        let st = self.state.lock();
        let got = if st.current == me { st.tcb(me).token } else { 0 };
        drop(st);
        A::irq_unlock(irq);
        got
    }

    // ------------------------------------------------------------------
    // Interrupt-context entry points
    // ------------------------------------------------------------------

    /// Run `f` as an interrupt handler body.
    ///
    /// The closure receives the [`IrqContext`] capability, whose
    /// operations never switch directly; any preemption they decide is
    /// parked in the deferred slot and performed by
    /// [`Kernel::post_irq_switch`] on the way out of the interrupt.
    pub fn irq_scope<R>(&self, f: impl FnOnce(&mut IrqContext<'_, A::Context>) -> R) -> R {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        let r = f(&mut IrqContext { st: &mut st });
        drop(st);
        A::irq_unlock(irq);
        r
    }

    /// Drain the deferred-switch slot. The interrupt dispatch trampoline
    /// must call this after the handler, once it is safe to switch stacks.
    pub fn post_irq_switch(&self) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        let sw = match st.deferred.take() {
            Some(d) if st.tcb(d).runnable() && st.tcb(d).prio < st.tcb(st.current).prio => {
                let prev = st.current;
                st.current = d;
                Some(Switch { prev, next: d })
            }
            _ => None,
        };
        self.commit(st, irq, sw);
    }
}

/// Capability for code running in interrupt context.
///
/// Holding one proves interrupts are masked and the kernel state lock is
/// held. The operations exposed here are the only legal kernel interaction
/// from an ISR or timer callback; none of them block, and none of them
/// switch contexts directly.
pub struct IrqContext<'a, Ctx> {
    pub(crate) st: &'a mut KernelState<Ctx>,
}

impl<Ctx> IrqContext<'_, Ctx> {
    /// Wake up to `max` waiters (`max < 0` = all) matching `pred` on the
    /// global wait channel. Returns how many woke.
    pub fn wake(&mut self, pred: Wake, max: i32) -> u32 {
        let (n, candidate) = self.st.unblock(QueueId::Wait, max, pred);
        if let Some(c) = candidate {
            self.st.resched(c, true);
        }
        n
    }

    /// Record fired interrupt bits, waking matching `irq_wait` callers.
    /// Unconsumed bits stay sticky.
    pub fn note_irq(&mut self, bits: u32) {
        if let Some(c) = self.st.note_irq(bits) {
            self.st.resched(c, true);
        }
    }
}

/// Entry point of the idle thread: park until something becomes runnable.
fn idle_entry<A: Arch>(_arg: usize) {
    loop {
        A::wait_for_interrupt();
    }
}
