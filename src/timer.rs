//! Tick-driven timer tasks: the monotonic tick counter, the
//! deadline-ordered task list, and sleeping.
//!
//! Time comes from a free-running 16-bit hardware counter. The overflow
//! interrupt extends it in software to a 64-bit monotonic tick count, and a
//! separate hardware deadline (the reload value programmed through
//! [`TickSource::arm`]) fires when the head of the task list comes due.
//!
//! Task deadlines are 32-bit and allowed to wrap; ordering between them is
//! the wraparound-safe signed difference, so a target of `0xFFFF_FFF0` is
//! earlier than `0x0000_0010`.
//!
//! Task callbacks run in interrupt context. They receive the
//! [`IrqContext`] capability and must not block; the canonical callback
//! body is a single wake, which is exactly how [`Kernel::sleep_ticks`] and
//! thread-wait-with-timeout are built.

use alloc::boxed::Box;
use alloc::vec::Vec;

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::Arch;
use crate::kernel::{IrqContext, Kernel};
use crate::sched::Wake;
use crate::thread::{token, QueueId, ThreadStatus};

/// Hardware tick timer abstraction.
///
/// Models a free-running 16-bit up-counter with an overflow interrupt,
/// plus a reprogrammable deadline: `arm(reload)` makes the deadline
/// interrupt fire after `0x10000 - reload` counts.
pub trait TickSource {
    /// Current value of the free-running counter (low 16 bits of time).
    fn counter(&self) -> u16;

    /// True if the overflow interrupt has fired but not yet been serviced.
    /// Reading time must account for this window.
    fn overflow_pending(&self) -> bool;

    /// Program the deadline interrupt. A reload of `0xFFFF` means "fire on
    /// the very next tick", which is also the clamp used for deadlines
    /// already in the past.
    fn arm(&self, reload: u16);

    /// Disarm the deadline interrupt (no tasks pending).
    fn disarm(&self);
}

/// Simulated tick timer for the host.
///
/// Tests advance it manually and then deliver the corresponding interrupts
/// through [`Kernel::tick_overflow_irq`] / [`Kernel::tick_deadline_irq`],
/// playing the role of the dispatch trampoline.
pub struct SimTicks {
    /// Full software counter; the hardware-visible window is the low 16 bits.
    count: AtomicU32,
    pending: AtomicBool,
    /// Programmed reload value, or `DISARMED`.
    reload: AtomicU32,
}

impl SimTicks {
    const DISARMED: u32 = u32::MAX;

    pub const fn new() -> Self {
        SimTicks {
            count: AtomicU32::new(0),
            pending: AtomicBool::new(false),
            reload: AtomicU32::new(Self::DISARMED),
        }
    }

    /// Advance simulated time. Crossing a 16-bit boundary latches the
    /// overflow-pending flag, exactly like the hardware line.
    pub fn advance(&self, ticks: u32) {
        let old = self.count.load(Ordering::Relaxed);
        let new = old.wrapping_add(ticks);
        self.count.store(new, Ordering::Relaxed);
        if (old >> 16) != (new >> 16) {
            self.pending.store(true, Ordering::Relaxed);
        }
    }

    /// Acknowledge the overflow interrupt (the trampoline does this before
    /// invoking the handler on hardware).
    pub fn ack_overflow(&self) {
        self.pending.store(false, Ordering::Relaxed);
    }

    /// The currently programmed deadline reload, if armed.
    pub fn armed_reload(&self) -> Option<u16> {
        match self.reload.load(Ordering::Relaxed) {
            Self::DISARMED => None,
            r => Some(r as u16),
        }
    }
}

impl Default for SimTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SimTicks {
    fn counter(&self) -> u16 {
        self.count.load(Ordering::Relaxed) as u16
    }

    fn overflow_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }

    fn arm(&self, reload: u16) {
        self.reload.store(reload as u32, Ordering::Relaxed);
    }

    fn disarm(&self) {
        self.reload.store(Self::DISARMED, Ordering::Relaxed);
    }
}

/// True if tick `a` is at or before tick `b` in wraparound order.
pub fn tick_is_sequential(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) as i32 >= 0
}

/// Reload value that makes the deadline interrupt fire at `target`.
/// Deadlines at or before `now` clamp to `0xFFFF` (the very next tick);
/// deadlines beyond the 16-bit window get a full period and re-evaluate
/// when it fires.
fn reload_for(now: u32, target: u32) -> u16 {
    let delta = target.wrapping_sub(now) as i32;
    if delta <= 0 {
        0xFFFF
    } else if delta as u32 >= 0x1_0000 {
        0
    } else {
        (0x1_0000 - delta as u32) as u16
    }
}

/// A timer-task callback. Runs in interrupt context; must not block.
pub type TickFn<Ctx> = Box<dyn FnMut(&mut IrqContext<'_, Ctx>) + Send>;

/// Handle to a started timer task. Generational, so a handle left over
/// from a task that already completed cannot stop an unrelated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickTaskId {
    index: u32,
    gen: u32,
}

struct TickSlot<Ctx> {
    gen: u32,
    active: bool,
    /// Tick deadline (compared wraparound-safe).
    target: u32,
    /// Refire interval; 0 = one-shot.
    period: u32,
    cb: Option<TickFn<Ctx>>,
    next: Option<u32>,
}

/// Timer-task list plus the software high word of the tick counter.
pub(crate) struct TickState<Ctx> {
    /// Number of counter overflows observed; upper bits of the tick count.
    high: u64,
    slots: Vec<TickSlot<Ctx>>,
    free: Vec<u32>,
    head: Option<u32>,
}

impl<Ctx> TickState<Ctx> {
    pub const fn new() -> Self {
        TickState {
            high: 0,
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
        }
    }

    /// Synthesize the 64-bit monotonic tick count, accounting for an
    /// overflow that fired but has not been serviced yet: re-read the
    /// counter after seeing the pending flag, since it may have wrapped
    /// between the two reads.
    pub fn now<T: TickSource>(&self, hw: &T) -> u64 {
        let mut high = self.high;
        let mut low = hw.counter();
        if hw.overflow_pending() {
            high += 1;
            low = hw.counter();
        }
        (high << 16) | low as u64
    }

    pub fn note_overflow(&mut self) {
        self.high += 1;
    }

    fn alloc(&mut self, target: u32, period: u32, cb: TickFn<Ctx>) -> TickTaskId {
        let slot = TickSlot {
            gen: 0,
            active: true,
            target,
            period,
            cb: Some(cb),
            next: None,
        };
        match self.free.pop() {
            Some(i) => {
                let gen = self.slots[i as usize].gen;
                self.slots[i as usize] = TickSlot { gen, ..slot };
                TickTaskId { index: i, gen }
            }
            None => {
                self.slots.push(slot);
                TickTaskId {
                    index: (self.slots.len() - 1) as u32,
                    gen: 0,
                }
            }
        }
    }

    /// Insert an allocated slot into the deadline-ordered list; equal
    /// deadlines keep insertion (FIFO) order. Returns true if the slot
    /// became the new head.
    fn link(&mut self, index: u32) -> bool {
        let target = self.slots[index as usize].target;

        let mut prev: Option<u32> = None;
        let mut at = self.head;
        while let Some(cur) = at {
            // Stop before the first strictly-later deadline.
            if !tick_is_sequential(self.slots[cur as usize].target, target) {
                break;
            }
            prev = at;
            at = self.slots[cur as usize].next;
        }

        self.slots[index as usize].next = at;
        match prev {
            Some(p) => {
                self.slots[p as usize].next = Some(index);
                false
            }
            None => {
                self.head = Some(index);
                true
            }
        }
    }

    /// Unlink a slot. Returns true if it was the head.
    fn unlink(&mut self, index: u32) -> bool {
        let mut prev: Option<u32> = None;
        let mut at = self.head;
        while let Some(cur) = at {
            if cur == index {
                let next = self.slots[cur as usize].next;
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.head = next,
                }
                self.slots[cur as usize].next = None;
                return prev.is_none();
            }
            prev = at;
            at = self.slots[cur as usize].next;
        }
        false
    }

    fn retire(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.active = false;
        slot.cb = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(index);
    }

    fn is_live(&self, id: TickTaskId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|s| s.active && s.gen == id.gen)
            .unwrap_or(false)
    }

    /// Reprogram the hardware for the current head, or disarm.
    fn rearm<T: TickSource>(&self, hw: &T, now: u32) {
        match self.head {
            Some(h) => hw.arm(reload_for(now, self.slots[h as usize].target)),
            None => hw.disarm(),
        }
    }
}

impl<A: Arch, T: TickSource> Kernel<A, T> {
    /// Current 64-bit monotonic tick count.
    pub fn tick_now(&self) -> u64 {
        let irq = A::irq_lock();
        let st = self.state.lock();
        let now = st.ticks.now(&self.timer);
        drop(st);
        A::irq_unlock(irq);
        now
    }

    /// Start a timer task: `callback` fires `delay` ticks from now, and
    /// every `period` ticks after that (`period == 0` = one-shot).
    ///
    /// Each refire deadline is computed from the previous target, not from
    /// the moment of delivery, so periodic tasks do not accumulate jitter.
    pub fn tick_task_start<F>(&self, delay: u32, period: u32, callback: F) -> TickTaskId
    where
        F: FnMut(&mut IrqContext<'_, A::Context>) + Send + 'static,
    {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        let id = self.tick_task_start_locked(&mut st.ticks, delay, period, Box::new(callback));
        drop(st);
        A::irq_unlock(irq);
        id
    }

    pub(crate) fn tick_task_start_locked(
        &self,
        ticks: &mut TickState<A::Context>,
        delay: u32,
        period: u32,
        cb: TickFn<A::Context>,
    ) -> TickTaskId {
        let now = ticks.now(&self.timer) as u32;
        let target = now.wrapping_add(delay);
        let id = ticks.alloc(target, period, cb);
        if ticks.link(id.index) {
            self.timer.arm(reload_for(now, target));
        }
        id
    }

    /// Stop a timer task. A handle from a task that already fired (and was
    /// one-shot) or was stopped is ignored.
    pub fn tick_task_stop(&self, id: TickTaskId) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        if st.ticks.is_live(id) {
            let was_head = st.ticks.unlink(id.index);
            st.ticks.retire(id.index);
            if was_head {
                let now = st.ticks.now(&self.timer) as u32;
                st.ticks.rearm(&self.timer, now);
            }
        }
        drop(st);
        A::irq_unlock(irq);
    }

    /// Overflow interrupt body: extend the tick counter's high word.
    /// The dispatch trampoline acknowledges the hardware line first.
    pub fn tick_overflow_irq(&self) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        st.ticks.note_overflow();
        drop(st);
        A::irq_unlock(irq);
    }

    /// Deadline interrupt body: run every task at the head of the list
    /// whose deadline is not after now (several may be due if servicing
    /// was delayed), then reprogram the hardware for the new head.
    ///
    /// The trampoline must call [`Kernel::post_irq_switch`] afterwards to
    /// perform any switch the callbacks decided.
    pub fn tick_deadline_irq(&self) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();

        loop {
            let now = st.ticks.now(&self.timer) as u32;
            let head = match st.ticks.head {
                Some(h) if tick_is_sequential(st.ticks.slots[h as usize].target, now) => h,
                _ => break,
            };

            st.ticks.unlink(head);
            // Take the callback out so it can borrow the whole state.
            let mut cb = st.ticks.slots[head as usize].cb.take();
            let period = st.ticks.slots[head as usize].period;

            if let Some(cb) = cb.as_mut() {
                cb(&mut IrqContext { st: &mut st });
            }

            if period != 0 {
                let slot = &mut st.ticks.slots[head as usize];
                slot.cb = cb;
                slot.target = slot.target.wrapping_add(period);
                st.ticks.link(head);
            } else {
                st.ticks.retire(head);
            }
        }

        let now = st.ticks.now(&self.timer) as u32;
        st.ticks.rearm(&self.timer, now);
        drop(st);
        A::irq_unlock(irq);
    }

    /// Block the calling thread for `ticks` ticks.
    ///
    /// Composed from the primitives: a one-shot timer task whose entire
    /// body is a wake of this thread's sleep token.
    pub fn sleep_ticks(&self, ticks: u32) {
        let irq = A::irq_lock();
        let mut st = self.state.lock();
        let me = st.current;
        let wake_token = token::sleep(me);

        let cb: TickFn<A::Context> = Box::new(move |cx: &mut IrqContext<'_, A::Context>| {
            cx.wake(Wake::TokenEquals(wake_token), 1);
        });
        {
            let s = &mut *st;
            // Single lock section: the deadline cannot fire between
            // arming and blocking.
            let _ = self.tick_task_start_locked(&mut s.ticks, ticks, 0, cb);
        }
        let sw = st.block_current(QueueId::Wait, wake_token, ThreadStatus::Waiting);
        self.commit(st, irq, Some(sw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_handles_wraparound() {
        assert!(tick_is_sequential(0, 1));
        assert!(tick_is_sequential(5, 5));
        assert!(!tick_is_sequential(6, 5));
        // Across the 32-bit boundary.
        assert!(tick_is_sequential(0xFFFF_FFF0, 0x0000_0010));
        assert!(!tick_is_sequential(0x0000_0010, 0xFFFF_FFF0));
    }

    #[test]
    fn reload_clamps_past_deadlines_to_next_tick() {
        assert_eq!(reload_for(100, 100), 0xFFFF);
        assert_eq!(reload_for(100, 90), 0xFFFF);
        assert_eq!(reload_for(100, 101), 0xFFFF);
        assert_eq!(reload_for(100, 100 + 0xFFFF), 1);
        assert_eq!(reload_for(100, 100 + 0x1_0000), 0);
        assert_eq!(reload_for(100, 100 + 0x5_0000), 0);
    }

    #[test]
    fn sim_ticks_latch_overflow_on_wrap() {
        let hw = SimTicks::new();
        hw.advance(0xFFFF);
        assert!(!hw.overflow_pending());
        hw.advance(1);
        assert!(hw.overflow_pending());
        assert_eq!(hw.counter(), 0);
        hw.ack_overflow();
        assert!(!hw.overflow_pending());
    }

    #[test]
    fn now_accounts_for_unserviced_overflow() {
        let hw = SimTicks::new();
        let ticks: TickState<()> = TickState::new();
        hw.advance(0x1_0005);
        // Overflow fired but the handler has not run: high word must be
        // bumped when reading.
        assert!(hw.overflow_pending());
        assert_eq!(ticks.now(&hw), 0x1_0005);
    }
}
