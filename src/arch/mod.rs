//! Architecture abstraction layer for context switching and interrupt masking.
//!
//! Everything the scheduler needs from the CPU goes through the [`Arch`]
//! trait: building an initial execution context, swapping contexts, and
//! masking interrupts. Interrupt masking is the kernel's one and only lock
//! (single core), so `irq_lock`/`irq_unlock` must nest correctly by
//! saving and restoring the previous mask state.

use crate::thread::ThreadEntry;

/// Architecture abstraction trait.
///
/// Implementations for real hardware involve inline assembly; the methods
/// marked unsafe have preconditions the caller must uphold.
pub trait Arch {
    /// Architecture-specific saved context type.
    ///
    /// Must hold every CPU register needed to resume a suspended thread.
    type Context: Default + Send;

    /// Build the initial context for a thread that has never run.
    ///
    /// When first switched to, the thread begins at `entry` with `arg` in
    /// the argument register and the stack pointer at `stack_top`.
    fn init_context(entry: ThreadEntry, arg: usize, stack_top: usize) -> Self::Context;

    /// Save the calling context into `prev` and resume `next`.
    ///
    /// This call "returns" only when some later switch restores `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` and `next` must point to valid, properly aligned contexts
    ///   that stay alive for the duration of the call
    /// - `next` must hold a resumable execution state
    /// - Must be called with interrupts masked
    unsafe fn context_switch(prev: *mut Self::Context, next: *const Self::Context);

    /// Mask interrupts, returning the previous mask state.
    fn irq_lock() -> u32;

    /// Restore a mask state previously returned by [`Arch::irq_lock`].
    fn irq_unlock(state: u32);

    /// Park the CPU until an interrupt arrives. Used by the idle thread.
    fn wait_for_interrupt();
}

/// Host-simulation port.
///
/// Context switches are no-ops and interrupt masking is stateless, so the
/// scheduler's bookkeeping (ready list, current slot, priorities, wait
/// queues) runs unmodified on the host and stays fully observable. This is
/// the port the test suite drives; it is also useful for prototyping
/// application logic off-target.
pub struct SimArch;

/// Saved context of the simulation port.
///
/// Nothing executes on a simulated thread, so only the creation parameters
/// are recorded (they are handy when debugging a host run).
#[derive(Default)]
pub struct SimContext {
    /// Entry point recorded at prepare time, never invoked on the host.
    pub entry: Option<(ThreadEntry, usize)>,
    /// Initial stack pointer recorded at prepare time.
    pub stack_top: usize,
}

impl Arch for SimArch {
    type Context = SimContext;

    fn init_context(entry: ThreadEntry, arg: usize, stack_top: usize) -> Self::Context {
        SimContext {
            entry: Some((entry, arg)),
            stack_top,
        }
    }

    unsafe fn context_switch(_prev: *mut Self::Context, _next: *const Self::Context) {
        // Control never actually leaves the caller on the host; the kernel's
        // notion of "current" has already been updated by the time this runs.
    }

    fn irq_lock() -> u32 {
        0
    }

    fn irq_unlock(_state: u32) {}

    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(_arg: usize) {}

    #[test]
    fn sim_context_records_creation_parameters() {
        let ctx = SimArch::init_context(entry, 7, 0x2000);
        let (_, arg) = ctx.entry.expect("entry recorded");
        assert_eq!(arg, 7);
        assert_eq!(ctx.stack_top, 0x2000);
    }
}
