//! A small cooperative kernel for single-core handheld targets.
//!
//! Threads run until they block, yield, or exit; there is no time slicing.
//! Preemption happens only at kernel entry points: whenever an operation
//! (or an interrupt handler) makes a strictly higher-priority thread
//! runnable, control transfers to it. Priority 0 is the highest and the
//! idle thread sits at [`IDLE_PRIO`].
//!
//! The building blocks:
//!
//! * [`Kernel`] - thread lifecycle, yield, join, interrupt waits, tick
//!   timer tasks and sleep.
//! * [`Mutex`] / [`RecursiveMutex`] - locks with priority inheritance.
//! * [`CondVar`] - condition variables over a mutex.
//! * [`Mailbox`] - fixed-capacity `u32` message rings.
//! * [`IrqContext`] - the capability interrupt handlers act through.
//!
//! Hardware sits behind two traits, [`Arch`] for context switching and
//! interrupt masking and [`TickSource`] for the 16-bit tick counter. The
//! bundled [`SimArch`] and [`SimTicks`] ports run the whole kernel on a
//! host, which is how the test suite works.
//!
//! ```ignore
//! use coop_kernel::{Kernel, SimArch, SimTicks};
//!
//! fn worker_entry(_arg: usize) {}
//!
//! static KERNEL: Kernel<SimArch, SimTicks> = Kernel::new(SimTicks::new());
//!
//! let main = KERNEL.init(8, 0).unwrap();
//! let worker = KERNEL.thread_prepare(worker_entry, 0, 0, 4).unwrap();
//! KERNEL.thread_start(worker).unwrap();
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
mod condvar;
mod errors;
mod kernel;
mod mailbox;
mod mutex;
mod sched;
mod thread;
mod timer;
mod waitqueue;

#[cfg(test)]
mod tests;

pub use arch::{Arch, SimArch, SimContext};
pub use condvar::CondVar;
pub use errors::{KernelError, KernelResult};
pub use kernel::{IrqContext, Kernel, IDLE_PRIO};
pub use mailbox::Mailbox;
pub use mutex::{Mutex, RecursiveMutex};
pub use sched::{Wake, PI_CHAIN_MAX};
pub use thread::{ThreadEntry, ThreadId, ThreadStatus};
pub use timer::{SimTicks, TickSource, TickTaskId};

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}
