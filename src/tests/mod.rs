//! Scenario tests running the whole kernel on the simulation port.
//!
//! The simulated context switch is a no-op, so a blocked call returns to
//! the test immediately while the scheduler state is exactly what it would
//! be on hardware at the moment of suspension. The test then acts as
//! whichever thread the kernel currently considers running and inspects
//! the rest through the accessors.

use alloc::boxed::Box;

use crate::{Kernel, SimArch, SimTicks};

mod sync;
mod timers;

fn kernel() -> &'static Kernel<SimArch, SimTicks> {
    Box::leak(Box::new(Kernel::new(SimTicks::new())))
}

fn noop(_arg: usize) {}
