//! Thread representation: ids, states, and the thread control block arena.
//!
//! Threads live in a push-only arena inside the kernel state. A slot is
//! created by `thread_prepare` and is never freed or reused: a `Finished`
//! thread keeps its slot (and its return code) for the life of the process,
//! which is what lets `thread_join` read the return code at any later time.
//! [`ThreadId`] is therefore a plain, always-valid arena index.

use crate::waitqueue::WaitQueue;

/// Entry point of a thread: a plain function taking one word of argument.
pub type ThreadEntry = fn(usize);

/// Identifies one thread for the lifetime of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThreadId(pub(crate) u32);

impl ThreadId {
    /// Get the raw arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a thread.
///
/// `Running` means "eligible to execute", not "executing right now": every
/// `Running` thread sits in the ready list and the scheduler picks the
/// highest-priority one. There is no time slicing; a thread leaves `Running`
/// only by blocking, exiting, or being administratively paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadStatus {
    /// Slot exists but prepare has not completed.
    Uninitialized = 0,
    /// Entry function returned or the thread called exit. Permanent.
    Finished = 1,
    /// Eligible to run.
    Running = 2,
    /// Blocked on the global wait channel or the irq-wait queue.
    Waiting = 3,
    /// Blocked on a mutex, linked into the owner's waiter queue.
    WaitingOnMutex = 4,
}

/// Which list a thread is currently linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueId {
    /// The global ready list.
    Ready,
    /// The global wait channel (condvars, mailboxes, joins, sleeps).
    Wait,
    /// The interrupt-wait queue.
    IrqWait,
    /// The waiter queue of the thread that owns the contended mutex.
    Waiters(ThreadId),
}

/// Intrusive doubly-linked list hooks stored in every control block.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Link {
    pub prev: Option<ThreadId>,
    pub next: Option<ThreadId>,
}

/// Thread control block.
///
/// `Ctx` is the port's saved-register snapshot. All fields are mutated only
/// while the kernel state lock is held (with interrupts masked on hardware).
pub(crate) struct Tcb<Ctx> {
    /// Saved execution context, valid while the thread is not executing.
    pub ctx: Ctx,
    pub status: ThreadStatus,
    /// Administratively paused: set by prepare, cleared by start. A paused
    /// thread stays out of scheduling even when an unblock matches it.
    pub paused: bool,
    /// Effective (dynamic) priority. 0 is highest.
    pub prio: u8,
    /// Priority configured by the owner, before any inheritance boost.
    pub baseprio: u8,
    /// Wake token: identifies why the thread blocked, rewritten with the
    /// matched value by unblock.
    pub token: u32,
    /// The list this thread is linked into right now.
    pub queue: QueueId,
    pub link: Link,
    /// Threads blocked on a mutex this thread currently owns. The head is
    /// the highest-priority waiter, which makes priority inheritance a
    /// single comparison per chain step.
    pub waiters: WaitQueue,
    /// Return code, valid once status is `Finished`.
    pub rc: u32,
}

impl<Ctx> Tcb<Ctx> {
    pub fn new(ctx: Ctx, prio: u8) -> Self {
        Tcb {
            ctx,
            status: ThreadStatus::Uninitialized,
            paused: false,
            prio,
            baseprio: prio,
            token: 0,
            queue: QueueId::Ready,
            link: Link::default(),
            waiters: WaitQueue::new(),
            rc: 0,
        }
    }

    /// Eligible to be picked by the scheduler.
    pub fn runnable(&self) -> bool {
        self.status == ThreadStatus::Running && !self.paused
    }
}

/// Wake-token namespaces for waits that share the global wait channel.
///
/// Sync objects (mutexes, condvars, mailboxes) draw their identity tokens
/// from [`next_sync_token`], which never sets the top two bits; join and
/// sleep waits carry the target thread id under reserved prefixes, so the
/// three kinds can never collide on the shared queue.
pub(crate) mod token {
    use super::ThreadId;
    use portable_atomic::{AtomicU32, Ordering};

    /// Join waits: `JOIN_BASE | joined-thread-id`.
    pub const JOIN_BASE: u32 = 0x8000_0000;
    /// Sleep and timeout waits: `SLEEP_BASE | sleeping-thread-id`.
    pub const SLEEP_BASE: u32 = 0xC000_0000;

    static NEXT_SYNC_TOKEN: AtomicU32 = AtomicU32::new(1);

    /// Allocate a unique identity token for a sync object.
    pub fn next_sync_token() -> u32 {
        let t = NEXT_SYNC_TOKEN.fetch_add(1, Ordering::Relaxed);
        debug_assert!(t & JOIN_BASE == 0, "sync token space exhausted");
        t
    }

    pub fn join(t: ThreadId) -> u32 {
        JOIN_BASE | t.0
    }

    pub fn sleep(t: ThreadId) -> u32 {
        SLEEP_BASE | t.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tcb_is_uninitialized_and_unboosted() {
        let tcb: Tcb<()> = Tcb::new((), 12);
        assert_eq!(tcb.status, ThreadStatus::Uninitialized);
        assert_eq!(tcb.prio, 12);
        assert_eq!(tcb.baseprio, 12);
        assert!(!tcb.runnable());
    }

    #[test]
    fn paused_thread_is_not_runnable() {
        let mut tcb: Tcb<()> = Tcb::new((), 3);
        tcb.status = ThreadStatus::Running;
        assert!(tcb.runnable());
        tcb.paused = true;
        assert!(!tcb.runnable());
    }

    #[test]
    fn token_namespaces_are_disjoint() {
        let sync = token::next_sync_token();
        let join = token::join(ThreadId(5));
        let sleep = token::sleep(ThreadId(5));
        assert_eq!(sync & 0xC000_0000, 0);
        assert_eq!(join & 0xC000_0000, token::JOIN_BASE);
        assert_eq!(sleep & 0xC000_0000, token::SLEEP_BASE);
    }
}
