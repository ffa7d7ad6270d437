//! Fixed-capacity message mailboxes.
//!
//! A mailbox is a ring of `u32` messages plus two wake tokens, one for
//! blocked receivers and one for blocked senders, both parked on the
//! global wait channel. The ring has its own lock but it is only ever
//! taken inside a kernel-lock section, so it never contends.
//!
//! Interrupt handlers may post with [`IrqContext::mailbox_try_send`];
//! everything that can block is thread-context only.

use alloc::boxed::Box;
use alloc::vec;

use crate::arch::Arch;
use crate::kernel::{IrqContext, Kernel};
use crate::sched::Wake;
use crate::thread::{token, QueueId, ThreadStatus};
use crate::timer::TickSource;

struct Ring {
    slots: Box<[u32]>,
    /// Read index.
    cur: usize,
    /// Number of queued messages.
    pending: usize,
}

impl Ring {
    fn push(&mut self, msg: u32) -> bool {
        if self.pending == self.slots.len() {
            return false;
        }
        let at = (self.cur + self.pending) % self.slots.len();
        self.slots[at] = msg;
        self.pending += 1;
        true
    }

    fn pop(&mut self) -> Option<u32> {
        if self.pending == 0 {
            return None;
        }
        let msg = self.slots[self.cur];
        self.cur = (self.cur + 1) % self.slots.len();
        self.pending -= 1;
        Some(msg)
    }
}

pub struct Mailbox {
    recv_token: u32,
    send_token: u32,
    ring: spin::Mutex<Ring>,
}

impl Mailbox {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "mailbox capacity must be nonzero");
        Mailbox {
            recv_token: token::next_sync_token(),
            send_token: token::next_sync_token(),
            ring: spin::Mutex::new(Ring {
                slots: vec![0; capacity].into_boxed_slice(),
                cur: 0,
                pending: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Post a message if the ring has room. Never blocks.
    pub fn try_send<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>, msg: u32) -> bool {
        let irq = A::irq_lock();
        let mut st = k.state.lock();
        if !self.ring.lock().push(msg) {
            drop(st);
            A::irq_unlock(irq);
            return false;
        }
        let (_, candidate) = st.unblock(QueueId::Wait, 1, Wake::TokenEquals(self.recv_token));
        let sw = candidate.and_then(|c| st.resched(c, false));
        k.commit(st, irq, sw);
        true
    }

    /// Take the oldest message if there is one. Never blocks.
    pub fn try_recv<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) -> Option<u32> {
        let irq = A::irq_lock();
        let mut st = k.state.lock();
        let msg = self.ring.lock().pop();
        let sw = match msg {
            Some(_) => {
                // Room opened up; release one blocked sender.
                let (_, candidate) =
                    st.unblock(QueueId::Wait, 1, Wake::TokenEquals(self.send_token));
                candidate.and_then(|c| st.resched(c, false))
            }
            None => None,
        };
        k.commit(st, irq, sw);
        msg
    }

    /// Take the oldest message, blocking until one is posted.
    ///
    /// On the simulation port a blocked call returns 0 immediately; see
    /// the kernel module docs.
    pub fn recv<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>) -> u32 {
        loop {
            let irq = A::irq_lock();
            let mut st = k.state.lock();
            let me = st.current;

            if let Some(msg) = self.ring.lock().pop() {
                let (_, candidate) =
                    st.unblock(QueueId::Wait, 1, Wake::TokenEquals(self.send_token));
                let sw = candidate.and_then(|c| st.resched(c, false));
                k.commit(st, irq, sw);
                return msg;
            }

            let sw = st.block_current(QueueId::Wait, self.recv_token, ThreadStatus::Waiting);
            k.commit(st, irq, Some(sw));

            let irq = A::irq_lock();
            let st = k.state.lock();
            let suspended = st.current != me;
            drop(st);
            A::irq_unlock(irq);
            if suspended {
                return 0;
            }
            // Resumed: a sender posted. Re-check, someone may have raced
            // us to the message.
        }
    }

    /// Post a message, blocking until the ring has room.
    pub fn send<A: Arch, T: TickSource>(&self, k: &Kernel<A, T>, msg: u32) {
        loop {
            let irq = A::irq_lock();
            let mut st = k.state.lock();
            let me = st.current;

            if self.ring.lock().push(msg) {
                let (_, candidate) =
                    st.unblock(QueueId::Wait, 1, Wake::TokenEquals(self.recv_token));
                let sw = candidate.and_then(|c| st.resched(c, false));
                k.commit(st, irq, sw);
                return;
            }

            let sw = st.block_current(QueueId::Wait, self.send_token, ThreadStatus::Waiting);
            k.commit(st, irq, Some(sw));

            let irq = A::irq_lock();
            let st = k.state.lock();
            let suspended = st.current != me;
            drop(st);
            A::irq_unlock(irq);
            if suspended {
                return;
            }
        }
    }
}

impl<Ctx> IrqContext<'_, Ctx> {
    /// Post a message from interrupt context. Never blocks; returns false
    /// if the ring is full. Any receiver woken is a deferred-switch
    /// candidate, not an immediate one.
    pub fn mailbox_try_send(&mut self, mbox: &Mailbox, msg: u32) -> bool {
        if !mbox.ring.lock().push(msg) {
            return false;
        }
        let (_, candidate) = self
            .st
            .unblock(QueueId::Wait, 1, Wake::TokenEquals(mbox.recv_token));
        if let Some(c) = candidate {
            self.st.resched(c, true);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo_and_bounded() {
        let mut ring = Ring {
            slots: vec![0; 2].into_boxed_slice(),
            cur: 0,
            pending: 0,
        };
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(!ring.push(3));
        assert_eq!(ring.pop(), Some(1));
        assert!(ring.push(3));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }
}
