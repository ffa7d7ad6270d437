use super::{kernel, noop};
use crate::{CondVar, Mutex, RecursiveMutex, ThreadStatus};

#[test]
fn try_lock_enforces_exclusion() {
    let k = kernel();
    k.init(10, 0).unwrap();
    let m = Mutex::new();

    assert!(!m.is_locked());
    assert!(m.try_lock(k));
    assert!(m.is_locked());
    assert!(!m.try_lock(k));
    m.unlock(k);
    assert!(!m.is_locked());
    assert!(m.try_lock(k));
}

#[test]
#[should_panic(expected = "recursive lock")]
fn self_lock_panics() {
    let k = kernel();
    k.init(10, 0).unwrap();
    let m = Mutex::new();
    m.lock(k);
    m.lock(k);
}

#[test]
#[should_panic(expected = "not owned")]
fn unlock_by_non_owner_panics() {
    let k = kernel();
    k.init(10, 0).unwrap();
    let m = Mutex::new();
    m.unlock(k);
}

#[test]
fn contended_lock_boosts_and_unlock_reverts() {
    let k = kernel();
    // A at 10 takes the mutex, then B at 5 wants it.
    let a = k.init(10, 0).unwrap();
    let m = Mutex::new();
    m.lock(k);

    let b = k.thread_prepare(noop, 0, 0, 5).unwrap();
    k.thread_start(b).unwrap();
    assert_eq!(k.current_thread(), b);

    // Acting as B: blocks on the mutex, boosting A and handing it the CPU.
    m.lock(k);
    assert_eq!(k.thread_status(b).unwrap(), ThreadStatus::WaitingOnMutex);
    assert_eq!(k.thread_priority(a).unwrap(), 5);
    assert_eq!(k.thread_base_priority(a).unwrap(), 10);
    assert_eq!(k.current_thread(), a);

    // Acting as A: unlock hands the mutex to B and sheds the boost.
    m.unlock(k);
    assert_eq!(k.thread_priority(a).unwrap(), 10);
    assert_eq!(k.thread_status(b).unwrap(), ThreadStatus::Running);
    assert_eq!(k.current_thread(), b);
    assert!(m.is_locked());
}

#[test]
fn inheritance_propagates_along_the_chain() {
    let k = kernel();
    // main at 20 only orchestrates; t3 (15) -> t2 (10) -> t1 (5).
    k.init(20, 0).unwrap();
    let m1 = Mutex::new();
    let m2 = Mutex::new();

    let t3 = k.thread_prepare(noop, 0, 0, 15).unwrap();
    k.thread_start(t3).unwrap();
    assert_eq!(k.current_thread(), t3);
    m1.lock(k); // t3 owns m1

    let t2 = k.thread_prepare(noop, 0, 0, 10).unwrap();
    k.thread_start(t2).unwrap();
    assert_eq!(k.current_thread(), t2);
    m2.lock(k); // t2 owns m2
    m1.lock(k); // t2 blocks on m1; t3 inherits 10
    assert_eq!(k.thread_priority(t3).unwrap(), 10);
    assert_eq!(k.current_thread(), t3);

    let t1 = k.thread_prepare(noop, 0, 0, 5).unwrap();
    k.thread_start(t1).unwrap();
    assert_eq!(k.current_thread(), t1);
    m2.lock(k); // t1 blocks on m2; the boost walks t2 then t3
    assert_eq!(k.thread_priority(t2).unwrap(), 5);
    assert_eq!(k.thread_priority(t3).unwrap(), 5);
    assert_eq!(k.current_thread(), t3);

    // Acting as t3: releasing m1 hands it to t2; t3 reverts fully, t2
    // keeps the boost it still earns from t1.
    m1.unlock(k);
    assert_eq!(k.thread_priority(t3).unwrap(), 15);
    assert_eq!(k.thread_priority(t2).unwrap(), 5);
    assert_eq!(k.current_thread(), t2);

    // Acting as t2: done with both locks; everything reverts stepwise.
    m1.unlock(k);
    m2.unlock(k);
    assert_eq!(k.thread_priority(t2).unwrap(), 10);
    assert_eq!(k.thread_status(t1).unwrap(), ThreadStatus::Running);
    assert_eq!(k.current_thread(), t1);
}

#[test]
fn recursive_mutex_counts_locks() {
    let k = kernel();
    k.init(10, 0).unwrap();
    let m = RecursiveMutex::new();

    m.lock(k);
    m.lock(k);
    assert!(m.is_locked());
    m.unlock(k);
    assert!(m.is_locked());
    m.unlock(k);
    assert!(!m.is_locked());
}

#[test]
fn condvar_wait_releases_the_mutex() {
    let k = kernel();
    let main = k.init(10, 0).unwrap();
    let m = Mutex::new();
    let cv = CondVar::new();

    let w = k.thread_prepare(noop, 0, 0, 5).unwrap();
    k.thread_start(w).unwrap();
    assert_eq!(k.current_thread(), w);

    // Acting as the worker: take the lock and wait.
    m.lock(k);
    cv.wait(k, &m);
    assert_eq!(k.thread_status(w).unwrap(), ThreadStatus::Waiting);
    assert!(!m.is_locked());
    assert_eq!(k.current_thread(), main);

    // Signal from main; the worker outranks us and takes over.
    assert!(cv.signal(k));
    assert_eq!(k.thread_status(w).unwrap(), ThreadStatus::Running);
    assert_eq!(k.current_thread(), w);

    // Nobody left to signal.
    assert!(!cv.signal(k));
}

#[test]
fn condvar_wait_hands_the_mutex_to_a_blocked_locker() {
    let k = kernel();
    // The condvar waiter holds the mutex while another thread is blocked
    // on it; going into the wait must hand the mutex straight over.
    let main = k.init(10, 0).unwrap();
    let m = Mutex::new();
    let cv = CondVar::new();

    let w = k.thread_prepare(noop, 0, 0, 5).unwrap();
    k.thread_start(w).unwrap();

    // Acting as the worker: own the mutex, then park on an interrupt so
    // main gets a turn while the lock is held.
    m.lock(k);
    assert_eq!(k.irq_wait(0x1), 0);
    assert_eq!(k.current_thread(), main);

    // Main blocks on the held mutex; with both threads asleep only the
    // idle thread is left.
    m.lock(k);
    assert_eq!(k.thread_status(main).unwrap(), ThreadStatus::WaitingOnMutex);

    // The interrupt arrives and the worker resumes.
    k.irq_scope(|cx| cx.note_irq(0x1));
    k.post_irq_switch();
    assert_eq!(k.current_thread(), w);

    // Acting as the worker: waiting on the condvar promotes main to
    // mutex owner in the same kernel-lock section.
    cv.wait(k, &m);
    assert!(m.is_locked());
    assert_eq!(k.thread_status(main).unwrap(), ThreadStatus::Running);
    assert_eq!(k.current_thread(), main);
    assert_eq!(k.thread_status(w).unwrap(), ThreadStatus::Waiting);
}

#[test]
fn broadcast_wakes_every_waiter() {
    let k = kernel();
    let main = k.init(10, 0).unwrap();
    let m = Mutex::new();
    let cv = CondVar::new();

    let w1 = k.thread_prepare(noop, 0, 0, 5).unwrap();
    let w2 = k.thread_prepare(noop, 0, 0, 6).unwrap();
    k.thread_start(w1).unwrap();
    // Acting as w1.
    m.lock(k);
    cv.wait(k, &m);
    assert_eq!(k.current_thread(), main);
    k.thread_start(w2).unwrap();
    // Acting as w2.
    m.lock(k);
    cv.wait(k, &m);
    assert_eq!(k.current_thread(), main);

    assert_eq!(cv.broadcast(k), 2);
    assert_eq!(k.thread_status(w1).unwrap(), ThreadStatus::Running);
    assert_eq!(k.thread_status(w2).unwrap(), ThreadStatus::Running);
    // The best waiter preempts the broadcaster.
    assert_eq!(k.current_thread(), w1);
}
