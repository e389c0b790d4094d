//! Fast enter/exit on an already inflated monitor. Anything beyond a single
//! owner CAS or a simple release is left to the monitor's blocking paths.

use std::sync::atomic::{fence, Ordering};

use crate::runtime::threads::ThreadId;

use super::{basic_lock::LockRecord, object_monitor::ObjectMonitor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InflatedEnter {
    Acquired,
    /// Somebody (possibly us, recursively) owns the monitor.
    Owned,
    FailedCas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InflatedExit {
    /// Released and nobody is waiting.
    Released,
    /// Released, and a successor is on its way or already took the lock.
    Transferred,
    SlowPath(InflatedSlowExit),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InflatedSlowExit {
    /// Not the owner, or a recursive exit.
    NotSimple,
    /// Waiters are queued and none of them was woken yet.
    NoSuccessor,
    /// The successor gave up before we released; we own the monitor again.
    Reacquired,
}

pub fn try_enter_inflated(
    monitor: &ObjectMonitor,
    thread: ThreadId,
    record: &LockRecord,
) -> InflatedEnter {
    // any non-zero value keeps the exit from taking the record for a nested
    // stack lock.
    record.mark_non_recursive();

    let owner = monitor.owner_field();
    if owner.load(Ordering::Relaxed) != 0 {
        return InflatedEnter::Owned;
    }

    match owner.compare_exchange(0, thread.as_word(), Ordering::SeqCst, Ordering::Relaxed) {
        Ok(_) => InflatedEnter::Acquired,
        Err(_) => InflatedEnter::FailedCas,
    }
}

pub fn try_exit_inflated(monitor: &ObjectMonitor, thread: ThreadId) -> InflatedExit {
    let owner = monitor.owner_field();
    if owner.load(Ordering::Relaxed) != thread.as_word()
        || monitor.recursions_field().load(Ordering::Relaxed) != 0
    {
        return InflatedExit::SlowPath(InflatedSlowExit::NotSimple);
    }

    if monitor.queue_heads() == 0 {
        fence(Ordering::Release);
        owner.store(0, Ordering::Relaxed);
        return InflatedExit::Released;
    }

    let succ = monitor.succ_field();
    if succ.load(Ordering::Relaxed) == 0 {
        return InflatedExit::SlowPath(InflatedSlowExit::NoSuccessor);
    }

    fence(Ordering::Release);
    owner.store(0, Ordering::Relaxed);
    // a successor that parks between the release and this re-read must be seen.
    fence(Ordering::SeqCst);

    if succ.load(Ordering::Relaxed) != 0 {
        return InflatedExit::Transferred;
    }

    match owner.compare_exchange(0, thread.as_word(), Ordering::SeqCst, Ordering::Relaxed) {
        Ok(_) => InflatedExit::SlowPath(InflatedSlowExit::Reacquired),
        Err(_) => InflatedExit::Transferred,
    }
}
