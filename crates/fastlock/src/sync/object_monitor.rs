use std::{
    fmt,
    hint::spin_loop,
    mem::offset_of,
    ptr::{self, null_mut},
    sync::{
        atomic::{fence, AtomicIsize, AtomicPtr, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    objectmodel::{header::LockWord, ObjectHeader},
    runtime::threads::{MutatorThread, Parker, ThreadId},
};

pub const TS_RUN: u8 = 2;
pub const TS_ENTER: u8 = 4;
pub const TS_CXQ: u8 = 5;

const RECHECK_INITIAL: Duration = Duration::from_millis(1);
const RECHECK_MAX: Duration = Duration::from_millis(1000);

/// Queue node of a thread blocked on a monitor. Lives in the blocked thread's
/// frame for as long as it is linked.
pub struct ObjectWaiter {
    next: AtomicPtr<Self>,
    thread: ThreadId,
    parker: Arc<Parker>,
    tstate: AtomicU8,
}

impl ObjectWaiter {
    pub(crate) fn new(thread: ThreadId, parker: Arc<Parker>) -> Self {
        Self {
            next: AtomicPtr::new(null_mut()),
            thread,
            parker,
            tstate: AtomicU8::new(TS_RUN),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn tstate(&self) -> u8 {
        self.tstate.load(Ordering::Relaxed)
    }
}

/// Inflated lock of one object.
///
/// `owner` is zero, the [`ThreadId`] of the owner, or the address of the lock
/// record of a thread that held a thin lock on the object when it was
/// inflated ("anonymous" owner; converted on that thread's next enter/exit).
///
/// Field discipline:
/// - `owner` changes by CAS only, except the release store by the owner.
/// - `recursions` is touched only by the owner.
/// - `cxq`/`entry_list` are modified under `queue_lock`; their heads may be
///   read without it.
/// - `succ` is a hint and may be read racily.
#[repr(C, align(64))]
pub struct ObjectMonitor {
    /// Header of the object before it was inflated.
    header: AtomicUsize,
    object: AtomicPtr<ObjectHeader>,
    owner: AtomicUsize,
    /// Only written by `exit()` so it can share the owner's cache line.
    previous_owner: AtomicUsize,
    recursions: AtomicIsize,
    cxq: AtomicPtr<ObjectWaiter>,
    entry_list: AtomicPtr<ObjectWaiter>,
    succ: AtomicUsize,
    responsible: AtomicUsize,
    contentions: AtomicUsize,
    queue_lock: Mutex<()>,
}

impl ObjectMonitor {
    pub const OWNER_OFFSET: usize = offset_of!(Self, owner);
    pub const RECURSIONS_OFFSET: usize = offset_of!(Self, recursions);
    pub const CXQ_OFFSET: usize = offset_of!(Self, cxq);
    pub const ENTRY_LIST_OFFSET: usize = offset_of!(Self, entry_list);
    pub const SUCC_OFFSET: usize = offset_of!(Self, succ);

    pub(crate) fn new(object: &ObjectHeader, header: LockWord, owner: usize) -> Self {
        Self {
            header: AtomicUsize::new(header.raw()),
            object: AtomicPtr::new(ptr::from_ref(object).cast_mut()),
            owner: AtomicUsize::new(owner),
            previous_owner: AtomicUsize::new(0),
            recursions: AtomicIsize::new(0),
            cxq: AtomicPtr::new(null_mut()),
            entry_list: AtomicPtr::new(null_mut()),
            succ: AtomicUsize::new(0),
            responsible: AtomicUsize::new(0),
            contentions: AtomicUsize::new(0),
            queue_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn header(&self) -> LockWord {
        LockWord::from_raw(self.header.load(Ordering::Relaxed))
    }

    pub fn object(&self) -> *const ObjectHeader {
        self.object.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.owner() == thread.as_word()
    }

    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    pub fn succ(&self) -> usize {
        self.succ.load(Ordering::Relaxed)
    }

    pub fn previous_owner(&self) -> usize {
        self.previous_owner.load(Ordering::Relaxed)
    }

    pub fn contentions(&self) -> usize {
        self.contentions.load(Ordering::Relaxed)
    }

    pub fn has_waiters(&self) -> bool {
        !self.cxq.load(Ordering::Relaxed).is_null()
            || !self.entry_list.load(Ordering::Relaxed).is_null()
    }

    pub(crate) fn owner_field(&self) -> &AtomicUsize {
        &self.owner
    }

    pub(crate) fn recursions_field(&self) -> &AtomicIsize {
        &self.recursions
    }

    pub(crate) fn succ_field(&self) -> &AtomicUsize {
        &self.succ
    }

    pub(crate) fn queue_heads(&self) -> usize {
        self.cxq.load(Ordering::Relaxed) as usize | self.entry_list.load(Ordering::Relaxed) as usize
    }

    pub fn try_lock(&self, thread: ThreadId) -> bool {
        self.owner.load(Ordering::Relaxed) == 0
            && self
                .owner
                .compare_exchange(0, thread.as_word(), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
    }

    /// Blocking enter. Handles recursion and the anonymous owner left behind by
    /// inflating a thin lock of this thread.
    pub fn enter(&self, thread: &MutatorThread, spin_limit: u32) {
        let me = thread.id();

        match self.owner.compare_exchange(
            0,
            me.as_word(),
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(owner) if owner == me.as_word() => {
                self.recursions.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(owner) if thread.lock_records().owns(owner) => {
                self.recursions.store(1, Ordering::Relaxed);
                self.owner.store(me.as_word(), Ordering::Relaxed);
                return;
            }
            Err(_) => {}
        }

        for _ in 0..spin_limit {
            spin_loop();
            if self.try_lock(me) {
                return;
            }
        }

        self.contentions.fetch_add(1, Ordering::Relaxed);
        thread.parked_scope(|| self.enter_contended(thread));
        self.contentions.fetch_sub(1, Ordering::Relaxed);
    }

    fn enter_contended(&self, thread: &MutatorThread) {
        let me = thread.id();
        let node = Box::new(ObjectWaiter::new(me, thread.parker().clone()));
        node.tstate.store(TS_CXQ, Ordering::Relaxed);
        self.enqueue(&node);

        let mut recheck = RECHECK_INITIAL;
        loop {
            if self.try_lock(me) {
                break;
            }

            if self.responsible.load(Ordering::Relaxed) == 0 {
                let _ = self.responsible.compare_exchange(
                    0,
                    me.as_word(),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                );
            }

            // One waiter parks with a timeout: an exit that saw empty queues
            // right before we enqueued would otherwise strand everybody.
            if self.responsible.load(Ordering::Relaxed) == me.as_word() {
                thread.park_timeout(recheck);
                recheck = (recheck * 8).min(RECHECK_MAX);
            } else {
                thread.park();
            }

            if self.try_lock(me) {
                break;
            }

            let _ = self.succ.compare_exchange(
                me.as_word(),
                0,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            fence(Ordering::SeqCst);
        }

        self.unlink(&node);
        let _ = self
            .succ
            .compare_exchange(me.as_word(), 0, Ordering::Relaxed, Ordering::Relaxed);
        let _ = self.responsible.compare_exchange(
            me.as_word(),
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        fence(Ordering::SeqCst);
    }

    /// Pushes `waiter` onto the contention queue.
    pub(crate) fn enqueue(&self, waiter: &ObjectWaiter) {
        let _guard = self.queue_lock.lock();
        waiter
            .next
            .store(self.cxq.load(Ordering::Relaxed), Ordering::Relaxed);
        self.cxq
            .store(ptr::from_ref(waiter).cast_mut(), Ordering::Relaxed);
        drop(_guard);
        fence(Ordering::SeqCst);
    }

    pub(crate) fn unlink(&self, waiter: &ObjectWaiter) {
        let _guard = self.queue_lock.lock();
        let target = ptr::from_ref(waiter).cast_mut();
        let head = if waiter.tstate() == TS_CXQ {
            &self.cxq
        } else {
            &self.entry_list
        };

        let mut link: &AtomicPtr<ObjectWaiter> = head;
        loop {
            let current = link.load(Ordering::Relaxed);
            if current.is_null() {
                break;
            }
            if current == target {
                link.store(waiter.next.load(Ordering::Relaxed), Ordering::Relaxed);
                break;
            }
            // SAFETY: linked nodes stay alive until they unlink themselves,
            // which needs the queue lock we hold.
            link = unsafe { &(*current).next };
        }

        waiter.next.store(null_mut(), Ordering::Relaxed);
        waiter.tstate.store(TS_RUN, Ordering::Relaxed);
    }

    /// Moves everything on `cxq` to `entry_list`, oldest first. Caller holds
    /// the queue lock.
    fn drain_cxq(&self) {
        let mut node = self.cxq.swap(null_mut(), Ordering::Relaxed);
        let mut reversed: *mut ObjectWaiter = null_mut();
        while !node.is_null() {
            // SAFETY: see `unlink`.
            let waiter = unsafe { &*node };
            let next = waiter.next.load(Ordering::Relaxed);
            waiter.next.store(reversed, Ordering::Relaxed);
            waiter.tstate.store(TS_ENTER, Ordering::Relaxed);
            reversed = node;
            node = next;
        }
        self.entry_list.store(reversed, Ordering::Relaxed);
    }

    /// Blocking exit: releases one level of ownership and, if needed, picks
    /// and wakes a successor.
    ///
    /// # Panics
    ///
    /// If `thread` does not own the monitor.
    pub fn exit(&self, thread: &MutatorThread) {
        let me = thread.id();
        let owner = self.owner.load(Ordering::Relaxed);

        if owner != me.as_word() {
            if owner != 0 && thread.lock_records().owns(owner) {
                self.owner.store(me.as_word(), Ordering::Relaxed);
                self.recursions.store(0, Ordering::Relaxed);
            } else {
                panic!(
                    "{:?} exits monitor {:#x} owned by {:#x}",
                    me,
                    self.address(),
                    owner
                );
            }
        }

        let recursions = self.recursions.load(Ordering::Relaxed);
        if recursions != 0 {
            self.recursions.store(recursions - 1, Ordering::Relaxed);
            return;
        }

        self.previous_owner.store(me.as_word(), Ordering::Relaxed);

        loop {
            self.owner.store(0, Ordering::Release);
            fence(Ordering::SeqCst);

            if self.queue_heads() == 0 || self.succ.load(Ordering::Relaxed) != 0 {
                return;
            }

            // somebody is queued and nobody is on the way: get the lock back
            // to choose a successor, unless another thread took it already.
            if self
                .owner
                .compare_exchange(0, me.as_word(), Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return;
            }

            let guard = self.queue_lock.lock();
            if self.entry_list.load(Ordering::Relaxed).is_null() {
                self.drain_cxq();
            }

            let head = self.entry_list.load(Ordering::Relaxed);
            if head.is_null() {
                drop(guard);
                continue;
            }

            // SAFETY: see `unlink`.
            let (successor, parker) = unsafe { ((*head).thread, (*head).parker.clone()) };
            self.succ.store(successor.as_word(), Ordering::Relaxed);
            drop(guard);

            self.owner.store(0, Ordering::Release);
            fence(Ordering::SeqCst);
            parker.unpark();
            return;
        }
    }
}

impl fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("owner", &format_args!("{:#x}", self.owner()))
            .field("recursions", &self.recursions())
            .field("succ", &format_args!("{:#x}", self.succ()))
            .field("has_waiters", &self.has_waiters())
            .finish()
    }
}
