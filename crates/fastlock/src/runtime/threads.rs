use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};

use crate::{diagnostics::UnbalancedMonitors, sync::lock_stack::LockRecordStack};

/// Thread contexts are aligned so that their address leaves the low lock word
/// bits free when a header is biased to them.
pub const THREAD_ALIGNMENT: usize = 1024;

/// Stable, pointer-sized identity of an attached thread: the address of its
/// [`ThreadContext`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(usize);

impl ThreadId {
    pub(crate) const fn from_word(word: usize) -> Self {
        Self(word)
    }

    pub const fn as_word(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({:#x})", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    /// Thread may touch lock words and lock records at any time.
    Running = 1,
    /// Thread is blocked or waiting and promises not to touch lock state until
    /// it leaves the parked region.
    Parked = 2,
    /// Someone asked this running thread to stop at its next safepoint poll.
    RunningToBlock = 3,
    /// Parked, and must stop before it may run again.
    BlockedInParked = 4,
    Terminated = 5,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::New,
            1 => ThreadState::Running,
            2 => ThreadState::Parked,
            3 => ThreadState::RunningToBlock,
            4 => ThreadState::BlockedInParked,
            5 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::RunningToBlock)
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Parked | Self::BlockedInParked)
    }

    pub fn not_running(&self) -> bool {
        matches!(self, Self::New | Self::Terminated)
    }
}

/// Park/unpark with a sticky token: an `unpark` that arrives before `park`
/// makes the next `park` return immediately.
pub struct Parker {
    token: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub fn park(&self) {
        let mut token = self.token.lock();
        while !*token {
            self.cvar.wait(&mut token);
        }
        *token = false;
    }

    /// Returns `true` when woken by [`unpark`](Self::unpark), `false` on timeout.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let mut token = self.token.lock();
        if !*token {
            self.cvar.wait_for(&mut token, timeout);
        }
        std::mem::replace(&mut *token, false)
    }

    pub fn unpark(&self) {
        let mut token = self.token.lock();
        *token = true;
        self.cvar.notify_one();
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the lock protocol and its runtime keep per thread.
///
/// The address is the thread's [`ThreadId`]. Lock records belong to the
/// owning thread; other threads only look at them while the owner is blocked
/// (see [`block`](Self::block)).
#[repr(C, align(1024))]
pub struct ThreadContext {
    index: usize,
    name: Box<str>,
    state: AtomicU8,
    take_yieldpoint: AtomicBool,
    block_requested: AtomicBool,
    blocked: AtomicBool,
    monitor: Mutex<()>,
    cvar: Condvar,
    parker: Arc<Parker>,
    lock_records: LockRecordStack,
    monitor_balance: AtomicIsize,
}

unsafe impl Send for ThreadContext {}
unsafe impl Sync for ThreadContext {}

impl ThreadContext {
    fn new(index: usize, name: &str, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            name: name.into(),
            state: AtomicU8::new(ThreadState::New as u8),
            take_yieldpoint: AtomicBool::new(false),
            block_requested: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            monitor: Mutex::new(()),
            cvar: Condvar::new(),
            parker: Arc::new(Parker::new()),
            lock_records: LockRecordStack::new(page_size),
            monitor_balance: AtomicIsize::new(0),
        })
    }

    pub fn id(&self) -> ThreadId {
        ThreadId(self as *const Self as usize)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    fn set_exec_status(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn attempt_fast_exec_status_transition(&self, old: ThreadState, new: ThreadState) -> bool {
        self.state
            .compare_exchange_weak(old as u8, new as u8, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn set_blocked_exec_status(&self) -> ThreadState {
        loop {
            let old = self.state();
            let new = match old {
                ThreadState::Running => ThreadState::RunningToBlock,
                ThreadState::Parked => ThreadState::BlockedInParked,
                other => other,
            };

            if self.attempt_fast_exec_status_transition(old, new) {
                break new;
            }
        }
    }

    pub fn parker(&self) -> &Arc<Parker> {
        &self.parker
    }

    pub fn unpark(&self) {
        self.parker.unpark();
    }

    /// # Safety
    ///
    /// Caller is the owning thread, or the owner is blocked (or terminated)
    /// for the whole lifetime of the returned reference.
    pub(crate) unsafe fn lock_records(&self) -> &LockRecordStack {
        &self.lock_records
    }

    pub(crate) fn monitor_balance(&self) -> &AtomicIsize {
        &self.monitor_balance
    }

    /// Turns a pending block request into the blocked state. Caller holds
    /// `self.monitor`.
    fn acknowledge_block_requests(&self) {
        if self.block_requested.swap(false, Ordering::Relaxed) {
            self.blocked.store(true, Ordering::Relaxed);
            self.cvar.notify_all();
        }
    }

    pub fn is_blocked(&self) -> bool {
        let _guard = self.monitor.lock();
        self.blocked.load(Ordering::Relaxed)
    }

    /// Stops this thread on behalf of another one and waits until it is
    /// stopped. A running thread stops at its next safepoint poll; a parked
    /// thread is stopped immediately and cannot leave the parked region until
    /// [`unblock`](Self::unblock) is called.
    ///
    /// The caller must not be this thread and must itself be parked or not a
    /// mutator, otherwise two threads blocking each other deadlock.
    pub fn block(&self) -> ThreadState {
        let mut guard = self.monitor.lock();

        if self.state() == ThreadState::Terminated {
            return ThreadState::Terminated;
        }

        self.block_requested.store(true, Ordering::Relaxed);
        self.take_yieldpoint.store(true, Ordering::Release);
        let new_state = self.set_blocked_exec_status();
        self.cvar.notify_all();

        match new_state {
            ThreadState::RunningToBlock => {
                while self.block_requested.load(Ordering::Relaxed)
                    && !self.blocked.load(Ordering::Relaxed)
                    && self.state() != ThreadState::Terminated
                {
                    self.cvar.wait(&mut guard);
                }
                self.state()
            }
            ThreadState::BlockedInParked => {
                // parked threads can't return to running without the monitor
                // we are holding, so we own it from here on.
                self.block_requested.store(false, Ordering::Relaxed);
                self.blocked.store(true, Ordering::Relaxed);
                new_state
            }
            other => {
                self.block_requested.store(false, Ordering::Relaxed);
                other
            }
        }
    }

    pub fn unblock(&self) {
        let _guard = self.monitor.lock();
        self.block_requested.store(false, Ordering::Relaxed);
        self.blocked.store(false, Ordering::Relaxed);
        self.cvar.notify_all();
    }

    fn check_block(&self) {
        let mut guard = self.monitor.lock();

        loop {
            self.acknowledge_block_requests();
            if !self.blocked.load(Ordering::Relaxed) {
                break;
            }
            log::trace!("thread #{} stopped", self.index);
            self.cvar.wait(&mut guard);
        }

        self.take_yieldpoint.store(false, Ordering::Relaxed);
        self.set_exec_status(ThreadState::Running);
    }

    fn enter_parked(&self) {
        loop {
            let old = self.state();
            if old != ThreadState::Running {
                self.enter_parked_blocked();
                return;
            }

            if self.attempt_fast_exec_status_transition(old, ThreadState::Parked) {
                return;
            }
        }
    }

    fn enter_parked_blocked(&self) {
        let _guard = self.monitor.lock();
        self.set_exec_status(ThreadState::BlockedInParked);
        self.acknowledge_block_requests();
    }

    fn leave_parked(&self) {
        if !self.attempt_fast_exec_status_transition(ThreadState::Parked, ThreadState::Running) {
            self.check_block();
        }
    }

    fn terminate(&self) {
        let _guard = self.monitor.lock();
        self.set_exec_status(ThreadState::Terminated);
        self.block_requested.store(false, Ordering::Relaxed);
        self.cvar.notify_all();
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id())
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

thread_local! {
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

/// Identity of the thread attached on the calling OS thread, if any.
pub fn current_thread_id() -> Option<ThreadId> {
    match CURRENT.with(Cell::get) {
        0 => None,
        word => Some(ThreadId(word)),
    }
}

/// Handle of the calling thread's own [`ThreadContext`].
///
/// It cannot leave the OS thread it was attached on, which is what makes the
/// owner-only operations (lock records, safepoint polls, parking) safe to
/// expose here. Dropping it detaches the thread.
///
/// Stopping a thread is cooperative. A running mutator must call
/// [`safepoint_poll`](Self::safepoint_poll) regularly and wrap anything that
/// blocks (channels, joins, sleeps, other locks) in
/// [`parked_scope`](Self::parked_scope). A thread that does neither stalls
/// every bias revocation that needs to stop it.
pub struct MutatorThread {
    context: Arc<ThreadContext>,
    threads: Arc<Threads>,
    marker: PhantomData<*const ()>,
}

impl MutatorThread {
    pub fn context(&self) -> &Arc<ThreadContext> {
        &self.context
    }

    pub fn lock_records(&self) -> &LockRecordStack {
        // SAFETY: we are the owner.
        unsafe { self.context.lock_records() }
    }

    /// Stops here if another thread asked us to.
    #[inline]
    pub fn safepoint_poll(&self) {
        if self.context.take_yieldpoint.load(Ordering::Acquire) {
            self.context.check_block();
        }
    }

    pub fn enter_parked(&self) {
        self.context.enter_parked();
    }

    pub fn leave_parked(&self) {
        self.context.leave_parked();
    }

    /// Runs `f` parked: other threads may stop and inspect this one meanwhile,
    /// so `f` must not touch lock words or lock records.
    pub fn parked_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.enter_parked();
        let result = f();
        self.leave_parked();
        result
    }

    pub fn park(&self) {
        self.context.parker.park();
    }

    pub fn park_timeout(&self, timeout: Duration) -> bool {
        self.context.parker.park_timeout(timeout)
    }

    /// Detaches, reporting locks that are still held.
    pub fn detach(self) -> Result<(), UnbalancedMonitors> {
        crate::diagnostics::verify_balanced(&self)
    }
}

impl Deref for MutatorThread {
    type Target = ThreadContext;

    fn deref(&self) -> &ThreadContext {
        &self.context
    }
}

impl Drop for MutatorThread {
    fn drop(&mut self) {
        self.context.terminate();
        self.threads.remove(self.context.id());
        CURRENT.with(|current| current.set(0));
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.context.fmt(f)
    }
}

/// Registry of attached threads.
pub struct Threads {
    threads: Mutex<Vec<Arc<ThreadContext>>>,
    /// Held for reading while a thread attaches, for writing while the world
    /// is stopped.
    attach_gate: RwLock<()>,
    next_thread_index: AtomicUsize,
    page_size: usize,
}

/// Every attached thread but one is blocked, and no thread can attach, until
/// this is handed back to [`Threads::unblock_all`].
#[must_use]
pub struct StoppedWorld<'a> {
    stopped: Vec<Arc<ThreadContext>>,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl StoppedWorld<'_> {
    /// The threads that were running or parked and are now blocked.
    pub fn threads(&self) -> &[Arc<ThreadContext>] {
        &self.stopped
    }
}

impl Threads {
    pub fn new(page_size: usize) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            attach_gate: RwLock::new(()),
            next_thread_index: AtomicUsize::new(0),
            page_size,
        }
    }

    /// Registers the calling OS thread. Waits while the world is stopped.
    ///
    /// # Panics
    ///
    /// If the calling OS thread is already attached.
    pub fn attach_current(self: &Arc<Self>, name: &str) -> MutatorThread {
        assert!(
            current_thread_id().is_none(),
            "thread {name:?} is already attached"
        );

        let index = self.next_thread_index.fetch_add(1, Ordering::Relaxed);
        let context = ThreadContext::new(index, name, self.page_size);

        let gate = self.attach_gate.read();
        context.set_exec_status(ThreadState::Running);
        CURRENT.with(|current| current.set(context.id().as_word()));
        self.threads.lock().push(context.clone());
        drop(gate);
        log::debug!("attached thread #{index} {name:?} as {:?}", context.id());

        MutatorThread {
            context,
            threads: self.clone(),
            marker: PhantomData,
        }
    }

    fn remove(&self, id: ThreadId) {
        let mut threads = self.threads.lock();
        if let Some(pos) = threads.iter().position(|thread| thread.id() == id) {
            let thread = threads.swap_remove(pos);
            log::debug!("detached thread #{} {:?}", thread.index(), thread.name());
        }
    }

    pub fn find(&self, id: ThreadId) -> Option<Arc<ThreadContext>> {
        self.threads
            .lock()
            .iter()
            .find(|thread| thread.id() == id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ThreadContext>> {
        self.threads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks every attached thread except `except` and keeps new threads
    /// from attaching until the result is passed to
    /// [`unblock_all`](Self::unblock_all).
    pub fn block_all_except(&self, except: ThreadId) -> StoppedWorld<'_> {
        let gate = self.attach_gate.write();
        let mut stopped = self.snapshot();
        stopped.retain(|thread| thread.id() != except);
        stopped.retain(|thread| !thread.block().not_running());
        StoppedWorld {
            stopped,
            _gate: gate,
        }
    }

    pub fn unblock_all(&self, world: StoppedWorld<'_>) {
        for thread in &world.stopped {
            thread.unblock();
        }
    }
}
