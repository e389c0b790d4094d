//! Object locking entry points.
//!
//! [`FastLocking`] tries the fast paths in the order fixed by its [`LockPlan`]
//! and hands everything they cannot finish to a [`SlowPath`]. Each strategy
//! performs at most one CAS; there are no retry loops on this side of the
//! slow path.

use std::{fmt, sync::Arc};

use tinyvec::ArrayVec;

use crate::{
    config::LockingConfig,
    diagnostics::{self, Counter, Counters},
    objectmodel::{header::LockTag, ObjectHeader},
    runtime::{threads::MutatorThread, SlowPath},
};

use self::{
    basic_lock::LockRecord,
    biased::{try_enter_biased, BiasAcquire, BiasConflict, BiasedEnter, Unbiasable},
    inflated::{try_enter_inflated, try_exit_inflated, InflatedEnter, InflatedExit, InflatedSlowExit},
    object_monitor::ObjectMonitor,
    stack_lock::{try_enter_stack, try_exit_stack, StackEnter, StackExit},
};

pub mod basic_lock;
pub mod biased;
pub mod inflated;
pub mod lock_stack;
pub mod object_monitor;
pub mod stack_lock;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnterStep {
    Biased,
    Inflated,
    #[default]
    Stack,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExitStep {
    Biased,
    Recursive,
    Inflated,
    #[default]
    Stack,
}

/// Order in which the fast paths are tried, computed once from the
/// capability switches of a [`LockingConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockPlan {
    enter: ArrayVec<[EnterStep; 3]>,
    exit: ArrayVec<[ExitStep; 4]>,
}

impl LockPlan {
    pub fn new(config: &LockingConfig) -> Self {
        let mut enter = ArrayVec::new();
        let mut exit = ArrayVec::new();

        if !config.use_fast_locking {
            return Self { enter, exit };
        }

        if config.use_biased_locking {
            enter.push(EnterStep::Biased);
            exit.push(ExitStep::Biased);
        }

        exit.push(ExitStep::Recursive);

        if config.inline_fast_lock_supported() {
            enter.push(EnterStep::Inflated);
        }
        if config.inline_fast_unlock_supported() {
            exit.push(ExitStep::Inflated);
        }

        enter.push(EnterStep::Stack);
        exit.push(ExitStep::Stack);

        Self { enter, exit }
    }

    pub fn enter_steps(&self) -> &[EnterStep] {
        &self.enter
    }

    pub fn exit_steps(&self) -> &[ExitStep] {
        &self.exit
    }

    /// Every enter and exit goes to the slow path.
    pub fn is_slow_only(&self) -> bool {
        self.enter.is_empty()
    }
}

/// Why an enter needed the slow path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlowEnter {
    /// Fast locking is switched off.
    Disabled,
    Bias(BiasConflict),
    /// A biased header showed up without a biased fast path to handle it.
    BiasedHeader,
    StackFailed,
    InflatedOwned,
    InflatedFailedCas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockPath {
    Biased(BiasAcquire),
    Stack,
    StackRecursive,
    Inflated,
    Slow(SlowEnter),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlowExit {
    Disabled,
    /// The header stopped pointing at our record: it was inflated meanwhile.
    StackFailed,
    Inflated(InflatedSlowExit),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlockPath {
    Biased,
    Stack,
    StackRecursive,
    Inflated,
    InflatedTransfer,
    Slow(SlowExit),
}

/// Enter/exit of object locks for threads attached to one runtime.
pub struct FastLocking<S: SlowPath> {
    config: Arc<LockingConfig>,
    plan: LockPlan,
    counters: Arc<Counters>,
    slow_path: S,
}

impl<S: SlowPath> FastLocking<S> {
    pub fn new(config: Arc<LockingConfig>, slow_path: S) -> Self {
        let counters = Arc::new(Counters::new(config.profile_monitors));
        Self::with_counters(config, slow_path, counters)
    }

    pub fn with_counters(config: Arc<LockingConfig>, slow_path: S, counters: Arc<Counters>) -> Self {
        let plan = LockPlan::new(&config);
        log::debug!("lock plan: enter {:?}, exit {:?}", plan.enter_steps(), plan.exit_steps());
        Self {
            config,
            plan,
            counters,
            slow_path,
        }
    }

    pub fn config(&self) -> &Arc<LockingConfig> {
        &self.config
    }

    pub fn plan(&self) -> &LockPlan {
        &self.plan
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn slow_path(&self) -> &S {
        &self.slow_path
    }

    /// Returns once `thread` owns the lock of `object`.
    ///
    /// A bias taken here is released without atomics, so another thread can
    /// only revoke it once `thread` is stopped. That happens cooperatively:
    /// while `thread` runs, a contending enter waits until `thread` calls
    /// [`MutatorThread::safepoint_poll`] or is inside
    /// [`MutatorThread::parked_scope`].
    pub fn enter(&self, thread: &MutatorThread, object: &ObjectHeader) -> LockPath {
        let records = thread.lock_records();
        let record = records.push(object);

        let path = match self.try_fast_enter(thread, object, record) {
            Ok(path) => path,
            Err(cause) => {
                self.slow_path.slow_enter(thread, object, record);
                LockPath::Slow(cause)
            }
        };

        self.count_enter(path);
        if self.config.verify_balanced_monitors {
            diagnostics::note_enter(thread);
        }
        diagnostics::trace_event(&self.config, thread, object, &path, records.depth());
        path
    }

    fn try_fast_enter(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        record: &LockRecord,
    ) -> Result<LockPath, SlowEnter> {
        let layout = &self.config.layout;
        let me = thread.id();
        let mut mark = object.mark();

        for step in self.plan.enter_steps() {
            match step {
                EnterStep::Biased => {
                    let prototype = object.class().prototype();
                    match try_enter_biased(object, mark, prototype, me, layout) {
                        BiasedEnter::Acquired(how) => return Ok(LockPath::Biased(how)),
                        BiasedEnter::MustRevokeOrTransfer(conflict) => {
                            return Err(SlowEnter::Bias(conflict));
                        }
                        BiasedEnter::NotBiasable(why) => {
                            self.counters.inc(Counter::Unbiasable);
                            if why == Unbiasable::ClassRevoked {
                                mark = object.mark();
                            }
                        }
                    }
                }
                EnterStep::Inflated => {
                    if mark.tag(layout) == LockTag::Fat {
                        // SAFETY: monitors stay alive as long as the slow path that
                        // published them.
                        let monitor = unsafe { &*(mark.address(layout) as *const ObjectMonitor) };
                        return match try_enter_inflated(monitor, me, record) {
                            InflatedEnter::Acquired => Ok(LockPath::Inflated),
                            InflatedEnter::Owned => Err(SlowEnter::InflatedOwned),
                            InflatedEnter::FailedCas => Err(SlowEnter::InflatedFailedCas),
                        };
                    }
                }
                EnterStep::Stack => {
                    if mark.has_bias_pattern(layout) {
                        return Err(SlowEnter::BiasedHeader);
                    }
                    let sp = thread.lock_records().stack_pointer();
                    return match try_enter_stack(object, mark, record, sp, &self.config) {
                        StackEnter::Acquired => Ok(LockPath::Stack),
                        StackEnter::AcquiredRecursive => Ok(LockPath::StackRecursive),
                        StackEnter::Failed(_) => Err(SlowEnter::StackFailed),
                    };
                }
            }
        }

        Err(SlowEnter::Disabled)
    }

    /// Releases the lock taken by the matching [`enter`](Self::enter).
    ///
    /// # Panics
    ///
    /// If the newest lock record of `thread` is not for `object`.
    pub fn exit(&self, thread: &MutatorThread, object: &ObjectHeader) -> UnlockPath {
        let records = thread.lock_records();
        let record = match records.top() {
            Some(record) if record.holds(object) => record,
            _ => panic!(
                "{:?} exits {:?} without holding it (depth {})",
                thread.id(),
                object,
                records.depth()
            ),
        };

        let path = match self.try_fast_exit(thread, object, record) {
            Ok(path) => path,
            Err(cause) => {
                self.slow_path.slow_exit(thread, object, record);
                UnlockPath::Slow(cause)
            }
        };

        diagnostics::trace_event(&self.config, thread, object, &path, records.depth());
        records.pop();
        self.count_exit(path);
        if self.config.verify_balanced_monitors {
            diagnostics::note_exit(thread);
        }
        path
    }

    fn try_fast_exit(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        record: &LockRecord,
    ) -> Result<UnlockPath, SlowExit> {
        let layout = &self.config.layout;
        let mark = object.mark();

        for step in self.plan.exit_steps() {
            match step {
                ExitStep::Biased => {
                    if mark.has_bias_pattern(layout) {
                        return Ok(UnlockPath::Biased);
                    }
                }
                ExitStep::Recursive => {
                    if record.lock().is_recursive() {
                        return Ok(UnlockPath::StackRecursive);
                    }
                }
                ExitStep::Inflated => {
                    if mark.tag(layout) == LockTag::Fat {
                        // SAFETY: see `try_fast_enter`.
                        let monitor = unsafe { &*(mark.address(layout) as *const ObjectMonitor) };
                        return match try_exit_inflated(monitor, thread.id()) {
                            InflatedExit::Released => Ok(UnlockPath::Inflated),
                            InflatedExit::Transferred => Ok(UnlockPath::InflatedTransfer),
                            InflatedExit::SlowPath(cause) => Err(SlowExit::Inflated(cause)),
                        };
                    }
                }
                ExitStep::Stack => {
                    return match try_exit_stack(object, record, layout) {
                        StackExit::Recursive => Ok(UnlockPath::StackRecursive),
                        StackExit::Released => Ok(UnlockPath::Stack),
                        StackExit::Failed(_) => Err(SlowExit::StackFailed),
                    };
                }
            }
        }

        Err(SlowExit::Disabled)
    }

    /// Locks `object` until the returned guard is dropped.
    pub fn lock<'a>(
        &'a self,
        thread: &'a MutatorThread,
        object: &'a ObjectHeader,
    ) -> ObjectLockGuard<'a, S> {
        let path = self.enter(thread, object);
        ObjectLockGuard {
            locking: self,
            thread,
            object,
            path,
        }
    }

    pub fn synchronized<R>(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        f: impl FnOnce() -> R,
    ) -> R {
        let _guard = self.lock(thread, object);
        f()
    }

    fn count_enter(&self, path: LockPath) {
        if !self.counters.is_enabled() {
            return;
        }

        let counter = match path {
            LockPath::Biased(BiasAcquire::Existing) => Counter::LockBiasExisting,
            LockPath::Biased(BiasAcquire::Acquired) => Counter::LockBiasAcquired,
            LockPath::Biased(BiasAcquire::Transferred) => Counter::LockBiasTransfer,
            LockPath::Stack => Counter::LockCas,
            LockPath::StackRecursive => Counter::LockCasRecursive,
            LockPath::Inflated => Counter::LockInflatedCas,
            LockPath::Slow(cause) => {
                self.counters.inc(Counter::LockStub);
                match cause {
                    SlowEnter::Bias(BiasConflict::EpochExpired) => Counter::LockStubEpochExpired,
                    SlowEnter::Bias(BiasConflict::Revoke) | SlowEnter::BiasedHeader => {
                        Counter::LockStubRevoke
                    }
                    SlowEnter::StackFailed => Counter::LockStubFailedCas,
                    SlowEnter::InflatedOwned => {
                        self.counters.inc(Counter::LockInflatedOwned);
                        Counter::LockStubInflated
                    }
                    SlowEnter::InflatedFailedCas => {
                        self.counters.inc(Counter::LockInflatedFailedCas);
                        Counter::LockStubInflated
                    }
                    SlowEnter::Disabled => return,
                }
            }
        };
        self.counters.inc(counter);
    }

    fn count_exit(&self, path: UnlockPath) {
        if !self.counters.is_enabled() {
            return;
        }

        let counter = match path {
            UnlockPath::Biased => Counter::UnlockBias,
            UnlockPath::Stack => Counter::UnlockCas,
            UnlockPath::StackRecursive => Counter::UnlockCasRecursive,
            UnlockPath::Inflated => Counter::UnlockInflated,
            UnlockPath::InflatedTransfer => Counter::UnlockInflatedTransfer,
            UnlockPath::Slow(cause) => {
                if let SlowExit::Inflated(_) = cause {
                    self.counters.inc(Counter::UnlockStubInflated);
                }
                Counter::UnlockStub
            }
        };
        self.counters.inc(counter);
    }
}

impl<S: SlowPath> fmt::Debug for FastLocking<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastLocking")
            .field("plan", &self.plan)
            .field("counters", &self.counters)
            .finish()
    }
}

/// Holds an object lock; exits it on drop.
pub struct ObjectLockGuard<'a, S: SlowPath> {
    locking: &'a FastLocking<S>,
    thread: &'a MutatorThread,
    object: &'a ObjectHeader,
    path: LockPath,
}

impl<S: SlowPath> ObjectLockGuard<'_, S> {
    /// How the lock was acquired.
    pub fn path(&self) -> LockPath {
        self.path
    }

    pub fn object(&self) -> &ObjectHeader {
        self.object
    }
}

impl<S: SlowPath> Drop for ObjectLockGuard<'_, S> {
    fn drop(&mut self) {
        self.locking.exit(self.thread, self.object);
    }
}
