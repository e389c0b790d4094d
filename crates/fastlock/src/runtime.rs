//! Reference host for the lock protocol: thread registry, monitor inflation,
//! the blocking slow paths and bias revocation.

use std::{ptr, sync::Arc, thread};

use parking_lot::Mutex;

use crate::{
    config::{ConfigError, LockingConfig},
    diagnostics::{Counters, UnbalancedMonitors},
    objectmodel::{
        header::{LockState, LockWord},
        LockClass, ObjectHeader,
    },
    sync::{
        basic_lock::{BasicLock, LockRecord},
        object_monitor::ObjectMonitor,
        stack_lock::{try_enter_stack, StackEnter},
        FastLocking,
    },
};

use self::threads::{MutatorThread, Threads};

pub mod options;
pub mod revocation;
pub mod threads;

/// Where the fast paths go when they cannot finish on their own.
///
/// Both calls may block. The lock record passed in is the one the fast path
/// pushed for this enter (or is about to pop for this exit).
///
/// # Safety
///
/// A fat lock word points at an [`ObjectMonitor`] and the fast paths
/// dereference it. Implementations must keep every monitor they publish in a
/// header alive for as long as they are themselves alive.
pub unsafe trait SlowPath: Send + Sync {
    fn slow_enter(&self, thread: &MutatorThread, object: &ObjectHeader, record: &LockRecord);
    fn slow_exit(&self, thread: &MutatorThread, object: &ObjectHeader, record: &LockRecord);
}

unsafe impl<T: SlowPath> SlowPath for Arc<T> {
    fn slow_enter(&self, thread: &MutatorThread, object: &ObjectHeader, record: &LockRecord) {
        (**self).slow_enter(thread, object, record)
    }

    fn slow_exit(&self, thread: &MutatorThread, object: &ObjectHeader, record: &LockRecord) {
        (**self).slow_exit(thread, object, record)
    }
}

pub struct MonitorRuntime {
    config: Arc<LockingConfig>,
    threads: Arc<Threads>,
    /// Never shrinks; a published monitor must outlive every header that may
    /// still point at it.
    monitors: Mutex<Vec<Box<ObjectMonitor>>>,
    revocation_lock: Mutex<()>,
    counters: Arc<Counters>,
}

impl MonitorRuntime {
    pub fn new(config: LockingConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        log::debug!(
            "monitor runtime: fast locking {}, biased locking {}, inflated fast paths {}/{}",
            config.use_fast_locking,
            config.use_biased_locking,
            config.inline_fast_lock_supported(),
            config.inline_fast_unlock_supported()
        );

        Ok(Arc::new(Self {
            threads: Arc::new(Threads::new(config.page_size)),
            counters: Arc::new(Counters::new(config.profile_monitors)),
            config: Arc::new(config),
            monitors: Mutex::new(Vec::new()),
            revocation_lock: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &Arc<LockingConfig> {
        &self.config
    }

    pub fn threads(&self) -> &Arc<Threads> {
        &self.threads
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// A dispatcher that falls back to this runtime and shares its counters.
    pub fn locking(self: &Arc<Self>) -> FastLocking<Arc<Self>> {
        FastLocking::with_counters(self.config.clone(), self.clone(), self.counters.clone())
    }

    /// New objects of the class start anonymously biased when biased locking
    /// is on, neutral otherwise.
    pub fn new_class(&self, name: &str) -> Arc<LockClass> {
        let layout = &self.config.layout;
        let prototype = if self.config.use_biased_locking {
            LockWord::biased_prototype(0, layout)
        } else {
            LockWord::neutral(0, layout)
        };
        LockClass::new(name, prototype)
    }

    pub fn attach_current_thread(&self, name: &str) -> MutatorThread {
        self.threads.attach_current(name)
    }

    /// Detaches `thread`. With balanced-monitor verification on, locks still
    /// held are reported.
    pub fn detach_current_thread(&self, thread: MutatorThread) -> Result<(), UnbalancedMonitors> {
        if self.config.verify_balanced_monitors {
            thread.detach()
        } else {
            drop(thread);
            Ok(())
        }
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }

    fn allocate_monitor(&self, object: &ObjectHeader, header: LockWord, owner: usize) -> &ObjectMonitor {
        let monitor = Box::new(ObjectMonitor::new(object, header, owner));
        let address = ptr::from_ref(&*monitor);
        self.monitors.lock().push(monitor);
        // SAFETY: boxed monitors are never dropped before `self`.
        unsafe { &*address }
    }

    /// Waits for another thread to finish installing a monitor.
    fn wait_for_inflation(&self, thread: &MutatorThread) {
        thread.safepoint_poll();
        thread::yield_now();
    }

    /// Returns the monitor of `object`, installing one if necessary.
    ///
    /// A thin lock becomes a monitor owned by the lock record that held it;
    /// its thread claims it on its next enter or exit.
    pub fn inflate(&self, thread: &MutatorThread, object: &ObjectHeader) -> &ObjectMonitor {
        let layout = &self.config.layout;

        loop {
            let mark = object.mark();
            let (header, owner) = match mark.decode(layout) {
                LockState::Fat { monitor } => {
                    // SAFETY: published by `self`.
                    return unsafe { &*(monitor as *const ObjectMonitor) };
                }
                LockState::Inflating => {
                    self.wait_for_inflation(thread);
                    continue;
                }
                LockState::Biased { .. } => {
                    self.revoke_bias(thread, object);
                    continue;
                }
                LockState::Marked => panic!("inflating marked object {object:?}"),
                LockState::Unlocked { .. } => (mark, 0),
                LockState::Thin { record } => (LockWord::INFLATING, record),
            };

            if object.cas_mark(mark, LockWord::INFLATING).is_err() {
                continue;
            }

            let header = if owner == 0 {
                header
            } else {
                // SAFETY: while the header is INFLATING the thin owner cannot
                // release, so its record and displaced header stay put.
                unsafe { (*(owner as *const LockRecord)).lock().displaced_header() }
            };

            let monitor = self.allocate_monitor(object, header, owner);
            object.set_mark(LockWord::fat(monitor.address(), layout));
            log::debug!(
                "inflated {:?} (displaced {}, owner {:#x})",
                object,
                header,
                owner
            );
            return monitor;
        }
    }

    fn enter_monitor(&self, thread: &MutatorThread, monitor: usize, record: &LockRecord) {
        record.mark_non_recursive();
        // SAFETY: published by `self`.
        let monitor = unsafe { &*(monitor as *const ObjectMonitor) };
        monitor.enter(thread, self.config.monitor_spin_limit);
    }
}

unsafe impl SlowPath for MonitorRuntime {
    fn slow_enter(&self, thread: &MutatorThread, object: &ObjectHeader, record: &LockRecord) {
        let layout = &self.config.layout;
        let records = thread.lock_records();

        loop {
            let mark = object.mark();
            match mark.decode(layout) {
                LockState::Biased { .. } => {
                    self.revoke_bias_for_enter(thread, object, record);
                }
                LockState::Unlocked { .. } => {
                    let sp = records.stack_pointer();
                    match try_enter_stack(object, mark, record, sp, &self.config) {
                        StackEnter::Acquired | StackEnter::AcquiredRecursive => return,
                        StackEnter::Failed(_) => {}
                    }
                }
                LockState::Thin { record: holder } if records.owns(holder) => {
                    record.lock().set_displaced_header(BasicLock::RECURSIVE);
                    return;
                }
                LockState::Thin { .. } => {
                    let monitor = self.inflate(thread, object);
                    self.enter_monitor(thread, monitor.address(), record);
                    return;
                }
                LockState::Fat { monitor } => {
                    self.enter_monitor(thread, monitor, record);
                    return;
                }
                LockState::Inflating => self.wait_for_inflation(thread),
                LockState::Marked => panic!("{:?} locks marked object {object:?}", thread.id()),
            }
        }
    }

    fn slow_exit(&self, thread: &MutatorThread, object: &ObjectHeader, record: &LockRecord) {
        let layout = &self.config.layout;

        loop {
            let mark = object.mark();
            match mark.decode(layout) {
                LockState::Biased { .. } => return,
                _ if record.lock().is_recursive() => return,
                LockState::Thin { record: holder } => {
                    assert_eq!(
                        holder,
                        record.address(),
                        "{:?} exits {object:?} locked through another record",
                        thread.id()
                    );
                    if object
                        .cas_mark(mark, record.lock().displaced_header())
                        .is_ok()
                    {
                        return;
                    }
                }
                LockState::Fat { monitor } => {
                    // SAFETY: published by `self`.
                    let monitor = unsafe { &*(monitor as *const ObjectMonitor) };
                    monitor.exit(thread);
                    return;
                }
                LockState::Inflating => self.wait_for_inflation(thread),
                LockState::Unlocked { .. } | LockState::Marked => {
                    panic!("{:?} exits {object:?} which is not locked", thread.id())
                }
            }
        }
    }
}

impl std::fmt::Debug for MonitorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRuntime")
            .field("threads", &self.threads.len())
            .field("monitors", &self.monitor_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::test_config, sync::LockPath};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    };

    #[test]
    fn invalid_config_is_rejected() {
        let config = LockingConfig {
            page_size: 1000,
            ..test_config()
        };
        assert!(matches!(
            MonitorRuntime::new(config),
            Err(ConfigError::PageSize(1000))
        ));
    }

    #[test]
    fn classes_follow_biased_locking_switch() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let layout = &runtime.config().layout;
        assert!(runtime.new_class("A").prototype().has_bias_pattern(layout));

        let runtime = MonitorRuntime::new(LockingConfig {
            use_biased_locking: false,
            ..test_config()
        })
        .unwrap();
        let layout = &runtime.config().layout;
        assert!(runtime.new_class("B").prototype().is_neutral(layout));
    }

    #[test]
    fn inflating_a_thin_lock_keeps_the_owner() {
        let runtime = MonitorRuntime::new(LockingConfig {
            use_biased_locking: false,
            ..test_config()
        })
        .unwrap();
        let locking = runtime.locking();
        let me = runtime.attach_current_thread("main");
        let object = ObjectHeader::new(&runtime.new_class("Inflate"));
        let neutral = object.mark();

        assert_eq!(locking.enter(&me, &object), LockPath::Stack);
        let record = me.lock_records().top().unwrap().address();

        let monitor = runtime.inflate(&me, &object);
        assert_eq!(monitor.owner(), record, "anonymous owner");
        assert_eq!(monitor.header(), neutral);
        assert_eq!(runtime.monitor_count(), 1);
        assert!(std::ptr::eq(runtime.inflate(&me, &object), monitor));
        assert_eq!(runtime.monitor_count(), 1);

        locking.exit(&me, &object);
        assert_eq!(monitor.owner(), 0);
        assert_eq!(monitor.previous_owner(), me.id().as_word());
        runtime.detach_current_thread(me).unwrap();
    }

    #[test]
    fn contention_inflates_and_hands_off() {
        let runtime = MonitorRuntime::new(LockingConfig {
            use_biased_locking: false,
            ..test_config()
        })
        .unwrap();
        let locking = Arc::new(runtime.locking());
        let class = runtime.new_class("Contended");
        let object = Arc::new(ObjectHeader::new(&class));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered = Arc::new(AtomicBool::new(false));

        let holder = {
            let runtime = runtime.clone();
            let locking = locking.clone();
            let object = object.clone();
            thread::spawn(move || {
                let me = runtime.attach_current_thread("holder");
                assert_eq!(locking.enter(&me, &object), LockPath::Stack);
                locked_tx.send(()).unwrap();
                me.parked_scope(|| release_rx.recv().unwrap());
                locking.exit(&me, &object);
                runtime.detach_current_thread(me).unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let contender = {
            let runtime = runtime.clone();
            let locking = locking.clone();
            let object = object.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let me = runtime.attach_current_thread("contender");
                assert!(matches!(locking.enter(&me, &object), LockPath::Slow(_)));
                entered.store(true, Ordering::SeqCst);
                locking.exit(&me, &object);
                runtime.detach_current_thread(me).unwrap();
            })
        };

        while runtime.monitor_count() == 0 {
            thread::yield_now();
        }
        assert!(!entered.load(Ordering::SeqCst));
        release_tx.send(()).unwrap();

        holder.join().unwrap();
        contender.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(matches!(
            object.mark().decode(&runtime.config().layout),
            LockState::Fat { .. }
        ));
    }
}
