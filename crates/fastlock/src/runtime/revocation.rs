//! Bias revocation.
//!
//! A bias can only be taken away from a thread that is stopped, because the
//! owner locks and unlocks a biased object without atomics. Revoking means
//! rewriting the owner's lock records as if it had stack locked the object
//! all along and pointing the header at the oldest of them.
//!
//! Classes whose objects keep getting revoked are handled in bulk: first the
//! class epoch is bumped so every outstanding bias becomes stale at once
//! (bulk rebias); if that does not help, biasing is switched off for the class
//! (bulk revoke).

use std::{ptr, sync::Arc};

use crate::{
    diagnostics::Counter,
    objectmodel::{header::LockWord, LockClass, ObjectHeader},
    sync::{
        basic_lock::{BasicLock, LockRecord},
        lock_stack::LockRecordStack,
    },
};

use super::{
    threads::{MutatorThread, ThreadContext, ThreadId},
    MonitorRuntime,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Revocation {
    /// The header was not biased (anymore).
    NotBiased,
    /// Nobody could be relying on the bias; replaced by a neutral header.
    Neutralized,
    /// The owner was stopped and its lock records rewritten.
    Revoked,
    BulkRebias,
    BulkRevoke,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Heuristic {
    Single,
    BulkRebias,
    BulkRevoke,
}

impl MonitorRuntime {
    /// Takes the bias away from `object`, whoever holds it.
    pub fn revoke_bias(&self, thread: &MutatorThread, object: &ObjectHeader) -> Revocation {
        self.revoke(thread, object, None)
    }

    /// Same as [`revoke_bias`](Self::revoke_bias) for a slow enter whose lock
    /// record is already pushed; that record must not count as held.
    pub(crate) fn revoke_bias_for_enter(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        pending: &LockRecord,
    ) -> Revocation {
        self.revoke(thread, object, Some(pending))
    }

    /// Makes every bias of objects of `object`'s class stale at once.
    pub fn bulk_rebias(&self, thread: &MutatorThread, object: &ObjectHeader) -> Revocation {
        thread.parked_scope(|| {
            let _guard = self.revocation_lock.lock();
            self.bulk_locked(thread, object, None, true)
        })
    }

    /// Switches biased locking off for `object`'s class.
    pub fn bulk_revoke(&self, thread: &MutatorThread, object: &ObjectHeader) -> Revocation {
        thread.parked_scope(|| {
            let _guard = self.revocation_lock.lock();
            self.bulk_locked(thread, object, None, false)
        })
    }

    fn revoke(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        pending: Option<&LockRecord>,
    ) -> Revocation {
        let layout = &self.config.layout;
        let mark = object.mark();
        if !mark.has_bias_pattern(layout) {
            return Revocation::NotBiased;
        }

        if let Some(revocation) = self.neutralize_unused_bias(object, mark) {
            return revocation;
        }

        thread.parked_scope(|| {
            let _guard = self.revocation_lock.lock();

            let mark = object.mark();
            if !mark.has_bias_pattern(layout) {
                return Revocation::NotBiased;
            }
            if let Some(revocation) = self.neutralize_unused_bias(object, mark) {
                return revocation;
            }

            let owner = ThreadId::from_word(mark.biased_owner(layout));
            let target = if owner == thread.id() {
                None
            } else {
                match self.threads.find(owner) {
                    Some(target) => Some(target),
                    None => {
                        // the owner is gone, so is everything it held.
                        let _ = object.cas_mark(mark, LockWord::neutral(mark.age(layout), layout));
                        self.counters.inc(Counter::RevokeBias);
                        return Revocation::Neutralized;
                    }
                }
            };

            // only biases that someone may still rely on count against the class.
            match self.heuristic(object.class()) {
                Heuristic::Single => self.revoke_single_locked(thread, object, mark, target, pending),
                Heuristic::BulkRebias => self.bulk_locked(thread, object, pending, true),
                Heuristic::BulkRevoke => self.bulk_locked(thread, object, pending, false),
            }
        })
    }

    /// Anonymous biases, biases of classes that stopped biasing and biases
    /// from an expired epoch are not held by anyone and can be dropped with
    /// a CAS.
    fn neutralize_unused_bias(&self, object: &ObjectHeader, mark: LockWord) -> Option<Revocation> {
        let layout = &self.config.layout;
        let prototype = object.class().prototype();

        let unused = mark.biased_owner(layout) == 0
            || !prototype.has_bias_pattern(layout)
            || mark.epoch(layout) != prototype.epoch(layout);
        if !unused {
            return None;
        }

        let neutral = LockWord::neutral(mark.age(layout), layout);
        Some(match object.cas_mark(mark, neutral) {
            Ok(_) => {
                self.counters.inc(Counter::RevokeBias);
                Revocation::Neutralized
            }
            Err(_) => Revocation::NotBiased,
        })
    }

    fn heuristic(&self, class: &LockClass) -> Heuristic {
        let config = &self.config;
        let count = class.record_revocation(config.bias_decay_time, config.bias_bulk_rebias_threshold);

        if count == config.bias_bulk_revoke_threshold {
            Heuristic::BulkRevoke
        } else if count == config.bias_bulk_rebias_threshold {
            Heuristic::BulkRebias
        } else {
            Heuristic::Single
        }
    }

    /// Caller holds the revocation lock and is parked. `target` is the live
    /// owner of `mark`'s bias, or `None` if that is the caller itself.
    fn revoke_single_locked(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        mark: LockWord,
        target: Option<Arc<ThreadContext>>,
        pending: Option<&LockRecord>,
    ) -> Revocation {
        let Some(target) = target else {
            self.revoke_held(thread.lock_records(), object, mark, pending);
            return Revocation::Revoked;
        };

        target.block();
        log::debug!("revoking bias of {:?} held by {:?}", object, target.id());
        // SAFETY: the owner is stopped until `unblock`.
        unsafe { self.revoke_stopped_owner(&target, object) };
        target.unblock();
        Revocation::Revoked
    }

    /// # Safety
    ///
    /// `owner` is stopped (or terminated) and the revocation lock is held.
    unsafe fn revoke_stopped_owner(&self, owner: &ThreadContext, object: &ObjectHeader) {
        let layout = &self.config.layout;
        let mark = object.mark();
        if !mark.has_bias_pattern(layout) || mark.biased_owner(layout) != owner.id().as_word() {
            return;
        }
        self.revoke_held(owner.lock_records(), object, mark, None);
    }

    /// Rewrites `records` so that the object looks stack locked: the oldest
    /// record gets the neutral header, the others become recursive. Without
    /// held records the header is simply made neutral.
    fn revoke_held(
        &self,
        records: &LockRecordStack,
        object: &ObjectHeader,
        mark: LockWord,
        pending: Option<&LockRecord>,
    ) {
        let layout = &self.config.layout;
        let neutral = LockWord::neutral(mark.age(layout), layout);

        let mut held = records
            .iter()
            .filter(|record| record.holds(object))
            .filter(|record| !pending.is_some_and(|pending| ptr::eq(pending, *record)));

        match held.next() {
            Some(oldest) => {
                oldest.lock().set_displaced_header(neutral);
                for record in held {
                    record.lock().set_displaced_header(BasicLock::RECURSIVE);
                }
                object.set_mark(LockWord::thin(oldest.address(), layout));
            }
            None => {
                let _ = object.cas_mark(mark, neutral);
            }
        }

        self.counters.inc(Counter::RevokeBias);
    }

    /// Caller holds the revocation lock and is parked.
    fn bulk_locked(
        &self,
        thread: &MutatorThread,
        object: &ObjectHeader,
        pending: Option<&LockRecord>,
        rebias: bool,
    ) -> Revocation {
        let layout = &self.config.layout;
        let class = object.class();

        {
            let world = self.threads.block_all_except(thread.id());
            let stopped = world.threads();

            let prototype = class.prototype();
            if prototype.has_bias_pattern(layout) {
                if rebias {
                    let epoch = (prototype.epoch(layout) + 1) & layout.max_epoch();
                    class.set_prototype(prototype.with_epoch(epoch, layout));
                    class.note_bulk_rebias();
                    self.for_each_held(thread, stopped, class, |owner, _, held| {
                        let mark = held.mark();
                        if mark.has_bias_pattern(layout) && mark.biased_owner(layout) == owner.id().as_word() {
                            held.set_mark(mark.with_epoch(epoch, layout));
                        }
                    });
                    log::debug!("bulk rebias of {} to epoch {}", class.name(), epoch);
                } else {
                    class.set_prototype(LockWord::neutral(0, layout));
                    self.for_each_held(thread, stopped, class, |owner, records, held| {
                        let mark = held.mark();
                        if mark.has_bias_pattern(layout) && mark.biased_owner(layout) == owner.id().as_word() {
                            let pending = if owner.id() == thread.id() { pending } else { None };
                            self.revoke_held(records, held, mark, pending);
                        }
                    });
                    log::debug!("bulk revoke of {}", class.name());
                }
            }

            // the object that triggered this may still be biased to a live
            // owner in the current epoch.
            let mark = object.mark();
            if mark.has_bias_pattern(layout) {
                if self.neutralize_unused_bias(object, mark).is_none() {
                    let owner = ThreadId::from_word(mark.biased_owner(layout));
                    if owner == thread.id() {
                        self.revoke_held(thread.lock_records(), object, mark, pending);
                    } else if let Some(target) = stopped.iter().find(|t| t.id() == owner) {
                        // SAFETY: stopped above.
                        unsafe { self.revoke_stopped_owner(target, object) };
                    } else {
                        // attaching waits for the world to restart, so the
                        // owner has detached.
                        let _ = object.cas_mark(mark, LockWord::neutral(mark.age(layout), layout));
                        self.counters.inc(Counter::RevokeBias);
                    }
                }
            }

            self.threads.unblock_all(world);
        }

        if rebias {
            Revocation::BulkRebias
        } else {
            Revocation::BulkRevoke
        }
    }

    /// Calls `f` once for every object of `class` that is locked by the caller
    /// or by one of the stopped threads.
    fn for_each_held(
        &self,
        thread: &MutatorThread,
        stopped: &[Arc<ThreadContext>],
        class: &Arc<LockClass>,
        mut f: impl FnMut(&ThreadContext, &LockRecordStack, &ObjectHeader),
    ) {
        let owners = std::iter::once(thread.context()).chain(stopped.iter());
        for owner in owners {
            // SAFETY: either our own records or those of a stopped thread.
            let records = unsafe { owner.lock_records() };
            let mut seen: Vec<*const ObjectHeader> = Vec::new();

            for record in records.iter() {
                let object = record.object();
                if object.is_null() || seen.contains(&object) {
                    continue;
                }
                seen.push(object);

                // SAFETY: locked objects stay in place while locked.
                let held = unsafe { &*object };
                if Arc::ptr_eq(held.class(), class) {
                    f(&**owner, records, held);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::LockingConfig,
        mock::test_config,
        objectmodel::header::LockState,
        sync::{biased::BiasAcquire, LockPath, UnlockPath},
    };
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
        thread,
    };

    #[test]
    fn anonymous_bias_is_neutralized() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let me = runtime.attach_current_thread("main");
        let object = ObjectHeader::new(&runtime.new_class("Anon"));

        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::Neutralized);
        assert!(object.mark().is_neutral(&runtime.config().layout));
        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::NotBiased);
        assert_eq!(runtime.counters().get(Counter::RevokeBias), 1);
    }

    #[test]
    fn own_bias_becomes_a_stack_lock() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let locking = runtime.locking();
        let me = runtime.attach_current_thread("main");
        let object = ObjectHeader::new(&runtime.new_class("Own"));
        let layout = runtime.config().layout;

        assert_eq!(
            locking.enter(&me, &object),
            LockPath::Biased(BiasAcquire::Acquired)
        );
        assert_eq!(
            locking.enter(&me, &object),
            LockPath::Biased(BiasAcquire::Existing)
        );
        let age = object.mark().age(&layout);

        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::Revoked);
        let records = me.lock_records().iter().collect::<Vec<_>>();
        assert_eq!(
            object.mark(),
            LockWord::thin(records[0].address(), &layout)
        );
        assert_eq!(
            records[0].lock().displaced_header(),
            LockWord::neutral(age, &layout)
        );
        assert!(records[1].lock().is_recursive());

        assert_eq!(locking.exit(&me, &object), UnlockPath::StackRecursive);
        assert_eq!(locking.exit(&me, &object), UnlockPath::Stack);
        assert!(object.mark().is_neutral(&layout));
        runtime.detach_current_thread(me).unwrap();
    }

    #[test]
    fn stale_epoch_is_neutralized_without_stopping_anyone() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let me = runtime.attach_current_thread("main");
        let class = runtime.new_class("Stale");
        let object = ObjectHeader::new(&class);
        let layout = runtime.config().layout;

        object.set_mark(LockWord::encode(
            LockState::Biased {
                owner: 0x5000_0400,
                epoch: 0,
                age: 2,
            },
            &layout,
        ));
        class.set_prototype(LockWord::biased_prototype(1, &layout));

        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::Neutralized);
        assert_eq!(object.mark(), LockWord::neutral(2, &layout));
    }

    #[test]
    fn bias_of_a_parked_owner_is_revoked_by_handshake() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let locking = Arc::new(runtime.locking());
        let object = Arc::new(ObjectHeader::new(&runtime.new_class("Shared")));
        let (biased_tx, biased_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let owner = {
            let runtime = runtime.clone();
            let locking = locking.clone();
            let object = object.clone();
            thread::spawn(move || {
                let me = runtime.attach_current_thread("owner");
                locking.enter(&me, &object);
                biased_tx.send(me.id()).unwrap();
                me.parked_scope(|| release_rx.recv().unwrap());
                // revoked while we were parked: now a stack lock.
                assert_eq!(locking.exit(&me, &object), UnlockPath::Stack);
                runtime.detach_current_thread(me).unwrap();
            })
        };

        let owner_id = biased_rx.recv().unwrap();
        let me = runtime.attach_current_thread("revoker");
        let layout = runtime.config().layout;
        assert_eq!(object.mark().biased_owner(&layout), owner_id.as_word());

        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::Revoked);
        assert!(matches!(object.mark().decode(&layout), LockState::Thin { .. }));

        release_tx.send(()).unwrap();
        owner.join().unwrap();
        assert!(object.mark().is_neutral(&layout));
        runtime.detach_current_thread(me).unwrap();
    }

    #[test]
    fn unheld_bias_of_a_running_owner_is_dropped() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let locking = Arc::new(runtime.locking());
        let object = Arc::new(ObjectHeader::new(&runtime.new_class("Dropped")));
        let (biased_tx, biased_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let owner = {
            let runtime = runtime.clone();
            let locking = locking.clone();
            let object = object.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let me = runtime.attach_current_thread("owner");
                locking.synchronized(&me, &object, || {});
                biased_tx.send(()).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    me.safepoint_poll();
                    thread::yield_now();
                }
                runtime.detach_current_thread(me).unwrap();
            })
        };

        biased_rx.recv().unwrap();
        let me = runtime.attach_current_thread("revoker");
        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::Revoked);
        assert!(object.mark().is_neutral(&runtime.config().layout));

        stop.store(true, Ordering::Relaxed);
        owner.join().unwrap();
        runtime.detach_current_thread(me).unwrap();
    }

    #[test]
    fn bias_of_a_detached_owner_does_not_count_against_the_class() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let locking = Arc::new(runtime.locking());
        let class = runtime.new_class("Orphan");
        let object = Arc::new(ObjectHeader::new(&class));
        let layout = runtime.config().layout;
        // attached first so the owner can't reuse our id.
        let me = runtime.attach_current_thread("main");

        let owner = {
            let runtime = runtime.clone();
            let object = object.clone();
            thread::spawn(move || {
                let me = runtime.attach_current_thread("owner");
                locking.synchronized(&me, &object, || {});
                runtime.detach_current_thread(me).unwrap();
            })
        };
        owner.join().unwrap();
        assert!(object.mark().has_bias_pattern(&layout));
        assert_ne!(object.mark().biased_owner(&layout), 0);

        assert_eq!(runtime.revoke_bias(&me, &object), Revocation::Neutralized);
        assert!(object.mark().is_neutral(&layout));
        assert_eq!(class.revocation_count(), 0);
        assert_eq!(runtime.counters().get(Counter::RevokeBias), 1);
        runtime.detach_current_thread(me).unwrap();
    }

    #[test]
    fn repeated_revocations_escalate_to_bulk_operations() {
        let runtime = MonitorRuntime::new(LockingConfig {
            bias_bulk_rebias_threshold: 2,
            bias_bulk_revoke_threshold: 3,
            ..test_config()
        })
        .unwrap();
        let locking = runtime.locking();
        let me = runtime.attach_current_thread("main");
        let class = runtime.new_class("Hot");
        let layout = runtime.config().layout;

        let objects = (0..3).map(|_| ObjectHeader::new(&class)).collect::<Vec<_>>();
        let mut outcomes = Vec::new();
        for object in &objects {
            locking.synchronized(&me, object, || {});
            outcomes.push(runtime.revoke_bias(&me, object));
        }

        assert_eq!(
            outcomes,
            vec![
                Revocation::Revoked,
                Revocation::BulkRebias,
                Revocation::BulkRevoke
            ]
        );
        assert_eq!(class.prototype(), LockWord::neutral(0, &layout));
        assert!(objects.iter().all(|o| o.mark().is_neutral(&layout)));

        // new objects of the class are no longer biased.
        let fresh = ObjectHeader::new(&class);
        assert_eq!(locking.enter(&me, &fresh), LockPath::Stack);
        locking.exit(&me, &fresh);
        runtime.detach_current_thread(me).unwrap();
    }

    #[test]
    fn bulk_rebias_keeps_held_biases() {
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let locking = runtime.locking();
        let me = runtime.attach_current_thread("main");
        let class = runtime.new_class("Epoch");
        let layout = runtime.config().layout;

        let held = ObjectHeader::new(&class);
        let idle = ObjectHeader::new(&class);
        locking.enter(&me, &held);
        locking.synchronized(&me, &idle, || {});

        assert_eq!(runtime.bulk_rebias(&me, &idle), Revocation::BulkRebias);
        assert_eq!(class.prototype().epoch(&layout), 1);
        assert_eq!(held.mark().epoch(&layout), 1);
        assert_eq!(held.mark().biased_owner(&layout), me.id().as_word());
        assert!(idle.mark().is_neutral(&layout), "stale bias dropped");

        assert_eq!(locking.exit(&me, &held), UnlockPath::Biased);
        assert_eq!(
            locking.enter(&me, &held),
            LockPath::Biased(BiasAcquire::Existing)
        );
        locking.exit(&me, &held);
        runtime.detach_current_thread(me).unwrap();
    }
}
