//! Mock objects and worker threads used in tests, benches and the demo.

use std::{
    cell::UnsafeCell,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::{
    config::LockingConfig,
    diagnostics::UnbalancedMonitors,
    objectmodel::{LockClass, ObjectHeader},
    runtime::{threads::MutatorThread, MonitorRuntime, SlowPath},
    sync::FastLocking,
};

/// Configuration with counters and balance checks switched on.
pub fn test_config() -> LockingConfig {
    LockingConfig {
        profile_monitors: true,
        verify_balanced_monitors: true,
        ..Default::default()
    }
}

/// A lockable object guarding a `T`.
pub struct MockObject<T> {
    header: ObjectHeader,
    value: UnsafeCell<T>,
}

// SAFETY: `value` is only reached while holding the object lock.
unsafe impl<T: Send> Sync for MockObject<T> {}

impl<T> MockObject<T> {
    pub fn new(class: &Arc<LockClass>, value: T) -> Self {
        Self {
            header: ObjectHeader::new(class),
            value: UnsafeCell::new(value),
        }
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Runs `f` on the value with the object locked.
    pub fn synchronized<S: SlowPath, R>(
        &self,
        locking: &FastLocking<S>,
        thread: &MutatorThread,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        // SAFETY: exclusive while the lock is held.
        locking.synchronized(thread, &self.header, || f(unsafe { &mut *self.value.get() }))
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Runs `f` on a new OS thread attached to `runtime` and detaches it
/// afterwards.
pub fn spawn_mutator<F, R>(
    runtime: &Arc<MonitorRuntime>,
    name: impl Into<String>,
    f: F,
) -> JoinHandle<Result<R, UnbalancedMonitors>>
where
    F: FnOnce(&MutatorThread) -> R + Send + 'static,
    R: Send + 'static,
{
    let runtime = runtime.clone();
    let name = name.into();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let me = runtime.attach_current_thread(&name);
            let result = f(&me);
            runtime.detach_current_thread(me).map(|()| result)
        })
        .unwrap_or_else(|err| panic!("failed to spawn mutator {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_count_under_the_lock() {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = MonitorRuntime::new(test_config()).unwrap();
        let locking = Arc::new(runtime.locking());
        let counter = Arc::new(MockObject::new(&runtime.new_class("Counter"), 0usize));

        let workers = (0..4)
            .map(|i| {
                let locking = locking.clone();
                let counter = counter.clone();
                spawn_mutator(&runtime, format!("worker-{i}"), move |me| {
                    for _ in 0..500 {
                        counter.synchronized(&locking, me, |value| *value += 1);
                        me.safepoint_poll();
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        let counter = Arc::try_unwrap(counter).ok().unwrap();
        assert_eq!(counter.into_inner(), 2000);
    }
}
