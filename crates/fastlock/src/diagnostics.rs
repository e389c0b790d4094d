//! Lock profiling counters, tracing and balanced-monitor checks. None of this
//! changes what the protocol does.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    config::LockingConfig,
    objectmodel::ObjectHeader,
    runtime::threads::{MutatorThread, ThreadContext},
};

macro_rules! define_counters {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Counter {
            $($variant),*
        }

        impl Counter {
            pub const ALL: &'static [Counter] = &[$(Counter::$variant),*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Counter::$variant => $name),*
                }
            }
        }
    };
}

define_counters! {
    LockBiasExisting => "lock{bias:existing}",
    LockBiasAcquired => "lock{bias:acquired}",
    LockBiasTransfer => "lock{bias:transfer}",
    LockCas => "lock{cas}",
    LockCasRecursive => "lock{cas:recursive}",
    LockInflatedCas => "lock{inflated:cas}",
    LockInflatedFailedCas => "lock{inflated:failed-cas}",
    LockInflatedOwned => "lock{inflated:owned}",
    LockStubEpochExpired => "lock{stub:epoch-expired}",
    LockStubRevoke => "lock{stub:revoke}",
    LockStubFailedCas => "lock{stub:failed-cas/stack}",
    LockStubInflated => "lock{stub:inflated}",
    LockStub => "lock{stub}",
    Unbiasable => "unbiasable",
    RevokeBias => "revokeBias",
    UnlockBias => "unlock{bias}",
    UnlockCas => "unlock{cas}",
    UnlockCasRecursive => "unlock{cas:recursive}",
    UnlockInflated => "unlock{inflated}",
    UnlockInflatedTransfer => "unlock{inflated:transfer}",
    UnlockStub => "unlock{stub}",
    UnlockStubInflated => "unlock{stub:inflated}",
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hit counts of every lock path. Disabled counters cost one branch.
pub struct Counters {
    enabled: bool,
    values: Box<[AtomicU64]>,
}

impl Counters {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            values: Counter::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn inc(&self, counter: Counter) {
        if self.enabled {
            self.values[counter as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    /// Non-zero counters in declaration order.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        Counter::ALL
            .iter()
            .map(|&counter| (counter, self.get(counter)))
            .filter(|&(_, value)| value != 0)
            .collect()
    }

    pub fn reset(&self) {
        for value in self.values.iter() {
            value.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (counter, value) in self.snapshot() {
            writeln!(f, "{:>28}: {}", counter.name(), value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.snapshot()
                    .into_iter()
                    .map(|(counter, value)| (counter.name(), value)),
            )
            .finish()
    }
}

pub(crate) fn trace_event(
    config: &LockingConfig,
    thread: &ThreadContext,
    object: &ObjectHeader,
    event: &dyn fmt::Debug,
    depth: usize,
) {
    if config.traces(object.class().name()) {
        log::trace!(
            "{:?} #{} depth={} {:?}: {:?}",
            thread.id(),
            thread.index(),
            depth,
            object,
            event
        );
    }
}

pub(crate) fn note_enter(thread: &ThreadContext) {
    thread.monitor_balance().fetch_add(1, Ordering::Relaxed);
}

/// # Panics
///
/// When the thread exits more monitors than it entered.
pub(crate) fn note_exit(thread: &ThreadContext) {
    let balance = thread.monitor_balance().fetch_sub(1, Ordering::Relaxed) - 1;
    if balance < 0 {
        panic!(
            "thread #{} {:?} exited more monitors than it entered ({balance})",
            thread.index(),
            thread.name()
        );
    }
}

/// A thread was detached while still holding locks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnbalancedMonitors {
    pub thread: String,
    pub held: usize,
    pub balance: isize,
}

impl fmt::Display for UnbalancedMonitors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread {:?} detached with {} lock record(s) in use (enter/exit balance {})",
            self.thread, self.held, self.balance
        )
    }
}

impl std::error::Error for UnbalancedMonitors {}

pub fn verify_balanced(thread: &MutatorThread) -> Result<(), UnbalancedMonitors> {
    let held = thread.lock_records().depth();
    let balance = thread.monitor_balance().load(Ordering::Relaxed);
    if held == 0 && balance == 0 {
        return Ok(());
    }

    log::warn!("{:?} still holds {held} lock(s)", thread.name());
    Err(UnbalancedMonitors {
        thread: thread.name().to_owned(),
        held,
        balance,
    })
}
