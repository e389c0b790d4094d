use std::{
    fmt,
    mem::offset_of,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use header::LockWord;

pub mod header;

/// Per-class locking state: the prototype lock word new objects start with
/// and the bookkeeping that drives bulk bias revocation.
pub struct LockClass {
    name: Box<str>,
    prototype: AtomicUsize,
    revocation_count: AtomicUsize,
    last_bulk_rebias: Mutex<Option<Instant>>,
}

impl LockClass {
    pub fn new(name: impl Into<Box<str>>, prototype: LockWord) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            prototype: AtomicUsize::new(prototype.raw()),
            revocation_count: AtomicUsize::new(0),
            last_bulk_rebias: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prototype(&self) -> LockWord {
        LockWord::from_raw(self.prototype.load(Ordering::Acquire))
    }

    /// Only changed while every other thread is stopped.
    pub(crate) fn set_prototype(&self, prototype: LockWord) {
        self.prototype.store(prototype.raw(), Ordering::Release);
    }

    pub fn revocation_count(&self) -> usize {
        self.revocation_count.load(Ordering::Relaxed)
    }

    /// Counts one more revocation and returns the new total. The count starts
    /// over when the last bulk rebias is older than `decay` so that classes
    /// with rare revocations are not punished forever.
    pub(crate) fn record_revocation(&self, decay: Duration, rebias_threshold: usize) -> usize {
        let last = *self.last_bulk_rebias.lock();
        if let Some(last) = last {
            if self.revocation_count() >= rebias_threshold && last.elapsed() >= decay {
                log::debug!("resetting bias revocation count of {}", self.name);
                self.revocation_count.store(0, Ordering::Relaxed);
            }
        }

        self.revocation_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn note_bulk_rebias(&self) {
        *self.last_bulk_rebias.lock() = Some(Instant::now());
    }
}

impl fmt::Debug for LockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClass")
            .field("name", &self.name)
            .field("prototype", &self.prototype())
            .field("revocation_count", &self.revocation_count())
            .finish()
    }
}

/// The part of an object the lock protocol cares about.
///
/// Must not move while any thread holds or is acquiring its lock: lock records
/// and monitors refer to it by address.
#[repr(C)]
pub struct ObjectHeader {
    mark: AtomicUsize,
    class: Arc<LockClass>,
}

impl ObjectHeader {
    pub const MARK_OFFSET: usize = offset_of!(Self, mark);

    pub fn new(class: &Arc<LockClass>) -> Self {
        Self {
            mark: AtomicUsize::new(class.prototype().raw()),
            class: class.clone(),
        }
    }

    pub fn class(&self) -> &Arc<LockClass> {
        &self.class
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn mark(&self) -> LockWord {
        LockWord::from_raw(self.mark.load(Ordering::Acquire))
    }

    pub fn cas_mark(&self, expected: LockWord, new: LockWord) -> Result<LockWord, LockWord> {
        self.mark
            .compare_exchange(expected.raw(), new.raw(), Ordering::SeqCst, Ordering::SeqCst)
            .map(LockWord::from_raw)
            .map_err(LockWord::from_raw)
    }

    /// Unconditional store. Only for words nobody else may legally CAS: a
    /// monitor replacing the inflating sentinel, or a header rewritten while
    /// its bias owner is stopped.
    pub(crate) fn set_mark(&self, word: LockWord) {
        self.mark.store(word.raw(), Ordering::Release);
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x} [{}]", self.class.name, self.address(), self.mark())
    }
}
