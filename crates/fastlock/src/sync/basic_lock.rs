use std::{
    mem::offset_of,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::objectmodel::{header::LockWord, ObjectHeader};

/// Holds the header an object had before it was stack locked.
pub struct BasicLock {
    displaced_header: AtomicUsize,
}

impl BasicLock {
    /// Displaced header of a nested entry: there is nothing to restore.
    pub const RECURSIVE: LockWord = LockWord::from_raw(0);

    pub fn displaced_header(&self) -> LockWord {
        LockWord::from_raw(self.displaced_header.load(Ordering::Relaxed))
    }

    pub fn set_displaced_header(&self, header: LockWord) {
        self.displaced_header
            .store(header.raw(), Ordering::Relaxed);
    }

    pub fn is_recursive(&self) -> bool {
        self.displaced_header() == Self::RECURSIVE
    }
}

/// A lock record: one per lock currently held (or being acquired) by a thread,
/// kept in that thread's [`LockRecordStack`](super::lock_stack::LockRecordStack).
///
/// A thin-locked header holds the address of the record that acquired it.
#[repr(C, align(16))]
pub struct LockRecord {
    lock: BasicLock,
    obj: AtomicPtr<ObjectHeader>,
}

impl LockRecord {
    pub const LOCK_OFFSET: usize = offset_of!(Self, lock);
    pub const OBJ_OFFSET: usize = offset_of!(Self, obj);

    pub fn lock(&self) -> &BasicLock {
        &self.lock
    }

    pub fn object(&self) -> *const ObjectHeader {
        self.obj.load(Ordering::Relaxed)
    }

    pub fn holds(&self, object: &ObjectHeader) -> bool {
        std::ptr::eq(self.object(), object)
    }

    pub(crate) fn set_object(&self, object: *const ObjectHeader) {
        self.obj.store(object.cast_mut(), Ordering::Relaxed);
    }

    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Entries that went through a monitor still need a non-zero displaced
    /// header so the exit is not mistaken for a nested stack lock exit.
    pub(crate) fn mark_non_recursive(&self) {
        self.lock
            .set_displaced_header(LockWord::from_raw(self.address()));
    }

    pub(crate) fn clear(&self) {
        self.lock.set_displaced_header(BasicLock::RECURSIVE);
        self.obj.store(null_mut(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(LockRecord::LOCK_OFFSET, 0);
        assert_eq!(LockRecord::OBJ_OFFSET, std::mem::size_of::<usize>());
        assert_eq!(std::mem::align_of::<LockRecord>(), 16);
    }

    #[test]
    fn non_recursive_marker() {
        let record = LockRecord {
            lock: BasicLock {
                displaced_header: AtomicUsize::new(0),
            },
            obj: AtomicPtr::new(null_mut()),
        };
        assert!(record.lock().is_recursive());
        record.mark_non_recursive();
        assert!(!record.lock().is_recursive());
        assert_eq!(record.lock().displaced_header().raw(), record.address());
        record.clear();
        assert!(record.lock().is_recursive());
        assert!(record.object().is_null());
    }
}
