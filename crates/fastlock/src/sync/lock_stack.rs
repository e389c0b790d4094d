use std::{
    cell::{Cell, UnsafeCell},
    mem::size_of,
};

use memmap2::MmapMut;

use crate::objectmodel::ObjectHeader;

use super::basic_lock::LockRecord;

const RECORD_SIZE: usize = size_of::<LockRecord>();

/// One page of lock records followed by a page that is never handed out.
///
/// Records are placed from the top of the first page downwards, so the newest
/// record has the lowest address, like frames on a machine stack. The spare
/// page keeps `[stack pointer, stack pointer + page)` inside this mapping,
/// which is what makes the stack-lock recursion test sound.
struct RecordChunk {
    map: MmapMut,
}

impl RecordChunk {
    fn new(page_size: usize) -> Self {
        let map = MmapMut::map_anon(page_size * 2)
            .unwrap_or_else(|err| panic!("failed to map lock record chunk: {err}"));
        Self { map }
    }

    fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }
}

/// Per-thread LIFO of [`LockRecord`]s indexed by lock depth.
///
/// Only the owning thread pushes and pops. Other threads may read it while
/// the owner is stopped at a safepoint. Records never move once handed out:
/// chunks are only ever appended.
pub struct LockRecordStack {
    chunks: UnsafeCell<Vec<RecordChunk>>,
    depth: Cell<usize>,
    page_size: usize,
}

impl LockRecordStack {
    pub fn new(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two() && page_size >= RECORD_SIZE);
        Self {
            chunks: UnsafeCell::new(Vec::new()),
            depth: Cell::new(0),
            page_size,
        }
    }

    fn records_per_chunk(&self) -> usize {
        self.page_size / RECORD_SIZE
    }

    fn chunks(&self) -> &[RecordChunk] {
        unsafe { &*self.chunks.get() }
    }

    fn slot_address(&self, index: usize) -> usize {
        let per_chunk = self.records_per_chunk();
        let chunk = &self.chunks()[index / per_chunk];
        chunk.base() + (per_chunk - 1 - index % per_chunk) * RECORD_SIZE
    }

    fn record_at(&self, index: usize) -> &LockRecord {
        // SAFETY: slot lies inside a live, zero-initialised mapping and is
        // 16-byte aligned; an all-zero record is a valid `LockRecord`.
        unsafe { &*(self.slot_address(index) as *const LockRecord) }
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Hands out the record for a new lock on `object`.
    pub fn push(&self, object: &ObjectHeader) -> &LockRecord {
        let depth = self.depth.get();
        if depth / self.records_per_chunk() == self.chunks().len() {
            // SAFETY: only the owner mutates and no reference into the vector
            // itself is alive; handed out records point into the mappings.
            unsafe { (*self.chunks.get()).push(RecordChunk::new(self.page_size)) };
        }

        self.depth.set(depth + 1);
        let record = self.record_at(depth);
        record.set_object(object);
        record
    }

    pub fn top(&self) -> Option<&LockRecord> {
        match self.depth() {
            0 => None,
            depth => Some(self.record_at(depth - 1)),
        }
    }

    pub fn pop(&self) {
        let depth = self.depth();
        assert!(depth > 0, "lock record stack underflow");
        self.record_at(depth - 1).clear();
        self.depth.set(depth - 1);
    }

    /// Address the stack-lock recursion test is relative to: the newest
    /// record, or the top of the first chunk when nothing is held.
    pub fn stack_pointer(&self) -> usize {
        match self.top() {
            Some(record) => record.address(),
            None => self
                .chunks()
                .first()
                .map_or(0, |chunk| chunk.base() + self.page_size),
        }
    }

    /// Is `address` one of the records currently in use?
    pub fn owns(&self, address: usize) -> bool {
        let per_chunk = self.records_per_chunk();
        let depth = self.depth();

        self.chunks().iter().enumerate().any(|(i, chunk)| {
            let base = chunk.base();
            if address < base || address >= base + self.page_size {
                return false;
            }

            let offset = address - base;
            if offset % RECORD_SIZE != 0 {
                return false;
            }

            let index = i * per_chunk + (per_chunk - 1 - offset / RECORD_SIZE);
            index < depth
        })
    }

    /// Records in use, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LockRecord> + '_ {
        (0..self.depth()).map(move |index| self.record_at(index))
    }

    pub fn count_for(&self, object: &ObjectHeader) -> usize {
        self.iter().filter(|record| record.holds(object)).count()
    }
}
