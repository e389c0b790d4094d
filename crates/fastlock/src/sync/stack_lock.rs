//! Thin locks: the header points at a lock record of the owner.

use std::sync::atomic::{fence, Ordering};

use crate::{
    config::LockingConfig,
    config::MarkLayout,
    objectmodel::{
        header::{LockTag, LockWord},
        ObjectHeader,
    },
};

use super::basic_lock::{BasicLock, LockRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackEnter {
    Acquired,
    AcquiredRecursive,
    /// Carries the header that made the CAS fail.
    Failed(LockWord),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackExit {
    Recursive,
    Released,
    /// The header no longer points at the record; it was inflated meanwhile.
    Failed(LockWord),
}

/// Does `header` point into the page above `stack_pointer`, at a word aligned
/// address? If so it is one of our own lock records.
pub fn is_own_stack_address(header: usize, stack_pointer: usize, config: &LockingConfig) -> bool {
    let align_mask = config.word_size - 1;
    header.wrapping_sub(stack_pointer) & align_mask.wrapping_sub(config.page_size) == 0
}

pub fn try_enter_stack(
    object: &ObjectHeader,
    mark: LockWord,
    record: &LockRecord,
    stack_pointer: usize,
    config: &LockingConfig,
) -> StackEnter {
    let unlocked = LockWord::from_raw(mark.raw() | config.layout.unlocked_value);
    record.lock().set_displaced_header(unlocked);
    // the displaced header must be visible before the record address is.
    fence(Ordering::Release);

    let layout = &config.layout;
    match object.cas_mark(unlocked, LockWord::thin(record.address(), layout)) {
        Ok(_) => StackEnter::Acquired,
        Err(current)
            if current.tag(layout) == LockTag::Thin
                && is_own_stack_address(current.address(layout), stack_pointer, config) =>
        {
            record.lock().set_displaced_header(BasicLock::RECURSIVE);
            StackEnter::AcquiredRecursive
        }
        Err(current) => StackEnter::Failed(current),
    }
}

pub fn try_exit_stack(object: &ObjectHeader, record: &LockRecord, layout: &MarkLayout) -> StackExit {
    let displaced = record.lock().displaced_header();
    if displaced == BasicLock::RECURSIVE {
        return StackExit::Recursive;
    }

    match object.cas_mark(LockWord::thin(record.address(), layout), displaced) {
        Ok(_) => StackExit::Released,
        Err(current) => StackExit::Failed(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{objectmodel::LockClass, sync::lock_stack::LockRecordStack};

    fn setup() -> (LockingConfig, ObjectHeader, LockRecordStack) {
        let config = LockingConfig {
            page_size: 4096,
            ..Default::default()
        };
        let class = LockClass::new("S", LockWord::neutral(0, &MarkLayout::host()));
        (config, ObjectHeader::new(&class), LockRecordStack::new(4096))
    }

    #[test]
    fn recursion_test_is_a_page_window() {
        let config = LockingConfig {
            page_size: 4096,
            ..Default::default()
        };
        let sp = 0x7fff_0000_1000;
        assert!(is_own_stack_address(sp, sp, &config));
        assert!(is_own_stack_address(sp + 16, sp, &config));
        assert!(is_own_stack_address(sp + 4088, sp, &config));
        assert!(!is_own_stack_address(sp + 4096, sp, &config));
        assert!(!is_own_stack_address(sp - 16, sp, &config));
        assert!(!is_own_stack_address(sp + 2, sp, &config), "fat tag");
    }

    #[test]
    fn recursive_round_trip() {
        let (config, object, stack) = setup();
        let original = object.mark();

        let outer = stack.push(&object);
        assert_eq!(
            try_enter_stack(&object, object.mark(), outer, stack.stack_pointer(), &config),
            StackEnter::Acquired
        );
        assert_eq!(object.mark().raw(), outer.address());
        assert_eq!(outer.lock().displaced_header(), original);

        let inner = stack.push(&object);
        assert_eq!(
            try_enter_stack(&object, object.mark(), inner, stack.stack_pointer(), &config),
            StackEnter::AcquiredRecursive
        );
        assert!(inner.lock().is_recursive());

        let locked = object.mark();
        assert_eq!(try_exit_stack(&object, inner, &config.layout), StackExit::Recursive);
        assert_eq!(object.mark(), locked, "recursive exit leaves the header alone");
        stack.pop();

        assert_eq!(try_exit_stack(&object, outer, &config.layout), StackExit::Released);
        stack.pop();
        assert_eq!(object.mark(), original);
    }

    #[test]
    fn foreign_owner_fails() {
        let (config, object, mine) = setup();
        let theirs = LockRecordStack::new(4096);

        let record = theirs.push(&object);
        assert_eq!(
            try_enter_stack(&object, object.mark(), record, theirs.stack_pointer(), &config),
            StackEnter::Acquired
        );

        let attempt = mine.push(&object);
        let held = object.mark();
        assert_eq!(
            try_enter_stack(&object, held, attempt, mine.stack_pointer(), &config),
            StackEnter::Failed(held)
        );
    }

    #[test]
    fn exit_after_inflation_fails() {
        let (config, object, stack) = setup();
        let record = stack.push(&object);
        try_enter_stack(&object, object.mark(), record, stack.stack_pointer(), &config);

        let fat = LockWord::fat(0x5000_0040, &config.layout);
        object.set_mark(fat);
        assert_eq!(try_exit_stack(&object, record, &config.layout), StackExit::Failed(fat));
    }

    #[test]
    fn thin_tag_need_not_be_zero() {
        let host = MarkLayout::host();
        let layout = MarkLayout {
            locked_value: 0b11,
            marked_value: 0b00,
            ..host
        };
        let config = LockingConfig {
            page_size: 4096,
            layout,
            ..Default::default()
        };
        let class = LockClass::new("T", LockWord::neutral(0, &layout));
        let object = ObjectHeader::new(&class);
        let stack = LockRecordStack::new(4096);
        let original = object.mark();

        let outer = stack.push(&object);
        assert_eq!(
            try_enter_stack(&object, object.mark(), outer, stack.stack_pointer(), &config),
            StackEnter::Acquired
        );
        assert_eq!(object.mark(), LockWord::thin(outer.address(), &layout));
        assert_eq!(object.mark().tag(&layout), LockTag::Thin);

        let inner = stack.push(&object);
        assert_eq!(
            try_enter_stack(&object, object.mark(), inner, stack.stack_pointer(), &config),
            StackEnter::AcquiredRecursive
        );

        assert_eq!(try_exit_stack(&object, inner, &layout), StackExit::Recursive);
        stack.pop();
        assert_eq!(try_exit_stack(&object, outer, &layout), StackExit::Released);
        stack.pop();
        assert_eq!(object.mark(), original);
    }
}
