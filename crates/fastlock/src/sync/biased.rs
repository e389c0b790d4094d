//! Biased locking fast path (Russell & Detlefs).
//!
//! A biasable object is handed to the first thread that locks it; after that
//! the owner locks and unlocks it without any atomic operation until another
//! thread shows up and the bias has to be revoked or transferred.

use crate::{
    config::MarkLayout,
    objectmodel::{header::LockWord, ObjectHeader},
    runtime::threads::ThreadId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BiasAcquire {
    /// Already biased to us in the current epoch.
    Existing,
    /// Took an anonymous bias.
    Acquired,
    /// Rebiased to us because the previous epoch expired.
    Transferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BiasConflict {
    /// Biased to another thread in the current epoch, or lost the race for an
    /// anonymous bias.
    Revoke,
    /// Lost the race to rebias an object with an expired epoch.
    EpochExpired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unbiasable {
    /// The header is not in the bias pattern.
    NotBiased,
    /// The class stopped biasing; the header was reset to the prototype when
    /// that CAS succeeded.
    ClassRevoked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BiasedEnter {
    Acquired(BiasAcquire),
    MustRevokeOrTransfer(BiasConflict),
    NotBiasable(Unbiasable),
}

pub fn try_enter_biased(
    object: &ObjectHeader,
    mark: LockWord,
    prototype: LockWord,
    thread: ThreadId,
    layout: &MarkLayout,
) -> BiasedEnter {
    let thread = thread.as_word();
    let tmp = ((prototype.raw() | thread) ^ mark.raw()) & !layout.age_mask;

    if tmp == 0 {
        // only the bias owner can get here, no atomics needed.
        return BiasedEnter::Acquired(BiasAcquire::Existing);
    }

    if !mark.has_bias_pattern(layout) {
        return BiasedEnter::NotBiasable(Unbiasable::NotBiased);
    }

    if tmp & layout.biased_lock_mask != 0 {
        // the prototype lost its bias pattern. Try to reset the header so the
        // next attempt doesn't come here again; losing the race is fine.
        let _ = object.cas_mark(mark, prototype);
        return BiasedEnter::NotBiasable(Unbiasable::ClassRevoked);
    }

    if tmp & layout.epoch_mask != 0 {
        let rebiased = LockWord::from_raw(prototype.raw() | thread);
        return match object.cas_mark(mark, rebiased) {
            Ok(_) => BiasedEnter::Acquired(BiasAcquire::Transferred),
            Err(_) => BiasedEnter::MustRevokeOrTransfer(BiasConflict::EpochExpired),
        };
    }

    let unbiased = mark.unbiased(layout);
    match object.cas_mark(unbiased, LockWord::from_raw(unbiased.raw() | thread)) {
        Ok(_) => BiasedEnter::Acquired(BiasAcquire::Acquired),
        Err(_) => BiasedEnter::MustRevokeOrTransfer(BiasConflict::Revoke),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmodel::{header::LockState, LockClass};

    const A: ThreadId = ThreadId::from_word(0x7000_0400);
    const B: ThreadId = ThreadId::from_word(0x7000_0800);

    fn biased_object(epoch: usize) -> (MarkLayout, ObjectHeader) {
        let layout = MarkLayout::host();
        let class = LockClass::new("B", LockWord::biased_prototype(epoch, &layout));
        (layout, ObjectHeader::new(&class))
    }

    fn enter(object: &ObjectHeader, thread: ThreadId, layout: &MarkLayout) -> BiasedEnter {
        try_enter_biased(
            object,
            object.mark(),
            object.class().prototype(),
            thread,
            layout,
        )
    }

    #[test]
    fn first_thread_takes_anonymous_bias() {
        let (layout, object) = biased_object(1);
        let prototype = object.mark();

        assert_eq!(
            enter(&object, A, &layout),
            BiasedEnter::Acquired(BiasAcquire::Acquired)
        );
        assert_eq!(object.mark().raw(), prototype.raw() | A.as_word());

        assert_eq!(
            enter(&object, A, &layout),
            BiasedEnter::Acquired(BiasAcquire::Existing)
        );
    }

    #[test]
    fn age_does_not_break_existing_bias() {
        let (layout, object) = biased_object(0);
        let aged = LockWord::encode(
            LockState::Biased {
                owner: A.as_word(),
                epoch: 0,
                age: 7,
            },
            &layout,
        );
        object.set_mark(aged);
        assert_eq!(
            enter(&object, A, &layout),
            BiasedEnter::Acquired(BiasAcquire::Existing)
        );
        assert_eq!(object.mark(), aged);
    }

    #[test]
    fn other_thread_must_revoke_and_header_is_untouched() {
        let (layout, object) = biased_object(0);
        enter(&object, A, &layout);
        let before = object.mark();

        assert_eq!(
            enter(&object, B, &layout),
            BiasedEnter::MustRevokeOrTransfer(BiasConflict::Revoke)
        );
        assert_eq!(object.mark(), before);
        assert_eq!(
            enter(&object, A, &layout),
            BiasedEnter::Acquired(BiasAcquire::Existing)
        );
    }

    #[test]
    fn expired_epoch_transfers_bias() {
        let (layout, object) = biased_object(0);
        enter(&object, A, &layout);

        object
            .class()
            .set_prototype(LockWord::biased_prototype(1, &layout));
        assert_eq!(
            enter(&object, B, &layout),
            BiasedEnter::Acquired(BiasAcquire::Transferred)
        );
        let mark = object.mark();
        assert_eq!(mark.biased_owner(&layout), B.as_word());
        assert_eq!(mark.epoch(&layout), 1);
    }

    #[test]
    fn expired_epoch_race_loses() {
        let (layout, object) = biased_object(0);
        enter(&object, A, &layout);
        let stale = object.mark();
        object
            .class()
            .set_prototype(LockWord::biased_prototype(1, &layout));

        // someone else changes the header between our read and our CAS
        object.set_mark(LockWord::from_raw(stale.raw() ^ (1 << layout.age_shift)));
        assert_eq!(
            try_enter_biased(&object, stale, object.class().prototype(), B, &layout),
            BiasedEnter::MustRevokeOrTransfer(BiasConflict::EpochExpired)
        );
    }

    #[test]
    fn revoked_class_resets_header() {
        let (layout, object) = biased_object(0);
        enter(&object, A, &layout);

        let neutral = LockWord::neutral(0, &layout);
        object.class().set_prototype(neutral);
        assert_eq!(
            enter(&object, B, &layout),
            BiasedEnter::NotBiasable(Unbiasable::ClassRevoked)
        );
        assert_eq!(object.mark(), neutral);
    }

    #[test]
    fn neutral_header_is_not_biasable() {
        let layout = MarkLayout::host();
        let class = LockClass::new("N", LockWord::neutral(0, &layout));
        let object = ObjectHeader::new(&class);
        assert_eq!(
            enter(&object, A, &layout),
            BiasedEnter::NotBiasable(Unbiasable::NotBiased)
        );
        assert_eq!(object.mark(), LockWord::neutral(0, &layout));
    }
}
