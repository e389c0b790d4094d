//! Lock word codec.
//!
//! ```text
//!  neutral:  [ hash               | unused:2 | age:4 | 0 | 01 ]
//!  biased:   [ thread             | epoch:2  | age:4 | 1 | 01 ]
//!  thin:     [ lock record address                       | 00 ]
//!  fat:      [ monitor address                           | 10 ]
//!  marked:   [ reserved for the collector                | 11 ]
//! ```
//!
//! A word of all zeroes is never a valid thin lock (records are never at
//! address zero) and is used by the runtime while a monitor is being installed.
//! All masks come from [`MarkLayout`], nothing here hard-codes a position.

use std::fmt;

use crate::config::MarkLayout;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockTag {
    Thin = 0b00,
    Unlocked = 0b01,
    Fat = 0b10,
    Marked = 0b11,
}

/// Decoded form of a [`LockWord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked { hash: usize, age: usize },
    /// `owner == 0` means anonymously biased: biasable, but nobody took it yet.
    Biased { owner: usize, epoch: usize, age: usize },
    Thin { record: usize },
    Fat { monitor: usize },
    /// The runtime is installing a monitor.
    Inflating,
    Marked,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LockWord(usize);

impl LockWord {
    pub const INFLATING: LockWord = LockWord(0);

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn tag(self, layout: &MarkLayout) -> LockTag {
        let bits = self.0 & layout.lock_mask;
        if bits == layout.locked_value {
            LockTag::Thin
        } else if bits == layout.unlocked_value {
            LockTag::Unlocked
        } else if bits == layout.monitor_value {
            LockTag::Fat
        } else {
            LockTag::Marked
        }
    }

    fn tag_value(tag: LockTag, layout: &MarkLayout) -> usize {
        match tag {
            LockTag::Thin => layout.locked_value,
            LockTag::Unlocked => layout.unlocked_value,
            LockTag::Fat => layout.monitor_value,
            LockTag::Marked => layout.marked_value,
        }
    }

    /// Tag is `01`, biased or not.
    pub fn is_unlocked_pattern(self, layout: &MarkLayout) -> bool {
        self.0 & layout.lock_mask == layout.unlocked_value
    }

    pub fn has_bias_pattern(self, layout: &MarkLayout) -> bool {
        self.0 & layout.biased_lock_mask == layout.biased_lock_pattern
    }

    /// Unlocked and not biasable.
    pub fn is_neutral(self, layout: &MarkLayout) -> bool {
        self.0 & layout.biased_lock_mask == layout.unlocked_value
    }

    pub fn is_inflating(self) -> bool {
        self.0 == 0
    }

    pub fn with_tag(self, tag: LockTag, layout: &MarkLayout) -> Self {
        Self((self.0 & !layout.lock_mask) | Self::tag_value(tag, layout))
    }

    pub fn age(self, layout: &MarkLayout) -> usize {
        (self.0 & layout.age_mask) >> layout.age_shift
    }

    pub fn epoch(self, layout: &MarkLayout) -> usize {
        (self.0 & layout.epoch_mask) >> layout.epoch_shift
    }

    pub fn with_epoch(self, epoch: usize, layout: &MarkLayout) -> Self {
        Self((self.0 & !layout.epoch_mask) | ((epoch << layout.epoch_shift) & layout.epoch_mask))
    }

    pub fn hash(self, layout: &MarkLayout) -> usize {
        (self.0 & layout.hash_mask) >> layout.hash_shift
    }

    /// Thread the word is biased to, zero when anonymous. Only meaningful
    /// under the bias pattern.
    pub fn biased_owner(self, layout: &MarkLayout) -> usize {
        self.0 & layout.owner_mask()
    }

    /// The bias bit, age and epoch with the owner stripped.
    pub fn unbiased(self, layout: &MarkLayout) -> Self {
        Self(self.0 & (layout.biased_lock_mask | layout.age_mask | layout.epoch_mask))
    }

    /// Pointer payload of a thin or fat word.
    pub fn address(self, layout: &MarkLayout) -> usize {
        self.0 & !layout.lock_mask
    }

    pub fn neutral(age: usize, layout: &MarkLayout) -> Self {
        Self(layout.unlocked_value | ((age << layout.age_shift) & layout.age_mask))
    }

    pub fn biased_prototype(epoch: usize, layout: &MarkLayout) -> Self {
        Self(layout.biased_lock_pattern).with_epoch(epoch, layout)
    }

    pub fn thin(record: usize, layout: &MarkLayout) -> Self {
        debug_assert_eq!(record & layout.lock_mask, 0);
        Self(record | layout.locked_value)
    }

    pub fn fat(monitor: usize, layout: &MarkLayout) -> Self {
        debug_assert_eq!(monitor & layout.lock_mask, 0);
        Self(monitor | layout.monitor_value)
    }

    pub fn decode(self, layout: &MarkLayout) -> LockState {
        if self.is_inflating() {
            return LockState::Inflating;
        }

        match self.tag(layout) {
            LockTag::Thin => LockState::Thin {
                record: self.address(layout),
            },
            LockTag::Fat => LockState::Fat {
                monitor: self.address(layout),
            },
            LockTag::Marked => LockState::Marked,
            LockTag::Unlocked if self.has_bias_pattern(layout) => LockState::Biased {
                owner: self.biased_owner(layout),
                epoch: self.epoch(layout),
                age: self.age(layout),
            },
            LockTag::Unlocked => LockState::Unlocked {
                hash: self.hash(layout),
                age: self.age(layout),
            },
        }
    }

    pub fn encode(state: LockState, layout: &MarkLayout) -> Self {
        match state {
            LockState::Unlocked { hash, age } => Self(
                Self::neutral(age, layout).0 | ((hash << layout.hash_shift) & layout.hash_mask),
            ),
            LockState::Biased { owner, epoch, age } => Self(
                Self::biased_prototype(epoch, layout).0
                    | ((age << layout.age_shift) & layout.age_mask)
                    | (owner & layout.owner_mask()),
            ),
            LockState::Thin { record } => Self::thin(record, layout),
            LockState::Fat { monitor } => Self::fat(monitor, layout),
            LockState::Inflating => Self::INFLATING,
            LockState::Marked => Self(layout.marked_value),
        }
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockWord({:#x})", self.0)
    }
}

impl fmt::Display for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
