//! Lock word layout and the switches that select which fast paths run.
//!
//! Nothing in here is global. A [`LockingConfig`] is built once (usually by
//! [`options`](crate::runtime::options)) and shared by the dispatcher and the
//! runtime behind an `Arc`.

use std::{fmt, mem::size_of, time::Duration};

use easy_bitfield::{BitField, BitFieldTrait};

use crate::{runtime::threads::THREAD_ALIGNMENT, sync::object_monitor::ObjectMonitor};

pub type LockBits = BitField<usize, u8, 0, 2, false>;
pub type BiasedLockBit = BitField<usize, bool, { LockBits::NEXT_BIT }, 1, false>;
pub type AgeBits = BitField<usize, u8, { BiasedLockBit::NEXT_BIT }, 4, false>;
pub type EpochBits = BitField<usize, u8, { AgeBits::NEXT_BIT }, 2, false>;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Identity hash of a neutral object. Overlaps the bias owner, never both at once.
        pub type HashBits = BitField<usize, u32, { EpochBits::NEXT_BIT }, 31, false>;
        const HASH_MAX: u32 = (1 << 31) - 1;
    } else {
        pub type HashBits = BitField<usize, u32, { EpochBits::NEXT_BIT }, 23, false>;
        const HASH_MAX: u32 = (1 << 23) - 1;
    }
}

/// Masks and shifts describing the lock word.
///
/// Everything that interprets a header goes through these values; the bit
/// positions are an agreement with whoever allocates objects, so they are data
/// rather than constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkLayout {
    pub lock_mask: usize,
    pub locked_value: usize,
    pub unlocked_value: usize,
    pub monitor_value: usize,
    pub marked_value: usize,
    pub biased_lock_mask: usize,
    pub biased_lock_pattern: usize,
    pub age_mask: usize,
    pub age_shift: u32,
    pub epoch_mask: usize,
    pub epoch_shift: u32,
    pub hash_mask: usize,
    pub hash_shift: u32,
    pub owner_shift: u32,
}

impl MarkLayout {
    /// Layout used by this process' own objects.
    pub fn host() -> Self {
        Self {
            lock_mask: LockBits::encode(0b11),
            locked_value: LockBits::encode(0b00),
            unlocked_value: LockBits::encode(0b01),
            monitor_value: LockBits::encode(0b10),
            marked_value: LockBits::encode(0b11),
            biased_lock_mask: LockBits::encode(0b11) | BiasedLockBit::encode(true),
            biased_lock_pattern: LockBits::encode(0b01) | BiasedLockBit::encode(true),
            age_mask: AgeBits::encode(0b1111),
            age_shift: BiasedLockBit::NEXT_BIT as u32,
            epoch_mask: EpochBits::encode(0b11),
            epoch_shift: AgeBits::NEXT_BIT as u32,
            hash_mask: HashBits::encode(HASH_MAX),
            hash_shift: EpochBits::NEXT_BIT as u32,
            owner_shift: EpochBits::NEXT_BIT as u32,
        }
    }

    /// Bits holding the thread a lock word is biased to.
    pub fn owner_mask(&self) -> usize {
        !((1usize << self.owner_shift) - 1)
    }

    pub fn max_epoch(&self) -> usize {
        self.epoch_mask >> self.epoch_shift
    }

    pub fn max_age(&self) -> usize {
        self.age_mask >> self.age_shift
    }

    fn bias_bit(&self) -> usize {
        self.biased_lock_mask & !self.lock_mask
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("locked value", self.locked_value),
            ("unlocked value", self.unlocked_value),
            ("monitor value", self.monitor_value),
            ("marked value", self.marked_value),
        ] {
            if value & !self.lock_mask != 0 {
                return Err(ConfigError::PatternOutsideMask(name));
            }
        }

        if self.biased_lock_pattern & !self.biased_lock_mask != 0
            || self.biased_lock_pattern & self.lock_mask != self.unlocked_value
            || self.bias_bit() == 0
        {
            return Err(ConfigError::PatternOutsideMask("biased lock pattern"));
        }

        let fields = [
            ("lock bits", self.lock_mask),
            ("bias bit", self.bias_bit()),
            ("age", self.age_mask),
            ("epoch", self.epoch_mask),
            ("bias owner", self.owner_mask()),
        ];

        for (i, (a_name, a)) in fields.iter().enumerate() {
            for (b_name, b) in &fields[i + 1..] {
                if a & b != 0 {
                    return Err(ConfigError::OverlappingFields(a_name, b_name));
                }
            }
        }

        if self.hash_mask & (self.lock_mask | self.biased_lock_mask | self.age_mask) != 0 {
            return Err(ConfigError::OverlappingFields("hash", "lock bits"));
        }

        if self.epoch_mask == 0 {
            return Err(ConfigError::PatternOutsideMask("epoch"));
        }

        let required = 1usize << self.owner_shift;
        if required > THREAD_ALIGNMENT {
            return Err(ConfigError::OwnerAlignment {
                required,
                provided: THREAD_ALIGNMENT,
            });
        }

        Ok(())
    }
}

impl Default for MarkLayout {
    fn default() -> Self {
        Self::host()
    }
}

/// Offsets of the monitor fields the inflated fast paths touch.
///
/// A host that cannot expose one of these leaves it `None`, which switches the
/// matching fast path off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorOffsets {
    pub owner: Option<usize>,
    pub recursions: Option<usize>,
    pub cxq: Option<usize>,
    pub entry_list: Option<usize>,
    pub succ: Option<usize>,
}

impl MonitorOffsets {
    pub fn host() -> Self {
        Self {
            owner: Some(ObjectMonitor::OWNER_OFFSET),
            recursions: Some(ObjectMonitor::RECURSIONS_OFFSET),
            cxq: Some(ObjectMonitor::CXQ_OFFSET),
            entry_list: Some(ObjectMonitor::ENTRY_LIST_OFFSET),
            succ: Some(ObjectMonitor::SUCC_OFFSET),
        }
    }

    pub const fn unavailable() -> Self {
        Self {
            owner: None,
            recursions: None,
            cxq: None,
            entry_list: None,
            succ: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LockingConfig {
    pub layout: MarkLayout,
    pub word_size: usize,
    pub page_size: usize,
    /// When off every enter and exit goes straight to the slow path.
    pub use_fast_locking: bool,
    pub use_biased_locking: bool,
    pub simple_fast_inflated_locking: bool,
    pub monitor_offsets: MonitorOffsets,
    pub profile_monitors: bool,
    /// Class-name filter for lock tracing. An empty filter traces every object.
    pub trace_monitors: Option<String>,
    pub verify_balanced_monitors: bool,
    pub bias_bulk_rebias_threshold: usize,
    pub bias_bulk_revoke_threshold: usize,
    pub bias_decay_time: Duration,
    pub monitor_spin_limit: u32,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            layout: MarkLayout::host(),
            word_size: size_of::<usize>(),
            page_size: page_size::get(),
            use_fast_locking: true,
            use_biased_locking: true,
            simple_fast_inflated_locking: true,
            monitor_offsets: MonitorOffsets::host(),
            profile_monitors: false,
            trace_monitors: None,
            verify_balanced_monitors: false,
            bias_bulk_rebias_threshold: 20,
            bias_bulk_revoke_threshold: 40,
            bias_decay_time: Duration::from_millis(25_000),
            monitor_spin_limit: 64,
        }
    }
}

impl LockingConfig {
    pub fn inline_fast_lock_supported(&self) -> bool {
        self.simple_fast_inflated_locking && self.monitor_offsets.owner.is_some()
    }

    pub fn inline_fast_unlock_supported(&self) -> bool {
        let offsets = &self.monitor_offsets;
        self.inline_fast_lock_supported()
            && offsets.recursions.is_some()
            && offsets.cxq.is_some()
            && offsets.entry_list.is_some()
            && offsets.succ.is_some()
    }

    /// Whether lock events on objects of `class_name` should be traced.
    pub fn traces(&self, class_name: &str) -> bool {
        match &self.trace_monitors {
            Some(filter) => filter.is_empty() || class_name.contains(filter.as_str()),
            None => false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;

        if self.word_size != size_of::<usize>() {
            return Err(ConfigError::WordSize(self.word_size));
        }

        if !self.page_size.is_power_of_two() || self.page_size <= self.word_size {
            return Err(ConfigError::PageSize(self.page_size));
        }

        if self.bias_bulk_revoke_threshold < self.bias_bulk_rebias_threshold {
            return Err(ConfigError::Thresholds {
                rebias: self.bias_bulk_rebias_threshold,
                revoke: self.bias_bulk_revoke_threshold,
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    OverlappingFields(&'static str, &'static str),
    PatternOutsideMask(&'static str),
    OwnerAlignment { required: usize, provided: usize },
    PageSize(usize),
    WordSize(usize),
    Thresholds { rebias: usize, revoke: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverlappingFields(a, b) => write!(f, "lock word fields overlap: {a} and {b}"),
            Self::PatternOutsideMask(name) => {
                write!(f, "{name} does not fit the bits reserved for it")
            }
            Self::OwnerAlignment { required, provided } => write!(
                f,
                "bias owner needs {required}-byte aligned threads, threads are {provided}-byte aligned"
            ),
            Self::PageSize(size) => write!(f, "page size {size} is not a usable power of two"),
            Self::WordSize(size) => write!(
                f,
                "word size {size} does not match the host word size {}",
                size_of::<usize>()
            ),
            Self::Thresholds { rebias, revoke } => write!(
                f,
                "bulk revoke threshold ({revoke}) must not be below bulk rebias threshold ({rebias})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_layout_is_consistent() {
        let layout = MarkLayout::host();
        assert_eq!(layout.lock_mask, 0b11);
        assert_eq!(layout.unlocked_value, 0b01);
        assert_eq!(layout.monitor_value, 0b10);
        assert_eq!(layout.biased_lock_mask, 0b111);
        assert_eq!(layout.biased_lock_pattern, 0b101);
        assert_eq!(layout.age_mask, 0b1111 << 3);
        assert_eq!(layout.epoch_mask, 0b11 << 7);
        assert_eq!(layout.owner_shift, 9);
        assert_eq!(layout.max_epoch(), 3);
        assert_eq!(layout.max_age(), 15);
        assert!(layout.validate().is_ok());
        assert!(LockingConfig::default().validate().is_ok());
    }

    #[test]
    fn overlapping_fields_are_rejected() {
        let mut layout = MarkLayout::host();
        layout.epoch_mask |= layout.age_mask;
        assert_eq!(
            layout.validate(),
            Err(ConfigError::OverlappingFields("age", "epoch"))
        );

        let mut layout = MarkLayout::host();
        layout.owner_shift = 12;
        assert!(matches!(
            layout.validate(),
            Err(ConfigError::OwnerAlignment { required: 4096, .. })
        ));
    }

    #[test]
    fn bad_sizes_are_rejected() {
        let config = LockingConfig {
            page_size: 3000,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PageSize(3000)));

        let config = LockingConfig {
            bias_bulk_rebias_threshold: 10,
            bias_bulk_revoke_threshold: 5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Thresholds { .. })
        ));
    }

    #[test]
    fn inflated_fast_paths_follow_monitor_offsets() {
        let mut config = LockingConfig::default();
        assert!(config.inline_fast_lock_supported());
        assert!(config.inline_fast_unlock_supported());

        config.monitor_offsets.succ = None;
        assert!(config.inline_fast_lock_supported());
        assert!(!config.inline_fast_unlock_supported());

        config.monitor_offsets = MonitorOffsets::unavailable();
        assert!(!config.inline_fast_lock_supported());

        config.monitor_offsets = MonitorOffsets::host();
        config.simple_fast_inflated_locking = false;
        assert!(!config.inline_fast_lock_supported());
        assert!(!config.inline_fast_unlock_supported());
    }

    #[test]
    fn trace_filter() {
        let mut config = LockingConfig::default();
        assert!(!config.traces("java.lang.Object"));
        config.trace_monitors = Some(String::new());
        assert!(config.traces("anything"));
        config.trace_monitors = Some("Vector".to_owned());
        assert!(config.traces("java.util.Vector"));
        assert!(!config.traces("java.util.ArrayList"));
    }
}
