use crate::ring_index::SafeStreamRingIndex;

/// Where a probe offset lies relative to an [OffsetRange]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OffsetPosition {
    /// the probe precedes the range
    Before,
    InRange,
    /// the probe follows the range, by at most one window
    After,
}

/// A range of offsets on the ring, including both `begin` and `end`. A probe is linearized
///  relative to `begin`: it is in range if its distance from `begin` is at most the range's
///  length, after the range if the excess is at most `window_size`, and before the range
///  otherwise.
///
/// `window_size` must not exceed half the ring for this to be unambiguous. That is up to the
///  caller to ensure (see [crate::config::SafeStreamConfig::validate]).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OffsetRange {
    pub begin: SafeStreamRingIndex,
    pub end: SafeStreamRingIndex,
    pub window_size: u32,
}

impl OffsetRange {
    pub fn new(begin: SafeStreamRingIndex, end: SafeStreamRingIndex, window_size: u32) -> OffsetRange {
        OffsetRange { begin, end, window_size }
    }

    /// The range for a half-open interval `[begin, end)`. `end` must differ from `begin`.
    pub fn from_half_open(begin: SafeStreamRingIndex, end: SafeStreamRingIndex, window_size: u32) -> OffsetRange {
        OffsetRange::new(begin, end.prev(), window_size)
    }

    /// distance from `begin` to `end`
    pub fn span(&self) -> u32 {
        self.begin.distance(self.end)
    }

    pub fn classify(&self, probe: SafeStreamRingIndex) -> OffsetPosition {
        let distance = self.begin.distance(probe);
        let span = self.span();

        if distance <= span {
            OffsetPosition::InRange
        }
        else if distance - span <= self.window_size {
            OffsetPosition::After
        }
        else {
            OffsetPosition::Before
        }
    }

    pub fn in_range(&self, probe: SafeStreamRingIndex) -> bool {
        self.classify(probe) == OffsetPosition::InRange
    }
}
