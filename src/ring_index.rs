use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::util::safe_converter::PrecheckedCast;

/// A position on a ring of `MAX` positions. The value is always reduced modulo `MAX`, so adding
///  or subtracting any number of steps never overflows the wire representation.
///
/// There is no total order on a ring: use [RingIndex::distance] relative to a reference point
///  (or [crate::offset_range::OffsetRange]) to decide which of two indices comes first.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct RingIndex<const MAX: u32>(u32);

/// Stream offsets as they go over the wire
pub type SafeStreamRingIndex = RingIndex<65536>;

impl <const MAX: u32> RingIndex<MAX> {
    pub const ZERO: Self = RingIndex(0);

    pub fn new(value: u32) -> Self {
        RingIndex(value % MAX)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn clockwise(&mut self, steps: u32) {
        self.0 = ((self.0 as u64 + steps as u64) % MAX as u64) as u32;
    }

    pub fn counter_clockwise(&mut self, steps: u32) {
        let steps = steps % MAX;
        self.0 = ((self.0 as u64 + MAX as u64 - steps as u64) % MAX as u64) as u32;
    }

    /// number of clockwise steps it takes to get from `self` to `other`
    pub fn distance(&self, other: Self) -> u32 {
        ((other.0 as u64 + MAX as u64 - self.0 as u64) % MAX as u64) as u32
    }

    pub fn next(&self) -> Self {
        *self + 1
    }

    pub fn prev(&self) -> Self {
        *self - 1
    }
}

impl SafeStreamRingIndex {
    pub fn from_wire(value: u16) -> Self {
        RingIndex(value as u32)
    }

    pub fn to_wire(&self) -> u16 {
        self.0.prechecked_cast()
    }
}

impl <const MAX: u32> Debug for RingIndex<MAX> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}
impl <const MAX: u32> Display for RingIndex<MAX> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl <const MAX: u32> Add<u32> for RingIndex<MAX> {
    type Output = Self;

    fn add(mut self, rhs: u32) -> Self::Output {
        self.clockwise(rhs);
        self
    }
}
impl <const MAX: u32> AddAssign<u32> for RingIndex<MAX> {
    fn add_assign(&mut self, rhs: u32) {
        self.clockwise(rhs);
    }
}
impl <const MAX: u32> Sub<u32> for RingIndex<MAX> {
    type Output = Self;

    fn sub(mut self, rhs: u32) -> Self::Output {
        self.counter_clockwise(rhs);
        self
    }
}
impl <const MAX: u32> SubAssign<u32> for RingIndex<MAX> {
    fn sub_assign(&mut self, rhs: u32) {
        self.counter_clockwise(rhs);
    }
}
