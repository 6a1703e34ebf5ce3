use std::fmt;

pub const DEFAULT_MAX_SEQUENCE: u16 = 0xFFFF;

/// Identifier of a single outgoing datagram on a bounded, wrapping ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SequenceId(pub u16);

impl SequenceId {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn value(self) -> u16 {
        self.0
    }

    /// Next id on a ring whose highest value is `max`.
    #[inline]
    pub fn next(self, max: u16) -> Self {
        if self.0 >= max { Self(0) } else { Self(self.0 + 1) }
    }

    /// Id `count` steps behind this one on a ring whose highest value is `max`.
    pub fn back(self, count: u32, max: u16) -> Self {
        let range = max as u32 + 1;
        let value = (self.0 as u32 + range - (count % range)) % range;
        Self(value as u16)
    }

    #[inline]
    pub fn is_more_recent(self, other: Self, max: u16) -> bool {
        is_more_recent(self.0, other.0, max)
    }
}

impl From<u16> for SequenceId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `a` is more recent than `b` when the forward distance from `b` to `a`
/// is at most half of the ring.
#[inline]
pub fn is_more_recent(a: u16, b: u16, max: u16) -> bool {
    let half = max as u32 / 2;
    let (a, b) = (a as u32, b as u32);
    ((a > b) && (a - b <= half)) || ((b > a) && (b - a > half))
}

/// Position of `sequence` in the ack bitfield anchored at `ack`.
///
/// Only meaningful when `ack` is more recent than `sequence`; values above
/// 31 fall outside the bitfield.
pub fn bit_index(sequence: SequenceId, ack: SequenceId, max: u16) -> u32 {
    let (seq, ack, max) = (sequence.0 as u32, ack.0 as u32, max as u32);
    if seq > ack {
        ack + (max - seq)
    } else {
        ack - 1 - seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(is_more_recent(2, 1, DEFAULT_MAX_SEQUENCE));
        assert!(!is_more_recent(1, 2, DEFAULT_MAX_SEQUENCE));
        assert!(is_more_recent(0, u16::MAX, DEFAULT_MAX_SEQUENCE));
        assert!(!is_more_recent(u16::MAX, 0, DEFAULT_MAX_SEQUENCE));
    }

    #[test]
    fn test_more_recent_is_irreflexive_and_antisymmetric() {
        let max = 255;
        for a in 0..=max {
            assert!(!is_more_recent(a, a, max));
            for b in 0..=max {
                if is_more_recent(a, b, max) {
                    assert!(!is_more_recent(b, a, max), "a={a} b={b}");
                }
            }
        }
    }

    #[test]
    fn test_more_recent_wraps_on_small_ring() {
        assert!(is_more_recent(1, 250, 255));
        assert!(!is_more_recent(250, 1, 255));
        assert!(is_more_recent(127, 0, 255));
        assert!(!is_more_recent(128, 0, 255));
    }

    #[test]
    fn test_next_wraps_at_max() {
        assert_eq!(SequenceId(41).next(100), SequenceId(42));
        assert_eq!(SequenceId(100).next(100), SequenceId(0));
        assert_eq!(SequenceId(u16::MAX).next(u16::MAX), SequenceId(0));
    }

    #[test]
    fn test_back_wraps_below_zero() {
        assert_eq!(SequenceId(10).back(3, u16::MAX), SequenceId(7));
        assert_eq!(SequenceId(1).back(3, u16::MAX), SequenceId(u16::MAX - 1));
        assert_eq!(SequenceId(0).back(1, 100), SequenceId(100));
    }

    #[test]
    fn test_bit_index() {
        let max = DEFAULT_MAX_SEQUENCE;
        assert_eq!(bit_index(SequenceId(99), SequenceId(100), max), 0);
        assert_eq!(bit_index(SequenceId(68), SequenceId(100), max), 31);
        assert_eq!(bit_index(SequenceId(u16::MAX), SequenceId(0), max), 0);
        assert_eq!(bit_index(SequenceId(u16::MAX - 1), SequenceId(1), max), 2);
    }
}
