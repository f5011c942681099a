use std::fmt::{Display, Formatter};

/// Sequence numbers are 28 bits wide and wrap around, so comparisons have to
///  be made with respect to the wrap point (see [SeqNum::seq_less_than]).
///
/// The remaining four bits of the carrier `u32` are kept clear on the wire;
///  a received value with any of them set is corrupt.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNum {
    /// The number of distinct sequence numbers.
    pub const SEQ_SIZE: u32 = 0x1000_0000;
    pub const SEQ_MASK: u32 = Self::SEQ_SIZE - 1;

    pub const ZERO: SeqNum = SeqNum(0);

    pub fn new(value: u32) -> SeqNum {
        SeqNum(value & Self::SEQ_MASK)
    }

    /// Checked conversion from a wire value: the high nibble must be clear.
    pub fn from_wire(value: u32) -> Option<SeqNum> {
        if value & !Self::SEQ_MASK != 0 {
            None
        } else {
            Some(SeqNum(value))
        }
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1) & Self::SEQ_MASK)
    }

    pub fn prev(self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1) & Self::SEQ_MASK)
    }

    pub fn add(self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(n) & Self::SEQ_MASK)
    }

    pub fn sub(self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_sub(n) & Self::SEQ_MASK)
    }

    /// The wrapped distance from `other` forward to `self`,
    ///  i.e. `other.add(other.dist_after(...)) == self`... the masked
    ///  difference `self - other`.
    pub fn dist_after(self, other: SeqNum) -> u32 {
        self.0.wrapping_sub(other.0) & Self::SEQ_MASK
    }

    /// Wrap-aware strict order: `a < b` iff `a != b` and the forward distance
    ///  from `a` to `b` is shorter than half the sequence space.
    pub fn seq_less_than(self, other: SeqNum) -> bool {
        self != other && other.dist_after(self) < Self::SEQ_SIZE / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::small(17, 17)]
    #[case::max(0x0FFF_FFFF, 0x0FFF_FFFF)]
    #[case::wrapped(0x1000_0000, 0)]
    #[case::wrapped_offset(0x1000_0005, 5)]
    #[case::all_bits(0xFFFF_FFFF, 0x0FFF_FFFF)]
    fn test_mask(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(SeqNum::new(raw).to_raw(), expected);
    }

    #[test]
    fn test_mask_is_periodic() {
        for raw in [0u32, 1, 12345, 0x0FFF_FFFF] {
            assert_eq!(
                SeqNum::new(raw),
                SeqNum::new(raw.wrapping_add(SeqNum::SEQ_SIZE))
            );
        }
    }

    #[rstest]
    #[case::simple(1, 2, true)]
    #[case::equal(5, 5, false)]
    #[case::reverse(2, 1, false)]
    #[case::wrap(0x0FFF_FFFF, 0, true)]
    #[case::wrap_reverse(0, 0x0FFF_FFFF, false)]
    #[case::far(0, 0x0800_0000 - 1, true)]
    #[case::too_far(0, 0x0800_0000, false)]
    fn test_seq_less_than(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(SeqNum::new(a).seq_less_than(SeqNum::new(b)), expected);
    }

    #[test]
    fn test_strict_order_consistency() {
        // a < b implies !(b < a), across the wrap point
        let samples = [0u32, 1, 100, 0x0800_0000, 0x0FFF_FFFE, 0x0FFF_FFFF];
        for &a in &samples {
            for &b in &samples {
                let a = SeqNum::new(a);
                let b = SeqNum::new(b);
                if a.seq_less_than(b) {
                    assert!(!b.seq_less_than(a), "{} vs {}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_next_prev_roundtrip() {
        let wrap = SeqNum::new(0x0FFF_FFFF);
        assert_eq!(wrap.next(), SeqNum::ZERO);
        assert_eq!(SeqNum::ZERO.prev(), wrap);
        assert_eq!(wrap.next().prev(), wrap);
    }

    #[test]
    fn test_from_wire() {
        assert_eq!(SeqNum::from_wire(12), Some(SeqNum::new(12)));
        assert_eq!(SeqNum::from_wire(0x1000_0000), None);
        assert_eq!(SeqNum::from_wire(0xFFFF_FFFF), None);
    }
}
