use super::registers::Fl;

/// The ALU's mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluMode {
    Add,
    /// Add with the carry flag as carry-in.
    Adc,
    And,
    Or,
    Nor,
    /// Compares the operands, replacing all flags. The result is unused.
    Compare,
}

impl AluMode {
    /// Computes `left <op> right` given the current flags, returning the result and the new flags.
    ///
    /// Carry is only ever OR'd in, never cleared: a program clears it explicitly.
    pub fn apply(self, left: u8, right: u8, flags: Fl) -> (u8, Fl) {
        match self {
            Self::Add => add(left, right, 0, flags),
            Self::Adc => add(left, right, flags.contains(Fl::CARRY) as u16, flags),
            Self::And => (left & right, flags),
            Self::Or => (left | right, flags),
            Self::Nor => (!(left | right), flags),
            Self::Compare => (left, compare(left, right)),
        }
    }
}

fn add(left: u8, right: u8, carry_in: u16, mut flags: Fl) -> (u8, Fl) {
    let sum = left as u16 + right as u16 + carry_in;
    if sum > 0xFF {
        flags |= Fl::CARRY;
    }
    (sum as u8, flags)
}

/// Exactly one of [Fl::GREATER], [Fl::EQUAL] and [Fl::LESS].
pub fn compare(left: u8, right: u8) -> Fl {
    match left.cmp(&right) {
        std::cmp::Ordering::Greater => Fl::GREATER,
        std::cmp::Ordering::Equal => Fl::EQUAL,
        std::cmp::Ordering::Less => Fl::LESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_carry_exhaustive() {
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                let (result, flags) = AluMode::Add.apply(a, b, Fl::empty());
                assert_eq!(result, a.wrapping_add(b));
                assert_eq!(flags.contains(Fl::CARRY), a as u16 + b as u16 > 255);
            }
        }
    }

    #[test]
    fn test_adc_uses_and_keeps_carry() {
        assert_eq!(AluMode::Adc.apply(0x10, 0x20, Fl::CARRY), (0x31, Fl::CARRY));
        assert_eq!(AluMode::Adc.apply(0xFF, 0x00, Fl::CARRY), (0x00, Fl::CARRY));
        assert_eq!(AluMode::Adc.apply(0x10, 0x20, Fl::empty()), (0x30, Fl::empty()));
        // x + !1 + 1 == x - 1
        assert_eq!(AluMode::Adc.apply(0x05, 0xFE, Fl::CARRY).0, 0x04);
    }

    #[test]
    fn test_compare_sets_exactly_one_flag() {
        for (a, b) in [(0u8, 0u8), (1, 0), (0, 1), (0x80, 0x7F), (0xFF, 0xFF)] {
            let (_, flags) = AluMode::Compare.apply(a, b, Fl::CARRY);
            assert_eq!(flags.bits().count_ones(), 1);
            assert!(!flags.contains(Fl::CARRY));
        }
        assert_eq!(compare(3, 2), Fl::GREATER);
        assert_eq!(compare(2, 2), Fl::EQUAL);
        assert_eq!(compare(1, 2), Fl::LESS);
    }

    #[test]
    fn test_logic() {
        assert_eq!(AluMode::Nor.apply(0xF0, 0x0F, Fl::empty()).0, 0x00);
        assert_eq!(AluMode::Nor.apply(0x00, 0x00, Fl::EQUAL), (0xFF, Fl::EQUAL));
        assert_eq!(AluMode::And.apply(0xF3, 0x3F, Fl::empty()).0, 0x33);
        assert_eq!(AluMode::Or.apply(0xF0, 0x0F, Fl::empty()).0, 0xFF);
    }
}
