use crate::plat::Opcode;

use super::alu::AluMode;

/// Micro-operations, one per execute phase. Operand fetches come before these and are not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicroOp {
    /* Memory */
    /// `reg(arg1) <- mem[H:L]`
    LoadPointer,
    /// `mem[H:L] <- src(arg1)`
    StorePointer,
    /// `reg(ir >> 4) <- mem[arg1:arg2]`
    LoadAbsolute,
    /// `mem[arg1:arg2] <- reg(ir >> 4)`
    StoreAbsolute,

    /* Registers */
    /// `H <- arg1; L <- arg2`
    LoadAddress,
    /// `reg(arg1) <- arg2`
    LoadConstant,
    /// `reg(arg1) <- reg(arg2)`
    Move,

    /* ALU */
    /// Runs the ALU on `reg(arg1)` and `src(arg2)`. The result goes to `reg(arg1)`, except for
    /// [AluMode::Compare] which only touches F.
    Alu(AluMode),
    /// ORs the comparison of `reg(arg1)` and `src(arg2)` into F.
    CompareFlags,

    /* Branching */
    /// `PC <- H:L` if `src(arg1)` is non-zero.
    JumpIfNotZero,

    /* Stack */
    /// `mem[SP] <- src(arg1); SP.lo -= 1`
    Push,
    /// `SP.lo += 1; reg(arg1) <- mem[SP]`
    Pop,
}

impl Opcode {
    /// The execute phases of this opcode, in order.
    pub fn microcode(self) -> &'static [MicroOp] {
        match self {
            Self::Lw => &[MicroOp::LoadPointer],
            Self::Sw => &[MicroOp::StorePointer],
            Self::Lda => &[MicroOp::LoadAddress],
            Self::Lc => &[MicroOp::LoadConstant],
            Self::Add => &[MicroOp::Alu(AluMode::Add), MicroOp::CompareFlags],
            Self::Or => &[MicroOp::Alu(AluMode::Or)],
            Self::Nor => &[MicroOp::Alu(AluMode::Nor)],
            Self::And => &[MicroOp::Alu(AluMode::And)],
            Self::Jnz => &[MicroOp::JumpIfNotZero],
            Self::Mw => &[MicroOp::Move],
            Self::Ldf => &[MicroOp::Alu(AluMode::Compare)],
            Self::Lwa => &[MicroOp::LoadAbsolute],
            Self::Adc => &[MicroOp::Alu(AluMode::Adc), MicroOp::CompareFlags],
            Self::Swa => &[MicroOp::StoreAbsolute],
            Self::Push => &[MicroOp::Push],
            Self::Pop => &[MicroOp::Pop],
        }
    }

    /// Calculates the number of CPU cycles (phases) required for an instruction with this opcode
    /// to fully execute, fetches included.
    pub fn required_cycles(self) -> usize {
        // opcode byte, then one or two operand bytes
        let fetches = if self.shape().needs_arg_two() { 3 } else { 2 };
        fetches + self.microcode().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plat::OPCODES;

    #[test]
    fn test_required_cycles() {
        assert_eq!(Opcode::Lw.required_cycles(), 3);
        assert_eq!(Opcode::Push.required_cycles(), 3);
        assert_eq!(Opcode::Mw.required_cycles(), 4);
        assert_eq!(Opcode::Lda.required_cycles(), 4);
        assert_eq!(Opcode::Add.required_cycles(), 5);
        assert_eq!(Opcode::Adc.required_cycles(), 5);
        for def in OPCODES {
            assert!((3..=5).contains(&def.op.required_cycles()), "{}", def.name);
        }
    }
}
