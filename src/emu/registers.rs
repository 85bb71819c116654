use std::fmt;

use crate::plat::{PResult, Register};

bitflags::bitflags! {
    /// The CPU status flags, kept in register F.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fl: u8 {
        /// Set by `ADD`/`ADC` when the sum overflowed 8 bits. Never cleared by them.
        const CARRY = 1 << 0;
        /// Left operand was greater than the right one.
        const GREATER = 1 << 1;
        /// Operands were equal.
        const EQUAL = 1 << 2;
        /// Left operand was less than the right one.
        const LESS = 1 << 3;
    }
}

/// The full set of registers in the CPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    /// General purpose registers, indexed by register code.
    pub file: [u8; 8],
    /// Opcode byte of the current instruction.
    pub ir: u8,
    pub arg_one: u8,
    pub arg_two: u8,
    pub pc_high: u8,
    pub pc_low: u8,
    pub sp_high: u8,
    pub sp_low: u8,
}

impl Registers {
    pub fn get(&self, reg: Register) -> u8 {
        self.file[reg.code() as usize]
    }

    pub fn set(&mut self, reg: Register, value: u8) {
        self.file[reg.code() as usize] = value;
    }

    /// Reads a register by its machine code.
    ///
    /// # Errors
    ///
    /// This function will return an error if `code` names no register.
    pub fn read(&self, code: u8) -> PResult<u8> {
        Ok(self.get(Register::try_from(code)?))
    }

    /// Writes a register by its machine code.
    ///
    /// # Errors
    ///
    /// This function will return an error if `code` names no register. Nothing is written then.
    pub fn write(&mut self, code: u8, value: u8) -> PResult<()> {
        self.set(Register::try_from(code)?, value);
        Ok(())
    }

    pub fn flags(&self) -> Fl {
        Fl::from_bits_retain(self.get(Register::F))
    }

    pub fn set_flags(&mut self, fl: Fl) {
        self.set(Register::F, fl.bits());
    }

    pub fn pc(&self) -> u16 {
        u16::from_be_bytes([self.pc_high, self.pc_low])
    }

    pub fn set_pc(&mut self, pc: u16) {
        [self.pc_high, self.pc_low] = pc.to_be_bytes();
    }

    /// Advances PC by one, wrapping from 0xFFFF to 0x0000.
    pub fn inc_pc(&mut self) {
        self.set_pc(self.pc().wrapping_add(1));
    }

    pub fn sp(&self) -> u16 {
        u16::from_be_bytes([self.sp_high, self.sp_low])
    }

    /// The memory pointer `H:L`.
    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.get(Register::H), self.get(Register::L)])
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reg in Register::ALL {
            write!(f, "{reg}={:02X} ", self.get(reg))?;
        }
        writeln!(f)?;
        write!(
            f,
            "PC={:04X} SP={:04X} IR={:02X} ARG1={:02X} ARG2={:02X} FLAGS={:?}",
            self.pc(),
            self.sp(),
            self.ir,
            self.arg_one,
            self.arg_two,
            self.flags()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plat::PlatformError;

    #[test]
    fn test_register_codes() {
        let mut regs = Registers::default();
        regs.write(6, 0x42).unwrap();
        assert_eq!(regs.get(Register::A), 0x42);
        assert_eq!(regs.read(6), Ok(0x42));
        assert_eq!(regs.read(8), Err(PlatformError::InvalidRegister(8)));
        assert_eq!(regs.write(0xFF, 1), Err(PlatformError::InvalidRegister(0xFF)));
        assert_eq!(regs.file, [0, 0, 0, 0, 0, 0, 0x42, 0]);
    }

    #[test]
    fn test_pc_wraps() {
        let mut regs = Registers::default();
        regs.set_pc(0x80FF);
        regs.inc_pc();
        assert_eq!((regs.pc_high, regs.pc_low), (0x81, 0x00));
        regs.set_pc(0xFFFF);
        regs.inc_pc();
        assert_eq!(regs.pc(), 0);
    }

    #[test]
    fn test_flags_live_in_f() {
        let mut regs = Registers::default();
        regs.set_flags(Fl::CARRY | Fl::LESS);
        assert_eq!(regs.get(Register::F), 0x09);
        regs.set(Register::F, 0xF4);
        assert!(regs.flags().contains(Fl::EQUAL));
    }
}
