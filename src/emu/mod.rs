//! The emulator/debugger module for JCPU.

use thiserror::Error;

pub mod alu;
pub mod cpu;
pub mod debugger;
pub mod emulator;
pub mod memory;
pub mod microcode;
pub mod registers;

pub use cpu::{Cpu, Peripheral, Step};
pub use emulator::{EmuState, Emulator, IoTrace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmuError {
    /// The executing instruction named a register code that doesn't exist. Reads of it yield
    /// 0xFF and writes to it are dropped.
    #[error("invalid register code 0x{code:02X} in instruction {instruction:02X?} at 0x{pc:04X}")]
    InvalidRegister {
        code: u8,
        instruction: [u8; 3],
        pc: u16,
    },
    #[error("image of {size} bytes at 0x{origin:04X} does not fit in memory")]
    ImageTooLarge { origin: u16, size: usize },
}
