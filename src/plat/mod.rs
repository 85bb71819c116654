//! Common platform code between JCPU's other modules.
//!
//! This is the instruction-set contract: the assembler's encoder and the emulator's decoder both
//! read the same [OPCODES] table, so opcode layout, operand forms and instruction lengths are
//! defined exactly once.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// An error for the core platform of JCPU.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("invalid opcode byte 0x{0:02X}")]
    InvalidOpcode(u8),
    #[error("invalid register code 0x{0:02X}")]
    InvalidRegister(u8),
    #[error("invalid operands for {0}")]
    InvalidInstruction(Opcode),
    #[error("instruction {0} is truncated")]
    Truncated(Opcode),
}

/// Type alias for Result<T, [PlatformError]>.
pub type PResult<T> = Result<T, PlatformError>;

/// First address of RAM. Everything below is ROM.
pub const RAM_START: u16 = 0x8000;
/// First address of the memory-mapped I/O window.
pub const IO_START: u16 = 0xFF00;
/// Size of the ROM region in bytes.
pub const ROM_SIZE: usize = RAM_START as usize;
/// Size of the RAM region in bytes.
pub const RAM_SIZE: usize = (IO_START - RAM_START) as usize;
/// Size of the I/O window in bytes.
pub const IO_SIZE: usize = 0x1_0000 - IO_START as usize;

/// Programs are loaded at the start of RAM unless told otherwise.
pub const DEFAULT_ORIGIN: u16 = RAM_START;

/// Writes to this I/O offset are mirrored into the low byte of the stack pointer.
pub const SP_LOW_PORT: u8 = 0x08;
/// Writes to this I/O offset are mirrored into the high byte of the stack pointer.
pub const SP_HIGH_PORT: u8 = 0x09;

/// Set on an opcode byte when its source operand is an immediate literal rather than a register.
pub const IMMEDIATE_BIT: u8 = 0x80;

/// The eight registers addressable by a 3-bit register code.
///
/// `H` and `L` form the memory pointer used by `LW`, `SW` and `JNZ`. `F` is the flag register;
/// it can be used as an ordinary operand, which is how the carry and comparison bits are tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    B = 0,
    C,
    /// Pointer high byte
    H,
    /// Pointer low byte
    L,
    D,
    E,
    A,
    /// Status flags
    F,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Self::B,
        Self::C,
        Self::H,
        Self::L,
        Self::D,
        Self::E,
        Self::A,
        Self::F,
    ];

    /// The 3-bit code of this register as it appears in machine code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::B => "B",
            Self::C => "C",
            Self::H => "H",
            Self::L => "L",
            Self::D => "D",
            Self::E => "E",
            Self::A => "A",
            Self::F => "F",
        }
    }
}

impl TryFrom<u8> for Register {
    type Error = PlatformError;

    fn try_from(value: u8) -> Result<Self, PlatformError> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(PlatformError::InvalidRegister(value))
    }
}

impl FromStr for Register {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The sixteen primitive operations the CPU can execute. The discriminant is the low nibble of
/// the opcode byte.
///
/// Everything else the assembler accepts (jumps, calls, subtraction, comparisons...) is a
/// [Compound](crate::asm::Compound) that expands into a sequence of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// `reg <- mem[H:L]`
    Lw = 0,
    /// `mem[H:L] <- reg/imm`
    Sw,
    /// `H <- hi; L <- lo`
    Lda,
    /// `reg <- imm`
    Lc,
    /// `regA <- regA + src`, carry OR'd into F, then the comparison bits are OR'd into F.
    Add,
    /// `regA <- regA | src`
    Or,
    /// `regA <- !(regA | src)`
    Nor,
    /// `regA <- regA & src`
    And,
    /// "Jump if not zero"
    /// ```text
    /// if src != 0 {
    ///     PC <- H:L
    /// }
    /// ```
    Jnz,
    /// `dest <- src`
    Mw,
    /// `F <- compare(regA, src)`, clearing F first.
    Ldf,
    /// `reg <- mem[hi:lo]`, register packed into the opcode byte.
    Lwa,
    /// `regA <- regA + src + carry`, then the comparison bits are OR'd into F.
    Adc,
    /// `mem[hi:lo] <- reg`, register packed into the opcode byte.
    Swa,
    /// `mem[SP] <- reg/imm; SP.lo -= 1`
    Push,
    /// `SP.lo += 1; reg <- mem[SP]`
    Pop,
}

/// The operand-form rule of an opcode: how many operand bytes follow it and what they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// `<Opcode, Register>`
    Reg,
    /// `<Opcode|IMM?, Register or Immediate>`
    Source,
    /// `<Opcode, ImmediateHi, ImmediateLo>`
    Address,
    /// `<Opcode, Register, Immediate>`
    RegImm,
    /// `<Opcode|IMM?, Register, Register or Immediate>`
    RegSource,
    /// `<Opcode, Register, Register>`
    RegReg,
    /// `<Opcode|Register << 4, ImmediateHi, ImmediateLo>`
    EmbeddedReg,
}

impl Shape {
    /// Total encoded length in bytes, opcode included.
    pub const fn len(self) -> usize {
        if self.needs_arg_two() {
            3
        } else {
            2
        }
    }

    /// Whether the CPU has to fetch a second operand byte for this shape.
    pub const fn needs_arg_two(self) -> bool {
        !matches!(self, Self::Reg | Self::Source)
    }

    /// Whether [IMMEDIATE_BIT] selects between a register and a literal source.
    pub const fn has_immediate_form(self) -> bool {
        matches!(self, Self::Source | Self::RegSource)
    }
}

/// One row of the instruction set table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeDef {
    pub name: &'static str,
    pub op: Opcode,
    pub shape: Shape,
}

/// The instruction set table, indexed by opcode number.
pub const OPCODES: [OpcodeDef; 16] = [
    OpcodeDef { name: "LW", op: Opcode::Lw, shape: Shape::Reg },
    OpcodeDef { name: "SW", op: Opcode::Sw, shape: Shape::Source },
    OpcodeDef { name: "LDA", op: Opcode::Lda, shape: Shape::Address },
    OpcodeDef { name: "LC", op: Opcode::Lc, shape: Shape::RegImm },
    OpcodeDef { name: "ADD", op: Opcode::Add, shape: Shape::RegSource },
    OpcodeDef { name: "OR", op: Opcode::Or, shape: Shape::RegSource },
    OpcodeDef { name: "NOR", op: Opcode::Nor, shape: Shape::RegSource },
    OpcodeDef { name: "AND", op: Opcode::And, shape: Shape::RegSource },
    OpcodeDef { name: "JNZ", op: Opcode::Jnz, shape: Shape::Source },
    OpcodeDef { name: "MW", op: Opcode::Mw, shape: Shape::RegReg },
    OpcodeDef { name: "LDF", op: Opcode::Ldf, shape: Shape::RegSource },
    OpcodeDef { name: "LWA", op: Opcode::Lwa, shape: Shape::EmbeddedReg },
    OpcodeDef { name: "ADC", op: Opcode::Adc, shape: Shape::RegSource },
    OpcodeDef { name: "SWA", op: Opcode::Swa, shape: Shape::EmbeddedReg },
    OpcodeDef { name: "PUSH", op: Opcode::Push, shape: Shape::Source },
    OpcodeDef { name: "POP", op: Opcode::Pop, shape: Shape::Reg },
];

impl Opcode {
    pub fn def(self) -> &'static OpcodeDef {
        &OPCODES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    pub fn shape(self) -> Shape {
        self.def().shape
    }

    /// Looks up a primitive mnemonic. Expects uppercase input.
    pub fn from_name(name: &str) -> Option<Self> {
        OPCODES.iter().find(|d| d.name == name).map(|d| d.op)
    }

    /// Identifies the operation of an opcode byte. The low nibble alone decides, so this never fails;
    /// the immediate bit and embedded register bits are the caller's business.
    pub fn decode(byte: u8) -> Self {
        OPCODES[(byte & 0x0F) as usize].op
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The source operand of an instruction that accepts either a register or a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Reg(Register),
    Imm(u8),
}

impl Source {
    fn byte(self) -> u8 {
        match self {
            Self::Reg(r) => r.code(),
            Self::Imm(v) => v,
        }
    }

    fn is_immediate(self) -> bool {
        matches!(self, Self::Imm(_))
    }

    fn decode(opcode: u8, byte: u8) -> PResult<Self> {
        if opcode & IMMEDIATE_BIT != 0 {
            Ok(Self::Imm(byte))
        } else {
            Ok(Self::Reg(byte.try_into()?))
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(r) => write!(f, "{r}"),
            Self::Imm(v) => write!(f, "0X{v:02X}"),
        }
    }
}

/// Operand formats, one per [Shape].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrFormat {
    /// [Shape::Reg]
    R(Register),
    /// [Shape::Source]
    S(Source),
    /// [Shape::Address]
    II(u8, u8),
    /// [Shape::RegImm]
    RI(Register, u8),
    /// [Shape::RegSource]
    RS(Register, Source),
    /// [Shape::RegReg]
    RR(Register, Register),
    /// [Shape::EmbeddedReg]
    RA(Register, u8, u8),
}

impl InstrFormat {
    fn shape(self) -> Shape {
        match self {
            Self::R(_) => Shape::Reg,
            Self::S(_) => Shape::Source,
            Self::II(..) => Shape::Address,
            Self::RI(..) => Shape::RegImm,
            Self::RS(..) => Shape::RegSource,
            Self::RR(..) => Shape::RegReg,
            Self::RA(..) => Shape::EmbeddedReg,
        }
    }
}

/// A single primitive instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: Opcode,
    pub format: InstrFormat,
}

impl Instruction {
    pub fn new(op: Opcode, format: InstrFormat) -> Self {
        Self { op, format }
    }

    /// Checks if this instruction has a valid format for its opcode.
    ///
    /// # Errors
    ///
    /// This function will return an error if the instruction's format is invalid for its opcode.
    pub fn validate(self) -> PResult<()> {
        if self.format.shape() == self.op.shape() {
            Ok(())
        } else {
            Err(PlatformError::InvalidInstruction(self.op))
        }
    }

    /// Encoded length in bytes.
    pub fn len(self) -> usize {
        self.op.shape().len()
    }

    /// Appends the machine code for this instruction to `out`.
    ///
    /// # Errors
    ///
    /// This function will return an error if the instruction's format is invalid for its opcode.
    pub fn encode_into(self, out: &mut Vec<u8>) -> PResult<()> {
        self.validate()?;
        let op = self.op as u8;
        match self.format {
            InstrFormat::R(r) => out.extend([op, r.code()]),
            InstrFormat::S(src) => {
                let op = if src.is_immediate() { op | IMMEDIATE_BIT } else { op };
                out.extend([op, src.byte()]);
            }
            InstrFormat::II(hi, lo) => out.extend([op, hi, lo]),
            InstrFormat::RI(r, imm) => out.extend([op, r.code(), imm]),
            InstrFormat::RS(r, src) => {
                let op = if src.is_immediate() { op | IMMEDIATE_BIT } else { op };
                out.extend([op, r.code(), src.byte()]);
            }
            InstrFormat::RR(a, b) => out.extend([op, a.code(), b.code()]),
            InstrFormat::RA(r, hi, lo) => out.extend([op | (r.code() << 4), hi, lo]),
        }
        Ok(())
    }

    /// Generates the machine code for this instruction.
    ///
    /// # Errors
    ///
    /// This function will return an error if the instruction's format is invalid for its opcode.
    pub fn to_bytes(self) -> PResult<Vec<u8>> {
        let mut out = Vec::with_capacity(3);
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decodes the instruction starting at `bytes[0]`. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// This function will return an error if the bytes are not a valid instruction.
    pub fn from_bytes(bytes: &[u8]) -> PResult<Self> {
        let first = *bytes.first().ok_or(PlatformError::InvalidOpcode(0))?;
        let op = Opcode::decode(first);
        let shape = op.shape();
        if bytes.len() < shape.len() {
            return Err(PlatformError::Truncated(op));
        }
        // bit 7 only means something for shapes with an immediate form, bits 4-6 only for
        // embedded-register shapes
        let stray_bits = match shape {
            Shape::Source | Shape::RegSource => first & 0x70,
            Shape::EmbeddedReg => first & IMMEDIATE_BIT,
            _ => first & 0xF0,
        };
        if stray_bits != 0 {
            return Err(PlatformError::InvalidOpcode(first));
        }
        let format = match shape {
            Shape::Reg => InstrFormat::R(bytes[1].try_into()?),
            Shape::Source => InstrFormat::S(Source::decode(first, bytes[1])?),
            Shape::Address => InstrFormat::II(bytes[1], bytes[2]),
            Shape::RegImm => InstrFormat::RI(bytes[1].try_into()?, bytes[2]),
            Shape::RegSource => {
                InstrFormat::RS(bytes[1].try_into()?, Source::decode(first, bytes[2])?)
            }
            Shape::RegReg => InstrFormat::RR(bytes[1].try_into()?, bytes[2].try_into()?),
            Shape::EmbeddedReg => InstrFormat::RA((first >> 4).try_into()?, bytes[1], bytes[2]),
        };
        Ok(Self { op, format })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        match self.format {
            InstrFormat::R(r) => write!(f, " {r}"),
            InstrFormat::S(src) => write!(f, " {src}"),
            InstrFormat::II(hi, lo) => write!(f, " 0X{hi:02X} 0X{lo:02X}"),
            InstrFormat::RI(r, imm) => write!(f, " {r} 0X{imm:02X}"),
            InstrFormat::RS(r, src) => write!(f, " {r} {src}"),
            InstrFormat::RR(a, b) => write!(f, " {a} {b}"),
            InstrFormat::RA(r, hi, lo) => write!(f, " {r} 0X{hi:02X} 0X{lo:02X}"),
        }
    }
}

/// Decodes a primitive stream loaded at `origin`, stopping at the first byte that doesn't start
/// a valid instruction. Returns the decoded instructions with their addresses, and the offset
/// of the undecoded tail.
pub fn disassemble(origin: u16, bytes: &[u8]) -> (Vec<(u16, Instruction)>, usize) {
    let mut out = vec![];
    let mut offset = 0;
    while offset < bytes.len() {
        let Ok(instr) = Instruction::from_bytes(&bytes[offset..]) else {
            break;
        };
        out.push((origin.wrapping_add(offset as u16), instr));
        offset += instr.len();
    }
    (out, offset)
}
