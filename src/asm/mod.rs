//! The assembler module for JCPU.
//!
//! Assembly runs as a fixed sequence of passes over a [Session]:
//! [preprocess] → [layout] → [symbols] → [expand] → [encode].
//! Every pass completes before the next one starts, and every error is fatal.

use std::{fmt, path::PathBuf, sync::Arc};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::plat::{Instruction, Opcode, Register, OPCODES};

pub mod assembler;
pub mod encode;
pub mod expand;
pub mod layout;
pub mod lexer;
pub mod preprocess;
pub mod symbols;

pub use assembler::{Assembler, Config, Dumps, FsSource, MemorySource, SourceProvider};
pub use encode::Image;

/// Where a line came from: the file it was read from and its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loc {
    pub file: Arc<str>,
    pub line: usize,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} of {}", self.line, self.file)
    }
}

/// An error for the assembler module of JCPU. All of these abort the assembly run.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("unrecognized assembler command \"{directive}\" on {loc}")]
    UnknownDirective { directive: String, loc: Loc },
    #[error("invalid literal \"{text}\" on {loc}, column {column}")]
    InvalidLiteral {
        text: String,
        loc: Loc,
        column: usize,
    },
    #[error("invalid escaped character '{ch}' on {loc}")]
    InvalidEscape { ch: char, loc: Loc },
    #[error("escape sequence at string end on {loc}")]
    EscapeAtEnd { loc: Loc },
    #[error("illegal character in symbol \"{name}\" on {loc}")]
    IllegalName { name: String, loc: Loc },
    #[error("procedure \"{name}\" declared on {loc} is not followed by an instruction")]
    DanglingLabel { name: String, loc: Loc },
    #[error("symbol \"{name}\" on {loc} is already defined")]
    DuplicateSymbol { name: String, loc: Loc },
    #[error("invalid {directive} on {loc}")]
    InvalidDirective { directive: &'static str, loc: Loc },
    #[error("unrecognized instruction \"{mnemonic}\" on {loc}")]
    UnknownMnemonic { mnemonic: String, loc: Loc },
    #[error("invalid symbol \"{symbol}\" on {loc}")]
    InvalidSymbol { symbol: String, loc: Loc },
    #[error("invalid {mnemonic} on {loc}")]
    InvalidOperands { mnemonic: String, loc: Loc },
    #[error("included file \"{}\" on {loc} could not be read", .path.display())]
    Include {
        path: PathBuf,
        loc: Loc,
        #[source]
        source: std::io::Error,
    },
    #[error("includes nested too deeply on {loc}")]
    IncludeDepth { loc: Loc },
    #[error("program of {size} bytes at origin 0x{origin:04X} runs past the end of memory")]
    ImageTooLarge { origin: u16, size: usize },
    #[error("layout assumed {expected} bytes but {actual} were emitted")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Type alias for Result<T, [AsmError]>.
pub type AResult<T> = Result<T, AsmError>;

/// A literal operand, after symbols have been resolved (or replaced by same-shaped placeholders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Register),
    /// `0XNN`
    Byte(u8),
    /// `0XNNNN`, always an address
    Word(u16),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(r) => write!(f, "{r}"),
            Self::Byte(v) => write!(f, "0X{v:02X}"),
            Self::Word(v) => write!(f, "0X{v:04X}"),
        }
    }
}

/// One instruction line of the source stream, mnemonic first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub loc: Loc,
    pub tokens: Vec<String>,
    /// Procedures whose entry point is this line. Consumed by the layout pass.
    pub labels: Vec<String>,
    /// Address right after the expanded sequence, set on `CALL` lines by the layout pass.
    pub return_address: Option<u16>,
}

impl Line {
    pub fn new(loc: Loc, tokens: Vec<String>) -> Self {
        Self {
            loc,
            tokens,
            labels: vec![],
            return_address: None,
        }
    }

    pub fn mnemonic(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    pub fn operands(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or_default()
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(" "))?;
        for label in &self.labels {
            write!(f, " : PROC {label}")?;
        }
        if let Some(ret) = self.return_address {
            write!(f, " : 0X{ret:04X}")?;
        }
        Ok(())
    }
}

/// A superset of [Opcode], containing all of the "regular" ones that translate directly to machine code,
/// as well as [Compound] instructions that expand into several of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    /// A regular operation that can be directly translated to machine code.
    Regular(Opcode),
    /// A compound operation that requires multiple instructions to actually implement.
    Compound(Compound),
}

impl Mnemonic {
    pub fn name(self) -> &'static str {
        match self {
            Self::Regular(op) => op.name(),
            Self::Compound(c) => c.def().name,
        }
    }
}

/// Compound instructions (pseudo-instructions) that have no opcode of their own.
/// These are only valid as syntactic sugar in assembly listings, and never appear if one
/// were to disassemble a JCPU binary.
///
/// `H` and `L` double as scratch registers for several of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compound {
    /// Unconditional jump to a literal address or a register pair.
    ///
    /// Equivalent to:
    /// ```text
    /// lda     hi lo
    /// jnz     0x01
    /// ```
    Jmp,
    /// Jump if the carry flag is set.
    Jc,
    /// Jump if the carry flag is clear.
    Jnc,
    Not,
    Nand,
    /// Exclusive or, using `H` as scratch.
    ///
    /// Equivalent to:
    /// ```text
    /// mw      h regB      ; or lc h imm
    /// and     h regA
    /// nor     regA regB
    /// nor     regA h
    /// ```
    Xor,
    Xnor,
    /// Set carry.
    Stc,
    /// `regA <- regA - src`, using `H` as scratch.
    ///
    /// Equivalent to:
    /// ```text
    /// mw      h regB      ; or lc h imm
    /// nor     h h
    /// or      f 0x01
    /// adc     regA h
    /// ```
    Sub,
    /// `regA <- 0x02 if regA > src else 0`
    Gtn,
    /// `regA <- 0x08 if regA < src else 0`
    Ltn,
    /// `regA <- 0x04 if regA == src else 0`
    Equ,
    /// Register, constant, or absolute-address move, destination first.
    Mov,
    /// `regA <- mem[regB:regC]`
    Movmr,
    /// `mem[regA:regB] <- src`
    Movrm,
    /// Pushes the return address (high byte first), then jumps.
    ///
    /// Equivalent to:
    /// ```text
    /// push    ret.hi
    /// push    ret.lo
    /// lda     hi lo
    /// jnz     0x01
    /// ```
    Call,
    /// Equivalent to:
    /// ```text
    /// pop     l
    /// pop     h
    /// jnz     0x01
    /// ```
    Ret,
    Nop,
    Inc,
    Dec,
}

/// Mnemonic name → [Mnemonic], built once per assembly session from the instruction set table and
/// the compound table.
#[derive(Debug, Clone)]
pub struct MnemonicTable(FxHashMap<&'static str, Mnemonic>);

impl MnemonicTable {
    pub fn new() -> Self {
        let mut map = FxHashMap::default();
        for def in &OPCODES {
            map.insert(def.name, Mnemonic::Regular(def.op));
        }
        for def in expand::COMPOUNDS {
            map.insert(def.name, Mnemonic::Compound(def.compound));
        }
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<Mnemonic> {
        self.0.get(name).copied()
    }

    /// Like [get](Self::get), but an unknown mnemonic is an error.
    pub fn lookup(&self, line: &Line) -> AResult<Mnemonic> {
        self.get(line.mnemonic())
            .ok_or_else(|| AsmError::UnknownMnemonic {
                mnemonic: line.mnemonic().to_owned(),
                loc: line.loc.clone(),
            })
    }
}

impl Default for MnemonicTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Data declared with `#DB`, `#DW` or `#RESB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredData {
    pub symbol: String,
    pub bytes: Vec<u8>,
    /// Assigned by the layout pass, once the size of the code is known.
    pub address: u16,
    pub loc: Loc,
}

/// What a symbol token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRef<'a> {
    /// A procedure, with its address once the layout pass has bound it.
    Procedure(Option<u16>),
    DataHigh(&'a StoredData),
    DataLow(&'a StoredData),
    Constant(&'a str),
}

/// The symbol tables of one assembly run.
#[derive(Debug, Clone, Default)]
pub struct Symbols {
    constants: FxHashMap<String, String>,
    procedures: FxHashMap<String, Option<u16>>,
    data: Vec<StoredData>,
    data_index: FxHashMap<String, usize>,
}

impl Symbols {
    pub fn define_constant(&mut self, name: &str, text: &str, loc: &Loc) -> AResult<()> {
        if self.constants.contains_key(name) {
            return Err(duplicate(name, loc));
        }
        self.constants.insert(name.to_owned(), text.to_owned());
        Ok(())
    }

    pub fn declare_procedure(&mut self, name: &str, loc: &Loc) -> AResult<()> {
        if self.procedures.contains_key(name) {
            return Err(duplicate(name, loc));
        }
        self.procedures.insert(name.to_owned(), None);
        Ok(())
    }

    pub fn bind_procedure(&mut self, name: &str, address: u16) {
        self.procedures.insert(name.to_owned(), Some(address));
    }

    pub fn add_data(&mut self, data: StoredData) -> AResult<()> {
        if self.data_index.contains_key(&data.symbol) {
            return Err(duplicate(&data.symbol, &data.loc));
        }
        self.data_index.insert(data.symbol.clone(), self.data.len());
        self.data.push(data);
        Ok(())
    }

    pub fn constant(&self, name: &str) -> Option<&str> {
        self.constants.get(name).map(String::as_str)
    }

    pub fn procedure(&self, name: &str) -> Option<u16> {
        self.procedures.get(name).copied().flatten()
    }

    pub fn data(&self) -> &[StoredData] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [StoredData] {
        &mut self.data
    }

    pub fn data_symbol(&self, name: &str) -> Option<&StoredData> {
        self.data_index.get(name).map(|&i| &self.data[i])
    }

    /// Resolves a token, trying procedures, then `NAME.H`/`NAME.L` data references, then constants.
    pub fn lookup(&self, token: &str) -> Option<SymbolRef<'_>> {
        if let Some(&address) = self.procedures.get(token) {
            return Some(SymbolRef::Procedure(address));
        }
        if let Some(name) = token.strip_suffix(".H") {
            if let Some(data) = self.data_symbol(name) {
                return Some(SymbolRef::DataHigh(data));
            }
        }
        if let Some(name) = token.strip_suffix(".L") {
            if let Some(data) = self.data_symbol(name) {
                return Some(SymbolRef::DataLow(data));
            }
        }
        self.constant(token).map(SymbolRef::Constant)
    }
}

fn duplicate(name: &str, loc: &Loc) -> AsmError {
    AsmError::DuplicateSymbol {
        name: name.to_owned(),
        loc: loc.clone(),
    }
}

/// The mutable state of one assembly run, threaded through every pass and dropped afterwards.
#[derive(Debug, Clone)]
pub struct Session {
    pub origin: u16,
    pub lines: Vec<Line>,
    pub symbols: Symbols,
    /// Bytes of code, known after the layout pass.
    pub code_size: usize,
    /// Bytes of code plus data, known after the layout pass.
    pub total_size: usize,
    pub mnemonics: MnemonicTable,
}

impl Session {
    pub fn new(origin: u16) -> Self {
        Self {
            origin,
            lines: vec![],
            symbols: Symbols::default(),
            code_size: 0,
            total_size: 0,
            mnemonics: MnemonicTable::new(),
        }
    }
}

/// Sums the encoded length of a primitive instruction sequence.
pub fn byte_len(instrs: &[Instruction]) -> usize {
    instrs.iter().map(|i| i.len()).sum()
}
