//! Expansion of [Compound] instructions into primitive sequences, and the pass that turns the
//! fully-substituted line stream into a flat [Instruction] list.
//!
//! Layout computes instruction lengths by calling the very same [Mnemonic::expand] on
//! placeholder operands, so the two can never disagree about how long a line is.

use crate::plat::{InstrFormat, Instruction, Opcode, Register, Shape, Source};

use super::{lexer::parse_operand, AResult, AsmError, Compound, Line, Loc, Mnemonic, Operand, Session};

/// One row of the compound instruction table.
#[derive(Debug, Clone, Copy)]
pub struct CompoundDef {
    pub name: &'static str,
    pub compound: Compound,
    /// Inclusive bounds on the number of operand values (a `0XNNNN` address counts as one).
    pub min_operands: usize,
    pub max_operands: usize,
    /// Produces the primitive sequence, or `None` if the operand forms don't fit.
    /// The second argument is the return address, only meaningful for `CALL`.
    pub expand: fn(&[Operand], u16) -> Option<Vec<Instruction>>,
}

pub const COMPOUNDS: &[CompoundDef] = &[
    CompoundDef { name: "JMP", compound: Compound::Jmp, min_operands: 1, max_operands: 2, expand: jmp },
    CompoundDef { name: "JC", compound: Compound::Jc, min_operands: 1, max_operands: 2, expand: jc },
    CompoundDef { name: "JNC", compound: Compound::Jnc, min_operands: 1, max_operands: 2, expand: jnc },
    CompoundDef { name: "NOT", compound: Compound::Not, min_operands: 1, max_operands: 1, expand: not },
    CompoundDef { name: "NAND", compound: Compound::Nand, min_operands: 2, max_operands: 2, expand: nand },
    CompoundDef { name: "XOR", compound: Compound::Xor, min_operands: 2, max_operands: 2, expand: xor },
    CompoundDef { name: "XNOR", compound: Compound::Xnor, min_operands: 2, max_operands: 2, expand: xnor },
    CompoundDef { name: "STC", compound: Compound::Stc, min_operands: 0, max_operands: 0, expand: stc },
    CompoundDef { name: "SUB", compound: Compound::Sub, min_operands: 2, max_operands: 2, expand: sub },
    CompoundDef { name: "GTN", compound: Compound::Gtn, min_operands: 2, max_operands: 2, expand: gtn },
    CompoundDef { name: "LTN", compound: Compound::Ltn, min_operands: 2, max_operands: 2, expand: ltn },
    CompoundDef { name: "EQU", compound: Compound::Equ, min_operands: 2, max_operands: 2, expand: equ },
    CompoundDef { name: "MOV", compound: Compound::Mov, min_operands: 2, max_operands: 3, expand: mov },
    CompoundDef { name: "MOVMR", compound: Compound::Movmr, min_operands: 3, max_operands: 3, expand: movmr },
    CompoundDef { name: "MOVRM", compound: Compound::Movrm, min_operands: 3, max_operands: 3, expand: movrm },
    CompoundDef { name: "CALL", compound: Compound::Call, min_operands: 1, max_operands: 2, expand: call },
    CompoundDef { name: "RET", compound: Compound::Ret, min_operands: 0, max_operands: 0, expand: ret },
    CompoundDef { name: "NOP", compound: Compound::Nop, min_operands: 0, max_operands: 0, expand: nop },
    CompoundDef { name: "INC", compound: Compound::Inc, min_operands: 1, max_operands: 1, expand: inc },
    CompoundDef { name: "DEC", compound: Compound::Dec, min_operands: 1, max_operands: 1, expand: dec },
];

impl Compound {
    /// The table lists compounds in declaration order.
    pub fn def(self) -> &'static CompoundDef {
        &COMPOUNDS[self as usize]
    }
}

impl Mnemonic {
    /// Expands this mnemonic with the given operands into primitive instructions.
    ///
    /// # Errors
    ///
    /// This function will return an error if the operand count or forms are invalid for the
    /// mnemonic.
    pub fn expand(self, operands: &[Operand], return_address: u16, loc: &Loc) -> AResult<Vec<Instruction>> {
        let expanded = match self {
            Self::Regular(op) => primitive(op, operands).map(|i| vec![i]),
            Self::Compound(c) => {
                let def = c.def();
                if (def.min_operands..=def.max_operands).contains(&operands.len()) {
                    (def.expand)(operands, return_address)
                } else {
                    None
                }
            }
        };
        expanded.ok_or_else(|| AsmError::InvalidOperands {
            mnemonic: self.name().to_owned(),
            loc: loc.clone(),
        })
    }

    pub fn is_call(self) -> bool {
        self == Self::Compound(Compound::Call)
    }
}

/// Runs the pass: every line becomes one or more primitive instructions.
pub fn run(session: &Session) -> AResult<Vec<Instruction>> {
    let mut out = Vec::with_capacity(session.lines.len());
    for line in &session.lines {
        let mnemonic = session.mnemonics.lookup(line)?;
        let operands = literal_operands(line)?;
        out.extend(mnemonic.expand(&operands, line.return_address.unwrap_or(0), &line.loc)?);
    }
    Ok(out)
}

fn literal_operands(line: &Line) -> AResult<Vec<Operand>> {
    line.operands()
        .iter()
        .map(|t| {
            parse_operand(t).ok_or_else(|| AsmError::InvalidSymbol {
                symbol: t.clone(),
                loc: line.loc.clone(),
            })
        })
        .collect()
}

fn source(op: Operand) -> Option<Source> {
    match op {
        Operand::Reg(r) => Some(Source::Reg(r)),
        Operand::Byte(v) => Some(Source::Imm(v)),
        Operand::Word(_) => None,
    }
}

fn address(ops: &[Operand]) -> Option<(u8, u8)> {
    match *ops {
        [Operand::Word(w)] => Some(((w >> 8) as u8, w as u8)),
        [Operand::Byte(hi), Operand::Byte(lo)] => Some((hi, lo)),
        _ => None,
    }
}

/// Translates a primitive mnemonic with its operands, checking them against the opcode's shape.
fn primitive(op: Opcode, ops: &[Operand]) -> Option<Instruction> {
    use Operand::*;
    let format = match (op.shape(), ops) {
        (Shape::Reg, &[Reg(r)]) => InstrFormat::R(r),
        (Shape::Source, &[s]) => InstrFormat::S(source(s)?),
        (Shape::Address, ops) => {
            let (hi, lo) = address(ops)?;
            InstrFormat::II(hi, lo)
        }
        (Shape::RegImm, &[Reg(r), Byte(v)]) => InstrFormat::RI(r, v),
        (Shape::RegSource, &[Reg(r), s]) => InstrFormat::RS(r, source(s)?),
        (Shape::RegReg, &[Reg(a), Reg(b)]) => InstrFormat::RR(a, b),
        (Shape::EmbeddedReg, [Reg(r), rest @ ..]) => {
            let (hi, lo) = address(rest)?;
            InstrFormat::RA(*r, hi, lo)
        }
        _ => return None,
    };
    Some(Instruction::new(op, format))
}

const TRUE: Source = Source::Imm(0x01);

fn rs(op: Opcode, r: Register, src: Source) -> Instruction {
    Instruction::new(op, InstrFormat::RS(r, src))
}

fn mw(dest: Register, src: Register) -> Instruction {
    Instruction::new(Opcode::Mw, InstrFormat::RR(dest, src))
}

fn lc(dest: Register, imm: u8) -> Instruction {
    Instruction::new(Opcode::Lc, InstrFormat::RI(dest, imm))
}

fn jnz(src: Source) -> Instruction {
    Instruction::new(Opcode::Jnz, InstrFormat::S(src))
}

/// Loads any source into `H`.
fn load_h(src: Source) -> Instruction {
    match src {
        Source::Reg(r) => mw(Register::H, r),
        Source::Imm(v) => lc(Register::H, v),
    }
}

/// Where a jump goes: a literal address or the contents of a register pair.
enum Target {
    Literal(u8, u8),
    Pair(Register, Register),
}

impl Target {
    fn parse(ops: &[Operand]) -> Option<Self> {
        match *ops {
            [Operand::Reg(hi), Operand::Reg(lo)] => {
                // moving `lo` into L would read the already-overwritten H
                if lo == Register::H && hi != Register::H {
                    None
                } else {
                    Some(Self::Pair(hi, lo))
                }
            }
            _ => address(ops).map(|(hi, lo)| Self::Literal(hi, lo)),
        }
    }

    /// Puts the target address into `H:L`.
    fn load(&self) -> Vec<Instruction> {
        match *self {
            Self::Literal(hi, lo) => vec![Instruction::new(Opcode::Lda, InstrFormat::II(hi, lo))],
            Self::Pair(hi, lo) => vec![mw(Register::H, hi), mw(Register::L, lo)],
        }
    }
}

fn reg_source(ops: &[Operand]) -> Option<(Register, Source)> {
    match *ops {
        [Operand::Reg(r), s] => Some((r, source(s)?)),
        _ => None,
    }
}

/// Like [reg_source], but for expansions that clobber `H`.
fn reg_source_no_h(ops: &[Operand]) -> Option<(Register, Source)> {
    reg_source(ops).filter(|&(r, _)| r != Register::H)
}

fn jmp(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let mut out = Target::parse(ops)?.load();
    out.push(jnz(TRUE));
    Some(out)
}

fn jc(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let carry = rs(Opcode::And, Register::F, TRUE);
    let target = Target::parse(ops)?;
    let mut out = match target {
        Target::Literal(..) => [vec![carry], target.load()].concat(),
        Target::Pair(..) => [target.load(), vec![carry]].concat(),
    };
    out.push(jnz(Source::Reg(Register::F)));
    Some(out)
}

fn jnc(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let mut out = Target::parse(ops)?.load();
    out.extend([
        rs(Opcode::Nor, Register::F, Source::Reg(Register::F)),
        rs(Opcode::And, Register::F, TRUE),
        jnz(Source::Reg(Register::F)),
    ]);
    Some(out)
}

fn not(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let &[Operand::Reg(r)] = ops else {
        return None;
    };
    Some(vec![rs(Opcode::Nor, r, Source::Reg(r))])
}

fn nand(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let (r, s) = reg_source(ops)?;
    Some(vec![rs(Opcode::And, r, s), rs(Opcode::Nor, r, Source::Reg(r))])
}

fn xor(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let (r, s) = reg_source_no_h(ops)?;
    if s == Source::Reg(Register::H) {
        return None;
    }
    Some(vec![
        load_h(s),
        rs(Opcode::And, Register::H, Source::Reg(r)),
        rs(Opcode::Nor, r, s),
        rs(Opcode::Nor, r, Source::Reg(Register::H)),
    ])
}

fn xnor(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let (r, s) = reg_source_no_h(ops)?;
    if s == Source::Reg(Register::H) {
        return None;
    }
    Some(vec![
        load_h(s),
        rs(Opcode::And, Register::H, Source::Reg(r)),
        rs(Opcode::Nor, r, s),
        rs(Opcode::Or, r, Source::Reg(Register::H)),
    ])
}

fn stc(_: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    Some(vec![rs(Opcode::Or, Register::F, TRUE)])
}

fn sub(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let (r, s) = reg_source_no_h(ops)?;
    Some(vec![
        load_h(s),
        rs(Opcode::Nor, Register::H, Source::Reg(Register::H)),
        rs(Opcode::Or, Register::F, TRUE),
        rs(Opcode::Adc, r, Source::Reg(Register::H)),
    ])
}

fn compare(ops: &[Operand], mask: u8) -> Option<Vec<Instruction>> {
    let (r, s) = reg_source(ops)?;
    Some(vec![
        rs(Opcode::Ldf, r, s),
        rs(Opcode::And, Register::F, Source::Imm(mask)),
        mw(r, Register::F),
    ])
}

fn gtn(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    compare(ops, 0x02)
}

fn ltn(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    compare(ops, 0x08)
}

fn equ(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    compare(ops, 0x04)
}

fn mov(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    use Operand::*;
    let instr = match *ops {
        [Reg(d), Reg(s)] => mw(d, s),
        [Reg(d), Byte(v)] => lc(d, v),
        [Reg(d), ref addr @ ..] => {
            let (hi, lo) = address(addr)?;
            Instruction::new(Opcode::Lwa, InstrFormat::RA(d, hi, lo))
        }
        [ref addr @ .., Reg(s)] => {
            let (hi, lo) = address(addr)?;
            Instruction::new(Opcode::Swa, InstrFormat::RA(s, hi, lo))
        }
        _ => return None,
    };
    Some(vec![instr])
}

fn movmr(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let &[Operand::Reg(d), ref pair @ ..] = ops else {
        return None;
    };
    let Target::Pair(hi, lo) = Target::parse(pair)? else {
        return None;
    };
    let mut out = Target::Pair(hi, lo).load();
    out.push(Instruction::new(Opcode::Lw, InstrFormat::R(d)));
    Some(out)
}

fn movrm(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let [ref pair @ .., s] = *ops else {
        return None;
    };
    let s = source(s)?;
    if s == Source::Reg(Register::H) || s == Source::Reg(Register::L) {
        return None;
    }
    let Target::Pair(hi, lo) = Target::parse(pair)? else {
        return None;
    };
    let mut out = Target::Pair(hi, lo).load();
    out.push(Instruction::new(Opcode::Sw, InstrFormat::S(s)));
    Some(out)
}

fn call(ops: &[Operand], return_address: u16) -> Option<Vec<Instruction>> {
    let [hi, lo] = return_address.to_be_bytes();
    let mut out = vec![
        Instruction::new(Opcode::Push, InstrFormat::S(Source::Imm(hi))),
        Instruction::new(Opcode::Push, InstrFormat::S(Source::Imm(lo))),
    ];
    out.extend(jmp(ops, return_address)?);
    Some(out)
}

fn ret(_: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    Some(vec![
        Instruction::new(Opcode::Pop, InstrFormat::R(Register::L)),
        Instruction::new(Opcode::Pop, InstrFormat::R(Register::H)),
        jnz(TRUE),
    ])
}

fn nop(_: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    Some(vec![mw(Register::F, Register::F)])
}

fn inc(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let &[Operand::Reg(r)] = ops else {
        return None;
    };
    Some(vec![rs(Opcode::Add, r, TRUE)])
}

fn dec(ops: &[Operand], _: u16) -> Option<Vec<Instruction>> {
    let &[Operand::Reg(r)] = ops else {
        return None;
    };
    Some(vec![
        rs(Opcode::Or, Register::F, TRUE),
        rs(Opcode::Adc, r, Source::Imm(0xFE)),
    ])
}
