//! The third pass: replaces symbol references with literal text, so that the expander only
//! ever sees registers and hex literals.

use log::trace;

use super::{
    lexer::{parse_operand, split_tokens},
    AResult, AsmError, Loc, Operand, Session, SymbolRef, Symbols,
};

fn invalid(token: &str, loc: &Loc) -> AsmError {
    AsmError::InvalidSymbol {
        symbol: token.to_owned(),
        loc: loc.clone(),
    }
}

/// Parses every token of a constant's text as a literal operand.
fn constant_operands(text: &str, loc: &Loc) -> AResult<Vec<Operand>> {
    split_tokens(text)
        .map(|t| parse_operand(t).ok_or_else(|| invalid(t, loc)))
        .collect()
}

impl Symbols {
    /// Classifies an operand token into the literal operands it will become, using placeholder
    /// values where addresses are not yet known. The shapes are exact, so lengths computed from
    /// the result match the final encoding.
    pub fn operands(&self, token: &str, loc: &Loc) -> AResult<Vec<Operand>> {
        match self.lookup(token) {
            Some(SymbolRef::Procedure(address)) => Ok(vec![Operand::Word(address.unwrap_or(0))]),
            Some(SymbolRef::DataHigh(d)) => Ok(vec![Operand::Byte((d.address >> 8) as u8)]),
            Some(SymbolRef::DataLow(d)) => Ok(vec![Operand::Byte(d.address as u8)]),
            Some(SymbolRef::Constant(text)) => constant_operands(text, loc),
            None => Ok(vec![parse_operand(token).ok_or_else(|| invalid(token, loc))?]),
        }
    }

    /// Replaces a symbol token with its literal text. Literal tokens are returned unchanged.
    pub fn substitute(&self, token: &str, loc: &Loc) -> AResult<Vec<String>> {
        let out = match self.lookup(token) {
            Some(SymbolRef::Procedure(Some(address))) => {
                let [hi, lo] = address.to_be_bytes();
                vec![format!("0X{hi:02X}"), format!("0X{lo:02X}")]
            }
            Some(SymbolRef::Procedure(None)) => return Err(invalid(token, loc)),
            Some(SymbolRef::DataHigh(d)) => vec![format!("0X{:02X}", d.address >> 8)],
            Some(SymbolRef::DataLow(d)) => vec![format!("0X{:02X}", d.address & 0xFF)],
            Some(SymbolRef::Constant(text)) => {
                constant_operands(text, loc)?;
                split_tokens(text).map(str::to_owned).collect()
            }
            None => {
                parse_operand(token).ok_or_else(|| invalid(token, loc))?;
                vec![token.to_owned()]
            }
        };
        Ok(out)
    }
}

/// Runs the pass over every line's operands.
pub fn run(session: &mut Session) -> AResult<()> {
    let Session { lines, symbols, .. } = session;
    for line in lines.iter_mut() {
        let mut tokens = Vec::with_capacity(line.tokens.len() + 1);
        tokens.push(line.mnemonic().to_owned());
        for token in line.operands() {
            let replaced = symbols.substitute(token, &line.loc)?;
            if replaced.len() != 1 || replaced[0] != *token {
                trace!("Replaced {token} with {} on {}", replaced.join(" "), line.loc);
            }
            tokens.extend(replaced);
        }
        line.tokens = tokens;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{asm::StoredData, plat::Register};

    fn loc() -> Loc {
        Loc {
            file: "test.asm".into(),
            line: 1,
        }
    }

    fn symbols() -> Symbols {
        let mut symbols = Symbols::default();
        symbols.declare_procedure("LOOP", &loc()).unwrap();
        symbols.bind_procedure("LOOP", 0x8010);
        symbols.define_constant("PTR", "D E", &loc()).unwrap();
        symbols.define_constant("PAIR", "H, L", &loc()).unwrap();
        symbols.define_constant("BAD", "Q", &loc()).unwrap();
        symbols
            .add_data(StoredData {
                symbol: "MSG".into(),
                bytes: vec![0],
                address: 0x9A05,
                loc: loc(),
            })
            .unwrap();
        symbols
    }

    #[test]
    fn test_substitute() {
        let symbols = symbols();
        assert_eq!(symbols.substitute("LOOP", &loc()).unwrap(), ["0X80", "0X10"]);
        assert_eq!(symbols.substitute("MSG.H", &loc()).unwrap(), ["0X9A"]);
        assert_eq!(symbols.substitute("MSG.L", &loc()).unwrap(), ["0X05"]);
        assert_eq!(symbols.substitute("PTR", &loc()).unwrap(), ["D", "E"]);
        assert_eq!(symbols.substitute("PAIR", &loc()).unwrap(), ["H", "L"]);
        assert_eq!(symbols.substitute("0X05", &loc()).unwrap(), ["0X05"]);
        assert_eq!(symbols.substitute("B", &loc()).unwrap(), ["B"]);
    }

    #[test]
    fn test_unknown_symbols() {
        let symbols = symbols();
        for token in ["NOWHERE", "MSG", "BAD", "0X12345"] {
            assert!(
                matches!(symbols.substitute(token, &loc()), Err(AsmError::InvalidSymbol { .. })),
                "{token}"
            );
        }
    }

    #[test]
    fn test_operand_shapes_match_substitution() {
        let symbols = symbols();
        assert_eq!(symbols.operands("LOOP", &loc()).unwrap(), [Operand::Word(0x8010)]);
        assert_eq!(symbols.operands("MSG.L", &loc()).unwrap(), [Operand::Byte(0x05)]);
        assert_eq!(
            symbols.operands("PTR", &loc()).unwrap(),
            [Operand::Reg(Register::D), Operand::Reg(Register::E)]
        );
        assert_eq!(
            symbols.operands("PAIR", &loc()).unwrap(),
            [Operand::Reg(Register::H), Operand::Reg(Register::L)]
        );
    }
}
