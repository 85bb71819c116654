//! The second pass: assigns an address to every line and every data symbol.

use log::debug;

use super::{AResult, AsmError, Session};

/// The token that stands for the address of the line it appears on.
pub const CURRENT_ADDRESS: &str = "$";

/// Runs the pass. Binds procedure labels, replaces `$`, annotates `CALL` lines with their return
/// address, then places the data symbols right after the code.
pub fn run(session: &mut Session) -> AResult<()> {
    let origin = session.origin;
    let too_large = |size: usize| AsmError::ImageTooLarge { origin, size };
    let Session {
        lines,
        symbols,
        mnemonics,
        ..
    } = session;

    let mut offset = 0usize;
    for line in lines.iter_mut() {
        let address = u16::try_from(origin as usize + offset).map_err(|_| too_large(offset))?;

        for label in line.labels.drain(..) {
            debug!("Procedure {label} is at 0x{address:04X}");
            symbols.bind_procedure(&label, address);
        }

        if line.tokens.iter().any(|t| t == CURRENT_ADDRESS) {
            let [hi, lo] = address.to_be_bytes();
            line.tokens = line
                .tokens
                .drain(..)
                .flat_map(|t| {
                    if t == CURRENT_ADDRESS {
                        vec![format!("0X{hi:02X}"), format!("0X{lo:02X}")]
                    } else {
                        vec![t]
                    }
                })
                .collect();
            debug!("Replaced {CURRENT_ADDRESS} on {} with 0x{address:04X}", line.loc);
        }

        let mnemonic = mnemonics.lookup(line)?;
        let mut operands = vec![];
        for token in line.operands() {
            operands.extend(symbols.operands(token, &line.loc)?);
        }
        let len: usize = mnemonic
            .expand(&operands, 0, &line.loc)?
            .iter()
            .map(|i| i.len())
            .sum();

        if mnemonic.is_call() {
            let ret = u16::try_from(address as usize + len).map_err(|_| too_large(offset + len))?;
            debug!("Return address of call on {} is 0x{ret:04X}", line.loc);
            line.return_address = Some(ret);
        }
        offset += len;
    }
    session.code_size = offset;

    for data in session.symbols.data_mut() {
        data.address =
            u16::try_from(origin as usize + offset).map_err(|_| too_large(offset))?;
        debug!(
            "Data {} is at 0x{:04X}, {} bytes",
            data.symbol,
            data.address,
            data.bytes.len()
        );
        offset += data.bytes.len();
    }
    session.total_size = offset;

    if origin as usize + offset > 0x1_0000 {
        return Err(too_large(offset));
    }
    debug!(
        "Layout complete: {} bytes of code, {} bytes total",
        session.code_size, session.total_size
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::asm::{preprocess, MemorySource};

    fn layout(text: &str) -> AResult<Session> {
        let mut session = Session::new(0x8000);
        preprocess::run(&mut session, &MemorySource::default(), Path::new("test.asm"), text)?;
        run(&mut session)?;
        Ok(session)
    }

    #[test]
    fn test_addresses_and_sizes() {
        let session = layout(
            "
#DB MSG \"AB\"
#RESB BUF 4
MAIN:
    inc b
    jmp main
END:
    nop
",
        )
        .unwrap();
        assert_eq!(session.code_size, 3 + 5 + 3);
        assert_eq!(session.total_size, 11 + 3 + 4);
        assert_eq!(session.symbols.procedure("MAIN"), Some(0x8000));
        assert_eq!(session.symbols.procedure("END"), Some(0x8008));
        let data = session.symbols.data();
        assert_eq!(data[0].address, 0x800B);
        assert_eq!(data[1].address, 0x800E);
        assert!(session.lines.iter().all(|l| l.labels.is_empty()));
    }

    #[test]
    fn test_current_address() {
        let session = layout("#ORG 0X9000\nnop\njmp $").unwrap();
        assert_eq!(session.lines[1].tokens, ["JMP", "0X90", "0X03"]);
    }

    #[test]
    fn test_call_return_address() {
        let session = layout("call sub\nnop\nSUB:\nret").unwrap();
        assert_eq!(session.lines[0].return_address, Some(0x8009));
        assert_eq!(session.lines[0].to_string(), "CALL SUB : 0X8009");
        assert_eq!(session.symbols.procedure("SUB"), Some(0x800C));
    }

    #[test]
    fn test_forward_data_references() {
        let session = layout("lc h msg.h\nlc l msg.l\n#DB MSG 0X01").unwrap();
        assert_eq!(session.code_size, 6);
        assert_eq!(session.symbols.data_symbol("MSG").unwrap().address, 0x8006);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(layout("halt"), Err(AsmError::UnknownMnemonic { .. })));
        assert!(matches!(layout("add b q"), Err(AsmError::InvalidSymbol { .. })));
        assert!(matches!(layout("jmp b"), Err(AsmError::InvalidOperands { .. })));
        assert!(matches!(
            layout("#ORG 0XFFFE\nnop"),
            Err(AsmError::ImageTooLarge { .. })
        ));
    }
}
