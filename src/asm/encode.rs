//! The last pass: machine code for every instruction, followed by the data segment.

use log::{debug, error};

use crate::plat::Instruction;

use super::{AResult, AsmError, Session};

/// An assembled program: code then data, to be loaded at `origin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub origin: u16,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
}

impl Image {
    pub fn len(&self) -> usize {
        self.code.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The flat binary, exactly as it will sit in memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Runs the pass.
///
/// # Errors
///
/// This function will return an error if the emitted size differs from what the layout pass
/// computed, since every address in the program would then be wrong.
pub fn run(session: &Session, program: &[Instruction]) -> AResult<Image> {
    let mut code = Vec::with_capacity(session.code_size);
    for instr in program {
        if let Err(e) = instr.encode_into(&mut code) {
            error!("Skipping {instr}: {e}");
        }
    }
    if code.len() != session.code_size {
        return Err(AsmError::SizeMismatch {
            expected: session.code_size,
            actual: code.len(),
        });
    }

    let mut data = Vec::with_capacity(session.total_size - session.code_size);
    for d in session.symbols.data() {
        debug!(
            "Allocating {} bytes for {} at 0x{:04X}",
            d.bytes.len(),
            d.symbol,
            d.address
        );
        data.extend_from_slice(&d.bytes);
    }

    let image = Image {
        origin: session.origin,
        code,
        data,
    };
    if image.len() != session.total_size {
        return Err(AsmError::SizeMismatch {
            expected: session.total_size,
            actual: image.len(),
        });
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plat::{InstrFormat, Opcode, Register};

    #[test]
    fn test_size_mismatch_is_fatal() {
        let mut session = Session::new(0x8000);
        session.code_size = 4;
        session.total_size = 4;
        let program = [Instruction::new(Opcode::Pop, InstrFormat::R(Register::A))];
        assert!(matches!(
            run(&session, &program),
            Err(AsmError::SizeMismatch { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_image_bytes() {
        let mut session = Session::new(0x8000);
        session.code_size = 2;
        session.total_size = 2;
        let program = [Instruction::new(Opcode::Pop, InstrFormat::R(Register::A))];
        let image = run(&session, &program).unwrap();
        assert_eq!(image.to_bytes(), [0x0F, 0x06]);
        assert!(image.data.is_empty());
    }
}
