//! The execution core: one [Cpu::step] is one phase of the fetch/execute cycle.

use log::{trace, warn};

use crate::plat::{Instruction, Opcode, PResult, Register, IMMEDIATE_BIT};

use super::{
    alu::{compare, AluMode},
    memory::{IoResponse, Memory},
    microcode::MicroOp,
    registers::Registers,
    EmuError,
};

/// An external device that watches I/O port 0. It runs at the start of an instruction whenever
/// the port changed since the previous check, and may read or modify anything in the CPU.
pub trait Peripheral {
    fn on_io(&mut self, cpu: &mut Cpu);
}

impl Peripheral for () {
    fn on_io(&mut self, _cpu: &mut Cpu) {}
}

impl<P: Peripheral + ?Sized> Peripheral for Box<P> {
    fn on_io(&mut self, cpu: &mut Cpu) {
        (**self).on_io(cpu)
    }
}

impl<P: Peripheral> Peripheral for Vec<P> {
    fn on_io(&mut self, cpu: &mut Cpu) {
        for p in self.iter_mut() {
            p.on_io(cpu);
        }
    }
}

/// What happened during one [Cpu::step].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// The phase that just ran.
    pub phase: u8,
    /// Whether the I/O hook fired.
    pub io_event: bool,
    /// Whether this was the last phase of an instruction.
    pub completed: bool,
    pub anomalies: Vec<EmuError>,
}

/// The JCPU processor with its memory.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub registers: Registers,
    pub memory: Memory,
    phase: u8,
    needs_arg_two: bool,
    /// Value of I/O port 0 at the previous check.
    last_io: u8,
    anomalies: Vec<EmuError>,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            registers: Registers::default(),
            memory: Memory::new(),
            phase: 0,
            needs_arg_two: false,
            last_io: 0,
            anomalies: vec![],
        }
    }

    /// Clears all registers, all memory, and the phase counter.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The phase the next [step](Self::step) will run. 0 means the next step starts a new
    /// instruction.
    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn read_memory(&self, addr: u16) -> u8 {
        self.memory.read(addr)
    }

    /// Writes a byte, mirroring stack pointer port writes into SP.
    pub fn write_memory(&mut self, addr: u16, value: u8) {
        match self.memory.write(addr, value) {
            IoResponse::None => {}
            IoResponse::StackPointerLow(v) => self.registers.sp_low = v,
            IoResponse::StackPointerHigh(v) => self.registers.sp_high = v,
        }
    }

    /// Copies `bytes` into memory starting at `origin`, through the normal write path.
    ///
    /// # Errors
    ///
    /// This function will return an error if the bytes would run past 0xFFFF.
    pub fn load(&mut self, origin: u16, bytes: &[u8]) -> Result<(), EmuError> {
        if origin as usize + bytes.len() > 0x1_0000 {
            return Err(EmuError::ImageTooLarge {
                origin,
                size: bytes.len(),
            });
        }
        for (addr, &b) in (origin..=u16::MAX).zip(bytes) {
            self.write_memory(addr, b);
        }
        Ok(())
    }

    /// Decodes the instruction currently held in IR and the operand registers.
    ///
    /// # Errors
    ///
    /// This function will return an error if those bytes are not a valid instruction.
    pub fn current_instruction(&self) -> PResult<Instruction> {
        let regs = &self.registers;
        Instruction::from_bytes(&[regs.ir, regs.arg_one, regs.arg_two])
    }

    /// Runs one phase.
    ///
    /// Phase 0 checks I/O port 0 (calling `io` if it changed) and fetches the opcode. Phase 1
    /// fetches the first operand, phase 2 the second one if the opcode needs it. The remaining
    /// phases each run one [MicroOp]; the last of them wraps the counter back to 0.
    pub fn step(&mut self, io: &mut dyn Peripheral) -> Step {
        let phase = self.phase;
        let mut step = Step {
            phase,
            ..Step::default()
        };
        match phase {
            0 => {
                if self.memory.io(0) != self.last_io {
                    trace!("I/O port 0 changed to 0x{:02X}", self.memory.io(0));
                    step.io_event = true;
                    io.on_io(self);
                }
                self.last_io = self.memory.io(0);
                self.registers.ir = self.fetch();
                self.needs_arg_two = Opcode::decode(self.registers.ir)
                    .shape()
                    .needs_arg_two();
                self.phase = 1;
            }
            1 => {
                self.registers.arg_one = self.fetch();
                self.phase = 2;
            }
            2 if self.needs_arg_two => {
                self.registers.arg_two = self.fetch();
                self.phase = 3;
            }
            n => {
                let fetches = if self.needs_arg_two { 3 } else { 2 };
                let microcode = Opcode::decode(self.registers.ir).microcode();
                let index = (n - fetches) as usize;
                if let Some(&op) = microcode.get(index) {
                    trace!("> {op:?}");
                    self.execute(op);
                }
                if index + 1 >= microcode.len() {
                    step.completed = true;
                    self.phase = 0;
                } else {
                    self.phase = n + 1;
                }
            }
        }
        step.anomalies = std::mem::take(&mut self.anomalies);
        step
    }

    fn fetch(&mut self) -> u8 {
        let value = self.read_memory(self.registers.pc());
        self.registers.inc_pc();
        value
    }

    fn anomaly(&mut self, code: u8) {
        let regs = &self.registers;
        let err = EmuError::InvalidRegister {
            code,
            instruction: [regs.ir, regs.arg_one, regs.arg_two],
            pc: regs.pc(),
        };
        warn!("{err}");
        self.anomalies.push(err);
    }

    /// Reads a register by code. A bad code reads as 0xFF.
    fn reg(&mut self, code: u8) -> u8 {
        match self.registers.read(code) {
            Ok(v) => v,
            Err(_) => {
                self.anomaly(code);
                0xFF
            }
        }
    }

    /// Writes a register by code. Writes to a bad code are dropped.
    fn set_reg(&mut self, code: u8, value: u8) {
        if self.registers.write(code, value).is_err() {
            self.anomaly(code);
        }
    }

    /// The register or immediate named by `byte`, depending on the opcode's immediate bit.
    fn source(&mut self, byte: u8) -> u8 {
        if self.registers.ir & IMMEDIATE_BIT != 0 {
            byte
        } else {
            self.reg(byte)
        }
    }

    fn execute(&mut self, op: MicroOp) {
        let ir = self.registers.ir;
        let arg_one = self.registers.arg_one;
        let arg_two = self.registers.arg_two;
        let absolute = u16::from_be_bytes([arg_one, arg_two]);
        match op {
            MicroOp::LoadPointer => {
                let v = self.read_memory(self.registers.hl());
                self.set_reg(arg_one, v);
            }
            MicroOp::StorePointer => {
                let v = self.source(arg_one);
                self.write_memory(self.registers.hl(), v);
            }
            MicroOp::LoadAbsolute => {
                let v = self.read_memory(absolute);
                self.set_reg((ir >> 4) & 0x07, v);
            }
            MicroOp::StoreAbsolute => {
                let v = self.reg((ir >> 4) & 0x07);
                self.write_memory(absolute, v);
            }
            MicroOp::LoadAddress => {
                self.registers.set(Register::H, arg_one);
                self.registers.set(Register::L, arg_two);
            }
            MicroOp::LoadConstant => self.set_reg(arg_one, arg_two),
            MicroOp::Move => {
                let v = self.reg(arg_two);
                self.set_reg(arg_one, v);
            }
            MicroOp::Alu(mode) => {
                let left = self.reg(arg_one);
                let right = self.source(arg_two);
                let (result, flags) = mode.apply(left, right, self.registers.flags());
                self.registers.set_flags(flags);
                if mode != AluMode::Compare {
                    self.set_reg(arg_one, result);
                }
            }
            MicroOp::CompareFlags => {
                let left = self.reg(arg_one);
                let right = self.source(arg_two);
                let flags = self.registers.flags() | compare(left, right);
                self.registers.set_flags(flags);
            }
            MicroOp::JumpIfNotZero => {
                if self.source(arg_one) != 0 {
                    self.registers.set_pc(self.registers.hl());
                }
            }
            MicroOp::Push => {
                let v = self.source(arg_one);
                self.write_memory(self.registers.sp(), v);
                self.registers.sp_low = self.registers.sp_low.wrapping_sub(1);
            }
            MicroOp::Pop => {
                self.registers.sp_low = self.registers.sp_low.wrapping_add(1);
                let v = self.read_memory(self.registers.sp());
                self.set_reg(arg_one, v);
            }
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::registers::Fl;

    /// A CPU with `program` at 0x8000 and PC pointing at it.
    fn cpu_with(program: &[u8]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.load(0x8000, program).unwrap();
        cpu.registers.set_pc(0x8000);
        cpu
    }

    /// Steps until an instruction completes, returning how many steps that took.
    fn run_instr(cpu: &mut Cpu) -> usize {
        let mut steps = 0;
        loop {
            steps += 1;
            if cpu.step(&mut ()).completed {
                return steps;
            }
        }
    }

    #[test]
    fn test_phase_counts() {
        // LW B; MW B C; ADD B 0x01
        let mut cpu = cpu_with(&[0x00, 0x00, 0x09, 0x00, 0x01, 0x84, 0x00, 0x01]);
        assert_eq!(run_instr(&mut cpu), 3);
        assert_eq!(run_instr(&mut cpu), 4);
        assert_eq!(run_instr(&mut cpu), 5);
        assert_eq!(cpu.phase(), 0);
    }

    #[test]
    fn test_add_sets_carry_and_comparison() {
        // LC A 0xFF; ADD A 0x02
        let mut cpu = cpu_with(&[0x03, 0x06, 0xFF, 0x84, 0x06, 0x02]);
        run_instr(&mut cpu);
        run_instr(&mut cpu);
        assert_eq!(cpu.registers.get(Register::A), 0x01);
        // 0x01 < 0x02 after the wrap
        assert_eq!(cpu.registers.flags(), Fl::CARRY | Fl::LESS);
    }

    #[test]
    fn test_ldf_replaces_flags() {
        // LC F 0xFF; LDF B 0x00
        let mut cpu = cpu_with(&[0x03, 0x07, 0xFF, 0x8A, 0x00, 0x00]);
        run_instr(&mut cpu);
        run_instr(&mut cpu);
        assert_eq!(cpu.registers.flags(), Fl::EQUAL);
    }

    #[test]
    fn test_jnz() {
        // LDA 0x90 0x00; JNZ B; JNZ 0x01
        let mut cpu = cpu_with(&[0x02, 0x90, 0x00, 0x08, 0x00, 0x88, 0x01]);
        run_instr(&mut cpu);
        run_instr(&mut cpu);
        assert_eq!(cpu.registers.pc(), 0x8005);
        run_instr(&mut cpu);
        assert_eq!(cpu.registers.pc(), 0x9000);
    }

    #[test]
    fn test_push_pop() {
        // PUSH 0x42; POP D
        let mut cpu = cpu_with(&[0x8E, 0x42, 0x0F, 0x04]);
        cpu.registers.sp_high = 0xFE;
        cpu.registers.sp_low = 0xFF;
        run_instr(&mut cpu);
        assert_eq!(cpu.read_memory(0xFEFF), 0x42);
        assert_eq!(cpu.registers.sp(), 0xFEFE);
        run_instr(&mut cpu);
        assert_eq!(cpu.registers.get(Register::D), 0x42);
        assert_eq!(cpu.registers.sp(), 0xFEFF);
    }

    #[test]
    fn test_absolute_and_pointer_memory() {
        // LC C 0x77; SWA C 0x90 0x10; LWA E 0x90 0x10; LDA 0x90 0x10; SW 0x05; LW B
        let mut cpu = cpu_with(&[
            0x03, 0x01, 0x77, 0x1D, 0x90, 0x10, 0x5B, 0x90, 0x10, 0x02, 0x90, 0x10, 0x81, 0x05,
            0x00, 0x00,
        ]);
        for _ in 0..3 {
            run_instr(&mut cpu);
        }
        assert_eq!(cpu.registers.get(Register::E), 0x77);
        for _ in 0..3 {
            run_instr(&mut cpu);
        }
        assert_eq!(cpu.registers.get(Register::B), 0x05);
    }

    #[test]
    fn test_stack_pointer_mirroring() {
        // SWA A 0xFF 0x09 with A = 0xFE
        let mut cpu = cpu_with(&[0x6D, 0xFF, 0x09]);
        cpu.registers.set(Register::A, 0xFE);
        run_instr(&mut cpu);
        assert_eq!(cpu.registers.sp_high, 0xFE);
        assert_eq!(cpu.memory.io(0x09), 0xFE);
    }

    #[test]
    fn test_invalid_register_is_reported() {
        // MW B 0x09: reads register code 9
        let mut cpu = cpu_with(&[0x09, 0x00, 0x09]);
        let mut anomalies = vec![];
        loop {
            let step = cpu.step(&mut ());
            anomalies.extend(step.anomalies);
            if step.completed {
                break;
            }
        }
        assert_eq!(cpu.registers.get(Register::B), 0xFF);
        assert_eq!(
            anomalies,
            [EmuError::InvalidRegister {
                code: 0x09,
                instruction: [0x09, 0x00, 0x09],
                pc: 0x8003,
            }]
        );
    }

    struct Echo(Vec<u8>);

    impl Peripheral for Echo {
        fn on_io(&mut self, cpu: &mut Cpu) {
            self.0.push(cpu.memory.io(0));
            cpu.write_memory(0xFF01, 0xAA);
        }
    }

    #[test]
    fn test_io_hook_fires_on_change() {
        // LC A 0x41; SWA A 0xFF 0x00; MW F F; MW F F
        let mut cpu = cpu_with(&[
            0x03, 0x06, 0x41, 0x6D, 0xFF, 0x00, 0x09, 0x07, 0x07, 0x09, 0x07, 0x07,
        ]);
        let mut echo = Echo(vec![]);
        let mut events = 0;
        for _ in 0..4 {
            loop {
                let step = cpu.step(&mut echo);
                events += step.io_event as usize;
                if step.completed {
                    break;
                }
            }
        }
        assert_eq!(events, 1);
        assert_eq!(echo.0, [0x41]);
        assert_eq!(cpu.memory.io(0x01), 0xAA);
    }

    #[test]
    fn test_reset_is_total() {
        let mut cpu = cpu_with(&[0x03, 0x06, 0x41]);
        run_instr(&mut cpu);
        cpu.step(&mut ());
        cpu.reset();
        assert_eq!(cpu.registers, Registers::default());
        assert_eq!(cpu.phase(), 0);
        assert_eq!(cpu.read_memory(0x8000), 0);
    }
}
