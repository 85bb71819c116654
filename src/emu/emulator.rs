use std::{collections::VecDeque, fmt, time::Duration};

use anyhow::{bail, Result};
use log::{debug, info};
use rustc_hash::FxHashSet;
use tokio::{
    runtime::{Builder, Runtime},
    time::{interval, Interval, MissedTickBehavior},
};

use crate::plat::Instruction;

use super::{
    cpu::{Cpu, Peripheral, Step},
    debugger::Debugger,
};

/// How many executed instructions are remembered for `bt`.
pub const HISTORY_LEN: usize = 256;

/// The emulator's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuState {
    /// The emulator is allowed to run.
    Continue,
    /// Stops execution, but doesn't put the emulator in a hard, unrecoverable [`Halt`][EmuState::Halt] state.
    Pause,
    /// Halt execution.
    Halt,
}

/// An instruction that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executed {
    pub address: u16,
    pub bytes: [u8; 3],
    /// `None` if the bytes didn't decode cleanly (a bad register code, usually).
    pub instruction: Option<Instruction>,
}

impl fmt::Display for Executed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[pc={:04X}] ", self.address)?;
        match self.instruction {
            Some(instr) => write!(f, "{instr}"),
            None => write!(f, "?? {:02X?}", self.bytes),
        }
    }
}

/// Logs every change of I/O port 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoTrace;

impl Peripheral for IoTrace {
    fn on_io(&mut self, cpu: &mut Cpu) {
        let value = cpu.memory.io(0);
        info!(
            "I/O port 0 = 0x{value:02X} ({:?}) at pc={:04X}",
            value as char,
            cpu.registers.pc()
        );
    }
}

/// Paces microsteps to a fixed clock rate.
struct Clock {
    rt: Runtime,
    interval: Interval,
}

/// The main emulation context for JCPU.
pub struct Emulator {
    pub cpu: Cpu,
    pub state: EmuState,
    pub instr_history: VecDeque<Executed>,
    pub breakpoints: FxHashSet<u16>,
    /// Microsteps run since the last reset.
    pub cycles: u64,
    /// Halt once [cycles](Self::cycles) reaches this.
    pub max_cycles: Option<u64>,
    /// Where PC points after a reset.
    pub entry: u16,
    /// Open the debugger instead of returning when paused.
    pub debug_on_pause: bool,
    peripherals: Vec<Box<dyn Peripheral>>,
    images: Vec<(u16, Vec<u8>)>,
    instr_start: u16,
    clock: Option<Clock>,
}

impl Emulator {
    /// Creates a new [Emulator] with empty memory. Without a clock rate, it runs as fast as it can.
    ///
    /// # Errors
    ///
    /// This function will return an error if the clock rate is not positive, or if the Tokio
    /// runtime fails to initialize.
    pub fn new(clock_rate_hz: Option<f64>) -> Result<Self> {
        let clock = match clock_rate_hz {
            Some(hz) if !(hz > 0.0 && hz.is_finite()) => bail!("Invalid clock rate: {hz} Hz"),
            Some(hz) => {
                let rt = Builder::new_current_thread().enable_time().build()?;
                let interval = rt.block_on(async {
                    let mut clock = interval(Duration::from_secs_f64(hz.recip()));
                    clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    clock
                });
                Some(Clock { rt, interval })
            }
            None => None,
        };
        Ok(Self {
            cpu: Cpu::new(),
            state: EmuState::Continue,
            instr_history: VecDeque::with_capacity(HISTORY_LEN),
            breakpoints: FxHashSet::default(),
            cycles: 0,
            max_cycles: None,
            entry: 0,
            debug_on_pause: false,
            peripherals: vec![],
            images: vec![],
            instr_start: 0,
            clock,
        })
    }

    pub fn add_peripheral(&mut self, peripheral: impl Peripheral + 'static) {
        self.peripherals.push(Box::new(peripheral));
    }

    /// Loads a binary image into memory at `origin`. It is loaded again on every reset.
    ///
    /// # Errors
    ///
    /// This function will return an error if the image does not fit below 0x10000.
    pub fn load(&mut self, origin: u16, bytes: &[u8]) -> Result<()> {
        self.cpu.load(origin, bytes)?;
        info!("Loaded {} bytes at 0x{origin:04X}", bytes.len());
        self.images.push((origin, bytes.to_vec()));
        Ok(())
    }

    /// Sets the reset vector and points PC at it.
    pub fn set_entry(&mut self, entry: u16) {
        self.entry = entry;
        self.cpu.registers.set_pc(entry);
    }

    /// Clears the CPU and all memory. With `reload`, the loaded images are written back and PC
    /// returns to the entry point; otherwise they are forgotten.
    ///
    /// # Errors
    ///
    /// This function will return an error if reloading an image fails.
    pub fn reset(&mut self, reload: bool) -> Result<()> {
        self.cpu.reset();
        self.cycles = 0;
        self.instr_history.clear();
        if reload {
            for (origin, bytes) in &self.images {
                self.cpu.load(*origin, bytes)?;
            }
            self.cpu.registers.set_pc(self.entry);
        } else {
            self.images.clear();
        }
        if self.state == EmuState::Halt {
            self.state = EmuState::Pause;
        }
        info!("Reset{}", if reload { " and reloaded" } else { "" });
        Ok(())
    }

    /// Runs the emulator, stepping through instructions until it reaches a halt state.
    pub fn run_while_continue(&mut self) -> Result<()> {
        loop {
            match self.state {
                EmuState::Continue => {
                    self.microstep();
                }
                EmuState::Halt => break,
                EmuState::Pause if self.debug_on_pause => {
                    self.debug()?;
                    if self.state == EmuState::Pause {
                        self.state = EmuState::Halt;
                    }
                }
                EmuState::Pause => break,
            }
        }
        Ok(())
    }

    pub fn cont(&mut self) -> Result<()> {
        self.state = EmuState::Continue;
        self.run_while_continue()
    }

    /// Steps until the current instruction completes.
    pub fn step_instr(&mut self) {
        while let Some(step) = self.microstep() {
            if step.completed {
                break;
            }
        }
    }

    /// Steps a single CPU clock cycle. Returns `None` if the emulator is halted.
    pub fn microstep(&mut self) -> Option<Step> {
        if self.state == EmuState::Halt {
            return None;
        }
        if let Some(Clock { rt, interval }) = &mut self.clock {
            // snap!
            rt.block_on(interval.tick());
        }

        if self.cpu.phase() == 0 {
            self.instr_start = self.cpu.registers.pc();
        }
        let step = self.cpu.step(&mut self.peripherals);
        self.cycles += 1;

        if step.completed {
            let regs = &self.cpu.registers;
            let executed = Executed {
                address: self.instr_start,
                bytes: [regs.ir, regs.arg_one, regs.arg_two],
                instruction: self.cpu.current_instruction().ok(),
            };
            debug!(">>> {executed}");
            if self.instr_history.len() == HISTORY_LEN {
                self.instr_history.pop_front();
            }
            self.instr_history.push_back(executed);

            let pc = self.cpu.registers.pc();
            if self.breakpoints.contains(&pc) {
                info!("Breakpoint at 0x{pc:04X}");
                self.state = EmuState::Pause;
            }
        }
        if let Some(max) = self.max_cycles {
            if self.cycles >= max {
                info!("Cycle budget of {max} exhausted");
                self.state = EmuState::Halt;
            }
        }
        Some(step)
    }

    pub fn debug(&mut self) -> Result<()> {
        Debugger::new(self).repl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plat::Register;

    // LC B 0x00; INC B (ADD B 0x01); JMP 0x8003
    const COUNTER: [u8; 11] = [
        0x03, 0x00, 0x00, 0x84, 0x00, 0x01, 0x02, 0x80, 0x03, 0x88, 0x01,
    ];

    fn emulator() -> Emulator {
        let mut emu = Emulator::new(None).unwrap();
        emu.load(0x8000, &COUNTER).unwrap();
        emu.set_entry(0x8000);
        emu
    }

    #[test]
    fn test_cycle_budget() {
        let mut emu = emulator();
        emu.max_cycles = Some(4 + 5);
        emu.run_while_continue().unwrap();
        assert_eq!(emu.state, EmuState::Halt);
        assert_eq!(emu.cycles, 9);
        assert_eq!(emu.cpu.registers.get(Register::B), 1);
        assert!(emu.microstep().is_none());
    }

    #[test]
    fn test_breakpoint_pauses() {
        let mut emu = emulator();
        emu.breakpoints.insert(0x8003);
        emu.run_while_continue().unwrap();
        assert_eq!(emu.state, EmuState::Pause);
        assert_eq!(emu.cpu.registers.pc(), 0x8003);
        assert_eq!(emu.instr_history.len(), 1);
        assert_eq!(emu.instr_history[0].to_string(), "[pc=8000] LC B 0X00");

        // runs the loop body, then stops at 0x8003 again
        emu.cont().unwrap();
        assert_eq!(emu.state, EmuState::Pause);
        assert_eq!(emu.cpu.registers.get(Register::B), 1);
        assert_eq!(emu.instr_history.len(), 4);
    }

    #[test]
    fn test_reset_reloads() {
        let mut emu = emulator();
        emu.max_cycles = Some(100);
        emu.run_while_continue().unwrap();
        emu.cpu.write_memory(0x8000, 0xEE);
        emu.reset(true).unwrap();
        assert_eq!(emu.cycles, 0);
        assert_eq!(emu.cpu.read_memory(0x8000), 0x03);
        assert_eq!(emu.cpu.registers.pc(), 0x8000);
        assert_eq!(emu.cpu.registers.get(Register::B), 0);
        assert_eq!(emu.state, EmuState::Pause);

        emu.reset(false).unwrap();
        assert_eq!(emu.cpu.read_memory(0x8000), 0x00);
        emu.reset(true).unwrap();
        assert_eq!(emu.cpu.read_memory(0x8000), 0x00);
    }

    #[test]
    fn test_step_instr() {
        let mut emu = emulator();
        emu.step_instr();
        assert_eq!(emu.cycles, 4);
        emu.step_instr();
        assert_eq!(emu.cycles, 9);
        assert_eq!(emu.cpu.phase(), 0);
    }

    #[test]
    fn test_paced_clock() {
        let mut emu = Emulator::new(Some(10_000.0)).unwrap();
        emu.load(0x8000, &COUNTER).unwrap();
        emu.set_entry(0x8000);
        emu.step_instr();
        assert_eq!(emu.cycles, 4);
        assert!(Emulator::new(Some(0.0)).is_err());
    }
}
