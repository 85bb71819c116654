use std::cell::RefCell;

use anyhow::{Context, Result};
use easy_repl::{command, repl::LoopStatus, CommandStatus, Repl};

use super::emulator::{EmuState, Emulator};

/// Parses `8000`, `0x8000` or `0X8000` as a hex number.
pub fn parse_hex(s: &str) -> Result<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).with_context(|| format!("Invalid hex number: {s}"))
}

pub struct Debugger<'a> {
    pub emu: RefCell<&'a mut Emulator>,
}

impl<'a> Debugger<'a> {
    pub fn new(emu: &'a mut Emulator) -> Self {
        Self {
            emu: RefCell::new(emu),
        }
    }

    pub fn repl(&self) -> Result<()> {
        let mut repl = Repl::builder()
            .description("JCPU Debug REPL")
            .add(
                "c",
                command! {
                    "Continue execution",
                    () => || {
                        self.emu.borrow_mut().state = EmuState::Continue;
                        Ok(CommandStatus::Quit)
                    }
                },
            )
            .add(
                "s",
                command! {
                    "Step one phase",
                    () => || {
                        let mut emu = self.emu.borrow_mut();
                        if let Some(step) = emu.microstep() {
                            eprintln!(
                                "phase {}{}{}",
                                step.phase,
                                if step.io_event { " (I/O)" } else { "" },
                                if step.completed { " (done)" } else { "" },
                            );
                            for anomaly in &step.anomalies {
                                eprintln!("  {anomaly}");
                            }
                        }
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "si",
                command! {
                    "Step one instruction",
                    () => || {
                        self.emu.borrow_mut().step_instr();
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "bt",
                command! {
                    "Print last X instructions executed",
                    (x:usize) => |x| {
                        let emu = self.emu.borrow();
                        for instr in emu.instr_history.iter().rev().take(x).rev() {
                            eprintln!("{}", instr);
                        }
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "pr",
                command! {
                    "Print the value of all registers",
                    () => || {
                        let emu = self.emu.borrow();
                        eprintln!("{}", emu.cpu.registers);
                        eprintln!("phase={} cycles={}", emu.cpu.phase(), emu.cycles);
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "peek",
                command! {
                    "Peek a value from memory",
                    (addr:String) => |addr: String| {
                        let emu = self.emu.borrow();
                        let addr = parse_hex(&addr)?;
                        eprintln!("{:04X}={:02X}", addr, emu.cpu.read_memory(addr));
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "poke",
                command! {
                    "Write a value to memory",
                    (addr:String, value:String) => |addr: String, value: String| {
                        let addr = parse_hex(&addr)?;
                        let value = u8::try_from(parse_hex(&value)?)
                            .with_context(|| format!("Not a byte: {value}"))?;
                        self.emu.borrow_mut().cpu.write_memory(addr, value);
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "b",
                command! {
                    "Toggle a breakpoint at an address",
                    (addr:String) => |addr: String| {
                        let addr = parse_hex(&addr)?;
                        let mut emu = self.emu.borrow_mut();
                        if emu.breakpoints.remove(&addr) {
                            eprintln!("Removed breakpoint at {:04X}", addr);
                        } else {
                            emu.breakpoints.insert(addr);
                            eprintln!("Set breakpoint at {:04X}", addr);
                        }
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "reset",
                command! {
                    "Reset the CPU and reload the program",
                    () => || {
                        self.emu.borrow_mut().reset(true)?;
                        Ok(CommandStatus::Done)
                    }
                },
            )
            .add(
                "halt",
                command! {
                    "Halt execution",
                    () => || {
                        self.emu.borrow_mut().state = EmuState::Halt;
                        Ok(CommandStatus::Quit)
                    }
                },
            )
            .build()?;
        eprintln!("JCPU Debug REPL");
        'repl: loop {
            eprintln!();
            {
                let emu = self.emu.borrow();
                if let Some(instr) = emu.instr_history.back() {
                    eprintln!(
                        "Last instruction:\n{}\n[pc={:04X}] --> next",
                        instr,
                        emu.cpu.registers.pc()
                    );
                }
            }

            let status = repl.next()?;
            if let LoopStatus::Break = status {
                break 'repl;
            }
            {
                let emu = self.emu.borrow();
                if let EmuState::Halt = emu.state {
                    break 'repl;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("8000").unwrap(), 0x8000);
        assert_eq!(parse_hex("0xff09").unwrap(), 0xFF09);
        assert_eq!(parse_hex("0XFF").unwrap(), 0xFF);
        assert!(parse_hex("0x10000").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
