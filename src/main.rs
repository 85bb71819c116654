use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use jcpu::{
    asm::{Assembler, Config, Dumps},
    emu::{debugger::parse_hex, EmuState, Emulator, IoTrace},
    plat::{disassemble, DEFAULT_ORIGIN},
};

#[derive(Parser, Debug)]
#[command(version, about = "Assembler, disassembler and emulator for JCPU")]
struct Args {
    /// Log what every pass and every instruction does.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble a source file into a binary image.
    Asm {
        input: PathBuf,
        /// Output file. Defaults to INPUT with a `.bin` extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Dump the line stream after preprocessing.
        #[arg(long, alias = "ds0", value_name = "FILE")]
        dump_preprocess: Option<PathBuf>,
        /// Dump the line stream after layout.
        #[arg(long, alias = "ds1", value_name = "FILE")]
        dump_layout: Option<PathBuf>,
        /// Dump the line stream after symbol substitution.
        #[arg(long, alias = "ds2", value_name = "FILE")]
        dump_symbols: Option<PathBuf>,
        /// Dump the primitive instructions after expansion.
        #[arg(long, alias = "ds3", value_name = "FILE")]
        dump_expand: Option<PathBuf>,
        /// Report how long assembly took.
        #[arg(short, long)]
        time: bool,
    },
    /// Run a binary image.
    Emu {
        image: PathBuf,
        /// Load address, in hex.
        #[arg(long, value_parser = parse_hex, default_value = "8000")]
        origin: u16,
        /// Initial PC, in hex. Defaults to the load address.
        #[arg(long, value_parser = parse_hex)]
        entry: Option<u16>,
        /// Clock rate in Hz. Runs unpaced if not given.
        #[arg(long)]
        clock: Option<f64>,
        /// Halt after this many clock cycles.
        #[arg(long)]
        cycles: Option<u64>,
        /// Pause when PC reaches this address (hex). May be repeated.
        #[arg(short, long = "break", value_parser = parse_hex)]
        breakpoints: Vec<u16>,
        /// Start in the debugger, and return to it whenever execution pauses.
        #[arg(short, long)]
        debug: bool,
    },
    /// Print the instructions in a binary image.
    Disasm {
        image: PathBuf,
        /// Load address, in hex.
        #[arg(long, value_parser = parse_hex, default_value = "8000")]
        origin: u16,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, cfg!(debug_assertions)) {
        (true, true) => LevelFilter::Trace,
        (true, false) => LevelFilter::Debug,
        (false, _) => LevelFilter::Info,
    };
    TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    match args.command {
        Command::Asm {
            input,
            output,
            dump_preprocess,
            dump_layout,
            dump_symbols,
            dump_expand,
            time,
        } => {
            let config = Config {
                origin: DEFAULT_ORIGIN,
                dumps: Dumps {
                    preprocess: dump_preprocess,
                    layout: dump_layout,
                    symbols: dump_symbols,
                    expand: dump_expand,
                },
                report_time: time || args.verbose,
            };
            let image = Assembler::new(config).assemble_file(&input)?;
            let output = output.unwrap_or_else(|| input.with_extension("bin"));
            fs::write(&output, image.to_bytes())
                .with_context(|| format!("Error writing {}", output.display()))?;
            info!("Wrote {} bytes to {}", image.len(), output.display());
        }
        Command::Emu {
            image,
            origin,
            entry,
            clock,
            cycles,
            breakpoints,
            debug,
        } => {
            let bytes =
                fs::read(&image).with_context(|| format!("Error reading {}", image.display()))?;
            let mut emu = Emulator::new(clock)?;
            emu.add_peripheral(IoTrace);
            emu.load(origin, &bytes)?;
            emu.set_entry(entry.unwrap_or(origin));
            emu.max_cycles = cycles;
            emu.breakpoints.extend(breakpoints);
            if debug {
                emu.debug_on_pause = true;
                emu.state = EmuState::Pause;
            }
            emu.run_while_continue()?;
            info!("Stopped after {} cycles ({:?})", emu.cycles, emu.state);
            println!("{}", emu.cpu.registers);
        }
        Command::Disasm { image, origin } => {
            let bytes =
                fs::read(&image).with_context(|| format!("Error reading {}", image.display()))?;
            let (instrs, tail) = disassemble(origin, &bytes);
            for (addr, instr) in instrs {
                println!("{addr:04X}: {instr}");
            }
            for (i, chunk) in bytes[tail..].chunks(8).enumerate() {
                let addr = origin.wrapping_add((tail + i * 8) as u16);
                println!("{addr:04X}: {chunk:02X?}");
            }
        }
    }
    Ok(())
}
