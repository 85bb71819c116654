use std::{
    fmt::Display,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::plat::DEFAULT_ORIGIN;

use super::{encode, expand, layout, preprocess, symbols, Image, Session};

/// Where source text comes from. Includes are resolved through this, too.
pub trait SourceProvider {
    fn load(&self, path: &Path) -> io::Result<String>;
}

/// Reads sources from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSource;

impl SourceProvider for FsSource {
    fn load(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }
}

/// Serves sources from memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: FxHashMap<PathBuf, String>,
}

impl MemorySource {
    pub fn with(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.files.get(path.as_ref()).map(String::as_str)
    }
}

impl SourceProvider for MemorySource {
    fn load(&self, path: &Path) -> io::Result<String> {
        self.get(path).map(str::to_owned).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })
    }
}

/// Files to write the intermediate line stream to, one per pass.
#[derive(Debug, Clone, Default)]
pub struct Dumps {
    pub preprocess: Option<PathBuf>,
    pub layout: Option<PathBuf>,
    pub symbols: Option<PathBuf>,
    pub expand: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Load address, unless the source says otherwise with `#ORG`.
    pub origin: u16,
    pub dumps: Dumps,
    /// Log how long assembly took.
    pub report_time: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN,
            dumps: Dumps::default(),
            report_time: false,
        }
    }
}

/// An assembly context capable of translating a source file into binary / machine code.
#[derive(Debug, Clone)]
pub struct Assembler<S = FsSource> {
    config: Config,
    sources: S,
}

impl Assembler<FsSource> {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sources: FsSource,
        }
    }
}

impl<S: SourceProvider> Assembler<S> {
    pub fn with_sources(config: Config, sources: S) -> Self {
        Self { config, sources }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Assembles the file at `path`, resolving includes relative to it.
    ///
    /// # Errors
    ///
    /// This function will return an error if any file can't be read, if the source is invalid,
    /// or if a requested dump can't be written.
    pub fn assemble_file(&self, path: &Path) -> Result<Image> {
        let text = self
            .sources
            .load(path)
            .with_context(|| format!("Error reading source file {}", path.display()))?;
        self.assemble_source(path, &text)
    }

    /// Assembles source text that didn't come from a file. Includes resolve against the current
    /// directory.
    ///
    /// # Errors
    ///
    /// This function will return an error if the source is invalid, or if a requested dump can't
    /// be written.
    pub fn assemble_str(&self, text: &str) -> Result<Image> {
        self.assemble_source(Path::new("<input>"), text)
    }

    fn assemble_source(&self, path: &Path, text: &str) -> Result<Image> {
        let start = Instant::now();
        let dumps = &self.config.dumps;
        let mut session = Session::new(self.config.origin);

        preprocess::run(&mut session, &self.sources, path, text)?;
        debug!("Preprocessing produced {} lines", session.lines.len());
        dump(dumps.preprocess.as_deref(), &session.lines)?;

        layout::run(&mut session)?;
        dump(dumps.layout.as_deref(), &session.lines)?;

        symbols::run(&mut session)?;
        dump(dumps.symbols.as_deref(), &session.lines)?;

        let program = expand::run(&session)?;
        debug!("Expanded into {} primitive instructions", program.len());
        dump(dumps.expand.as_deref(), &program)?;

        let image = encode::run(&session, &program)?;
        let elapsed = start.elapsed();
        if self.config.report_time {
            info!(
                "Assembly took {} milliseconds ({:.3} seconds)",
                elapsed.as_millis(),
                elapsed.as_secs_f64()
            );
        }
        info!(
            "Assembled {} bytes of code and {} bytes of data at 0x{:04X}",
            image.code.len(),
            image.data.len(),
            image.origin
        );
        Ok(image)
    }
}

/// Writes one item per line to `path`, if there is one.
fn dump<T: Display>(path: Option<&Path>, items: &[T]) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut out = io::BufWriter::new(
        fs::File::create(path)
            .with_context(|| format!("Error creating dump file {}", path.display()))?,
    );
    for item in items {
        writeln!(out, "{item}")?;
    }
    out.flush()
        .with_context(|| format!("Error writing dump file {}", path.display()))?;
    debug!("Wrote {} lines to {}", items.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::AsmError;

    #[test]
    fn test_assemble() {
        let program = "
#DB MSG \"Hi\"
START:
    ; comment
    lc      h msg.h
    lc      l msg.l
    lw      a
    jmp     start
";
        let image = Assembler::new(Config::default()).assemble_str(program).unwrap();
        assert_eq!(image.origin, 0x8000);
        assert_eq!(
            image.code,
            [
                0x03, 0x02, 0x80, // LC H 0x80
                0x03, 0x03, 0x0D, // LC L 0x0D
                0x00, 0x06, // LW A
                0x02, 0x80, 0x00, 0x88, 0x01, // LDA 0x80 0x00; JNZ 0x01
            ]
        );
        assert_eq!(image.data, [b'H', b'i', 0]);
    }

    #[test]
    fn test_errors_keep_their_type() {
        let err = Assembler::new(Config::default()).assemble_str("jmp b").unwrap_err();
        let err = err.downcast::<AsmError>().unwrap();
        assert_eq!(err.to_string(), "invalid JMP on line 1 of <input>");
    }

    #[test]
    fn test_includes_through_provider() {
        let sources = MemorySource::default()
            .with("prog/main.asm", "#include \"consts.asm\"\nlc a ANSWER")
            .with("prog/consts.asm", "#define ANSWER 0x2A");
        let asm = Assembler::with_sources(Config::default(), sources);
        let image = asm.assemble_file(Path::new("prog/main.asm")).unwrap();
        assert_eq!(image.to_bytes(), [0x03, 0x06, 0x2A]);
    }

    #[test]
    fn test_dumps() {
        let dir = std::env::temp_dir().join(format!("jcpu-dumps-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let config = Config {
            dumps: Dumps {
                preprocess: Some(dir.join("0.txt")),
                layout: Some(dir.join("1.txt")),
                symbols: Some(dir.join("2.txt")),
                expand: Some(dir.join("3.txt")),
            },
            ..Config::default()
        };
        Assembler::new(config)
            .assemble_str("MAIN:\ncall main")
            .unwrap();
        let read = |name: &str| fs::read_to_string(dir.join(name)).unwrap();
        assert_eq!(read("0.txt"), "CALL MAIN : PROC MAIN\n");
        assert_eq!(read("1.txt"), "CALL MAIN : 0X8009\n");
        assert_eq!(read("2.txt"), "CALL 0X80 0X00 : 0X8009\n");
        assert_eq!(
            read("3.txt"),
            "PUSH 0X80\nPUSH 0X09\nLDA 0X80 0X00\nJNZ 0X01\n"
        );
        fs::remove_dir_all(&dir).unwrap();
    }
}
