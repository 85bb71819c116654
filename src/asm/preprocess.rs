//! The first pass: normalizes source lines, executes directives, and attaches labels to the
//! instruction that follows them.

use std::{path::Path, sync::Arc};

use log::debug;

use crate::plat::Register;

use super::{
    assembler::SourceProvider,
    lexer::{
        is_identifier, lex_data_items, parse_number, split_tokens, unescape, DataItem, EscapeError,
        Span, SEPARATORS,
    },
    AResult, AsmError, Line, Loc, Session, StoredData,
};

/// How deep `#INCLUDE`s may nest before we assume a cycle.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Uppercases everything outside quotes, cuts the line at the first unquoted `;`, and trims it.
/// A backslash escapes the next character, inside quotes or not, so an escaped quote never opens
/// or closes a string.
pub fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut quote = None;
    let mut escaped = false;
    for c in raw.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if quote == Some(c) {
            quote = None;
        } else if quote.is_none() {
            if c == ';' {
                break;
            }
            if c == '"' || c == '\'' {
                quote = Some(c);
                out.push(c);
                continue;
            }
        }
        // quoted text keeps its case
        if quote.is_some() {
            out.push(c);
        } else {
            out.push(c.to_ascii_uppercase());
        }
    }
    out.trim().to_owned()
}

/// Splits off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

/// Runs the pass over `text`, which was read from `path`, appending to `session`.
pub fn run(
    session: &mut Session,
    sources: &dyn SourceProvider,
    path: &Path,
    text: &str,
) -> AResult<()> {
    let mut pp = Preprocessor {
        session,
        sources,
        pending: vec![],
    };
    pp.process(path, text, 0)?;
    if let Some((name, loc)) = pp.pending.into_iter().next() {
        return Err(AsmError::DanglingLabel { name, loc });
    }
    Ok(())
}

struct Preprocessor<'a> {
    session: &'a mut Session,
    sources: &'a dyn SourceProvider,
    /// Labels waiting for their instruction.
    pending: Vec<(String, Loc)>,
}

impl Preprocessor<'_> {
    fn process(&mut self, path: &Path, text: &str, depth: usize) -> AResult<()> {
        let file: Arc<str> = path.display().to_string().into();
        for (i, raw) in text.lines().enumerate() {
            let loc = Loc {
                file: file.clone(),
                line: i + 1,
            };
            let line = normalize(raw);
            if line.is_empty() {
                continue;
            }
            let label = line
                .strip_suffix(':')
                .map(|l| l.strip_prefix('#').unwrap_or(l))
                .filter(|l| !l.contains(char::is_whitespace));
            if let Some(label) = label {
                self.label(label, loc)?;
            } else if let Some(directive) = line.strip_prefix('#') {
                self.directive(&line, directive, path, loc, depth)?;
            } else {
                self.instruction(&line, loc);
            }
        }
        Ok(())
    }

    fn label(&mut self, name: &str, loc: Loc) -> AResult<()> {
        check_name(name, &loc)?;
        self.session.symbols.declare_procedure(name, &loc)?;
        debug!("Found procedure {name} on {loc}");
        self.pending.push((name.to_owned(), loc));
        Ok(())
    }

    fn instruction(&mut self, line: &str, loc: Loc) {
        let tokens = split_tokens(line).map(str::to_owned).collect();
        let mut line = Line::new(loc, tokens);
        line.labels = self.pending.drain(..).map(|(name, _)| name).collect();
        self.session.lines.push(line);
    }

    fn directive(
        &mut self,
        line: &str,
        body: &str,
        path: &Path,
        loc: Loc,
        depth: usize,
    ) -> AResult<()> {
        let (command, args) = split_word(body);
        match command {
            "DB" | "DW" => {
                let wide = command == "DW";
                let (name, items) = split_word(args);
                check_name(name, &loc)?;
                if items.is_empty() {
                    return Err(invalid(if wide { "DW" } else { "DB" }, loc));
                }
                let offset = line.len() - items.len();
                let bytes = data_bytes(items, offset, wide, &loc)?;
                debug!("Stored {} bytes for data symbol {name}", bytes.len());
                self.session.symbols.add_data(StoredData {
                    symbol: name.to_owned(),
                    bytes,
                    address: 0,
                    loc,
                })?;
            }
            "RESB" => {
                let (name, count) = split_word(args);
                check_name(name, &loc)?;
                let count = parse_number(count)
                    .filter(|&n| n <= 0x1_0000)
                    .ok_or_else(|| invalid("RESB", loc.clone()))?;
                debug!("Reserved {count} bytes for data symbol {name}");
                self.session.symbols.add_data(StoredData {
                    symbol: name.to_owned(),
                    bytes: vec![0; count as usize],
                    address: 0,
                    loc,
                })?;
            }
            "ORG" => {
                let origin = parse_number(args)
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| invalid("ORG", loc.clone()))?;
                debug!("Origin set to 0x{origin:04X} on {loc}");
                self.session.origin = origin;
            }
            "DEFINE" => {
                let (name, text) = split_word(args);
                check_name(name, &loc)?;
                if text.is_empty() {
                    return Err(invalid("DEFINE", loc));
                }
                debug!("Defined constant {name} as \"{text}\"");
                self.session.symbols.define_constant(name, text, &loc)?;
            }
            "INCLUDE" => {
                let target = args
                    .strip_prefix('"')
                    .and_then(|a| a.strip_suffix('"'))
                    .unwrap_or(args);
                if target.is_empty() {
                    return Err(invalid("INCLUDE", loc));
                }
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(AsmError::IncludeDepth { loc });
                }
                let resolved = match path.parent() {
                    Some(dir) => dir.join(target),
                    None => target.into(),
                };
                debug!("Including {} from {loc}", resolved.display());
                let text = self
                    .sources
                    .load(&resolved)
                    .map_err(|source| AsmError::Include {
                        path: resolved.clone(),
                        loc,
                        source,
                    })?;
                self.process(&resolved, &text, depth + 1)?;
            }
            _ => {
                return Err(AsmError::UnknownDirective {
                    directive: command.to_owned(),
                    loc,
                })
            }
        }
        Ok(())
    }
}

fn invalid(directive: &'static str, loc: Loc) -> AsmError {
    AsmError::InvalidDirective { directive, loc }
}

fn check_name(name: &str, loc: &Loc) -> AResult<()> {
    if is_identifier(name) && name.parse::<Register>().is_err() {
        Ok(())
    } else {
        Err(AsmError::IllegalName {
            name: name.to_owned(),
            loc: loc.clone(),
        })
    }
}

/// Converts a data item list into bytes. `offset` is where the list starts within its line, for
/// error columns.
fn data_bytes(items: &str, offset: usize, wide: bool, loc: &Loc) -> AResult<Vec<u8>> {
    let (_, items) = lex_data_items(Span::new(items)).map_err(|e| {
        let rest = match e {
            nom::Err::Error(e) | nom::Err::Failure(e) => e.input,
            nom::Err::Incomplete(_) => Span::new(items),
        };
        let frag = *rest.fragment();
        if escape_at_end(frag) {
            return AsmError::EscapeAtEnd { loc: loc.clone() };
        }
        AsmError::InvalidLiteral {
            text: frag
                .split(|c: char| SEPARATORS.contains(c))
                .next()
                .unwrap_or_default()
                .to_owned(),
            loc: loc.clone(),
            column: offset + rest.get_utf8_column(),
        }
    })?;

    let mut out = vec![];
    for item in items {
        let bad_literal = || AsmError::InvalidLiteral {
            text: item.span().fragment().to_string(),
            loc: loc.clone(),
            column: offset + item.span().get_utf8_column(),
        };
        match item {
            DataItem::Chars(body) => out.extend(unescape_at(body.fragment(), loc)?),
            DataItem::Str(body) => {
                out.extend(unescape_at(body.fragment(), loc)?);
                out.push(0);
            }
            DataItem::Hex(text) => {
                let digits = &text.fragment()[2..];
                if wide && digits.len() <= 4 {
                    let v = u16::from_str_radix(digits, 16).map_err(|_| bad_literal())?;
                    out.extend(v.to_be_bytes());
                } else if !wide && digits.len() <= 2 {
                    out.push(u8::from_str_radix(digits, 16).map_err(|_| bad_literal())?);
                } else {
                    return Err(bad_literal());
                }
            }
            DataItem::Decimal(text) => {
                let v: i32 = text.fragment().parse().map_err(|_| bad_literal())?;
                if wide && (-0x8000..=0xFFFF).contains(&v) {
                    out.extend((v as u16).to_be_bytes());
                } else if !wide && (-0x80..=0xFF).contains(&v) {
                    out.push(v as u8);
                } else {
                    return Err(bad_literal());
                }
            }
        }
    }
    Ok(out)
}

/// Whether an unterminated quoted item failed because its last quote (or nothing) follows a
/// backslash, as in `"abc\` or `"abc\"`.
fn escape_at_end(frag: &str) -> bool {
    let Some(quote) = frag.chars().next().filter(|&c| c == '"' || c == '\'') else {
        return false;
    };
    let body = &frag[1..];
    body.ends_with('\\') || body.strip_suffix(quote).is_some_and(|b| b.ends_with('\\'))
}

fn unescape_at(body: &str, loc: &Loc) -> AResult<Vec<u8>> {
    unescape(body).map_err(|e| match e {
        EscapeError::Invalid(ch) => AsmError::InvalidEscape {
            ch,
            loc: loc.clone(),
        },
        EscapeError::AtEnd => AsmError::EscapeAtEnd { loc: loc.clone() },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::MemorySource;

    fn preprocess(text: &str) -> AResult<Session> {
        let mut session = Session::new(0x8000);
        run(&mut session, &MemorySource::default(), Path::new("test.asm"), text)?;
        Ok(session)
    }

    fn tokens(session: &Session) -> Vec<Vec<&str>> {
        session
            .lines
            .iter()
            .map(|l| l.tokens.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  add b, 0x01 ; increment"), "ADD B, 0X01");
        assert_eq!(normalize(r#"#db msg "a;b" ; c"#), r#"#DB MSG "a;b""#);
        assert_eq!(normalize(r#"#db q "x\"; y" ;z"#), r#"#DB Q "x\"; y""#);
        assert_eq!(normalize("; only a comment"), "");
        // an escaped quote outside a string doesn't start one, so the comment is still cut
        assert_eq!(normalize(r#"db \"x ; y"#), r#"DB \"X"#);
        assert_eq!(normalize(r"lc a \' ; c"), r"LC A \'");
    }

    #[test]
    fn test_instructions_and_labels() {
        let session = preprocess(
            "
#MAIN:
loop:
    add b, 0x01
    jmp loop
",
        )
        .unwrap();
        assert_eq!(tokens(&session), [vec!["ADD", "B", "0X01"], vec!["JMP", "LOOP"]]);
        assert_eq!(session.lines[0].labels, ["MAIN", "LOOP"]);
        assert!(session.lines[1].labels.is_empty());
        assert_eq!(session.lines[1].loc.line, 5);
    }

    #[test]
    fn test_dangling_label() {
        let err = preprocess("nop\nEND:").unwrap_err();
        assert!(matches!(err, AsmError::DanglingLabel { name, .. } if name == "END"));
    }

    #[test]
    fn test_illegal_label() {
        assert!(matches!(preprocess("A:\nnop"), Err(AsmError::IllegalName { .. })));
        assert!(matches!(preprocess("1ST:\nnop"), Err(AsmError::IllegalName { .. })));
    }

    #[test]
    fn test_data_directives() {
        let session = preprocess(
            r#"
#db msg "Hi\n", 0x21
#dw wide 0x1234 0x5 -1
#db nums -1 255 'A'
#resb buf 3
"#,
        )
        .unwrap();
        let data = session.symbols.data();
        assert_eq!(data[0].bytes, [b'H', b'i', 0x0A, 0x00, 0x21]);
        assert_eq!(data[1].bytes, [0x12, 0x34, 0x00, 0x05, 0xFF, 0xFF]);
        assert_eq!(data[2].bytes, [0xFF, 0xFF, 0x41]);
        assert_eq!(data[3].bytes, [0, 0, 0]);
    }

    #[test]
    fn test_bad_data() {
        let err = preprocess("#DB N 256").unwrap_err();
        assert!(matches!(err, AsmError::InvalidLiteral { text, column: 7, .. } if text == "256"));
        assert!(matches!(
            preprocess("#DB N 0X123"),
            Err(AsmError::InvalidLiteral { .. })
        ));
        assert!(matches!(
            preprocess(r#"#DB N "\q""#),
            Err(AsmError::InvalidEscape { ch: 'q', .. })
        ));
        assert!(matches!(
            preprocess(r#"#DB N "abc\"#),
            Err(AsmError::EscapeAtEnd { .. })
        ));
        assert!(matches!(
            preprocess(r#"#DB N "abc\""#),
            Err(AsmError::EscapeAtEnd { .. })
        ));
        assert!(matches!(
            preprocess("#DB N"),
            Err(AsmError::InvalidDirective { directive: "DB", .. })
        ));
        assert!(matches!(
            preprocess("#DB N 1\n#DB N 2"),
            Err(AsmError::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn test_org_and_define() {
        let session = preprocess("#ORG 0X9000\n#DEFINE COUNT 0X0A\n#org 0xA000").unwrap();
        assert_eq!(session.origin, 0xA000);
        assert_eq!(session.symbols.constant("COUNT"), Some("0X0A"));
        assert!(matches!(
            preprocess("#ORG 0X10000"),
            Err(AsmError::InvalidDirective { directive: "ORG", .. })
        ));
        assert!(matches!(
            preprocess("#DEFINE EMPTY"),
            Err(AsmError::InvalidDirective { directive: "DEFINE", .. })
        ));
    }

    #[test]
    fn test_unknown_directive() {
        let err = preprocess("#MACRO X").unwrap_err();
        assert!(matches!(err, AsmError::UnknownDirective { directive, .. } if directive == "MACRO"));
    }

    #[test]
    fn test_include_is_relative_and_inline() {
        let sources = MemorySource::default()
            .with("src/main.asm", "#include \"lib/util.asm\"\ninc b")
            .with("src/lib/util.asm", "UTIL:\nnop");
        let mut session = Session::new(0x8000);
        let main = sources.get("src/main.asm").unwrap().to_owned();
        run(&mut session, &sources, Path::new("src/main.asm"), &main).unwrap();
        assert_eq!(tokens(&session), [vec!["NOP"], vec!["INC", "B"]]);
        assert_eq!(session.lines[0].labels, ["UTIL"]);
        assert!(session.lines[0].loc.file.ends_with("util.asm"));
    }

    #[test]
    fn test_include_errors() {
        let sources = MemorySource::default().with("self.asm", "#include \"self.asm\"");
        let mut session = Session::new(0x8000);
        let err = run(&mut session, &sources, Path::new("self.asm"), "#include \"self.asm\"")
            .unwrap_err();
        assert!(matches!(err, AsmError::IncludeDepth { .. }));

        let err = preprocess("#include \"missing.asm\"").unwrap_err();
        assert!(matches!(err, AsmError::Include { .. }));
    }
}
