use nom::{
    branch::alt,
    bytes::complete::{is_a, tag, tag_no_case},
    character::complete::{alpha1, alphanumeric1, anychar, char, digit1, hex_digit1, none_of},
    combinator::{all_consuming, map, map_res, opt, recognize, value, verify},
    multi::{many0_count, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult,
};
use nom_locate::LocatedSpan;

use crate::plat::Register;

use super::Operand;

pub type Span<'a> = LocatedSpan<&'a str>;

/// Characters that separate items in a data directive.
pub const SEPARATORS: &str = " ,\t";

/// Splits an instruction line, or the text of a constant, into tokens. Commas separate tokens
/// just like whitespace.
pub fn split_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
}

impl Register {
    pub fn lex(inp: Span) -> IResult<Span, Self> {
        alt((
            value(Self::B, tag_no_case("b")),
            value(Self::C, tag_no_case("c")),
            value(Self::H, tag_no_case("h")),
            value(Self::L, tag_no_case("l")),
            value(Self::D, tag_no_case("d")),
            value(Self::E, tag_no_case("e")),
            value(Self::A, tag_no_case("a")),
            value(Self::F, tag_no_case("f")),
        ))(inp)
    }
}

/// `0XNN` is a byte, `0XNNNN` is an address. Anything longer is rejected.
pub fn lex_hex(inp: Span) -> IResult<Span, Operand> {
    map_res(
        preceded(
            tag_no_case("0x"),
            verify(hex_digit1, |d: &Span| d.fragment().len() <= 4),
        ),
        |d: Span| {
            if d.fragment().len() <= 2 {
                u8::from_str_radix(d.fragment(), 16).map(Operand::Byte)
            } else {
                u16::from_str_radix(d.fragment(), 16).map(Operand::Word)
            }
        },
    )(inp)
}

pub fn lex_operand(inp: Span) -> IResult<Span, Operand> {
    alt((map(Register::lex, Operand::Reg), lex_hex))(inp)
}

/// Parses a whole token as a register or hex literal.
pub fn parse_operand(token: &str) -> Option<Operand> {
    all_consuming(lex_operand)(Span::new(token))
        .ok()
        .map(|(_, op)| op)
}

pub fn lex_identifier(inp: Span) -> IResult<Span, Span> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(inp)
}

/// Whether `s` can name a symbol: a letter or underscore, then letters, digits and underscores.
pub fn is_identifier(s: &str) -> bool {
    all_consuming(lex_identifier)(Span::new(s)).is_ok()
}

pub fn lex_number(inp: Span) -> IResult<Span, u32> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |d: Span| {
            u32::from_str_radix(d.fragment(), 16)
        }),
        map_res(digit1, |d: Span| d.fragment().parse::<u32>()),
    ))(inp)
}

/// Parses a whole token as a hex or decimal number.
pub fn parse_number(s: &str) -> Option<u32> {
    all_consuming(lex_number)(Span::new(s))
        .ok()
        .map(|(_, n)| n)
}

/// One item of a `#DB` or `#DW` list, not yet converted to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataItem<'a> {
    /// `'...'`, body still escaped.
    Chars(Span<'a>),
    /// `"..."`, body still escaped. Gets a NUL terminator.
    Str(Span<'a>),
    /// `0X...`, prefix included.
    Hex(Span<'a>),
    /// `-?[0-9]+`
    Decimal(Span<'a>),
}

impl<'a> DataItem<'a> {
    pub fn span(&self) -> Span<'a> {
        match *self {
            Self::Chars(s) | Self::Str(s) | Self::Hex(s) | Self::Decimal(s) => s,
        }
    }
}

fn quoted<'a>(quote: char) -> impl FnMut(Span<'a>) -> IResult<Span<'a>, Span<'a>> {
    let stop = if quote == '"' { "\\\"" } else { "\\'" };
    delimited(
        char(quote),
        recognize(many0_count(alt((
            recognize(pair(char('\\'), anychar)),
            recognize(none_of(stop)),
        )))),
        char(quote),
    )
}

fn data_item(inp: Span) -> IResult<Span, DataItem> {
    alt((
        map(quoted('\''), DataItem::Chars),
        map(quoted('"'), DataItem::Str),
        map(
            recognize(preceded(tag_no_case("0x"), hex_digit1)),
            DataItem::Hex,
        ),
        map(recognize(pair(opt(char('-')), digit1)), DataItem::Decimal),
    ))(inp)
}

/// Lexes the item list of a data directive. Items are separated by spaces, tabs or commas.
pub fn lex_data_items(inp: Span) -> IResult<Span, Vec<DataItem>> {
    all_consuming(delimited(
        opt(is_a(SEPARATORS)),
        separated_list1(is_a(SEPARATORS), data_item),
        opt(is_a(SEPARATORS)),
    ))(inp)
}

/// What went wrong expanding a quoted body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeError {
    Invalid(char),
    AtEnd,
}

pub fn escaped_byte(c: char) -> Option<u8> {
    Some(match c {
        '0' => 0x00,
        'a' => 0x07,
        'b' => 0x08,
        't' => 0x09,
        'n' => 0x0A,
        'v' => 0x0B,
        'f' => 0x0C,
        'r' => 0x0D,
        'e' => 0x1B,
        '\\' => b'\\',
        '\'' => b'\'',
        '"' => b'"',
        _ => return None,
    })
}

/// Expands the escape sequences of a quoted body into bytes.
pub fn unescape(body: &str) -> Result<Vec<u8>, EscapeError> {
    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let esc = chars.next().ok_or(EscapeError::AtEnd)?;
            out.push(escaped_byte(esc).ok_or(EscapeError::Invalid(esc))?);
        } else {
            let mut buf = [0; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operands() {
        assert_eq!(parse_operand("B"), Some(Operand::Reg(Register::B)));
        assert_eq!(parse_operand("F"), Some(Operand::Reg(Register::F)));
        assert_eq!(parse_operand("0X5"), Some(Operand::Byte(0x05)));
        assert_eq!(parse_operand("0XFF"), Some(Operand::Byte(0xFF)));
        assert_eq!(parse_operand("0X100"), Some(Operand::Word(0x0100)));
        assert_eq!(parse_operand("0X8000"), Some(Operand::Word(0x8000)));
        assert_eq!(parse_operand("0X10000"), None);
        assert_eq!(parse_operand("BC"), None);
        assert_eq!(parse_operand("12"), None);
        assert_eq!(parse_operand("0X"), None);
    }

    #[test]
    fn test_split_tokens() {
        let tokens: Vec<_> = split_tokens("MOVMR A D, E").collect();
        assert_eq!(tokens, ["MOVMR", "A", "D", "E"]);
        let tokens: Vec<_> = split_tokens(" D ,E\t").collect();
        assert_eq!(tokens, ["D", "E"]);
        assert_eq!(split_tokens(" , ").count(), 0);
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("MAIN"));
        assert!(is_identifier("_LOOP2"));
        assert!(!is_identifier("2LOOP"));
        assert!(!is_identifier("MY-LOOP"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_number("0X8000"), Some(0x8000));
        assert_eq!(parse_number("32768"), Some(32768));
        assert_eq!(parse_number("0XZZ"), None);
        assert_eq!(parse_number("-1"), None);
    }

    #[test]
    fn test_data_items() {
        let (_, items) = lex_data_items(Span::new(r#"0X41, 'a\n' "x;y" -2"#)).unwrap();
        assert_eq!(items.len(), 4);
        assert!(matches!(items[0], DataItem::Hex(s) if *s.fragment() == "0X41"));
        assert!(matches!(items[1], DataItem::Chars(s) if *s.fragment() == r"a\n"));
        assert!(matches!(items[2], DataItem::Str(s) if *s.fragment() == "x;y"));
        assert!(matches!(items[3], DataItem::Decimal(s) if *s.fragment() == "-2"));
        assert_eq!(items[3].span().get_utf8_column(), 19);
    }

    #[test]
    fn test_escaped_quotes_stay_inside_strings() {
        let (_, items) = lex_data_items(Span::new(r#""say \"hi\"""#)).unwrap();
        assert_eq!(items.len(), 1);
        let DataItem::Str(body) = items[0] else {
            panic!("expected a string item");
        };
        assert_eq!(unescape(body.fragment()).unwrap(), b"say \"hi\"");
    }

    #[test]
    fn test_bad_data_items() {
        let err = lex_data_items(Span::new("0X41 0X4Z")).unwrap_err();
        let nom::Err::Error(e) = err else {
            panic!("expected a recoverable error");
        };
        assert_eq!(e.input.get_utf8_column(), 9);
        assert!(lex_data_items(Span::new("")).is_err());
        assert!(lex_data_items(Span::new("\"open")).is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\tb\0").unwrap(), [b'a', 0x09, b'b', 0x00]);
        assert_eq!(unescape(r"\e\\").unwrap(), [0x1B, b'\\']);
        assert_eq!(unescape(r"\q"), Err(EscapeError::Invalid('q')));
        assert_eq!(unescape("abc\\"), Err(EscapeError::AtEnd));
    }
}
