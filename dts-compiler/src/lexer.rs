use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until, take_while, take_while1, take_while_m_n},
    character::complete::{char, hex_digit1, multispace1, not_line_ending, oct_digit0},
    combinator::{map, opt, recognize},
    error::ParseError,
    multi::{many0, many1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    AsChar, InputTake,
};

use crate::error::{LexError, LexErrorKind, Position, Span};

type IResult<'a, T, E> = nom::IResult<Span<'a>, T, E>;

type NomError<'a> = nom::error::Error<Span<'a>>;

/// A token with the position of its first character.
pub type Spanned<'s> = (Token<'s>, Position);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'s> {
    /// Node or property name, including an optional `@unit-address`.
    Name(&'s str),
    /// Label definition, without the trailing `:`.
    Label(&'s str),
    /// `&label`
    Ref(&'s str),
    /// `&{/path}`
    PathRef(&'s str),
    Str(String),
    Num(u64),
    Byte(u8),
    Op(&'static str),
    Ctrl(char),
    Version,
    Plugin,
    Bits,
    DeleteNode,
    DeleteProp,
    OmitIfNoRef,
    MemReserve,
    Include,
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(s) => write!(f, "'{s}'"),
            Token::Label(s) => write!(f, "label '{s}:'"),
            Token::Ref(s) => write!(f, "reference '&{s}'"),
            Token::PathRef(s) => write!(f, "reference '&{{{s}}}'"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Num(n) => write!(f, "integer {n:#x}"),
            Token::Byte(b) => write!(f, "byte {b:02x}"),
            Token::Op(op) => write!(f, "'{op}'"),
            Token::Ctrl(c) => write!(f, "'{c}'"),
            Token::Version => f.write_str("'/dts-v1/'"),
            Token::Plugin => f.write_str("'/plugin/'"),
            Token::Bits => f.write_str("'/bits/'"),
            Token::DeleteNode => f.write_str("'/delete-node/'"),
            Token::DeleteProp => f.write_str("'/delete-property/'"),
            Token::OmitIfNoRef => f.write_str("'/omit-if-no-ref/'"),
            Token::MemReserve => f.write_str("'/memreserve/'"),
            Token::Include => f.write_str("include directive"),
        }
    }
}

/// Which token set the lexer recognizes.
///
/// Device tree source is context sensitive: `0x10` is a name in a node body, a
/// number in a cell array and two bytes in a byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Node bodies, property names and top-level directives.
    Structure,
    /// The inside of a `<...>` cell array.
    Cells,
    /// The inside of a `[...]` byte string.
    Bytes,
}

/// A saved lexer position, see [`Lexer::checkpoint`].
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint<'s>(Span<'s>);

/// Lazy tokenizer over device tree source text.
#[derive(Debug, Clone)]
pub struct Lexer<'s> {
    rest: Span<'s>,
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            rest: Span::new(source),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint<'s> {
        Checkpoint(self.rest)
    }

    pub fn rewind(&mut self, checkpoint: Checkpoint<'s>) {
        self.rest = checkpoint.0;
    }

    /// Position of the next token, or of the end of input.
    pub fn position(&self) -> Position {
        match ws::<NomError>(self.rest) {
            Ok((rest, _)) => Position::of(&rest),
            Err(_) => Position::of(&self.rest),
        }
    }

    /// Lex the next token in the given mode.
    ///
    /// Returns `Ok(None)` at the end of input in [`Mode::Structure`]. Running out of
    /// input inside a cell array or byte string is an error.
    pub fn next_token(&mut self, mode: Mode) -> Result<Option<Spanned<'s>>, LexError> {
        let input = self.skip_trivia()?;
        let position = Position::of(&input);

        if input.fragment().is_empty() {
            let reason = match mode {
                Mode::Structure => return Ok(None),
                Mode::Cells => LexErrorKind::UnterminatedCells,
                Mode::Bytes => LexErrorKind::UnterminatedBytes,
            };
            return Err(LexError { position, reason });
        }

        let (rest, token) = match mode {
            Mode::Structure => structure_token(input)?,
            Mode::Cells => cell_token(input)?,
            Mode::Bytes => byte_token(input)?,
        };

        self.rest = rest;
        Ok(Some((token, position)))
    }

    /// Lex the next token without consuming it.
    pub fn peek_token(&mut self, mode: Mode) -> Result<Option<Spanned<'s>>, LexError> {
        let checkpoint = self.checkpoint();
        let token = self.next_token(mode);
        self.rewind(checkpoint);
        token
    }

    fn skip_trivia(&mut self) -> Result<Span<'s>, LexError> {
        if let Ok((rest, _)) = ws::<NomError>(self.rest) {
            self.rest = rest;
        }

        if self.rest.fragment().starts_with("/*") {
            return Err(error(&self.rest, LexErrorKind::UnterminatedComment));
        }

        Ok(self.rest)
    }
}

impl<'s> Iterator for Lexer<'s> {
    type Item = Result<Spanned<'s>, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token(Mode::Structure).transpose();
        if let Some(Err(_)) = token {
            // Stop after the first error.
            self.rest = self.rest.take_split(self.rest.fragment().len()).0;
        }
        token
    }
}

fn error(at: &Span<'_>, reason: LexErrorKind) -> LexError {
    LexError {
        position: Position::of(at),
        reason,
    }
}

fn unexpected(at: Span<'_>) -> LexError {
    let c = at.fragment().chars().next().unwrap_or('\0');
    error(&at, LexErrorKind::UnexpectedChar(c))
}

/* === Mode entry points === */

fn structure_token(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    let Some(c) = input.fragment().chars().next() else {
        return Err(unexpected(input));
    };

    match c {
        '"' => string_literal(input),
        '&' => reference::<NomError>(input).map_err(|_| unexpected(input)),
        '/' => Ok(directive(input)?),
        '{' | '}' | '<' | '>' | '[' | ']' | ';' | '=' | ',' => {
            let (rest, _) = input.take_split(1);
            Ok((rest, Token::Ctrl(c)))
        }
        _ if is_name_char(c) => {
            let (rest, name) = take_while1::<_, _, NomError>(is_name_char)(input)
                .map_err(|_| unexpected(input))?;
            let name = *name.fragment();

            if name == "#include" {
                return Ok((rest, Token::Include));
            }

            match char::<_, NomError>(':')(rest) {
                Ok((after, _)) if is_label(name) => Ok((after, Token::Label(name))),
                _ => Ok((rest, Token::Name(name))),
            }
        }
        _ => Err(unexpected(input)),
    }
}

fn cell_token(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    let Some(c) = input.fragment().chars().next() else {
        return Err(unexpected(input));
    };

    match c {
        '0'..='9' => integer_literal(input),
        '\'' => char_literal(input),
        _ if c.is_ascii_alphabetic() || c == '_' => {
            terminated(label_str::<NomError>, char(':'))(input)
                .map(|(rest, label)| (rest, Token::Label(*label.fragment())))
                .map_err(|_| unexpected(input))
        }
        '&' => match reference::<NomError>(input) {
            Ok(res) => Ok(res),
            Err(_) => operator::<NomError>(input).map_err(|_| unexpected(input)),
        },
        '(' | ')' | '>' if !input.fragment().starts_with(">>") && !input.fragment().starts_with(">=") => {
            let (rest, _) = input.take_split(1);
            Ok((rest, Token::Ctrl(c)))
        }
        _ => operator::<NomError>(input).map_err(|_| unexpected(input)),
    }
}

fn byte_token(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    if let Ok((rest, _)) = char::<_, NomError>(']')(input) {
        return Ok((rest, Token::Ctrl(']')));
    }

    match take_while_m_n::<_, _, NomError>(1, 2, |c: char| c.is_ascii_hexdigit())(input) {
        Ok((rest, digits)) if digits.fragment().len() == 2 => {
            let byte = u8::from_str_radix(digits.fragment(), 16)
                .map_err(|_| error(&input, LexErrorKind::OddByteString))?;
            Ok((rest, Token::Byte(byte)))
        }
        Ok(_) => Err(error(&input, LexErrorKind::OddByteString)),
        Err(_) => Err(unexpected(input)),
    }
}

/* === Token recognizers === */

/// Recognize a directive keyword, or the root node name `/`.
fn directive(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    let keyword = alt::<_, _, NomError, _>((
        tag("/dts-v1/"),
        tag("/plugin/"),
        tag("/bits/"),
        tag("/delete-node/"),
        tag("/delete-property/"),
        tag("/omit-if-no-ref/"),
        tag("/memreserve/"),
        tag("/include/"),
    ))(input);

    if let Ok((rest, keyword)) = keyword {
        let token = match *keyword.fragment() {
            "/dts-v1/" => Token::Version,
            "/plugin/" => Token::Plugin,
            "/bits/" => Token::Bits,
            "/delete-node/" => Token::DeleteNode,
            "/delete-property/" => Token::DeleteProp,
            "/omit-if-no-ref/" => Token::OmitIfNoRef,
            "/memreserve/" => Token::MemReserve,
            _ => Token::Include,
        };
        return Ok((rest, token));
    }

    // Anything shaped like `/word/` is a directive we do not know about.
    if let Ok((_, unknown)) = recognize::<_, _, NomError, _>(delimited(
        char('/'),
        take_while1(|c: char| c.is_ascii_lowercase() || c == '-'),
        char('/'),
    ))(input)
    {
        return Err(error(
            &input,
            LexErrorKind::UnknownDirective(unknown.fragment().to_string()),
        ));
    }

    let (rest, _) = input.take_split(1);
    Ok((rest, Token::Ctrl('/')))
}

/// Recognize a `&label` or `&{/path}` reference.
fn reference<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Token<'a>, E> {
    let path = delimited(char('{'), node_path, char('}'));

    preceded(
        char('&'),
        alt((
            map(path, |p: Span<'a>| Token::PathRef(*p.fragment())),
            map(label_str, |l: Span<'a>| Token::Ref(*l.fragment())),
        )),
    )(input)
}

/// Recognize an expression operator.
fn operator<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Token<'a>, E> {
    let (rest, op) = alt((
        tag("<<"),
        tag(">>"),
        tag("<="),
        tag(">="),
        tag("=="),
        tag("!="),
        tag("&&"),
        tag("||"),
        recognize(nom::character::complete::one_of("+-*/%&|^~!?:<>")),
    ))(input)?;

    let op = match *op.fragment() {
        "<<" => "<<",
        ">>" => ">>",
        "<=" => "<=",
        ">=" => ">=",
        "==" => "==",
        "!=" => "!=",
        "&&" => "&&",
        "||" => "||",
        "+" => "+",
        "-" => "-",
        "*" => "*",
        "/" => "/",
        "%" => "%",
        "&" => "&",
        "|" => "|",
        "^" => "^",
        "~" => "~",
        "!" => "!",
        "?" => "?",
        ":" => ":",
        "<" => "<",
        _ => ">",
    };

    Ok((rest, Token::Op(op)))
}

/// Parse an integer literal in any base, with an optional C type suffix.
fn integer_literal(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    let (rest, digits) = recognize::<_, _, NomError, _>(alt((
        preceded(tag_no_case("0x"), hex_digit1),
        preceded(tag_no_case("0b"), take_while1(|c: char| c == '0' || c == '1')),
        preceded(char('0'), oct_digit0),
        take_while1(|c: char| c.is_ascii_digit()),
    )))(input)
    .map_err(|_| unexpected(input))?;

    let (rest, _) = opt(alt((
        tag_no_case::<_, _, NomError>("ull"),
        tag_no_case("ul"),
        tag_no_case("ll"),
        tag_no_case("u"),
        tag_no_case("l"),
    )))(rest)
    .map_err(|_| unexpected(input))?;

    let literal = &input.fragment()[..rest.location_offset() - input.location_offset()];

    // `0x1g` or `09` must not silently split into two tokens.
    if rest
        .fragment()
        .chars()
        .next()
        .is_some_and(|c| c.is_alphanum() || c == '_')
    {
        let end = take_while::<_, _, NomError>(|c: char| c.is_alphanum() || c == '_')(rest)
            .map(|(_, s)| s.fragment().len())
            .unwrap_or(0);
        let bad = &input.fragment()[..literal.len() + end];
        return Err(error(&input, LexErrorKind::InvalidInteger(bad.to_string())));
    }

    let digits = *digits.fragment();
    let parsed = if let Some(hex) = digits.strip_prefix("0x").or(digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = digits.strip_prefix("0b").or(digits.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2)
    } else if digits.len() > 1 && digits.starts_with('0') {
        u64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse()
    };

    match parsed {
        Ok(n) => Ok((rest, Token::Num(n))),
        Err(_) => Err(error(
            &input,
            LexErrorKind::IntegerOverflow(literal.to_string()),
        )),
    }
}

/// Parse a character literal such as `'a'` or `'\n'` into its integer value.
fn char_literal(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    let body = &input.fragment()[1..];
    let (value, len) = match body.chars().next() {
        Some('\\') => unescape(&body[1..])
            .map(|(v, n)| (v, n + 1))
            .map_err(|reason| error(&input, reason))?,
        Some(c) if c != '\'' => (c as u32, c.len_utf8()),
        _ => return Err(error(&input, LexErrorKind::InvalidCharLiteral)),
    };

    if !body[len..].starts_with('\'') {
        return Err(error(&input, LexErrorKind::InvalidCharLiteral));
    }

    let (rest, _) = input.take_split(1 + len + 1);
    Ok((rest, Token::Num(value.into())))
}

/// Parse a string literal, decoding its escape sequences.
fn string_literal(input: Span<'_>) -> Result<(Span<'_>, Token<'_>), LexError> {
    let body = &input.fragment()[1..];
    let mut value = String::new();
    let mut i = 0;

    loop {
        let Some(c) = body[i..].chars().next() else {
            return Err(error(&input, LexErrorKind::UnterminatedString));
        };

        match c {
            '"' => break,
            '\\' => {
                let (v, n) = unescape(&body[i + 1..]).map_err(|reason| {
                    let (at, _) = input.take_split(1 + i);
                    error(&at, reason)
                })?;
                // `unescape` only produces ASCII for strings.
                value.push(char::from(v as u8));
                i += 1 + n;
            }
            c => {
                value.push(c);
                i += c.len_utf8();
            }
        }
    }

    let (rest, _) = input.take_split(1 + i + 1);
    Ok((rest, Token::Str(value)))
}

/// Decode the escape sequence following a backslash.
///
/// Returns the value and the number of bytes consumed after the backslash.
fn unescape(s: &str) -> Result<(u32, usize), LexErrorKind> {
    let Some(c) = s.chars().next() else {
        return Err(LexErrorKind::UnterminatedString);
    };

    let simple = match c {
        'a' => Some(0x07),
        'b' => Some(0x08),
        't' => Some(b'\t'),
        'n' => Some(b'\n'),
        'v' => Some(0x0b),
        'f' => Some(0x0c),
        'r' => Some(b'\r'),
        '\\' => Some(b'\\'),
        '"' => Some(b'"'),
        '\'' => Some(b'\''),
        _ => None,
    };
    if let Some(v) = simple {
        return Ok((v.into(), 1));
    }

    let (digits, radix, skip) = match c {
        'x' => {
            let n = s[1..].chars().take(2).take_while(char::is_ascii_hexdigit).count();
            (&s[1..1 + n], 16, 1)
        }
        '0'..='7' => {
            let n = s.chars().take(3).take_while(|c| ('0'..='7').contains(c)).count();
            (&s[..n], 8, 0)
        }
        _ => return Err(LexErrorKind::InvalidEscape(c.to_string())),
    };

    match u32::from_str_radix(digits, radix) {
        Ok(v) if v < 0x80 => Ok((v, skip + digits.len())),
        _ => Err(LexErrorKind::InvalidEscape(s[..skip + digits.len()].to_string())),
    }
}

/* === Character classes === */

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ",._+*#?@-".contains(c)
}

fn is_label(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Recognize a valid node label string.
fn label_str<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(pair(
        take_while_m_n(1, 1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// Recognize a valid node path, e.g. `/cpus/cpu@0`.
fn node_path<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    alt((
        recognize(many1(preceded(char('/'), take_while1(is_name_char)))),
        tag("/"),
    ))(input)
}

/* === Whitespace and comments === */

/// Consume zero or more whitespace characters or comments.
fn ws<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(many0(alt((multispace1, line_comment, block_comment))))(input)
}

/// Parse block comments.
fn block_comment<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(tuple((tag("/*"), take_until("*/"), tag("*/"))))(input)
}

/// Parse a single line comment.
///
/// The parser stops just before the newline character but doesn't consume the newline.
fn line_comment<'a, E: ParseError<Span<'a>>>(input: Span<'a>) -> IResult<'a, Span<'a>, E> {
    recognize(pair(tag("//"), not_line_ending))(input)
}

/* === Unit Tests === */

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str, mode: Mode) -> Vec<Token<'_>> {
        let mut lexer = Lexer::new(input);
        let mut out = vec![];
        while lexer.position().offset < input.len() {
            match lexer.next_token(mode).unwrap() {
                Some((tok, _)) => out.push(tok),
                None => break,
            }
        }
        out
    }

    fn lex_error(input: &str, mode: Mode) -> LexError {
        let mut lexer = Lexer::new(input);
        loop {
            match lexer.next_token(mode) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("{input:?} lexed without errors"),
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn numbers() {
        for (input, expected) in [
            ("0", 0),
            ("1", 1),
            ("25", 25),
            ("0x1", 0x1),
            ("0x25", 0x25),
            ("0x1f", 0x1f),
            ("0X0F00", 0xf00),
            ("010", 8),
            ("0b101", 5),
            ("42U", 42),
            ("0x10ULL", 0x10),
            ("0xffffffffffffffff", u64::MAX),
            ("'A'", 65),
            ("'\\n'", 10),
            ("'\\x41'", 0x41),
        ] {
            assert_eq!(tokens(input, Mode::Cells), [Token::Num(expected)], "{input}");
        }
    }

    #[test]
    fn invalid_numbers() {
        for (input, reason) in [
            (
                "0x10000000000000000",
                LexErrorKind::IntegerOverflow("0x10000000000000000".into()),
            ),
            ("0x1g", LexErrorKind::InvalidInteger("0x1g".into())),
            ("09", LexErrorKind::InvalidInteger("09".into())),
            ("''", LexErrorKind::InvalidCharLiteral),
            ("'ab'", LexErrorKind::InvalidCharLiteral),
        ] {
            assert_eq!(lex_error(input, Mode::Cells).reason, reason, "{input}");
        }
    }

    #[test]
    fn strings() {
        for (input, expected) in [
            (r#""word""#, "word"),
            (r#""""#, ""),
            (r#""more words""#, "more words"),
            ("\"words with\nnewline\"", "words with\nnewline"),
            (
                r#""words with nested \"quotes\"""#,
                r#"words with nested "quotes""#,
            ),
            (
                r#""words with escaped \\ delimiters""#,
                r#"words with escaped \ delimiters"#,
            ),
            (r#""tab\tand\x41\101""#, "tab\tandAA"),
        ] {
            assert_eq!(
                tokens(input, Mode::Structure),
                [Token::Str(expected.into())],
                "{input}"
            );
        }
    }

    #[test]
    fn invalid_strings() {
        let err = lex_error("/ {\n  model = \"abc\\q\";", Mode::Structure);
        assert_eq!(err.reason, LexErrorKind::InvalidEscape("q".into()));
        assert_eq!((err.position.line, err.position.column), (2, 15));

        let err = lex_error("model = \"abc;\n", Mode::Structure);
        assert_eq!(err.reason, LexErrorKind::UnterminatedString);
        assert_eq!(err.position.offset, 8);

        let err = lex_error(r#""\xff""#, Mode::Structure);
        assert_eq!(err.reason, LexErrorKind::InvalidEscape("xff".into()));
    }

    #[test]
    fn structure_tokens() {
        use Token::*;

        assert_eq!(
            tokens(
                "/dts-v1/;\n/ { L2_0: l2-cache@0,1 { #address-cells = <1>; }; };",
                Mode::Structure
            ),
            [
                Version,
                Ctrl(';'),
                Ctrl('/'),
                Ctrl('{'),
                Label("L2_0"),
                Name("l2-cache@0,1"),
                Ctrl('{'),
                Name("#address-cells"),
                Ctrl('='),
                Ctrl('<'),
                Name("1"),
                Ctrl('>'),
                Ctrl(';'),
                Ctrl('}'),
                Ctrl(';'),
                Ctrl('}'),
                Ctrl(';'),
            ]
        );
    }

    #[test]
    fn identifiers() {
        for input in [
            "cpus",
            "L2_0",
            "l2-cache",
            "ti,pmic-shutdown-controller",
            "#address-cells",
            "ibm,ppc-interrupt-server#s",
            "a-very-very-long-name-which-should-not-fail",
        ] {
            assert_eq!(tokens(input, Mode::Structure), [Token::Name(input)]);
        }
    }

    #[test]
    fn labels_and_references() {
        use Token::*;

        for (input, expected) in [
            ("L2: ", vec![Label("L2")]),
            ("L2 :", vec![Name("L2")]),
            ("a,b:", vec![Name("a,b")]),
            ("&mpic", vec![Ref("mpic")]),
            ("&{/cpus/cpu@0}", vec![PathRef("/cpus/cpu@0")]),
            ("&{/}", vec![PathRef("/")]),
        ] {
            let lexed: Vec<_> = Lexer::new(input)
                .map(|t| t.unwrap().0)
                .take(expected.len())
                .collect();
            assert_eq!(lexed, expected, "{input}");
        }
    }

    #[test]
    fn cell_tokens() {
        use Token::*;

        assert_eq!(
            tokens("&L11 3 (1 << 2) &{/soc} 'a'>", Mode::Cells),
            [
                Ref("L11"),
                Num(3),
                Ctrl('('),
                Num(1),
                Op("<<"),
                Num(2),
                Ctrl(')'),
                PathRef("/soc"),
                Num(97),
                Ctrl('>'),
            ]
        );

        assert_eq!(
            tokens("1 mid: 2 end:>", Mode::Cells),
            [Num(1), Label("mid"), Num(2), Label("end"), Ctrl('>')]
        );
        assert_eq!(
            lex_error("1 mid 2>", Mode::Cells).reason,
            LexErrorKind::UnexpectedChar('m')
        );

        assert_eq!(
            tokens("(1 >= 2 && 3 & 4 > 5)>", Mode::Cells),
            [
                Ctrl('('),
                Num(1),
                Op(">="),
                Num(2),
                Op("&&"),
                Num(3),
                Op("&"),
                Num(4),
                Ctrl('>'),
                Num(5),
                Ctrl(')'),
                Ctrl('>'),
            ]
        );
    }

    #[test]
    fn operators() {
        for input in [
            "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+", "-", "*", "/", "%", "^", "&", "|",
            "~", "!", "?", ":", "<",
        ] {
            assert_eq!(tokens(input, Mode::Cells), [Token::Op(input)], "{input}");
        }
    }

    #[test]
    fn byte_strings() {
        use Token::*;

        assert_eq!(
            tokens("00 0a FF 1234]", Mode::Bytes),
            [Byte(0), Byte(0x0a), Byte(0xff), Byte(0x12), Byte(0x34), Ctrl(']')]
        );
        assert_eq!(lex_error("0a 1]", Mode::Bytes).reason, LexErrorKind::OddByteString);
        assert_eq!(lex_error("0a zz]", Mode::Bytes).reason, LexErrorKind::UnexpectedChar('z'));
    }

    #[test]
    fn unterminated_groups() {
        assert_eq!(lex_error("1 2 3", Mode::Cells).reason, LexErrorKind::UnterminatedCells);
        assert_eq!(lex_error("00 11", Mode::Bytes).reason, LexErrorKind::UnterminatedBytes);
        assert_eq!(
            lex_error("/ { /* never closed", Mode::Structure).reason,
            LexErrorKind::UnterminatedComment
        );
    }

    #[test]
    fn directives() {
        for (input, expected) in [
            ("/dts-v1/", Token::Version),
            ("/plugin/", Token::Plugin),
            ("/bits/", Token::Bits),
            ("/delete-node/", Token::DeleteNode),
            ("/delete-property/", Token::DeleteProp),
            ("/omit-if-no-ref/", Token::OmitIfNoRef),
            ("/memreserve/", Token::MemReserve),
            ("/include/", Token::Include),
            ("#include", Token::Include),
            ("/", Token::Ctrl('/')),
        ] {
            assert_eq!(tokens(input, Mode::Structure), [expected], "{input}");
        }

        assert_eq!(
            lex_error("/delete-prop/ foo;", Mode::Structure).reason,
            LexErrorKind::UnknownDirective("/delete-prop/".into())
        );
    }

    #[test]
    fn comments_are_skipped() {
        let input = "// line comment\n/* block\n comment */ cpus // trailing";
        let mut lexer = Lexer::new(input);

        let (tok, pos) = lexer.next().unwrap().unwrap();
        assert_eq!(tok, Token::Name("cpus"));
        assert_eq!((pos.line, pos.column), (3, 13));
        assert!(lexer.next().is_none());
    }

    #[test]
    fn checkpoints() {
        let mut lexer = Lexer::new("a b c");
        assert_eq!(lexer.next_token(Mode::Structure).unwrap().unwrap().0, Token::Name("a"));

        let checkpoint = lexer.checkpoint();
        assert_eq!(lexer.next_token(Mode::Structure).unwrap().unwrap().0, Token::Name("b"));
        assert_eq!(lexer.peek_token(Mode::Structure).unwrap().unwrap().0, Token::Name("c"));

        lexer.rewind(checkpoint);
        assert_eq!(lexer.next_token(Mode::Structure).unwrap().unwrap().0, Token::Name("b"));
        assert_eq!(lexer.next_token(Mode::Structure).unwrap().unwrap().0, Token::Name("c"));
        assert_eq!(lexer.next_token(Mode::Structure).unwrap(), None);
    }
}
