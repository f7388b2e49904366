use std::fmt;

use nom_locate::LocatedSpan;
use thiserror::Error;

/// Source text annotated with its location, as consumed by the lexer.
pub(crate) type Span<'s> = LocatedSpan<&'s str>;

/// A location in the source text.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// Byte offset from the start of the source.
    pub offset: usize,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column, counted in characters.
    pub column: usize,
}

impl Position {
    pub(crate) fn of(span: &Span<'_>) -> Self {
        Self {
            offset: span.location_offset(),
            line: span.location_line(),
            column: span.get_utf8_column(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexErrorKind {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(String),
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("unterminated cell array, missing '>'")]
    UnterminatedCells,
    #[error("unterminated byte string, missing ']'")]
    UnterminatedBytes,
    #[error("byte strings are made of pairs of hex digits")]
    OddByteString,
    #[error("integer literal '{0}' does not fit in 64 bits")]
    IntegerOverflow(String),
    #[error("invalid integer literal '{0}'")]
    InvalidInteger(String),
    #[error("invalid character literal")]
    InvalidCharLiteral,
    #[error("unknown directive '{0}'")]
    UnknownDirective(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: {reason}")]
pub struct LexError {
    pub position: Position,
    pub reason: LexErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: syntax error, expected {expected}, found {found}")]
pub struct ParseError {
    pub position: Position,
    pub expected: String,
    pub found: String,
}

/// Structural problems found by the validator.
///
/// These are reported next to the blob and only abort compilation when
/// warnings are configured to be fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("{node_path}: '{property}' has {found} cells, expected a multiple of {expected_multiple}")]
    CellWidthMismatch {
        node_path: String,
        property: String,
        expected_multiple: usize,
        found: usize,
    },
    #[error("{node_path}: '{property}' is {len} bytes long, which is not a whole number of cells")]
    UnalignedCells {
        node_path: String,
        property: String,
        len: usize,
    },
    #[error("{node_path}: '{property}' refers to phandle {phandle:#x}, which no node carries")]
    UnknownInterruptParent {
        node_path: String,
        property: String,
        phandle: u32,
    },
    #[error("{node_path}: '{property}' refers to {target}, which has no '#interrupt-cells'")]
    MissingInterruptCells {
        node_path: String,
        property: String,
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{position}: label '{label}' is defined on both {first} and {second}")]
    DuplicateLabel {
        label: String,
        first: String,
        second: String,
        /// Where the label is attached to `second`.
        position: Position,
    },
    #[error("{position}: reference to undefined label or path '{label}'")]
    UnresolvedReference { label: String, position: Position },
    #[error("{position}: phandle {phandle:#x} is claimed by both {first} and {second}")]
    PhandleConflict {
        phandle: u32,
        first: String,
        second: String,
        /// Position of the property claiming it on `second`.
        position: Position,
    },
    #[error("{position}: {path}: '{property}' is not a valid phandle")]
    InvalidPhandle {
        path: String,
        property: String,
        position: Position,
    },
    #[error(transparent)]
    Validation(#[from] Diagnostic),
    #[error("{block} is {size} bytes, which overflows the 32-bit blob header")]
    SerializationOverflow { block: &'static str, size: usize },
}

impl Error {
    /// Source position the error points at, if it has one.
    pub fn position(&self) -> Option<Position> {
        match self {
            Error::Lex(e) => Some(e.position),
            Error::Parse(e) => Some(e.position),
            Error::DuplicateLabel { position, .. }
            | Error::UnresolvedReference { position, .. }
            | Error::PhandleConflict { position, .. }
            | Error::InvalidPhandle { position, .. } => Some(*position),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_from_spans() {
        let span = Span::new("/ {\n\tfoo;\n};");
        let (rest, _) = nom::InputTake::take_split(&span, 5);

        assert_eq!(
            Position::of(&rest),
            Position {
                offset: 5,
                line: 2,
                column: 2
            }
        );
        assert_eq!(Position::of(&rest).to_string(), "2:2");
    }

    #[test]
    fn error_positions() {
        let position = Position {
            offset: 10,
            line: 3,
            column: 4,
        };

        let err = Error::UnresolvedReference {
            label: "nonexistent".into(),
            position,
        };
        assert_eq!(err.position(), Some(position));
        assert_eq!(
            err.to_string(),
            "3:4: reference to undefined label or path 'nonexistent'"
        );

        let err = Error::DuplicateLabel {
            label: "L1".into(),
            first: "/a".into(),
            second: "/b".into(),
            position,
        };
        assert_eq!(err.position(), Some(position));
        assert_eq!(err.to_string(), "3:4: label 'L1' is defined on both /a and /b");

        let err = Error::SerializationOverflow {
            block: "blob",
            size: 1 << 32,
        };
        assert_eq!(err.position(), None);
    }
}
