// Brio Token Definitions

use std::fmt;
use std::sync::Arc;

/// Operator and punctuation tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %

    Equal,        // =
    EqualEqual,   // ==
    Bang,         // !
    BangEqual,    // !=
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=

    AndAnd,       // &&
    OrOr,         // ||

    // Compound assignment: recognized by the lexer, rejected by the parser
    PlusEqual,    // +=
    MinusEqual,   // -=
    StarEqual,    // *=
    SlashEqual,   // /=
    PercentEqual, // %=

    Amp,          // &
    Pipe,         // |
    Caret,        // ^
    Tilde,        // ~
    Shl,          // <<
    Shr,          // >>

    LeftParen,    // (
    RightParen,   // )
    LeftBracket,  // [
    RightBracket, // ]
    LeftBrace,    // {
    RightBrace,   // }
    Comma,        // ,
    Dot,          // .
    Colon,        // :
}

impl Op {
    pub fn is_compound_assign(&self) -> bool {
        matches!(
            self,
            Op::PlusEqual | Op::MinusEqual | Op::StarEqual | Op::SlashEqual | Op::PercentEqual
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Star => "*",
            Op::Slash => "/",
            Op::Percent => "%",
            Op::Equal => "=",
            Op::EqualEqual => "==",
            Op::Bang => "!",
            Op::BangEqual => "!=",
            Op::Less => "<",
            Op::LessEqual => "<=",
            Op::Greater => ">",
            Op::GreaterEqual => ">=",
            Op::AndAnd => "&&",
            Op::OrOr => "||",
            Op::PlusEqual => "+=",
            Op::MinusEqual => "-=",
            Op::StarEqual => "*=",
            Op::SlashEqual => "/=",
            Op::PercentEqual => "%=",
            Op::Amp => "&",
            Op::Pipe => "|",
            Op::Caret => "^",
            Op::Tilde => "~",
            Op::Shl => "<<",
            Op::Shr => ">>",
            Op::LeftParen => "(",
            Op::RightParen => ")",
            Op::LeftBracket => "[",
            Op::RightBracket => "]",
            Op::LeftBrace => "{",
            Op::RightBrace => "}",
            Op::Comma => ",",
            Op::Dot => ".",
            Op::Colon => ":",
        };
        write!(f, "{}", text)
    }
}

/// All token kinds in Brio.
///
/// Keywords are ordinary `Identifier` tokens; the parser distinguishes
/// them by text. `Str` and `RawStr` carry the text between the delimiters
/// with escape sequences unresolved — the parser interprets escapes.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    EndOfText,
    EndOfLine,
    Indent,
    Unindent,
    Identifier(Arc<str>),
    Int(i64),
    Float(f64),
    Str(String),
    RawStr(String),
    Op(Op),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::EndOfText => write!(f, "end of input"),
            TokenKind::EndOfLine => write!(f, "end of line"),
            TokenKind::Indent => write!(f, "indent"),
            TokenKind::Unindent => write!(f, "unindent"),
            TokenKind::Identifier(name) => write!(f, "{}", name),
            TokenKind::Int(n) => write!(f, "{}", n),
            TokenKind::Float(n) => write!(f, "{}", n),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::RawStr(s) => write!(f, "r\"{}\"", s),
            TokenKind::Op(op) => write!(f, "{}", op),
        }
    }
}

/// A token with its kind, source text, and line number
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            line,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::EndOfText)
    }

    /// True for an identifier token with exactly this text.
    pub fn is_word(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Identifier(name) if name.as_ref() == word)
    }

    pub fn is_op(&self, op: Op) -> bool {
        self.kind == TokenKind::Op(op)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
