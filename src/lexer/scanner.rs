// Brio Lexer
// Streams tokens from source text with one token of lookahead.
// Indentation is significant only at line start with zero bracket nesting.

use crate::error::{BrioError, BrioResult, Span};
use crate::lexer::token::{Op, Token, TokenKind};
use crate::vm::interner::intern;

const MAX_INDENT_DEPTH: usize = 64;

pub struct Lexer {
    source: Vec<char>,
    cursor: usize,
    line: usize,
    line_start: usize,
    at_line_start: bool,
    /// Depth of open ()[]{} pairs; indentation and EOL are insignificant inside
    nesting: usize,
    /// Stack of previously seen indentation widths
    indents: Vec<usize>,
    /// Target width while emitting a multi-level dedent
    pending_unindent: Option<usize>,
    lookahead: Option<Token>,
    file: String,
}

impl Lexer {
    pub fn new(source: &str, file: impl Into<String>) -> Self {
        Self {
            source: source.chars().collect(),
            cursor: 0,
            line: 1,
            line_start: 0,
            at_line_start: true,
            nesting: 0,
            indents: Vec::new(),
            pending_unindent: None,
            lookahead: None,
            file: file.into(),
        }
    }

    /// Consume and return the next token.
    pub fn next(&mut self) -> BrioResult<Token> {
        if let Some(token) = self.lookahead.take() {
            return Ok(token);
        }
        self.scan_token()
    }

    /// Return the next token without consuming it. One token of lookahead.
    pub fn peek(&mut self) -> BrioResult<&Token> {
        if self.lookahead.is_none() {
            let token = self.scan_token()?;
            self.lookahead = Some(token);
        }
        Ok(self.lookahead.as_ref().unwrap())
    }

    // ==================== scanning ====================

    fn scan_token(&mut self) -> BrioResult<Token> {
        // Drain a multi-level dedent one Unindent per call
        if let Some(target) = self.pending_unindent {
            if self.indents.last().is_some_and(|&top| top > target) {
                self.indents.pop();
                return Ok(self.make_token(TokenKind::Unindent, ""));
            }
            self.pending_unindent = None;
        }

        loop {
            if self.at_line_start && self.nesting == 0 {
                if let Some(token) = self.measure_indentation()? {
                    return Ok(token);
                }
            }

            if self.is_at_end() {
                // Close all open indentation levels before EndOfText
                if self.indents.pop().is_some() {
                    return Ok(self.make_token(TokenKind::Unindent, ""));
                }
                return Ok(self.make_token(TokenKind::EndOfText, ""));
            }

            let c = self.advance();
            if c != '\n' {
                self.at_line_start = false;
            }
            match c {
                ' ' | '\r' | '\t' => continue,

                '\n' => {
                    self.begin_line();
                    if self.nesting == 0 {
                        return Ok(self.make_token(TokenKind::EndOfLine, "\\n"));
                    }
                }

                '#' => {
                    // Comment to end of line, surfaced as an EndOfLine
                    while !self.is_at_end() && self.peek_char() != '\n' {
                        self.advance();
                    }
                    if !self.is_at_end() {
                        self.advance();
                        self.begin_line();
                    }
                    if self.nesting == 0 {
                        return Ok(self.make_token(TokenKind::EndOfLine, "\\n"));
                    }
                }

                '(' => return Ok(self.open_bracket(Op::LeftParen, "(")),
                '[' => return Ok(self.open_bracket(Op::LeftBracket, "[")),
                '{' => return Ok(self.open_bracket(Op::LeftBrace, "{")),
                ')' => return Ok(self.close_bracket(Op::RightParen, ")")),
                ']' => return Ok(self.close_bracket(Op::RightBracket, "]")),
                '}' => return Ok(self.close_bracket(Op::RightBrace, "}")),

                ',' => return Ok(self.op_token(Op::Comma, ",")),
                '.' => return Ok(self.op_token(Op::Dot, ".")),
                ':' => return Ok(self.op_token(Op::Colon, ":")),
                '~' => return Ok(self.op_token(Op::Tilde, "~")),
                '^' => return Ok(self.op_token(Op::Caret, "^")),

                '+' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::PlusEqual, "+=")
                    } else {
                        (Op::Plus, "+")
                    };
                    return Ok(self.op_token(op, text));
                }
                '-' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::MinusEqual, "-=")
                    } else {
                        (Op::Minus, "-")
                    };
                    return Ok(self.op_token(op, text));
                }
                '*' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::StarEqual, "*=")
                    } else {
                        (Op::Star, "*")
                    };
                    return Ok(self.op_token(op, text));
                }
                '/' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::SlashEqual, "/=")
                    } else {
                        (Op::Slash, "/")
                    };
                    return Ok(self.op_token(op, text));
                }
                '%' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::PercentEqual, "%=")
                    } else {
                        (Op::Percent, "%")
                    };
                    return Ok(self.op_token(op, text));
                }
                '=' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::EqualEqual, "==")
                    } else {
                        (Op::Equal, "=")
                    };
                    return Ok(self.op_token(op, text));
                }
                '!' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::BangEqual, "!=")
                    } else {
                        (Op::Bang, "!")
                    };
                    return Ok(self.op_token(op, text));
                }
                '<' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::LessEqual, "<=")
                    } else if self.match_char('<') {
                        (Op::Shl, "<<")
                    } else {
                        (Op::Less, "<")
                    };
                    return Ok(self.op_token(op, text));
                }
                '>' => {
                    let (op, text) = if self.match_char('=') {
                        (Op::GreaterEqual, ">=")
                    } else if self.match_char('>') {
                        (Op::Shr, ">>")
                    } else {
                        (Op::Greater, ">")
                    };
                    return Ok(self.op_token(op, text));
                }
                '&' => {
                    let (op, text) = if self.match_char('&') {
                        (Op::AndAnd, "&&")
                    } else {
                        (Op::Amp, "&")
                    };
                    return Ok(self.op_token(op, text));
                }
                '|' => {
                    let (op, text) = if self.match_char('|') {
                        (Op::OrOr, "||")
                    } else {
                        (Op::Pipe, "|")
                    };
                    return Ok(self.op_token(op, text));
                }

                '"' | '\'' | '`' => return self.string(c, false),

                'r' if matches!(self.peek_char(), '"' | '\'' | '`') => {
                    let delim = self.advance();
                    return self.string(delim, true);
                }

                c if c.is_ascii_digit() => return self.number(c),
                c if c.is_ascii_alphabetic() || c == '_' => return Ok(self.identifier(c)),

                c => {
                    return Err(self.error(format!("Unexpected character '{}'", c)));
                }
            }
        }
    }

    /// Measure indentation at line start. Blank and comment-only lines are
    /// skipped wholesale before measuring. Returns an Indent or Unindent
    /// token when the level changes, None when the line continues at the
    /// current level.
    fn measure_indentation(&mut self) -> BrioResult<Option<Token>> {
        let mut width = 0;
        loop {
            match self.peek_char() {
                ' ' | '\t' => {
                    self.advance();
                    width += 1;
                }
                '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    self.begin_line();
                    width = 0;
                }
                '#' => {
                    while !self.is_at_end() && self.peek_char() != '\n' {
                        self.advance();
                    }
                    if !self.is_at_end() {
                        self.advance();
                        self.begin_line();
                    }
                    width = 0;
                }
                _ => break,
            }
            if self.is_at_end() {
                self.at_line_start = false;
                return Ok(None);
            }
        }

        self.at_line_start = false;
        let top = self.indents.last().copied().unwrap_or(0);
        if width > top {
            if self.indents.len() >= MAX_INDENT_DEPTH {
                return Err(self.error("Indentation nested too deeply"));
            }
            self.indents.push(width);
            return Ok(Some(self.make_token(TokenKind::Indent, "")));
        }
        if width < top {
            // A width matching no stack entry dedents to the nearest
            // enclosing level; one Unindent is emitted per popped level.
            self.pending_unindent = Some(width);
            self.indents.pop();
            return Ok(Some(self.make_token(TokenKind::Unindent, "")));
        }
        Ok(None)
    }

    fn string(&mut self, delim: char, raw: bool) -> BrioResult<Token> {
        let start_line = self.line;
        let mut text = String::new();
        loop {
            if self.is_at_end() {
                return Err(BrioError::lexer(
                    "Unterminated string literal",
                    Span::line(start_line),
                    &self.file,
                ));
            }
            let c = self.advance();
            if c == delim {
                break;
            }
            if c == '\n' {
                self.line += 1;
                self.line_start = self.cursor;
            }
            text.push(c);
            if c == '\\' && !raw {
                // Escapes stay unresolved, but an escaped delimiter must
                // not terminate the scan
                if self.is_at_end() {
                    return Err(BrioError::lexer(
                        "Unterminated string literal",
                        Span::line(start_line),
                        &self.file,
                    ));
                }
                let escaped = self.advance();
                if escaped == '\n' {
                    self.line += 1;
                    self.line_start = self.cursor;
                }
                text.push(escaped);
            }
        }
        let kind = if raw {
            TokenKind::RawStr(text.clone())
        } else {
            TokenKind::Str(text.clone())
        };
        let lexeme = format!("{}{}{}", delim, text, delim);
        Ok(Token::new(kind, lexeme, start_line))
    }

    fn number(&mut self, first: char) -> BrioResult<Token> {
        let mut text = String::new();
        text.push(first);

        if first == '0' && matches!(self.peek_char(), 'x' | 'X') {
            text.push(self.advance());
            let mut digits = String::new();
            while self.peek_char().is_ascii_hexdigit() {
                digits.push(self.advance());
            }
            if digits.is_empty() {
                return Err(self.error("Expected hex digits after '0x'"));
            }
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("Hex literal out of range"))?;
            text.push_str(&digits);
            return Ok(self.make_token(TokenKind::Int(value), &text));
        }

        while self.peek_char().is_ascii_digit() {
            text.push(self.advance());
        }

        let mut is_float = false;
        if self.peek_char() == '.' && self.peek_next().is_ascii_digit() {
            is_float = true;
            text.push(self.advance());
            while self.peek_char().is_ascii_digit() {
                text.push(self.advance());
            }
        }
        if matches!(self.peek_char(), 'e' | 'E') {
            let after = self.peek_next();
            let has_sign = matches!(after, '+' | '-');
            let exp_digit = if has_sign {
                self.peek_at(2)
            } else {
                after
            };
            if exp_digit.is_ascii_digit() {
                is_float = true;
                text.push(self.advance());
                if has_sign {
                    text.push(self.advance());
                }
                while self.peek_char().is_ascii_digit() {
                    text.push(self.advance());
                }
            }
        }

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error("Malformed float literal"))?;
            Ok(self.make_token(TokenKind::Float(value), &text))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error("Integer literal out of range"))?;
            Ok(self.make_token(TokenKind::Int(value), &text))
        }
    }

    fn identifier(&mut self, first: char) -> Token {
        let mut text = String::new();
        text.push(first);
        while self.peek_char().is_ascii_alphanumeric() || self.peek_char() == '_' {
            text.push(self.advance());
        }
        self.make_token(TokenKind::Identifier(intern(&text)), &text)
    }

    // ==================== helpers ====================

    fn open_bracket(&mut self, op: Op, text: &str) -> Token {
        self.nesting += 1;
        self.op_token(op, text)
    }

    fn close_bracket(&mut self, op: Op, text: &str) -> Token {
        self.nesting = self.nesting.saturating_sub(1);
        self.op_token(op, text)
    }

    fn op_token(&self, op: Op, text: &str) -> Token {
        self.make_token(TokenKind::Op(op), text)
    }

    fn make_token(&self, kind: TokenKind, text: &str) -> Token {
        Token::new(kind, text, self.line)
    }

    fn begin_line(&mut self) {
        self.line += 1;
        self.line_start = self.cursor;
        self.at_line_start = true;
    }

    fn is_at_end(&self) -> bool {
        self.cursor >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.cursor];
        self.cursor += 1;
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek_char() == expected {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn peek_char(&self) -> char {
        self.source.get(self.cursor).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.peek_at(1)
    }

    fn peek_at(&self, offset: usize) -> char {
        self.source.get(self.cursor + offset).copied().unwrap_or('\0')
    }

    fn error(&self, message: impl Into<String>) -> BrioError {
        let column = self.cursor.saturating_sub(self.line_start);
        BrioError::lexer(message, Span::new(self.line, column), &self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, "<test>");
        let mut out = Vec::new();
        loop {
            let token = lexer.next().unwrap();
            let eof = token.is_eof();
            out.push(token.kind);
            if eof {
                break;
            }
        }
        out
    }

    #[test]
    fn test_simple_tokens() {
        let toks = kinds("x = 1 + 2.5\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Identifier(intern("x")),
                TokenKind::Op(Op::Equal),
                TokenKind::Int(1),
                TokenKind::Op(Op::Plus),
                TokenKind::Float(2.5),
                TokenKind::EndOfLine,
                TokenKind::EndOfText,
            ]
        );
    }

    #[test]
    fn test_indent_unindent() {
        let toks = kinds("if x\n  y = 1\nz = 2\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Identifier(intern("if")),
                TokenKind::Identifier(intern("x")),
                TokenKind::EndOfLine,
                TokenKind::Indent,
                TokenKind::Identifier(intern("y")),
                TokenKind::Op(Op::Equal),
                TokenKind::Int(1),
                TokenKind::EndOfLine,
                TokenKind::Unindent,
                TokenKind::Identifier(intern("z")),
                TokenKind::Op(Op::Equal),
                TokenKind::Int(2),
                TokenKind::EndOfLine,
                TokenKind::EndOfText,
            ]
        );
    }

    #[test]
    fn test_multi_level_dedent_emits_one_unindent_per_level() {
        let toks = kinds("a\n  b\n    c\nd\n");
        let unindent_run: Vec<&TokenKind> = toks
            .iter()
            .skip_while(|k| !matches!(k, TokenKind::Unindent))
            .take_while(|k| matches!(k, TokenKind::Unindent))
            .collect();
        assert_eq!(unindent_run.len(), 2);
        // Both levels close before the next statement token
        let after: Vec<&TokenKind> = toks
            .iter()
            .skip_while(|k| !matches!(k, TokenKind::Unindent))
            .collect();
        assert!(matches!(after[2], TokenKind::Identifier(n) if n.as_ref() == "d"));
    }

    #[test]
    fn test_end_of_input_closes_open_levels() {
        let toks = kinds("a\n  b\n    c");
        let tail = &toks[toks.len() - 3..];
        assert_eq!(
            tail,
            &[TokenKind::Unindent, TokenKind::Unindent, TokenKind::EndOfText]
        );
    }

    #[test]
    fn test_blank_lines_skipped_before_measuring() {
        let toks = kinds("a\n  b\n\n   \n  c\n");
        // Still exactly one Indent, no spurious level changes
        let indents = toks.iter().filter(|k| matches!(k, TokenKind::Indent)).count();
        let unindents = toks
            .iter()
            .filter(|k| matches!(k, TokenKind::Unindent))
            .count();
        assert_eq!(indents, 1);
        assert_eq!(unindents, 1);
    }

    #[test]
    fn test_parens_suppress_indentation_and_eol() {
        let toks = kinds("f(1,\n   2,\n   3)\n");
        assert!(!toks.iter().any(|k| matches!(k, TokenKind::Indent)));
        // Only the final newline surfaces
        let eols = toks
            .iter()
            .filter(|k| matches!(k, TokenKind::EndOfLine))
            .count();
        assert_eq!(eols, 1);
    }

    #[test]
    fn test_comment_surfaces_end_of_line() {
        let toks = kinds("x = 1 # trailing\ny = 2\n");
        let eols = toks
            .iter()
            .filter(|k| matches!(k, TokenKind::EndOfLine))
            .count();
        assert_eq!(eols, 2);
    }

    #[test]
    fn test_string_delimiters_and_raw() {
        let toks = kinds("\"a\\nb\" 'c' `d` r\"e\\f\"\n");
        assert_eq!(toks[0], TokenKind::Str("a\\nb".to_string()));
        assert_eq!(toks[1], TokenKind::Str("c".to_string()));
        assert_eq!(toks[2], TokenKind::Str("d".to_string()));
        assert_eq!(toks[3], TokenKind::RawStr("e\\f".to_string()));
    }

    #[test]
    fn test_unterminated_string_is_fatal() {
        let mut lexer = Lexer::new("\"oops\n", "<test>");
        let err = lexer.next().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Lexer);
    }

    #[test]
    fn test_hex_and_exponent_numbers() {
        let toks = kinds("0xff 1e3 2.5e-1 7\n");
        assert_eq!(toks[0], TokenKind::Int(255));
        assert_eq!(toks[1], TokenKind::Float(1000.0));
        assert_eq!(toks[2], TokenKind::Float(0.25));
        assert_eq!(toks[3], TokenKind::Int(7));
    }

    #[test]
    fn test_multi_char_operators() {
        let toks = kinds("== <= && || += << !=\n");
        assert_eq!(
            &toks[..7],
            &[
                TokenKind::Op(Op::EqualEqual),
                TokenKind::Op(Op::LessEqual),
                TokenKind::Op(Op::AndAnd),
                TokenKind::Op(Op::OrOr),
                TokenKind::Op(Op::PlusEqual),
                TokenKind::Op(Op::Shl),
                TokenKind::Op(Op::BangEqual),
            ]
        );
    }

    #[test]
    fn test_peek_is_single_lookahead() {
        let mut lexer = Lexer::new("a b\n", "<test>");
        assert!(lexer.peek().unwrap().is_word("a"));
        assert!(lexer.peek().unwrap().is_word("a"));
        assert!(lexer.next().unwrap().is_word("a"));
        assert!(lexer.next().unwrap().is_word("b"));
    }
}
