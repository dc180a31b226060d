// Brio Parser
// Recursive descent over the streaming lexer; expressions use
// precedence-climbing tiers. Blocks are built lazily and function/class
// declarations register into their enclosing block's declaration table.

use crate::ast::*;
use crate::error::{BrioError, BrioResult, Span};
use crate::lexer::{Lexer, Op, Token, TokenKind};
use crate::vm::interner::intern;
use std::sync::Arc;

const MAX_CALL_ARGS: usize = 15;

pub struct Parser {
    lexer: Lexer,
    file: String,
}

impl Parser {
    pub fn new(source: &str, file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            lexer: Lexer::new(source, file.clone()),
            file,
        }
    }

    /// Parse a whole source file into a program.
    pub fn parse(&mut self) -> BrioResult<Program> {
        let (stmts, decls) = self.sequence(true)?;
        let token = self.lexer.next()?;
        if !token.is_eof() {
            return Err(self.error_at(&token, format!("Unexpected '{}'", token)));
        }
        Ok(Program::new(Block::new(stmts, decls)))
    }

    // ==================== Statements ====================

    /// Parse statements at one indentation level. Stops before an
    /// Unindent; when `top_level`, stops before EndOfText instead.
    fn sequence(&mut self, top_level: bool) -> BrioResult<(Vec<Stmt>, Vec<Decl>)> {
        let mut stmts = Vec::new();
        let mut decls = Vec::new();
        loop {
            self.skip_newlines()?;
            let token = self.lexer.peek()?;
            match &token.kind {
                TokenKind::EndOfText => {
                    if !top_level {
                        let token = token.clone();
                        return Err(self.error_at(&token, "Unexpected end of input in block"));
                    }
                    break;
                }
                TokenKind::Unindent => break,
                _ => {}
            }
            if self.lexer.peek()?.is_word("fn") {
                decls.push(Decl::Function(self.function_def()?));
            } else if self.lexer.peek()?.is_word("class") {
                decls.push(Decl::Class(self.class_def()?));
            } else {
                stmts.push(self.statement()?);
            }
        }
        Ok((stmts, decls))
    }

    fn statement(&mut self) -> BrioResult<Stmt> {
        let token = self.lexer.peek()?.clone();
        if token.is_word("if") {
            return self.if_statement();
        }
        if token.is_word("while") {
            return self.while_statement();
        }
        if token.is_word("for") {
            return self.for_statement();
        }
        if token.is_word("return") {
            self.lexer.next()?;
            let value = if self.at_statement_end()? {
                None
            } else {
                Some(self.expression()?)
            };
            self.end_statement()?;
            return Ok(Stmt::Return {
                value,
                line: token.line,
            });
        }
        if token.is_word("break") {
            self.lexer.next()?;
            self.end_statement()?;
            return Ok(Stmt::Break { line: token.line });
        }
        if token.is_word("continue") {
            self.lexer.next()?;
            self.end_statement()?;
            return Ok(Stmt::Continue { line: token.line });
        }
        if token.is_word("import") {
            self.lexer.next()?;
            let name = self.expect_identifier("Expected module name after 'import'")?;
            self.end_statement()?;
            return Ok(Stmt::Import {
                name,
                line: token.line,
            });
        }
        if token.is_word("export") {
            self.lexer.next()?;
            let name = self.expect_identifier("Expected name after 'export'")?;
            self.end_statement()?;
            return Ok(Stmt::Export {
                name,
                line: token.line,
            });
        }

        let expr = self.expression()?;
        self.end_statement()?;
        Ok(Stmt::Expr {
            expr,
            line: token.line,
        })
    }

    fn if_statement(&mut self) -> BrioResult<Stmt> {
        let line = self.lexer.next()?.line; // consume 'if'
        let cond = self.expression()?;
        self.expect_eol("Expected end of line after 'if' condition")?;
        let then_block = self.indented_block()?;

        let mut else_block = None;
        if self.lexer.peek()?.is_word("else") {
            self.lexer.next()?;
            if self.lexer.peek()?.is_word("if") {
                // else-if chain: wrap the nested if in a synthetic block
                let nested = self.if_statement()?;
                else_block = Some(Block::new(vec![nested], Vec::new()));
            } else {
                self.expect_eol("Expected end of line after 'else'")?;
                else_block = self.indented_block()?;
            }
        }

        Ok(Stmt::If {
            cond,
            then_block,
            else_block,
            line,
        })
    }

    fn while_statement(&mut self) -> BrioResult<Stmt> {
        let line = self.lexer.next()?.line; // consume 'while'
        let cond = self.expression()?;
        self.expect_eol("Expected end of line after 'while' condition")?;
        let body = self.indented_block()?;
        Ok(Stmt::While { cond, body, line })
    }

    fn for_statement(&mut self) -> BrioResult<Stmt> {
        let line = self.lexer.next()?.line; // consume 'for'
        let var = self.expect_identifier("Expected loop variable after 'for'")?;
        let keyword = self.lexer.next()?;
        if !keyword.is_word("in") {
            return Err(self.error_at(&keyword, "Expected 'in' after loop variable"));
        }
        let iterable = self.expression()?;
        self.expect_eol("Expected end of line after 'for' header")?;
        let body = self.indented_block()?;
        Ok(Stmt::For {
            var,
            var_slot: std::cell::Cell::new(0),
            iterable,
            body,
            line,
        })
    }

    fn function_def(&mut self) -> BrioResult<FunctionDef> {
        let line = self.lexer.next()?.line; // consume 'fn'
        let name = self.expect_identifier("Expected function name after 'fn'")?;
        let params = self.parameter_list()?;
        self.expect_eol("Expected end of line after function header")?;
        let body = self.indented_block()?;
        Ok(FunctionDef {
            name,
            params,
            body,
            line,
        })
    }

    fn parameter_list(&mut self) -> BrioResult<Vec<Arc<str>>> {
        self.expect_op(Op::LeftParen, "Expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check_op(Op::RightParen)? {
            loop {
                if params.len() >= MAX_CALL_ARGS {
                    let token = self.lexer.peek()?.clone();
                    return Err(self.error_at(
                        &token,
                        format!("Too many parameters (max {})", MAX_CALL_ARGS),
                    ));
                }
                params.push(self.expect_identifier("Expected parameter name")?);
                if !self.match_op(Op::Comma)? {
                    break;
                }
            }
        }
        self.expect_op(Op::RightParen, "Expected ')' after parameters")?;
        Ok(params)
    }

    fn class_def(&mut self) -> BrioResult<ClassDef> {
        let line = self.lexer.next()?.line; // consume 'class'
        let name = self.expect_identifier("Expected class name after 'class'")?;
        let superclass = if self.lexer.peek()?.is_word("extends") {
            self.lexer.next()?;
            Some(self.expect_identifier("Expected superclass name after 'extends'")?)
        } else {
            None
        };
        self.expect_eol("Expected end of line after class header")?;

        let mut ivars = Vec::new();
        let mut methods = Vec::new();
        if self.lexer.peek()?.kind == TokenKind::Indent {
            self.lexer.next()?;
            loop {
                self.skip_newlines()?;
                let token = self.lexer.peek()?.clone();
                if token.kind == TokenKind::Unindent {
                    self.lexer.next()?;
                    break;
                }
                if token.is_word("var") {
                    self.lexer.next()?;
                    ivars.push(self.expect_identifier("Expected instance variable name")?);
                    self.end_statement()?;
                } else if token.is_word("fn") {
                    methods.push(self.function_def()?);
                } else {
                    return Err(
                        self.error_at(&token, "Expected 'var' or 'fn' in class body")
                    );
                }
            }
        }

        Ok(ClassDef {
            name,
            superclass,
            ivars,
            methods,
            line,
        })
    }

    /// Parse an optional indented block after a header line. Yields None
    /// when no indented statements follow.
    fn indented_block(&mut self) -> BrioResult<Option<Block>> {
        if self.lexer.peek()?.kind != TokenKind::Indent {
            return Ok(None);
        }
        self.lexer.next()?;
        let (stmts, decls) = self.sequence(false)?;
        let token = self.lexer.next()?;
        if token.kind != TokenKind::Unindent {
            return Err(self.error_at(&token, "Expected end of indented block"));
        }
        if stmts.is_empty() && decls.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Block::new(stmts, decls)))
        }
    }

    // ==================== Expressions ====================

    fn expression(&mut self) -> BrioResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> BrioResult<Expr> {
        let expr = self.or_expr()?;

        let token = self.lexer.peek()?.clone();
        if let TokenKind::Op(op) = token.kind {
            if op == Op::Equal {
                self.lexer.next()?;
                if !expr.is_assignable() {
                    return Err(self.error_at(&token, "Invalid assignment target"));
                }
                let value = self.assignment()?;
                return Ok(Expr::Assign {
                    target: Box::new(expr),
                    value: Box::new(value),
                    line: token.line,
                });
            }
            if op.is_compound_assign() {
                return Err(self
                    .error_at(&token, format!("Compound assignment '{}' is not supported", op))
                    .with_help(format!("write 'x = x {} …' instead", &op.to_string()[..1])));
            }
        }

        Ok(expr)
    }

    fn or_expr(&mut self) -> BrioResult<Expr> {
        let mut expr = self.and_expr()?;
        while self.match_op(Op::OrOr)? {
            let line = expr.line();
            let right = self.and_expr()?;
            expr = Expr::ShortCircuit {
                op: ShortCircuitOp::Or,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn and_expr(&mut self) -> BrioResult<Expr> {
        let mut expr = self.bitor_expr()?;
        while self.match_op(Op::AndAnd)? {
            let line = expr.line();
            let right = self.bitor_expr()?;
            expr = Expr::ShortCircuit {
                op: ShortCircuitOp::And,
                left: Box::new(expr),
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn bitor_expr(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::Pipe], Self::bitxor_expr)
    }

    fn bitxor_expr(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::Caret], Self::bitand_expr)
    }

    fn bitand_expr(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::Amp], Self::equality)
    }

    fn equality(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::EqualEqual, Op::BangEqual], Self::relational)
    }

    fn relational(&mut self) -> BrioResult<Expr> {
        self.binary_tier(
            &[Op::Less, Op::LessEqual, Op::Greater, Op::GreaterEqual],
            Self::shift,
        )
    }

    fn shift(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::Shl, Op::Shr], Self::additive)
    }

    fn additive(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::Plus, Op::Minus], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> BrioResult<Expr> {
        self.binary_tier(&[Op::Star, Op::Slash, Op::Percent], Self::unary)
    }

    fn binary_tier(
        &mut self,
        ops: &[Op],
        next: fn(&mut Self) -> BrioResult<Expr>,
    ) -> BrioResult<Expr> {
        let mut expr = next(self)?;
        loop {
            let matched = match &self.lexer.peek()?.kind {
                TokenKind::Op(op) if ops.contains(op) => Some(*op),
                _ => None,
            };
            let Some(op) = matched else { break };
            let token = self.lexer.next()?;
            let bin_op = BinaryOp::from_op(op).expect("binary tier op");
            let right = next(self)?;
            expr = Expr::Binary {
                op: bin_op,
                left: Box::new(expr),
                right: Box::new(right),
                line: token.line,
            };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> BrioResult<Expr> {
        let token = self.lexer.peek()?.clone();
        let op = match token.kind {
            TokenKind::Op(Op::Minus) => Some(UnaryOp::Negate),
            TokenKind::Op(Op::Bang) => Some(UnaryOp::Not),
            TokenKind::Op(Op::Tilde) => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.lexer.next()?;
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                line: token.line,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> BrioResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            let token = self.lexer.peek()?.clone();
            match token.kind {
                TokenKind::Op(Op::LeftParen) => {
                    self.lexer.next()?;
                    let args = self.argument_list()?;
                    expr = Expr::FunctionCall {
                        callee: Box::new(expr),
                        args,
                        line: token.line,
                    };
                }
                TokenKind::Op(Op::Dot) => {
                    self.lexer.next()?;
                    let name = self.expect_identifier("Expected method name after '.'")?;
                    let args = if self.match_op(Op::LeftParen)? {
                        self.argument_list()?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Call {
                        receiver: Box::new(expr),
                        name,
                        args,
                        line: token.line,
                    };
                }
                TokenKind::Op(Op::LeftBracket) => {
                    self.lexer.next()?;
                    let index = self.expression()?;
                    self.expect_op(Op::RightBracket, "Expected ']' after index")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        line: token.line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Arguments after a consumed '('.
    fn argument_list(&mut self) -> BrioResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check_op(Op::RightParen)? {
            loop {
                if args.len() >= MAX_CALL_ARGS {
                    let token = self.lexer.peek()?.clone();
                    return Err(self.error_at(
                        &token,
                        format!("Too many call arguments (max {})", MAX_CALL_ARGS),
                    ));
                }
                args.push(self.expression()?);
                if !self.match_op(Op::Comma)? {
                    break;
                }
            }
        }
        self.expect_op(Op::RightParen, "Expected ')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> BrioResult<Expr> {
        let token = self.lexer.next()?;
        let line = token.line;
        match token.kind {
            TokenKind::Int(value) => Ok(Expr::Int { value, line }),
            TokenKind::Float(value) => Ok(Expr::Float { value, line }),
            TokenKind::RawStr(text) => Ok(Expr::Str {
                value: intern(&text),
                line,
            }),
            TokenKind::Str(text) => {
                // Double-quoted strings interpolate; all quoted (non-raw)
                // strings get escape processing here, not in the lexer
                if token.lexeme.starts_with('"') {
                    self.interpolated_string(&text, line)
                } else {
                    let unescaped = self.unescape(&text, line)?;
                    Ok(Expr::Str {
                        value: intern(&unescaped),
                        line,
                    })
                }
            }
            TokenKind::Identifier(name) => match name.as_ref() {
                "true" => Ok(Expr::Bool { value: true, line }),
                "false" => Ok(Expr::Bool { value: false, line }),
                "nil" => Ok(Expr::Nil { line }),
                "self" => Ok(Expr::SelfExpr { line }),
                "super" => {
                    self.expect_op(Op::Dot, "Expected '.' after 'super'")?;
                    let method = self.expect_identifier("Expected method name after 'super.'")?;
                    let args = if self.match_op(Op::LeftParen)? {
                        self.argument_list()?
                    } else {
                        Vec::new()
                    };
                    Ok(Expr::SuperCall {
                        name: method,
                        args,
                        line,
                    })
                }
                _ => Ok(Expr::Identifier { name, line }),
            },
            TokenKind::Op(Op::LeftParen) => {
                let expr = self.expression()?;
                self.expect_op(Op::RightParen, "Expected ')' after expression")?;
                Ok(expr)
            }
            TokenKind::Op(Op::LeftBracket) => {
                let mut elements = Vec::new();
                if !self.check_op(Op::RightBracket)? {
                    loop {
                        elements.push(self.expression()?);
                        if !self.match_op(Op::Comma)? {
                            break;
                        }
                        // Allow a trailing comma before the close
                        if self.check_op(Op::RightBracket)? {
                            break;
                        }
                    }
                }
                self.expect_op(Op::RightBracket, "Expected ']' after list elements")?;
                Ok(Expr::List { elements, line })
            }
            TokenKind::Op(Op::LeftBrace) => {
                let mut entries = Vec::new();
                if !self.check_op(Op::RightBrace)? {
                    loop {
                        let key = self.map_key()?;
                        self.expect_op(Op::Colon, "Expected ':' after map key")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if !self.match_op(Op::Comma)? {
                            break;
                        }
                        if self.check_op(Op::RightBrace)? {
                            break;
                        }
                    }
                }
                self.expect_op(Op::RightBrace, "Expected '}' after map entries")?;
                Ok(Expr::MapLit { entries, line })
            }
            kind => Err(BrioError::syntax(
                format!("Unexpected '{}'", kind),
                Span::line(line),
                &self.file,
            )),
        }
    }

    fn map_key(&mut self) -> BrioResult<Arc<str>> {
        let token = self.lexer.next()?;
        match token.kind {
            TokenKind::Identifier(name) => Ok(name),
            TokenKind::Str(text) => {
                let unescaped = self.unescape(&text, token.line)?;
                Ok(intern(&unescaped))
            }
            TokenKind::RawStr(text) => Ok(intern(&text)),
            _ => Err(self.error_at(&token, "Expected map key")),
        }
    }

    // ==================== String processing ====================

    fn unescape(&self, text: &str, line: usize) -> BrioResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some('`') => out.push('`'),
                Some('{') => out.push('{'),
                Some('}') => out.push('}'),
                Some(other) => {
                    return Err(BrioError::syntax(
                        format!("Invalid escape sequence '\\{}'", other),
                        Span::line(line),
                        &self.file,
                    ));
                }
                None => {
                    return Err(BrioError::syntax(
                        "Dangling '\\' in string literal",
                        Span::line(line),
                        &self.file,
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Split a double-quoted string into text and `{expr}` segments; each
    /// expression segment is parsed by a nested parser.
    fn interpolated_string(&self, text: &str, line: usize) -> BrioResult<Expr> {
        let mut parts: Vec<InterpPart> = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '\\' {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                continue;
            }
            if c != '{' {
                current.push(c);
                continue;
            }

            // Expression segment: scan to the matching brace
            let mut depth = 1usize;
            let mut segment = String::new();
            for inner in chars.by_ref() {
                match inner {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                segment.push(inner);
            }
            if depth != 0 {
                return Err(BrioError::syntax(
                    "Unterminated '{' in interpolated string",
                    Span::line(line),
                    &self.file,
                ));
            }
            if !current.is_empty() {
                let unescaped = self.unescape(&current, line)?;
                parts.push(InterpPart::Text(intern(&unescaped)));
                current.clear();
            }
            parts.push(InterpPart::Expr(self.parse_embedded(&segment, line)?));
        }

        if parts.is_empty() {
            let unescaped = self.unescape(&current, line)?;
            return Ok(Expr::Str {
                value: intern(&unescaped),
                line,
            });
        }
        if !current.is_empty() {
            let unescaped = self.unescape(&current, line)?;
            parts.push(InterpPart::Text(intern(&unescaped)));
        }
        Ok(Expr::Interp { parts, line })
    }

    fn parse_embedded(&self, segment: &str, line: usize) -> BrioResult<Expr> {
        let mut parser = Parser::new(segment, self.file.clone());
        let expr = parser.expression().map_err(|mut err| {
            err.span = Span::line(line);
            err
        })?;
        let token = parser.lexer.peek()?.clone();
        if !matches!(token.kind, TokenKind::EndOfText | TokenKind::EndOfLine) {
            return Err(BrioError::syntax(
                "Unexpected text after interpolated expression",
                Span::line(line),
                &self.file,
            ));
        }
        Ok(expr)
    }

    // ==================== Token helpers ====================

    fn skip_newlines(&mut self) -> BrioResult<()> {
        while self.lexer.peek()?.kind == TokenKind::EndOfLine {
            self.lexer.next()?;
        }
        Ok(())
    }

    fn at_statement_end(&mut self) -> BrioResult<bool> {
        Ok(matches!(
            self.lexer.peek()?.kind,
            TokenKind::EndOfLine | TokenKind::Unindent | TokenKind::EndOfText
        ))
    }

    /// Consume the end of a statement: an EndOfLine, or the edge of the
    /// enclosing block (Unindent / EndOfText, left in place).
    fn end_statement(&mut self) -> BrioResult<()> {
        let token = self.lexer.peek()?.clone();
        match token.kind {
            TokenKind::EndOfLine => {
                self.lexer.next()?;
                Ok(())
            }
            TokenKind::Unindent | TokenKind::EndOfText => Ok(()),
            _ => Err(self.error_at(&token, format!("Unexpected '{}' after statement", token))),
        }
    }

    fn expect_eol(&mut self, message: &str) -> BrioResult<()> {
        let token = self.lexer.peek()?.clone();
        match token.kind {
            TokenKind::EndOfLine => {
                self.lexer.next()?;
                Ok(())
            }
            // A header at the very end of input has no newline to consume
            TokenKind::Unindent | TokenKind::EndOfText => Ok(()),
            _ => Err(self.error_at(&token, message)),
        }
    }

    fn expect_identifier(&mut self, message: &str) -> BrioResult<Arc<str>> {
        let token = self.lexer.next()?;
        match token.kind {
            TokenKind::Identifier(name) => Ok(name),
            _ => Err(self.error_at(&token, message)),
        }
    }

    fn expect_op(&mut self, op: Op, message: &str) -> BrioResult<()> {
        let token = self.lexer.next()?;
        if token.is_op(op) {
            Ok(())
        } else {
            Err(self.error_at(&token, message))
        }
    }

    fn check_op(&mut self, op: Op) -> BrioResult<bool> {
        Ok(self.lexer.peek()?.is_op(op))
    }

    fn match_op(&mut self, op: Op) -> BrioResult<bool> {
        if self.check_op(op)? {
            self.lexer.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> BrioError {
        BrioError::syntax(message, Span::line(token.line), &self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::new(source, "<test>").parse().unwrap()
    }

    fn parse_err(source: &str) -> BrioError {
        Parser::new(source, "<test>").parse().unwrap_err()
    }

    #[test]
    fn test_expression_statement() {
        let program = parse("1 + 2 * 3\n");
        assert_eq!(program.body.stmts.len(), 1);
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!("expected expression statement");
        };
        // Multiplication binds tighter than addition
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_if_else_chain() {
        let program = parse("if a\n  b = 1\nelse if c\n  b = 2\nelse\n  b = 3\n");
        let Stmt::If {
            then_block,
            else_block,
            ..
        } = &program.body.stmts[0]
        else {
            panic!("expected if");
        };
        assert!(then_block.is_some());
        let else_block = else_block.as_ref().unwrap();
        assert!(matches!(else_block.stmts[0], Stmt::If { .. }));
    }

    #[test]
    fn test_else_without_then_body() {
        let program = parse("if a\nelse\n  b = 1\n");
        let Stmt::If {
            then_block,
            else_block,
            ..
        } = &program.body.stmts[0]
        else {
            panic!("expected if");
        };
        assert!(then_block.is_none());
        assert!(else_block.is_some());
    }

    #[test]
    fn test_function_registers_into_block() {
        let program = parse("fn add(a, b)\n  return a + b\nx = 1\n");
        assert_eq!(program.body.decls.len(), 1);
        assert_eq!(program.body.stmts.len(), 1);
        let Decl::Function(def) = &program.body.decls[0] else {
            panic!("expected function decl");
        };
        assert_eq!(def.name.as_ref(), "add");
        assert_eq!(def.params.len(), 2);
        assert!(def.body.is_some());
    }

    #[test]
    fn test_class_def() {
        let program = parse(
            "class Point extends Base\n  var x\n  var y\n  fn init(x, y)\n    self.x = x\n",
        );
        let Decl::Class(def) = &program.body.decls[0] else {
            panic!("expected class decl");
        };
        assert_eq!(def.name.as_ref(), "Point");
        assert_eq!(def.superclass.as_deref(), Some("Base"));
        assert_eq!(def.ivars.len(), 2);
        assert_eq!(def.methods.len(), 1);
    }

    #[test]
    fn test_compound_assignment_rejected() {
        let err = parse_err("x += 1\n");
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
        assert!(err.message.contains("Compound assignment"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_err("1 + 2 = 3\n");
        assert!(err.message.contains("Invalid assignment target"));
    }

    #[test]
    fn test_too_many_call_arguments() {
        let args: Vec<String> = (0..16).map(|i| i.to_string()).collect();
        let source = format!("f({})\n", args.join(", "));
        let err = parse_err(&source);
        assert!(err.message.contains("Too many call arguments"));
    }

    #[test]
    fn test_dotted_access_is_zero_arg_call() {
        let program = parse("a.size\n");
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!();
        };
        let Expr::Call { name, args, .. } = expr else {
            panic!("expected call");
        };
        assert_eq!(name.as_ref(), "size");
        assert!(args.is_empty());
    }

    #[test]
    fn test_interpolated_string() {
        let program = parse("\"a {x + 1} b\"\n");
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!();
        };
        let Expr::Interp { parts, .. } = expr else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], InterpPart::Text(t) if t.as_ref() == "a "));
        assert!(matches!(&parts[1], InterpPart::Expr(Expr::Binary { .. })));
    }

    #[test]
    fn test_single_quote_string_is_plain() {
        let program = parse("'a {x} b'\n");
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!();
        };
        assert!(matches!(expr, Expr::Str { .. }));
    }

    #[test]
    fn test_list_and_map_literals() {
        let program = parse("[1, 2, 3]\n{a: 1, \"b\": 2}\n");
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!();
        };
        assert!(matches!(expr, Expr::List { elements, .. } if elements.len() == 3));
        let Stmt::Expr { expr, .. } = &program.body.stmts[1] else {
            panic!();
        };
        assert!(matches!(expr, Expr::MapLit { entries, .. } if entries.len() == 2));
    }

    #[test]
    fn test_index_expression() {
        let program = parse("a[0] = a[1]\n");
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!();
        };
        let Expr::Assign { target, value, .. } = expr else {
            panic!("expected assignment");
        };
        assert!(matches!(**target, Expr::Index { .. }));
        assert!(matches!(**value, Expr::Index { .. }));
    }

    #[test]
    fn test_super_call() {
        let program = parse("super.init(1)\n");
        let Stmt::Expr { expr, .. } = &program.body.stmts[0] else {
            panic!();
        };
        assert!(matches!(expr, Expr::SuperCall { args, .. } if args.len() == 1));
    }
}
