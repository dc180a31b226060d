// Brio Error Handling Module
// Error categories, source positions, and terminal rendering

use colored::*;
use std::fmt;

/// A position in the source code. Column 0 means "unknown column".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    pub fn line(line: usize) -> Self {
        Self { line, column: 0 }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self { line: 0, column: 0 }
    }
}

/// Error categories in Brio.
///
/// Every failure in the pipeline belongs to exactly one category; once an
/// error is raised, compilation or execution of the current program stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unterminated string, unknown character, indentation too deep
    Lexer,
    /// Unexpected token, bad assignment target, encoding limits exceeded
    Syntax,
    /// Undefined name, missing or forward-declared superclass
    Resolve,
    /// Wrong operand or argument type at runtime
    Type,
    /// No method found on the receiver's class chain
    Dispatch,
    /// Stack overflow, dead upvalue capture, corrupt bytecode
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Lexer => write!(f, "LexError"),
            ErrorKind::Syntax => write!(f, "SyntaxError"),
            ErrorKind::Resolve => write!(f, "ResolveError"),
            ErrorKind::Type => write!(f, "TypeError"),
            ErrorKind::Dispatch => write!(f, "DispatchError"),
            ErrorKind::Internal => write!(f, "InternalError"),
        }
    }
}

/// A frame in a runtime error trace
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub method_name: String,
    pub file: String,
    pub line: usize,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {} ({}:{})", self.method_name, self.file, self.line)
    }
}

/// Main error type for Brio
#[derive(Debug, Clone)]
pub struct BrioError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub file: String,
    pub help: Option<String>,
    pub trace: Vec<TraceFrame>,
    source_lines: Vec<String>,
}

impl BrioError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        span: Span,
        file: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            file: file.into(),
            help: None,
            trace: Vec::new(),
            source_lines: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        if self.source_lines.is_empty() {
            self.source_lines = source.lines().map(String::from).collect();
        }
        self
    }

    pub fn push_frame(&mut self, frame: TraceFrame) {
        self.trace.push(frame);
    }

    /// Format the error for terminal display
    pub fn format(&self) -> String {
        let mut output = String::new();

        let header = format!(
            "{}: {} at {}:{}",
            self.kind.to_string().red().bold(),
            self.message.white().bold(),
            self.file,
            self.span.line,
        );
        output.push_str(&header);
        output.push('\n');

        // Source context: the error line with one line of context either side
        if !self.source_lines.is_empty() && self.span.line > 0 {
            let error_line = self.span.line;
            let start_line = if error_line > 1 { error_line - 1 } else { 1 };
            let end_line = (error_line + 1).min(self.source_lines.len());

            output.push('\n');
            for line_num in start_line..=end_line {
                if line_num > self.source_lines.len() {
                    continue;
                }
                let line_content = &self.source_lines[line_num - 1];
                let line_num_str = format!("{:>4} |", line_num);

                if line_num == error_line {
                    output.push_str(&format!("{} {}\n", line_num_str.red(), line_content));
                    if self.span.column > 0 {
                        let spaces = " ".repeat(6 + self.span.column);
                        output.push_str(&format!("{}{}\n", spaces, "^".red().bold()));
                    }
                } else {
                    output.push_str(&format!("{} {}\n", line_num_str.dimmed(), line_content));
                }
            }
        }

        if let Some(ref help) = self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }

        if !self.trace.is_empty() {
            output.push_str(&format!("\n{}:\n", "Trace".yellow().bold()));
            for frame in &self.trace {
                output.push_str(&format!("{}\n", frame));
            }
        }

        output
    }
}

impl fmt::Display for BrioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for BrioError {}

/// Result type for Brio operations
pub type BrioResult<T> = Result<T, BrioError>;

// Convenience constructors for common errors
impl BrioError {
    pub fn lexer(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lexer, message, span, file)
    }

    pub fn syntax(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message, span, file)
    }

    pub fn resolve(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolve, message, span, file)
    }

    pub fn type_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message, span, file)
    }

    pub fn dispatch(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dispatch, message, span, file)
    }

    pub fn internal(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message, span, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Dispatch.to_string(), "DispatchError");
        assert_eq!(ErrorKind::Lexer.to_string(), "LexError");
    }

    #[test]
    fn test_with_source_keeps_first_attachment() {
        let err = BrioError::syntax("bad", Span::line(1), "<t>")
            .with_source("line one")
            .with_source("other");
        assert_eq!(err.format().contains("line one"), true);
    }

    #[test]
    fn test_trace_frames_render() {
        let mut err = BrioError::dispatch("No method 'x'", Span::line(3), "m.bri");
        err.push_frame(TraceFrame {
            method_name: "f".to_string(),
            file: "m.bri".to_string(),
            line: 3,
        });
        let text = err.format();
        assert!(text.contains("at f (m.bri:3)"));
    }
}
