//! Error model for the whole pipeline.
//!
//! Every layer reports through `EmberError`; the driver renders a styled
//! diagnostic and exits non-zero. Variants mirror the interpreter's error
//! kinds: argument, type, unbound symbol, out-of-memory, evaluation,
//! syntax, const violation, and not-found. `Exit` is not an error kind; it
//! carries the `exit` primitive's status code up to the driver.

use crate::token::Span;

// The three ANSI fragments the diagnostic renderer uses: a bold red
// label, blue gutter, red underline. Every painted piece resets itself.
const RESET: &str = "\x1b[0m";
const BOLD_RED: &str = "\x1b[1;31m";
const RED: &str = "\x1b[31m";
const BLUE: &str = "\x1b[34m";

fn paint(color: &str, text: &str) -> String {
    format!("{}{}{}", color, text, RESET)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    EmptyInput,
    UnmatchedClose,
    UnclosedExpr,
    InvalidToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmberError {
    /// Null/invalid input to a core operation, including arity mistakes.
    Argument { message: String },
    /// Operand has the wrong value kind.
    Type { message: String, span: Option<Span> },
    /// Identifier not found in any scope.
    Unbound { name: String, span: Option<Span> },
    /// Arena or GC could not satisfy a request.
    OutOfMemory { message: String },
    /// Malformed expressions, division by zero, quote in atom position.
    Eval { message: String, span: Option<Span> },
    /// Unmatched parens, invalid tokens.
    Syntax { kind: SyntaxErrorKind, span: Span },
    /// Attempt to redefine or mutate a const binding.
    ConstViolation { name: String },
    /// Remove/set of a missing name.
    NotFound { name: String },
    /// Driver-level I/O failure (file could not be read).
    Io { message: String },
    /// The `exit` primitive; carries the requested process status.
    Exit { code: i32 },
}

impl EmberError {
    pub fn eval(message: impl Into<String>) -> Self {
        EmberError::Eval {
            message: message.into(),
            span: None,
        }
    }

    pub fn eval_at(message: impl Into<String>, span: Span) -> Self {
        EmberError::Eval {
            message: message.into(),
            span: Some(span),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        EmberError::Type {
            message: message.into(),
            span: None,
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        EmberError::Argument {
            message: message.into(),
        }
    }

    /// Stable numeric status for each kind, reported next to the message.
    pub fn code(&self) -> i32 {
        match self {
            EmberError::Argument { .. } => -1,
            EmberError::Type { .. } => -2,
            EmberError::Unbound { .. } => -3,
            EmberError::OutOfMemory { .. } => -4,
            EmberError::Eval { .. } => -5,
            EmberError::Syntax { .. } => -6,
            EmberError::ConstViolation { .. } => -7,
            EmberError::NotFound { .. } => -8,
            EmberError::Io { .. } => -9,
            EmberError::Exit { code } => *code,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            EmberError::Type { span, .. }
            | EmberError::Unbound { span, .. }
            | EmberError::Eval { span, .. } => *span,
            EmberError::Syntax { span, .. } => Some(*span),
            _ => None,
        }
    }

    /// Render the diagnostic with a line of source context and a caret
    /// underline.
    pub fn display_with_source(&self, source: &str) -> String {
        let header = format!("{}: {} (code {})", paint(BOLD_RED, "error"), self, self.code());
        let span = match self.span() {
            Some(span) if span.start < source.len() => span,
            _ => return header,
        };

        let (line_num, line_start, line_content) = find_context(source, span.start);
        let col = span.start.saturating_sub(line_start);
        let len = span.len().max(1).min(line_content.len().saturating_sub(col).max(1));
        let underline = format!("{}{}", " ".repeat(col), "^".repeat(len));

        let line_num_str = paint(BLUE, &format!("{:4}", line_num));
        let pipe = paint(BLUE, "|");

        format!(
            "{}\n\n{} {} {}\n     {} {}",
            header,
            line_num_str,
            pipe,
            line_content,
            pipe,
            paint(RED, &underline)
        )
    }
}

fn find_context(source: &str, at: usize) -> (usize, usize, &str) {
    let mut line_num = 1;
    let mut line_start = 0;

    for (i, c) in source.char_indices() {
        if i >= at {
            break;
        }
        if c == '\n' {
            line_num += 1;
            line_start = i + 1;
        }
    }

    let line_end = source[line_start..]
        .find('\n')
        .map(|off| line_start + off)
        .unwrap_or(source.len());

    (line_num, line_start, &source[line_start..line_end])
}

impl std::fmt::Display for EmberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmberError::Argument { message } => write!(f, "invalid argument: {}", message),
            EmberError::Type { message, .. } => write!(f, "type mismatch: {}", message),
            EmberError::Unbound { name, .. } => write!(f, "unbound symbol `{}`", name),
            EmberError::OutOfMemory { message } => write!(f, "out of memory: {}", message),
            EmberError::Eval { message, .. } => write!(f, "evaluation failed: {}", message),
            EmberError::Syntax { kind, .. } => match kind {
                SyntaxErrorKind::EmptyInput => write!(f, "empty input"),
                SyntaxErrorKind::UnmatchedClose => write!(f, "unmatched closing parenthesis"),
                SyntaxErrorKind::UnclosedExpr => write!(f, "unclosed expression at end of input"),
                SyntaxErrorKind::InvalidToken => write!(f, "invalid token"),
            },
            EmberError::ConstViolation { name } => {
                write!(f, "cannot modify const binding `{}`", name)
            }
            EmberError::NotFound { name } => write!(f, "no binding named `{}`", name),
            EmberError::Io { message } => write!(f, "{}", message),
            EmberError::Exit { code } => write!(f, "exit with status {}", code),
        }
    }
}

impl std::error::Error for EmberError {}
