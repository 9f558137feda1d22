//! Token model shared by the lexer, the annotator, and the flux builder.
//!
//! Tokens carry a byte span into the source buffer rather than owning text;
//! the source must outlive the token vector. The `sexpr_id` field is zero
//! until the annotator assigns S-expression ids; after annotation,
//! parentheses are rewritten to `Ignored` but keep their id so span
//! intervals can be computed from them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    Integer,
    Float,
    Str,
    Identifier,
    Quote,
    Quasiquote,
    Unquote,
    Uninterned,
    /// Structural tokens the evaluator skips; annotated parens end up here.
    Ignored,
    /// Bytes the lexer could not classify.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// S-expression id; 0 means top level. Filled by the annotator.
    pub sexpr_id: usize,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Token {
            kind,
            span,
            sexpr_id: 0,
        }
    }

    /// The token's text, sliced out of the source it was lexed from.
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        &source[self.span.start..self.span.end]
    }
}
