//! Tokenizer for Ember source text.
//!
//! Produces the flat token vector the annotator consumes. The lexer never
//! fails: bytes it cannot classify become `Error` tokens carrying their
//! span, and the annotator rejects them with a syntax error. Atom
//! classification is maximal-munch over the identifier character set, then
//! a numeric re-check, so `+`, `-`, `1+`, and `...` are identifiers while
//! `+5`, `-3.25`, and `1e6` are numbers.

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

/// Characters allowed in identifiers besides letters and digits.
fn is_id_symbol(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'@'
            | b'#'
            | b'$'
            | b'%'
            | b'^'
            | b'&'
            | b'*'
            | b'-'
            | b'+'
            | b'='
            | b'<'
            | b'>'
            | b'/'
            | b'?'
            | b':'
            | b'.'
            | b'_'
            | b'\\'
            | b'~'
    )
}

fn is_atom_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || is_id_symbol(b)
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token() {
            tokens.push(token);
        }
        tokens
    }

    fn next_token(&mut self) -> Option<Token> {
        self.skip_trivia();
        if self.pos >= self.bytes.len() {
            return None;
        }

        let start = self.pos;
        let b = self.bytes[self.pos];
        let token = match b {
            b'(' => self.punct(TokenKind::LeftParen),
            b')' => self.punct(TokenKind::RightParen),
            b'\'' => self.punct(TokenKind::Quote),
            b'`' => self.punct(TokenKind::Quasiquote),
            b',' => self.punct(TokenKind::Unquote),
            b'"' => self.string(),
            b'#' if self.peek(1) == Some(b':') => self.uninterned(),
            _ if is_atom_byte(b) => self.atom(),
            _ => {
                self.pos += 1;
                Token::new(TokenKind::Error, Span::new(start, self.pos))
            }
        };
        Some(token)
    }

    fn skip_trivia(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b';' => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn punct(&mut self, kind: TokenKind) -> Token {
        let start = self.pos;
        self.pos += 1;
        Token::new(kind, Span::new(start, self.pos))
    }

    /// A double-quoted string. The span includes the quotes; the evaluator
    /// strips them and resolves escapes. Unterminated strings become error
    /// tokens spanning to end of input.
    fn string(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => {
                    self.pos += 2.min(self.bytes.len() - self.pos);
                }
                b'"' => {
                    self.pos += 1;
                    return Token::new(TokenKind::Str, Span::new(start, self.pos));
                }
                _ => self.pos += 1,
            }
        }
        Token::new(TokenKind::Error, Span::new(start, self.pos))
    }

    /// `#:` followed by identifier characters.
    fn uninterned(&mut self) -> Token {
        let start = self.pos;
        self.pos += 2;
        let name_start = self.pos;
        while self.pos < self.bytes.len() && is_atom_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        if self.pos == name_start {
            return Token::new(TokenKind::Error, Span::new(start, self.pos));
        }
        Token::new(TokenKind::Uninterned, Span::new(start, self.pos))
    }

    fn atom(&mut self) -> Token {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_atom_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        let kind = classify_atom(text);
        Token::new(kind, Span::new(start, self.pos))
    }
}

/// Decide whether an atom chunk is an integer, a float, or an identifier.
fn classify_atom(text: &str) -> TokenKind {
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    if unsigned.is_empty() {
        return TokenKind::Identifier;
    }
    if unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return TokenKind::Integer;
    }
    if is_float_body(unsigned) {
        return TokenKind::Float;
    }
    TokenKind::Identifier
}

/// `digit* ('.' digit+)? (('e'|'E') ('+'|'-')? digit+)?` with at least one
/// mantissa digit and at least one of dot/exponent present.
fn is_float_body(text: &str) -> bool {
    let (mantissa, exponent) = match text.find(['e', 'E']) {
        Some(i) => (&text[..i], Some(&text[i + 1..])),
        None => (text, None),
    };

    let mantissa_ok = match mantissa.find('.') {
        Some(i) => {
            let (int_part, frac_part) = (&mantissa[..i], &mantissa[i + 1..]);
            !frac_part.is_empty()
                && int_part.bytes().all(|b| b.is_ascii_digit())
                && frac_part.bytes().all(|b| b.is_ascii_digit())
        }
        None => !mantissa.is_empty() && mantissa.bytes().all(|b| b.is_ascii_digit()),
    };
    if !mantissa_ok {
        return false;
    }

    match exponent {
        Some(exp) => {
            let digits = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        }
        // No exponent: a float needs the dot to differ from an integer.
        None => mantissa.contains('.'),
    }
}
