//! S-expression annotation.
//!
//! A single pass over the lexer's token vector that gives every token a
//! stable S-expression id and rewrites parentheses to `Ignored`. Ids are
//! dense and monotone: id 0 is top level, and each opening paren takes the
//! next counter value, so inner forms always carry strictly greater ids
//! than the forms that contain them. The rewritten parens keep their id,
//! which is what lets the flux builder derive span intervals that contain
//! their children.

use crate::arena::Scratch;
use crate::error::{EmberError, SyntaxErrorKind};
use crate::token::{Token, TokenKind};

/// Annotate `tokens` in place. Returns the maximum id assigned.
///
/// The scratch arena backs the stack of currently open forms; it can be
/// reused across programs via `Scratch::reset`.
pub fn annotate(tokens: &mut [Token], scratch: &Scratch) -> Result<usize, EmberError> {
    if tokens.is_empty() {
        return Err(EmberError::Syntax {
            kind: SyntaxErrorKind::EmptyInput,
            span: Default::default(),
        });
    }

    // (id, index of the opening paren) for every form still open.
    let mut open = scratch.vec::<(usize, usize)>();
    let mut counter = 0usize;

    for idx in 0..tokens.len() {
        let kind = tokens[idx].kind;
        match kind {
            TokenKind::LeftParen => {
                counter += 1;
                tokens[idx].sexpr_id = counter;
                tokens[idx].kind = TokenKind::Ignored;
                open.push((counter, idx));
            }
            TokenKind::RightParen => match open.pop() {
                Some((id, _)) => {
                    tokens[idx].sexpr_id = id;
                    tokens[idx].kind = TokenKind::Ignored;
                }
                None => {
                    return Err(EmberError::Syntax {
                        kind: SyntaxErrorKind::UnmatchedClose,
                        span: tokens[idx].span,
                    });
                }
            },
            TokenKind::Error => {
                return Err(EmberError::Syntax {
                    kind: SyntaxErrorKind::InvalidToken,
                    span: tokens[idx].span,
                });
            }
            _ => {
                tokens[idx].sexpr_id = open.last().map(|&(id, _)| id).unwrap_or(0);
            }
        }
    }

    if let Some(&(_, open_idx)) = open.last() {
        return Err(EmberError::Syntax {
            kind: SyntaxErrorKind::UnclosedExpr,
            span: tokens[open_idx].span,
        });
    }

    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn annotated(source: &str) -> (Vec<Token>, usize) {
        let mut tokens = Lexer::new(source).tokenize();
        let scratch = Scratch::new();
        let max_id = annotate(&mut tokens, &scratch).expect("annotation should succeed");
        (tokens, max_id)
    }

    #[test]
    fn top_level_atoms_get_id_zero() {
        let (tokens, max_id) = annotated("1 2 3");
        assert_eq!(max_id, 0);
        assert!(tokens.iter().all(|t| t.sexpr_id == 0));
    }

    #[test]
    fn parens_are_rewritten_but_keep_their_id() {
        let (tokens, max_id) = annotated("(+ 1 2)");
        assert_eq!(max_id, 1);
        assert_eq!(tokens[0].kind, TokenKind::Ignored);
        assert_eq!(tokens[0].sexpr_id, 1);
        assert_eq!(tokens[4].kind, TokenKind::Ignored);
        assert_eq!(tokens[4].sexpr_id, 1);
    }

    #[test]
    fn nested_forms_get_greater_ids() {
        let (tokens, max_id) = annotated("(* 2 (+ 3 4))");
        assert_eq!(max_id, 2);
        // "*" and "2" belong to form 1; "+", "3", "4" to form 2.
        assert_eq!(tokens[1].sexpr_id, 1);
        assert_eq!(tokens[2].sexpr_id, 1);
        assert_eq!(tokens[4].sexpr_id, 2);
        assert_eq!(tokens[5].sexpr_id, 2);
        assert_eq!(tokens[6].sexpr_id, 2);
    }

    #[test]
    fn sibling_forms_number_in_opening_order() {
        let (tokens, max_id) = annotated("(a) (b) (c)");
        assert_eq!(max_id, 3);
        assert_eq!(tokens[1].sexpr_id, 1);
        assert_eq!(tokens[4].sexpr_id, 2);
        assert_eq!(tokens[7].sexpr_id, 3);
    }

    #[test]
    fn ids_are_dense() {
        let (tokens, max_id) = annotated("((a (b)) (c))");
        let mut seen = vec![false; max_id + 1];
        for t in &tokens {
            seen[t.sexpr_id] = true;
        }
        // Every id in 1..=max_id occurs at least once.
        assert!(seen[1..].iter().all(|&s| s), "ids should have no gaps");
    }

    #[test]
    fn balance_holds_after_annotation() {
        let source = "(define f (lambda (x) (+ x 1)))";
        let mut tokens = Lexer::new(source).tokenize();
        let lefts = tokens.iter().filter(|t| t.kind == TokenKind::LeftParen).count();
        let rights = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::RightParen)
            .count();
        assert_eq!(lefts, rights);
        let scratch = Scratch::new();
        annotate(&mut tokens, &scratch).unwrap();
        assert!(tokens
            .iter()
            .all(|t| !matches!(t.kind, TokenKind::LeftParen | TokenKind::RightParen)));
    }

    #[test]
    fn empty_input_is_rejected() {
        let mut tokens = Vec::new();
        let scratch = Scratch::new();
        let err = annotate(&mut tokens, &scratch).unwrap_err();
        assert!(matches!(
            err,
            EmberError::Syntax {
                kind: SyntaxErrorKind::EmptyInput,
                ..
            }
        ));
    }

    #[test]
    fn unmatched_close_is_rejected() {
        let mut tokens = Lexer::new("(a))").tokenize();
        let scratch = Scratch::new();
        let err = annotate(&mut tokens, &scratch).unwrap_err();
        assert!(matches!(
            err,
            EmberError::Syntax {
                kind: SyntaxErrorKind::UnmatchedClose,
                ..
            }
        ));
    }

    #[test]
    fn unclosed_expr_points_at_the_dangling_open() {
        let source = "(car (cdr x)";
        let mut tokens = Lexer::new(source).tokenize();
        let scratch = Scratch::new();
        let err = annotate(&mut tokens, &scratch).unwrap_err();
        match err {
            EmberError::Syntax {
                kind: SyntaxErrorKind::UnclosedExpr,
                span,
            } => assert_eq!(span.start, 0),
            other => panic!("expected unclosed-expr error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_tokens_are_rejected() {
        let mut tokens = Lexer::new("(car [x])").tokenize();
        let scratch = Scratch::new();
        let err = annotate(&mut tokens, &scratch).unwrap_err();
        assert!(matches!(
            err,
            EmberError::Syntax {
                kind: SyntaxErrorKind::InvalidToken,
                ..
            }
        ));
    }

    #[test]
    fn quote_marks_take_the_enclosing_id() {
        let (tokens, _) = annotated("(car '(1 2))");
        // the quote mark sits inside form 1
        let quote = tokens.iter().find(|t| t.kind == TokenKind::Quote).unwrap();
        assert_eq!(quote.sexpr_id, 1);
    }
}
