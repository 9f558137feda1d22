//! Structural invariants of the lexer → annotator → flux pipeline.

use ember::{annotate, flux, Arena, FluxContext, Lexer, Scratch, TokenKind};

fn annotated(source: &str) -> Vec<ember::Token> {
    let mut tokens = Lexer::new(source).tokenize();
    let scratch = Scratch::new();
    annotate(&mut tokens, &scratch).expect("annotation should succeed");
    tokens
}

const PROGRAMS: &[&str] = &[
    "(+ 1 2 3)",
    "(* 2 (+ 3 4))",
    "((lambda (x y) (+ x (* y y))) 3 4)",
    "(define rev (lambda (l acc) (if (null? l) acc (rev (cdr l) (cons (car l) acc)))))",
    "1 (a b (c (d))) 'x '(1 2) three",
    "((((deep))))",
];

#[test]
fn annotation_balances_every_program() {
    for src in PROGRAMS {
        let raw = Lexer::new(src).tokenize();
        let lefts = raw.iter().filter(|t| t.kind == TokenKind::LeftParen).count();
        let rights = raw
            .iter()
            .filter(|t| t.kind == TokenKind::RightParen)
            .count();
        assert_eq!(lefts, rights, "unbalanced fixture {:?}", src);

        let tokens = annotated(src);
        assert!(
            tokens
                .iter()
                .all(|t| !matches!(t.kind, TokenKind::LeftParen | TokenKind::RightParen)),
            "parens must be rewritten in {:?}",
            src
        );
    }
}

#[test]
fn ids_are_dense_with_no_gaps() {
    for src in PROGRAMS {
        let tokens = annotated(src);
        let max_id = tokens.iter().map(|t| t.sexpr_id).max().unwrap_or(0);
        let mut seen = vec![false; max_id + 1];
        for t in &tokens {
            seen[t.sexpr_id] = true;
        }
        for id in 1..=max_id {
            assert!(seen[id], "gap at id {} in {:?}", id, src);
        }
    }
}

#[test]
fn spans_nest_and_siblings_do_not_overlap() {
    for src in PROGRAMS {
        let tokens = annotated(src);
        let spans = Arena::new();
        let ids = Arena::new();
        let lists = Arena::new();
        let forms = Arena::new();
        let ctx = FluxContext {
            spans: &spans,
            ids: &ids,
            lists: &lists,
            forms: &forms,
        };
        let flux = flux::build(&tokens, ctx).expect("flux should build");

        for id in 1..=flux.max_id() {
            let parent = flux.span(id);
            let kids = flux.children(id);
            for &child in kids {
                let c = flux.span(child);
                assert!(
                    parent.start <= c.start && c.end <= parent.end,
                    "child {} escapes parent {} in {:?}",
                    child,
                    id,
                    src
                );
            }
            for pair in kids.windows(2) {
                let a = flux.span(pair[0]);
                let b = flux.span(pair[1]);
                assert!(
                    a.end < b.start,
                    "siblings {} and {} overlap in {:?}",
                    pair[0],
                    pair[1],
                    src
                );
            }
        }
    }
}

#[test]
fn spans_are_listed_children_before_parents() {
    let tokens = annotated("(a (b (c)) (d))");
    let spans = Arena::new();
    let ids = Arena::new();
    let lists = Arena::new();
    let forms = Arena::new();
    let ctx = FluxContext {
        spans: &spans,
        ids: &ids,
        lists: &lists,
        forms: &forms,
    };
    let flux = flux::build(&tokens, ctx).unwrap();
    let order: Vec<usize> = flux.spans().iter().map(|s| s.id).collect();
    for (pos, &id) in order.iter().enumerate() {
        for &child in flux.children(id) {
            let child_pos = order.iter().position(|&x| x == child).unwrap();
            assert!(
                child_pos < pos,
                "child {} must precede parent {}",
                child,
                id
            );
        }
    }
}

#[test]
fn quote_marks_never_open_spans() {
    let tokens = annotated("'(1 '2)");
    let max_id = tokens.iter().map(|t| t.sexpr_id).max().unwrap();
    assert_eq!(max_id, 1, "only the parenthesized list opens a span");

    // The marks belong to the surrounding form: the outer one to the top
    // level, the inner one to the list.
    let quote_ids: Vec<usize> = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Quote)
        .map(|t| t.sexpr_id)
        .collect();
    assert_eq!(quote_ids, vec![0, 1]);
}
