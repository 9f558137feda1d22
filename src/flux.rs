//! Program flux: the indexed view over an annotated token stream.
//!
//! One span record per S-expression id, stored in descending id order so
//! children always precede their parents, plus per-span direct-child lists
//! and the ordered list of top-level forms. The flux borrows the token
//! vector and stores its records in caller-provided arenas, so the whole
//! view is freed in one shot when the arenas drop.

use crate::arena::Arena;
use crate::error::{EmberError, SyntaxErrorKind};
use crate::token::{Token, TokenKind};

/// A single S-expression: the closed token interval `[start, end]` whose
/// tokens carry `id` or some strictly greater id nested inside it. The
/// interval includes the form's (now ignored) parentheses, which is what
/// makes parent intervals contain child intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SexprSpan {
    pub id: usize,
    pub start: usize,
    pub end: usize,
}

/// One top-level form: a parenthesized span or a bare atom token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopForm {
    Span(usize),
    Atom(usize),
}

/// One element of a span, in token order: an inline atom token or a
/// directly nested child span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    Atom(usize),
    Span(usize),
}

/// Arenas backing one flux. Mirrors how parse products are arena-scoped
/// elsewhere in the pipeline: build the context, build the flux, and drop
/// everything together after evaluation.
#[derive(Clone, Copy)]
pub struct FluxContext<'a> {
    pub spans: &'a Arena<SexprSpan>,
    pub ids: &'a Arena<usize>,
    pub lists: &'a Arena<&'a [usize]>,
    pub forms: &'a Arena<TopForm>,
}

pub struct ProgramFlux<'a> {
    tokens: &'a [Token],
    /// Descending by id; `spans[max_id - id]` is the record for `id`.
    spans: &'a [SexprSpan],
    /// Direct children per id; index 0 holds the root spans.
    children: &'a [&'a [usize]],
    top: &'a [TopForm],
    max_id: usize,
}

/// Build the flux for an annotated token vector.
pub fn build<'a>(
    tokens: &'a [Token],
    ctx: FluxContext<'a>,
) -> Result<ProgramFlux<'a>, EmberError> {
    let max_id = tokens.iter().map(|t| t.sexpr_id).max().unwrap_or(0);

    // First and last token index per id, ignored parens included.
    let mut first: Vec<Option<usize>> = vec![None; max_id + 1];
    let mut last: Vec<usize> = vec![0; max_id + 1];
    for (idx, tok) in tokens.iter().enumerate() {
        let id = tok.sexpr_id;
        if first[id].is_none() {
            first[id] = Some(idx);
        }
        last[id] = idx;
    }

    let mut span_records = Vec::with_capacity(max_id);
    for id in (1..=max_id).rev() {
        let start = first[id].ok_or_else(|| EmberError::Syntax {
            kind: SyntaxErrorKind::InvalidToken,
            span: Default::default(),
        })?;
        span_records.push(SexprSpan {
            id,
            start,
            end: last[id],
        });
    }
    let spans = ctx.spans.alloc_slice(span_records);

    // Direct parent/child structure. Ids are assigned in opening order, so
    // walking ids ascending walks start indices ascending; a stack of still
    // open intervals yields each span's parent.
    let mut child_accum: Vec<Vec<usize>> = vec![Vec::new(); max_id + 1];
    let mut open: Vec<usize> = Vec::new();
    for id in 1..=max_id {
        let span = spans[max_id - id];
        while let Some(&top) = open.last() {
            if spans[max_id - top].end < span.start {
                open.pop();
            } else {
                break;
            }
        }
        let parent = open.last().copied().unwrap_or(0);
        child_accum[parent].push(id);
        open.push(id);
    }
    let child_slices: Vec<&[usize]> = child_accum
        .into_iter()
        .map(|ids| ctx.ids.alloc_slice(ids))
        .collect();
    let children = ctx.lists.alloc_slice(child_slices);

    // Top-level forms in token order: bare atoms interleaved with root
    // spans. A span's first token is its opening paren, so the id seen on
    // entry to an unvisited interval is the root span's own id.
    let mut top_forms = Vec::new();
    let mut idx = 0;
    while idx < tokens.len() {
        let tok = &tokens[idx];
        if tok.sexpr_id == 0 {
            top_forms.push(TopForm::Atom(idx));
            idx += 1;
        } else {
            let id = tok.sexpr_id;
            top_forms.push(TopForm::Span(id));
            idx = spans[max_id - id].end + 1;
        }
    }
    let top = ctx.forms.alloc_slice(top_forms);

    Ok(ProgramFlux {
        tokens,
        spans,
        children,
        top,
        max_id,
    })
}

impl<'a> ProgramFlux<'a> {
    pub fn tokens(&self) -> &'a [Token] {
        self.tokens
    }

    pub fn max_id(&self) -> usize {
        self.max_id
    }

    pub fn span(&self, id: usize) -> &SexprSpan {
        &self.spans[self.max_id - id]
    }

    /// Span records, children before parents.
    pub fn spans(&self) -> &'a [SexprSpan] {
        self.spans
    }

    /// Direct child ids of `id`, in token order. `children(0)` holds the
    /// root spans.
    pub fn children(&self, id: usize) -> &'a [usize] {
        self.children[id]
    }

    pub fn top_level(&self) -> &'a [TopForm] {
        self.top
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_empty()
    }

    /// The elements of span `id` in token order. Ignored tokens of the
    /// span itself are skipped; every directly nested child appears as one
    /// `Element::Span`.
    pub fn elements(&self, id: usize) -> Vec<Element> {
        let span = self.span(id);
        let mut out = Vec::new();
        let mut idx = span.start;
        while idx <= span.end {
            let tok = &self.tokens[idx];
            if tok.sexpr_id == id {
                if tok.kind != TokenKind::Ignored {
                    out.push(Element::Atom(idx));
                }
                idx += 1;
            } else {
                let child = tok.sexpr_id;
                out.push(Element::Span(child));
                idx = self.span(child).end + 1;
            }
        }
        out
    }

    /// Multi-line description of the span table, for `--dump-flux`.
    pub fn describe(&self, source: &str) -> String {
        let mut out = format!("flux: {} spans, max id {}\n", self.spans.len(), self.max_id);
        for span in self.spans.iter().rev() {
            let text: String = self.tokens[span.start..=span.end]
                .iter()
                .map(|t| t.text(source))
                .collect::<Vec<_>>()
                .join(" ");
            out.push_str(&format!(
                "  #{:<4} [{:>4}, {:>4}] {}\n",
                span.id, span.start, span.end, text
            ));
        }
        out
    }
}
