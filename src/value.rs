//! Runtime values.
//!
//! A `Value` is one machine word of tag plus payload. Numbers, booleans,
//! and interned symbols are immediate; strings, cons cells, and functions
//! live in the garbage-collected heap and are carried by reference. The
//! `Undefined` tag marks result-cache slots that have not been computed
//! yet and never escapes to the user.

use std::collections::HashSet;

use crate::heap::{GcRef, Heap};
use crate::intern::{Interner, Symbol};
use crate::scope::ScopeRef;

/// Index into the builtin registry.
pub type BuiltinId = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Internal "not yet computed" marker; never user-visible.
    Undefined,
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Sym(Symbol),
    Str(GcRef),
    Cons(GcRef),
    Func(GcRef),
    Builtin(BuiltinId),
    /// Reserved for asynchronous I/O; never constructed.
    Promise(GcRef),
}

/// One form of a lambda body, by position in the program flux. Atom forms
/// have no span of their own and are evaluated inline by the body
/// sentinel; quoted forms are reified instead of evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormRef {
    Atom(usize),
    Span(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyForm {
    pub form: FormRef,
    /// Quote marks preceding the form; a quoted form reifies instead of
    /// evaluating.
    pub quotes: usize,
}

/// A user function: positional parameters, body forms, and the scope that
/// was active at the lambda's definition site. Applying the function
/// chains a fresh scope under `env`, never under the caller's scope.
#[derive(Debug, Clone)]
pub struct Function {
    pub params: Vec<Symbol>,
    pub body: Vec<BodyForm>,
    pub env: ScopeRef,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Nil => "nil",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "boolean",
            Value::Sym(_) => "symbol",
            Value::Str(_) => "string",
            Value::Cons(_) => "pair",
            Value::Func(_) => "procedure",
            Value::Builtin(_) => "procedure",
            Value::Promise(_) => "promise",
        }
    }

    /// Everything is true except `#f` and the empty list.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// The heap reference inside this value, if it has one.
    pub fn gc_ref(&self) -> Option<GcRef> {
        match self {
            Value::Str(r) | Value::Cons(r) | Value::Func(r) | Value::Promise(r) => Some(*r),
            _ => None,
        }
    }

    /// The same value pointing at a relocated heap object.
    pub fn with_ref(&self, r: GcRef) -> Value {
        match self {
            Value::Str(_) => Value::Str(r),
            Value::Cons(_) => Value::Cons(r),
            Value::Func(_) => Value::Func(r),
            Value::Promise(_) => Value::Promise(r),
            other => *other,
        }
    }
}

/// Identity equality: `eq?`. Heap values compare by reference, immediates
/// by payload.
pub fn identical(a: Value, b: Value) -> bool {
    a == b
}

/// Structural equality: `equal?`. Walks pairs, compares string contents,
/// and tolerates cycles by treating an already-visited pair of nodes as
/// equal.
pub fn structural_eq(a: Value, b: Value, heap: &Heap) -> bool {
    let mut pending = vec![(a, b)];
    let mut visited: HashSet<(GcRef, GcRef)> = HashSet::new();
    while let Some((x, y)) = pending.pop() {
        match (x, y) {
            (Value::Str(rx), Value::Str(ry)) => {
                if rx == ry {
                    continue;
                }
                match (heap.string(rx), heap.string(ry)) {
                    (Some(sx), Some(sy)) if sx == sy => continue,
                    _ => return false,
                }
            }
            (Value::Cons(rx), Value::Cons(ry)) => {
                if rx == ry || !visited.insert((rx, ry)) {
                    continue;
                }
                match (heap.cons(rx), heap.cons(ry)) {
                    (Some((carx, cdrx)), Some((cary, cdry))) => {
                        pending.push((cdrx, cdry));
                        pending.push((carx, cary));
                    }
                    _ => return false,
                }
            }
            _ => {
                if !identical(x, y) {
                    return false;
                }
            }
        }
    }
    true
}

/// Render a value the way `display` prints it: string contents raw.
pub fn display_form(value: Value, heap: &Heap, interner: &Interner) -> String {
    let mut out = String::new();
    let mut in_progress = HashSet::new();
    write_value(value, heap, interner, &mut out, &mut in_progress, true);
    out
}

/// Render a value's external form: strings quoted, so the output reads
/// back as source.
pub fn external_form(value: Value, heap: &Heap, interner: &Interner) -> String {
    let mut out = String::new();
    let mut in_progress = HashSet::new();
    write_value(value, heap, interner, &mut out, &mut in_progress, false);
    out
}

fn write_value(
    value: Value,
    heap: &Heap,
    interner: &Interner,
    out: &mut String,
    in_progress: &mut HashSet<GcRef>,
    raw_strings: bool,
) {
    match value {
        Value::Undefined => out.push_str("#<undefined>"),
        Value::Nil => out.push_str("()"),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(f) => out.push_str(&format_float(f)),
        Value::Bool(true) => out.push_str("#t"),
        Value::Bool(false) => out.push_str("#f"),
        Value::Sym(s) => out.push_str(interner.resolve(s)),
        Value::Str(r) => match heap.string(r) {
            Some(s) if raw_strings => out.push_str(s),
            Some(s) => {
                out.push('"');
                out.push_str(s);
                out.push('"');
            }
            None => out.push_str("#<string>"),
        },
        Value::Cons(r) => write_list(r, heap, interner, out, in_progress, raw_strings),
        Value::Func(_) => out.push_str("#<procedure>"),
        Value::Builtin(_) => out.push_str("#<builtin>"),
        Value::Promise(_) => out.push_str("#<promise>"),
    }
}

/// Print a cons chain as a list, falling back to dotted-pair notation for
/// improper tails. Pairs revisited while still being printed are part of
/// a cycle and print as `...`.
fn write_list(
    head: GcRef,
    heap: &Heap,
    interner: &Interner,
    out: &mut String,
    in_progress: &mut HashSet<GcRef>,
    raw_strings: bool,
) {
    if !in_progress.insert(head) {
        out.push_str("...");
        return;
    }
    let mut cells = vec![head];
    out.push('(');
    let mut cursor = head;
    loop {
        let (car, cdr) = match heap.cons(cursor) {
            Some(pair) => pair,
            None => break,
        };
        write_value(car, heap, interner, out, in_progress, raw_strings);
        match cdr {
            Value::Nil => break,
            Value::Cons(next) => {
                if !in_progress.insert(next) {
                    out.push_str(" ...");
                    break;
                }
                cells.push(next);
                out.push(' ');
                cursor = next;
            }
            other => {
                out.push_str(" . ");
                write_value(other, heap, interner, out, in_progress, raw_strings);
                break;
            }
        }
    }
    out.push(')');
    for cell in cells {
        in_progress.remove(&cell);
    }
}

/// Match the project's numeric display: six digits of precision with
/// trailing zeros trimmed.
fn format_float(f: f64) -> String {
    if !f.is_finite() {
        return f.to_string();
    }
    let formatted = format!("{:.6}", f);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, HeapConfig, ObjData};

    fn heap() -> Heap {
        Heap::new(HeapConfig::default())
    }

    #[test]
    fn truthiness_follows_booleans_and_nil() {
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Nil.is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Float(0.0).is_truthy());
    }

    #[test]
    fn immediates_format_directly() {
        let heap = heap();
        let interner = Interner::new();
        assert_eq!(external_form(Value::Int(-7), &heap, &interner), "-7");
        assert_eq!(external_form(Value::Bool(true), &heap, &interner), "#t");
        assert_eq!(external_form(Value::Nil, &heap, &interner), "()");
    }

    #[test]
    fn floats_trim_trailing_zeros() {
        let heap = heap();
        let interner = Interner::new();
        assert_eq!(external_form(Value::Float(2.5), &heap, &interner), "2.5");
        assert_eq!(external_form(Value::Float(4.0), &heap, &interner), "4");
        assert_eq!(
            external_form(Value::Float(0.125), &heap, &interner),
            "0.125"
        );
    }

    #[test]
    fn display_and_external_differ_on_strings() {
        let mut heap = heap();
        let interner = Interner::new();
        let r = heap.alloc_eden(ObjData::Str("hi".to_string())).unwrap();
        assert_eq!(display_form(Value::Str(r), &heap, &interner), "hi");
        assert_eq!(external_form(Value::Str(r), &heap, &interner), "\"hi\"");
    }

    #[test]
    fn proper_lists_print_with_spaces() {
        let mut heap = heap();
        let interner = Interner::new();
        let tail = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(2),
                cdr: Value::Nil,
            })
            .unwrap();
        let head = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(1),
                cdr: Value::Cons(tail),
            })
            .unwrap();
        assert_eq!(external_form(Value::Cons(head), &heap, &interner), "(1 2)");
    }

    #[test]
    fn improper_tails_print_dotted() {
        let mut heap = heap();
        let interner = Interner::new();
        let pair = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(1),
                cdr: Value::Int(2),
            })
            .unwrap();
        assert_eq!(
            external_form(Value::Cons(pair), &heap, &interner),
            "(1 . 2)"
        );
    }

    #[test]
    fn cyclic_lists_print_a_placeholder() {
        let mut heap = heap();
        let interner = Interner::new();
        let cell = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(1),
                cdr: Value::Nil,
            })
            .unwrap();
        heap.set_cdr(cell, Value::Cons(cell));
        let printed = external_form(Value::Cons(cell), &heap, &interner);
        assert!(printed.contains("..."), "{}", printed);
    }

    #[test]
    fn shared_but_acyclic_structure_prints_fully() {
        let mut heap = heap();
        let interner = Interner::new();
        let shared = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(9),
                cdr: Value::Nil,
            })
            .unwrap();
        let outer_tail = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Cons(shared),
                cdr: Value::Nil,
            })
            .unwrap();
        let outer = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Cons(shared),
                cdr: Value::Cons(outer_tail),
            })
            .unwrap();
        assert_eq!(
            external_form(Value::Cons(outer), &heap, &interner),
            "((9) (9))"
        );
    }

    #[test]
    fn structural_eq_compares_contents() {
        let mut heap = heap();
        let a = heap.alloc_eden(ObjData::Str("abc".to_string())).unwrap();
        let b = heap.alloc_eden(ObjData::Str("abc".to_string())).unwrap();
        assert!(!identical(Value::Str(a), Value::Str(b)));
        assert!(structural_eq(Value::Str(a), Value::Str(b), &heap));
    }

    #[test]
    fn structural_eq_walks_lists() {
        let mut heap = heap();
        let mk = |heap: &mut Heap, n: i64| {
            let tail = heap
                .alloc_eden(ObjData::Cons {
                    car: Value::Int(n),
                    cdr: Value::Nil,
                })
                .unwrap();
            heap.alloc_eden(ObjData::Cons {
                car: Value::Int(1),
                cdr: Value::Cons(tail),
            })
            .unwrap()
        };
        let a = mk(&mut heap, 2);
        let b = mk(&mut heap, 2);
        let c = mk(&mut heap, 3);
        assert!(structural_eq(Value::Cons(a), Value::Cons(b), &heap));
        assert!(!structural_eq(Value::Cons(a), Value::Cons(c), &heap));
    }

    #[test]
    fn structural_eq_terminates_on_cycles() {
        let mut heap = heap();
        let a = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(1),
                cdr: Value::Nil,
            })
            .unwrap();
        heap.set_cdr(a, Value::Cons(a));
        let b = heap
            .alloc_eden(ObjData::Cons {
                car: Value::Int(1),
                cdr: Value::Nil,
            })
            .unwrap();
        heap.set_cdr(b, Value::Cons(b));
        assert!(structural_eq(Value::Cons(a), Value::Cons(b), &heap));
    }
}
