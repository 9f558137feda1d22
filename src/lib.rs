//! Ember: a small Lisp interpreter.
//!
//! The pipeline runs in four stages: the lexer turns source bytes into a
//! flat token vector; the annotator assigns every token an S-expression
//! id and retires the parentheses; the flux builder derives an indexed
//! span table from those ids; and the evaluator reduces each top-level
//! form with an explicit work stack, allocating runtime values through a
//! two-generation copying collector.

pub mod annotate;
pub mod arena;
pub mod builtins;
pub mod cli;
pub mod error;
pub mod eval;
pub mod flux;
pub mod heap;
pub mod intern;
pub mod lexer;
pub mod scope;
pub mod token;
pub mod value;

pub use annotate::annotate;
pub use arena::{Arena, BumpVec, Scratch};
pub use error::{EmberError, SyntaxErrorKind};
pub use eval::{interpret, interpret_with_config, Interpretation, Vm};
pub use flux::{Element, FluxContext, ProgramFlux, SexprSpan, TopForm};
pub use heap::{GcRef, Generation, Heap, HeapConfig, HeapStats, ObjData, Space};
pub use intern::{Interner, Symbol};
pub use lexer::Lexer;
pub use scope::{Binding, BindingFlags, Scope, ScopeRef};
pub use token::{Span, Token, TokenKind};
pub use value::{display_form, external_form, structural_eq, Function, Value};
