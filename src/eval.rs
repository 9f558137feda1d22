//! The work-stack evaluator.
//!
//! One call evaluates one top-level form. Instead of recursing through the
//! host stack, the VM keeps an explicit stack of frames and advances one
//! step at a time: an `Eval` frame reduces a single span, suspending
//! whenever it finds a child span whose result-cache slot is still
//! undefined; a `Body` frame is the lambda-body sentinel that drives a
//! function's body forms in sequence and routes the last value to the
//! call site. Results live in a per-form cache indexed by span id, so a
//! frame that is re-entered after its children finish finds their values
//! waiting.
//!
//! Heap discipline: any value held in a Rust local across an allocation
//! must sit in the temp-root stack, because an allocation can trigger a
//! collection that moves objects. The helpers here (`alloc_cons`,
//! `push_args`, `reify_element`) follow that protocol internally.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::annotate::annotate;
use crate::arena::{Arena, Scratch};
use crate::builtins::{self, Invocation};
use crate::error::EmberError;
use crate::flux::{self, Element, FluxContext, ProgramFlux, TopForm};
use crate::heap::{GcRef, Heap, HeapConfig, HeapStats, ObjData};
use crate::intern::Interner;
use crate::lexer::Lexer;
use crate::scope::{self, BindingFlags, Scope, ScopeRef};
use crate::token::{Span, Token, TokenKind};
use crate::value::{self, BodyForm, FormRef, Function, Value};

/// Numeric literals longer than these fall back to symbols.
const MAX_INTEGER_LITERAL: usize = 31;
const MAX_FLOAT_LITERAL: usize = 63;

#[derive(Clone, Copy)]
enum BodyDest {
    /// Publish the last body value to this span's cache slot.
    Cache(usize),
    /// Publish to the nested-call result slot (apply/eval re-entry).
    Nested,
}

#[derive(Clone)]
enum Frame {
    Eval {
        span_id: usize,
        env: ScopeRef,
        /// Branch index an `if` committed to, so unwinding recursion never
        /// re-evaluates the condition.
        picked: Option<usize>,
    },
    Body {
        func: GcRef,
        index: usize,
        /// Span whose cached value becomes `last` when this frame resumes.
        pending: Option<usize>,
        last: Value,
        env: ScopeRef,
        dest: BodyDest,
    },
}

/// One logical element of a call: the element itself plus the number of
/// quote marks that preceded it.
#[derive(Clone, Copy)]
struct Item {
    el: Element,
    quotes: usize,
}

impl Item {
    fn quoted(&self) -> bool {
        self.quotes > 0
    }
}

pub struct Vm<'p> {
    source: &'p str,
    flux: &'p ProgramFlux<'p>,
    pub heap: Heap,
    pub interner: Interner,
    globals: ScopeRef,
    /// Every scope ever created, weakly; live ones contribute their
    /// bindings to the GC root set.
    scope_registry: Vec<Weak<RefCell<Scope>>>,
    /// Result cache, one slot per span id.
    cache: Vec<Value>,
    stack: Vec<Frame>,
    /// Values builtins and helpers keep alive across allocations.
    temp_roots: Vec<Value>,
    /// Values of completed top-level forms; rooted so later forms cannot
    /// collect them.
    results: Vec<Value>,
    nested_result: Value,
    scratch: Scratch,
    /// Everything `display` and `newline` wrote.
    pub output: String,
}

impl<'p> Vm<'p> {
    pub fn new(
        source: &'p str,
        flux: &'p ProgramFlux<'p>,
        config: HeapConfig,
    ) -> Result<Vm<'p>, EmberError> {
        let globals = Scope::global();
        let mut vm = Vm {
            source,
            flux,
            heap: Heap::new(config),
            interner: Interner::new(),
            globals: globals.clone(),
            scope_registry: vec![Rc::downgrade(&globals)],
            cache: vec![Value::Undefined; flux.max_id() + 1],
            stack: Vec::new(),
            temp_roots: Vec::new(),
            results: Vec::new(),
            nested_result: Value::Nil,
            scratch: Scratch::new(),
            output: String::new(),
        };
        builtins::install(&mut vm)?;
        vm.install_constants()?;
        Ok(vm)
    }

    fn install_constants(&mut self) -> Result<(), EmberError> {
        let flags = BindingFlags::CONST | BindingFlags::GLOBAL;
        for (name, value) in [
            ("nil", Value::Nil),
            ("#t", Value::Bool(true)),
            ("#f", Value::Bool(false)),
        ] {
            let sym = self.interner.intern(name);
            self.globals
                .borrow_mut()
                .define(sym, value, flags, &self.interner)?;
        }
        Ok(())
    }

    pub fn globals(&self) -> &ScopeRef {
        &self.globals
    }

    pub fn results(&self) -> &[Value] {
        &self.results
    }

    /// Push a lexical frame and register it as a GC root source.
    pub fn new_scope(&mut self, parent: &ScopeRef) -> ScopeRef {
        let scope = Scope::child(parent);
        self.scope_registry.push(Rc::downgrade(&scope));
        scope
    }

    fn token(&self, idx: usize) -> &Token {
        &self.flux.tokens()[idx]
    }

    /// Byte span of a whole form, for diagnostics.
    fn span_of(&self, span_id: usize) -> Span {
        let span = self.flux.span(span_id);
        let tokens = self.flux.tokens();
        Span::new(tokens[span.start].span.start, tokens[span.end].span.end)
    }

    // ------------------------------------------------------------------
    // Allocation and collection
    // ------------------------------------------------------------------

    pub(crate) fn arg(&self, inv: &Invocation, i: usize) -> Value {
        self.temp_roots[inv.base + i]
    }

    pub(crate) fn temp_len(&self) -> usize {
        self.temp_roots.len()
    }

    pub(crate) fn push_temp(&mut self, v: Value) {
        self.temp_roots.push(v);
    }

    pub(crate) fn truncate_temp(&mut self, len: usize) {
        self.temp_roots.truncate(len);
    }

    /// Allocate a heap object, collecting if the nursery is full. The
    /// values inside `data` are temp-rooted across the collection and
    /// re-read afterwards, so callers can pass unrooted arguments.
    pub fn alloc_data(&mut self, mut data: ObjData) -> Result<GcRef, EmberError> {
        let size = Heap::object_size(&data);
        if !self.heap.eden_has_room(size) {
            let base = self.temp_roots.len();
            data.for_each_ref(|v| self.temp_roots.push(*v));
            self.reserve(size)?;
            let mut i = base;
            data.for_each_ref(|v| {
                *v = self.temp_roots[i];
                i += 1;
            });
            self.temp_roots.truncate(base);
        }
        if self.heap.eden_has_room(size) {
            self.heap.alloc_eden(data)
        } else {
            self.heap.alloc_old(data)
        }
    }

    /// Eden is full: minor collection, old-gen fallback, major
    /// collection, then out-of-memory. A minor collection can promote up
    /// to a full nursery into the old generation, so when the old
    /// generation cannot absorb that, it is compacted first.
    fn reserve(&mut self, size: usize) -> Result<(), EmberError> {
        if self.heap.old_free() < self.heap.nursery_bytes() {
            self.collect_major()?;
        }
        self.collect_minor()?;
        if self.heap.eden_has_room(size) || self.heap.old_has_room(size) {
            return Ok(());
        }
        self.collect_major()?;
        if self.heap.old_has_room(size) {
            return Ok(());
        }
        Err(EmberError::OutOfMemory {
            message: format!("cannot allocate {} bytes", size),
        })
    }

    pub fn alloc_cons(&mut self, car: Value, cdr: Value) -> Result<Value, EmberError> {
        Ok(Value::Cons(self.alloc_data(ObjData::Cons { car, cdr })?))
    }

    pub fn alloc_string(&mut self, s: String) -> Result<Value, EmberError> {
        Ok(Value::Str(self.alloc_data(ObjData::Str(s))?))
    }

    pub fn alloc_function(&mut self, f: Function) -> Result<Value, EmberError> {
        Ok(Value::Func(self.alloc_data(ObjData::Function(f))?))
    }

    pub fn collect_minor(&mut self) -> Result<(), EmberError> {
        let roots = self.gather_roots();
        self.heap.minor_collect(&roots)?;
        self.rewrite_roots();
        self.heap.finish_collect();
        Ok(())
    }

    pub fn collect_major(&mut self) -> Result<(), EmberError> {
        let roots = self.gather_roots();
        self.heap.major_collect(&roots)?;
        self.rewrite_roots();
        self.heap.finish_collect();
        Ok(())
    }

    /// Snapshot of every value the collector must preserve: the result
    /// cache, temp roots, finished results, frame state, and every
    /// heap-kind binding in every live scope.
    fn gather_roots(&mut self) -> Vec<Value> {
        let mut roots = Vec::new();
        let heap_values = |v: &Value| v.gc_ref().is_some();
        roots.extend(self.cache.iter().filter(|v| heap_values(v)).copied());
        roots.extend(self.temp_roots.iter().copied());
        roots.extend(self.results.iter().filter(|v| heap_values(v)).copied());
        if self.nested_result.gc_ref().is_some() {
            roots.push(self.nested_result);
        }
        for frame in &self.stack {
            if let Frame::Body { func, last, .. } = frame {
                roots.push(Value::Func(*func));
                if last.gc_ref().is_some() {
                    roots.push(*last);
                }
            }
        }
        self.scope_registry.retain(|w| w.strong_count() > 0);
        for weak in &self.scope_registry {
            if let Some(scope) = weak.upgrade() {
                for binding in scope.borrow().bindings.values() {
                    if binding.value.gc_ref().is_some() {
                        roots.push(binding.value);
                    }
                }
            }
        }
        roots
    }

    /// Second root pass: rewrite every root location through the
    /// collector's forwarding information.
    fn rewrite_roots(&mut self) {
        let heap = &self.heap;
        for v in self.cache.iter_mut() {
            *v = heap.relocate(*v);
        }
        for v in self.temp_roots.iter_mut() {
            *v = heap.relocate(*v);
        }
        for v in self.results.iter_mut() {
            *v = heap.relocate(*v);
        }
        self.nested_result = heap.relocate(self.nested_result);
        for frame in self.stack.iter_mut() {
            if let Frame::Body { func, last, .. } = frame {
                if let Value::Func(moved) = heap.relocate(Value::Func(*func)) {
                    *func = moved;
                }
                *last = heap.relocate(*last);
            }
        }
        for weak in &self.scope_registry {
            if let Some(scope) = weak.upgrade() {
                for binding in scope.borrow_mut().bindings.values_mut() {
                    binding.value = heap.relocate(binding.value);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Evaluate every top-level form in order. Values land in `results`;
    /// the first error aborts the program.
    pub fn eval_program(&mut self) -> Result<(), EmberError> {
        let top = self.flux.top_level();
        let mut i = 0;
        while i < top.len() {
            match top[i] {
                TopForm::Atom(idx) if self.token(idx).kind == TokenKind::Quote => {
                    let quote_span = self.token(idx).span;
                    let mut quotes = 0;
                    while let Some(TopForm::Atom(a)) = top.get(i) {
                        if self.token(*a).kind != TokenKind::Quote {
                            break;
                        }
                        quotes += 1;
                        i += 1;
                    }
                    let next = top.get(i).copied().ok_or_else(|| {
                        EmberError::eval_at("quote at end of input", quote_span)
                    })?;
                    self.begin_form();
                    let el = match next {
                        TopForm::Atom(a) => Element::Atom(a),
                        TopForm::Span(s) => Element::Span(s),
                    };
                    let v = self.reify_with_wraps(el, quotes - 1)?;
                    self.results.push(v);
                }
                TopForm::Atom(idx)
                    if matches!(
                        self.token(idx).kind,
                        TokenKind::Quasiquote | TokenKind::Unquote
                    ) =>
                {
                    return Err(EmberError::eval_at(
                        "quasiquote is not supported",
                        self.token(idx).span,
                    ));
                }
                TopForm::Atom(idx) => {
                    self.begin_form();
                    let env = self.globals.clone();
                    let v = self.eval_atom(idx, &env)?;
                    self.results.push(v);
                }
                TopForm::Span(id) => {
                    self.begin_form();
                    let env = self.globals.clone();
                    self.stack.push(Frame::Eval {
                        span_id: id,
                        env,
                        picked: None,
                    });
                    if let Err(e) = self.run_to_depth(0) {
                        self.stack.clear();
                        return Err(e);
                    }
                    let v = self.cache[id];
                    self.results.push(v);
                }
            }
            i += 1;
        }
        Ok(())
    }

    /// Fresh cache lifetime for one top-level form.
    fn begin_form(&mut self) {
        for v in self.cache.iter_mut() {
            *v = Value::Undefined;
        }
        self.temp_roots.clear();
        self.scratch.reset();
    }

    fn run_to_depth(&mut self, depth: usize) -> Result<(), EmberError> {
        while self.stack.len() > depth {
            self.step()?;
        }
        Ok(())
    }

    /// Advance the machine by one step.
    fn step(&mut self) -> Result<(), EmberError> {
        let frame = match self.stack.last() {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        match frame {
            Frame::Eval {
                span_id,
                env,
                picked,
            } => self.step_eval(span_id, env, picked),
            Frame::Body { .. } => self.step_body(),
        }
    }

    fn step_eval(
        &mut self,
        span_id: usize,
        env: ScopeRef,
        picked: Option<usize>,
    ) -> Result<(), EmberError> {
        if !matches!(self.cache[span_id], Value::Undefined) {
            self.stack.pop();
            return Ok(());
        }

        let elements = self.flux.elements(span_id);
        if elements.is_empty() {
            return Err(EmberError::eval_at(
                "cannot evaluate the empty form ()",
                self.span_of(span_id),
            ));
        }

        if let Element::Atom(head) = elements[0] {
            let tok = self.token(head);
            if tok.kind == TokenKind::Identifier {
                match tok.text(self.source) {
                    "quote" => return self.form_quote(span_id, &elements),
                    "lambda" => return self.form_lambda(span_id, &elements, &env),
                    "define" => return self.form_define(span_id, &elements, &env),
                    "set!" => return self.form_set(span_id, &elements, &env),
                    "if" => return self.form_if(span_id, &elements, &env, picked),
                    _ => {}
                }
            }
        }

        let items = self.items(&elements)?;

        // Fan out: the leftmost unevaluated child span suspends this frame.
        for item in &items {
            if item.quoted() {
                continue;
            }
            if let Element::Span(child) = item.el {
                if matches!(self.cache[child], Value::Undefined) {
                    self.stack.push(Frame::Eval {
                        span_id: child,
                        env,
                        picked: None,
                    });
                    return Ok(());
                }
            }
        }

        self.apply(span_id, &items, &env)
    }

    /// The lambda-body sentinel: run body forms in sequence, then route
    /// the last value to the call site and pop the function's scope.
    fn step_body(&mut self) -> Result<(), EmberError> {
        let at = self.stack.len() - 1;
        let (func, mut index, pending, mut last, env, dest) = match &self.stack[at] {
            Frame::Body {
                func,
                index,
                pending,
                last,
                env,
                dest,
            } => (*func, *index, *pending, *last, env.clone(), *dest),
            _ => return Ok(()),
        };

        if let Some(span_id) = pending {
            last = self.cache[span_id];
        }

        let body = match self.heap.function(func) {
            Some(f) => f.body.clone(),
            None => return Err(EmberError::eval("corrupt function object")),
        };

        if index >= body.len() {
            self.stack.pop();
            match dest {
                BodyDest::Cache(d) => self.cache[d] = last,
                BodyDest::Nested => self.nested_result = last,
            }
            return Ok(());
        }

        let form = body[index];
        index += 1;
        // Commit state before evaluating anything: the frame's `last` slot
        // is a GC root, Rust locals are not.
        self.stack[at] = Frame::Body {
            func,
            index,
            pending: None,
            last,
            env: env.clone(),
            dest,
        };

        if form.quotes > 0 {
            let el = match form.form {
                FormRef::Atom(t) => Element::Atom(t),
                FormRef::Span(s) => Element::Span(s),
            };
            let v = self.reify_with_wraps(el, form.quotes - 1)?;
            if let Frame::Body { last, .. } = &mut self.stack[at] {
                *last = v;
            }
            return Ok(());
        }

        match form.form {
            FormRef::Atom(t) => {
                let v = self.eval_atom(t, &env)?;
                if let Frame::Body { last, .. } = &mut self.stack[at] {
                    *last = v;
                }
            }
            FormRef::Span(s) => {
                // Each activation re-evaluates its body spans.
                self.reset_subtree(s);
                if let Frame::Body { pending, .. } = &mut self.stack[at] {
                    *pending = Some(s);
                }
                self.stack.push(Frame::Eval {
                    span_id: s,
                    env,
                    picked: None,
                });
            }
        }
        Ok(())
    }

    /// Clear the cache slots of a span and everything nested in it, so a
    /// new activation starts from undefined.
    fn reset_subtree(&mut self, id: usize) {
        let scratch = &self.scratch;
        let mut work = scratch.vec::<usize>();
        work.push(id);
        while let Some(cur) = work.pop() {
            self.cache[cur] = Value::Undefined;
            for &child in self.flux.children(cur) {
                work.push(child);
            }
        }
    }

    /// Collapse quote marks: a run of marks binds to the element after it.
    fn items(&self, elements: &[Element]) -> Result<Vec<Item>, EmberError> {
        let mut out = Vec::with_capacity(elements.len());
        let mut i = 0;
        while i < elements.len() {
            let mut quotes = 0;
            let mut last_mark = None;
            while let Some(&Element::Atom(idx)) = elements.get(i) {
                let tok = self.token(idx);
                match tok.kind {
                    TokenKind::Quote => {
                        quotes += 1;
                        last_mark = Some(tok.span);
                        i += 1;
                    }
                    TokenKind::Quasiquote | TokenKind::Unquote => {
                        return Err(EmberError::eval_at(
                            "quasiquote is not supported",
                            tok.span,
                        ));
                    }
                    _ => break,
                }
            }
            match elements.get(i) {
                Some(&el) => {
                    out.push(Item { el, quotes });
                    i += 1;
                }
                None => {
                    return Err(EmberError::eval_at(
                        "quote without a following expression",
                        last_mark.unwrap_or_default(),
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Reify an element, wrapping it in `wraps` layers of `(quote _)`.
    /// One quote mark yields the bare datum; each additional mark adds a
    /// wrap.
    fn reify_with_wraps(&mut self, el: Element, wraps: usize) -> Result<Value, EmberError> {
        let mut v = self.reify_element(el)?;
        for _ in 0..wraps {
            let tail = self.alloc_cons(v, Value::Nil)?;
            let quote_sym = Value::Sym(self.interner.intern("quote"));
            v = self.alloc_cons(quote_sym, tail)?;
        }
        Ok(v)
    }

    /// The value of one already-materialized item: quoted items reify,
    /// atoms evaluate inline, child spans read their cache slot.
    fn item_value(&mut self, item: Item, env: &ScopeRef) -> Result<Value, EmberError> {
        if item.quoted() {
            return self.reify_with_wraps(item.el, item.quotes - 1);
        }
        match item.el {
            Element::Atom(idx) => self.eval_atom(idx, env),
            Element::Span(id) => Ok(self.cache[id]),
        }
    }

    /// Gather argument values onto the temp-root stack.
    fn push_args(&mut self, items: &[Item], env: &ScopeRef) -> Result<usize, EmberError> {
        for item in items {
            let v = self.item_value(*item, env)?;
            self.temp_roots.push(v);
        }
        Ok(items.len())
    }

    // ------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------

    fn apply(&mut self, span_id: usize, items: &[Item], env: &ScopeRef) -> Result<(), EmberError> {
        let base = self.temp_roots.len();
        let result = self.apply_inner(span_id, items, env, base);
        self.temp_roots.truncate(base);
        result
    }

    fn apply_inner(
        &mut self,
        span_id: usize,
        items: &[Item],
        env: &ScopeRef,
        base: usize,
    ) -> Result<(), EmberError> {
        let head = self.item_value(items[0], env)?;
        self.temp_roots.push(head);
        let argc = self.push_args(&items[1..], env)?;
        // Argument gathering can collect; re-read the rooted head.
        let head = self.temp_roots[base];

        match head {
            Value::Builtin(id) => {
                let inv = Invocation {
                    span: Some(span_id),
                    base: base + 1,
                    argc,
                };
                let v = (builtins::TABLE[id].run)(self, env, &inv)?;
                self.cache[span_id] = v;
                self.stack.pop();
                Ok(())
            }
            Value::Func(fref) => {
                let func = self
                    .heap
                    .function(fref)
                    .cloned()
                    .ok_or_else(|| EmberError::eval("corrupt function object"))?;
                if func.params.len() != argc {
                    return Err(EmberError::eval_at(
                        format!(
                            "procedure expected {} arguments, got {}",
                            func.params.len(),
                            argc
                        ),
                        self.span_of(span_id),
                    ));
                }
                // The closure contract: the new frame chains under the
                // function's captured environment, not the caller's.
                let call_env = self.new_scope(&func.env);
                for (i, &param) in func.params.iter().enumerate() {
                    let value = self.temp_roots[base + 1 + i];
                    call_env.borrow_mut().define(
                        param,
                        value,
                        BindingFlags::MUTABLE | BindingFlags::TEMPORARY,
                        &self.interner,
                    )?;
                }
                let at = self.stack.len() - 1;
                self.stack[at] = Frame::Body {
                    func: fref,
                    index: 0,
                    pending: None,
                    last: Value::Nil,
                    env: call_env,
                    dest: BodyDest::Cache(span_id),
                };
                Ok(())
            }
            other => Err(EmberError::Type {
                message: format!(
                    "{} is not callable; the head of a call must be a procedure",
                    other.type_name()
                ),
                span: Some(self.span_of(span_id)),
            }),
        }
    }

    /// Apply a function from primitive context (`apply`, `eval`): bind the
    /// already-gathered arguments and run a nested driver loop until the
    /// sentinel publishes to the nested-result slot.
    pub(crate) fn call_function_nested(
        &mut self,
        fref: GcRef,
        base: usize,
        argc: usize,
    ) -> Result<Value, EmberError> {
        let func = self
            .heap
            .function(fref)
            .cloned()
            .ok_or_else(|| EmberError::eval("corrupt function object"))?;
        if func.params.len() != argc {
            return Err(EmberError::eval(format!(
                "procedure expected {} arguments, got {}",
                func.params.len(),
                argc
            )));
        }
        let call_env = self.new_scope(&func.env);
        for (i, &param) in func.params.iter().enumerate() {
            let value = self.temp_roots[base + i];
            call_env.borrow_mut().define(
                param,
                value,
                BindingFlags::MUTABLE | BindingFlags::TEMPORARY,
                &self.interner,
            )?;
        }
        let depth = self.stack.len();
        self.stack.push(Frame::Body {
            func: fref,
            index: 0,
            pending: None,
            last: Value::Nil,
            env: call_env,
            dest: BodyDest::Nested,
        });
        while self.stack.len() > depth {
            if let Err(e) = self.step() {
                self.stack.truncate(depth);
                return Err(e);
            }
        }
        Ok(self.nested_result)
    }

    /// Evaluate reified data: atoms are self-evaluating, symbols look up,
    /// proper lists apply. `(quote x)` data returns `x` unevaluated.
    pub(crate) fn eval_datum(&mut self, value: Value, env: &ScopeRef) -> Result<Value, EmberError> {
        match value {
            Value::Sym(s) => scope::lookup(env, s).ok_or_else(|| EmberError::Unbound {
                name: self.interner.resolve(s).to_string(),
                span: None,
            }),
            Value::Cons(head) => {
                let base = self.temp_roots.len();
                let mut cursor = Value::Cons(head);
                loop {
                    match cursor {
                        Value::Cons(c) => {
                            let (car, cdr) = self
                                .heap
                                .cons(c)
                                .ok_or_else(|| EmberError::eval("dangling pair"))?;
                            self.temp_roots.push(car);
                            cursor = cdr;
                        }
                        Value::Nil => break,
                        _ => {
                            self.temp_roots.truncate(base);
                            return Err(EmberError::eval("cannot evaluate an improper list"));
                        }
                    }
                }
                let count = self.temp_roots.len() - base;
                let result = self.eval_datum_call(base, count, env);
                self.temp_roots.truncate(base);
                result
            }
            Value::Undefined => Err(EmberError::eval("cannot evaluate an undefined value")),
            other => Ok(other),
        }
    }

    fn eval_datum_call(
        &mut self,
        base: usize,
        count: usize,
        env: &ScopeRef,
    ) -> Result<Value, EmberError> {
        if count == 0 {
            return Err(EmberError::eval("cannot evaluate the empty form ()"));
        }
        if let Value::Sym(s) = self.temp_roots[base] {
            if self.interner.resolve(s) == "quote" {
                return if count == 2 {
                    Ok(self.temp_roots[base + 1])
                } else {
                    Err(EmberError::eval("quote takes exactly one expression"))
                };
            }
        }
        let head = self.eval_datum(self.temp_roots[base], env)?;
        self.temp_roots[base] = head;
        for i in 1..count {
            let arg = self.eval_datum(self.temp_roots[base + i], env)?;
            self.temp_roots[base + i] = arg;
        }
        match self.temp_roots[base] {
            Value::Builtin(id) => {
                let inv = Invocation {
                    span: None,
                    base: base + 1,
                    argc: count - 1,
                };
                (builtins::TABLE[id].run)(self, env, &inv)
            }
            Value::Func(fref) => self.call_function_nested(fref, base + 1, count - 1),
            other => Err(EmberError::Type {
                message: format!("{} is not callable", other.type_name()),
                span: None,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Special forms
    // ------------------------------------------------------------------

    fn form_quote(&mut self, span_id: usize, elements: &[Element]) -> Result<(), EmberError> {
        let items = self.items(elements)?;
        if items.len() != 2 {
            return Err(EmberError::eval_at(
                "quote takes exactly one expression",
                self.span_of(span_id),
            ));
        }
        // `(quote 'x)` is one more level of quoting on top of the form's
        // own, so the item's marks all become wraps.
        let v = self.reify_with_wraps(items[1].el, items[1].quotes)?;
        self.cache[span_id] = v;
        self.stack.pop();
        Ok(())
    }

    fn form_lambda(
        &mut self,
        span_id: usize,
        elements: &[Element],
        env: &ScopeRef,
    ) -> Result<(), EmberError> {
        if elements.len() < 3 {
            return Err(EmberError::eval_at(
                "lambda takes a parameter list and at least one body form",
                self.span_of(span_id),
            ));
        }
        let params_id = match elements[1] {
            Element::Span(id) => id,
            Element::Atom(idx) => {
                return Err(EmberError::eval_at(
                    "lambda parameter list must be parenthesized",
                    self.token(idx).span,
                ));
            }
        };
        let mut params = Vec::new();
        for el in self.flux.elements(params_id) {
            match el {
                Element::Atom(idx) if self.token(idx).kind == TokenKind::Identifier => {
                    let text = self.token(idx).text(self.source);
                    params.push(self.interner.intern(text));
                }
                _ => {
                    return Err(EmberError::eval_at(
                        "lambda parameters must be identifiers",
                        self.span_of(params_id),
                    ));
                }
            }
        }
        let body = self.body_forms(&elements[2..])?;
        let v = self.alloc_function(Function {
            params,
            body,
            env: env.clone(),
        })?;
        self.cache[span_id] = v;
        self.stack.pop();
        Ok(())
    }

    fn body_forms(&self, elements: &[Element]) -> Result<Vec<BodyForm>, EmberError> {
        let items = self.items(elements)?;
        Ok(items
            .into_iter()
            .map(|item| BodyForm {
                form: match item.el {
                    Element::Atom(i) => FormRef::Atom(i),
                    Element::Span(s) => FormRef::Span(s),
                },
                quotes: item.quotes,
            })
            .collect())
    }

    fn form_define(
        &mut self,
        span_id: usize,
        elements: &[Element],
        env: &ScopeRef,
    ) -> Result<(), EmberError> {
        let items = self.items(elements)?;
        if items.len() != 3 {
            return Err(EmberError::eval_at(
                "define takes a name and a value",
                self.span_of(span_id),
            ));
        }
        let name_idx = match items[1] {
            Item {
                el: Element::Atom(i),
                quotes: 0,
            } if self.token(i).kind == TokenKind::Identifier => i,
            _ => {
                return Err(EmberError::eval_at(
                    "define name must be an identifier",
                    self.span_of(span_id),
                ));
            }
        };
        let value = match self.settled_value(items[2], env)? {
            Some(v) => v,
            None => return Ok(()), // suspended on the value span
        };
        let text = self.token(name_idx).text(self.source);
        let name = self.interner.intern(text);
        let mut flags = BindingFlags::CONST;
        if Rc::ptr_eq(env, &self.globals) {
            flags = flags | BindingFlags::GLOBAL;
        }
        env.borrow_mut().define(name, value, flags, &self.interner)?;
        self.cache[span_id] = value;
        self.stack.pop();
        Ok(())
    }

    fn form_set(
        &mut self,
        span_id: usize,
        elements: &[Element],
        env: &ScopeRef,
    ) -> Result<(), EmberError> {
        let items = self.items(elements)?;
        if items.len() != 3 {
            return Err(EmberError::eval_at(
                "set! takes a name and a value",
                self.span_of(span_id),
            ));
        }
        let name_idx = match items[1] {
            Item {
                el: Element::Atom(i),
                quotes: 0,
            } if self.token(i).kind == TokenKind::Identifier => i,
            _ => {
                return Err(EmberError::eval_at(
                    "set! target must be an identifier",
                    self.span_of(span_id),
                ));
            }
        };
        let value = match self.settled_value(items[2], env)? {
            Some(v) => v,
            None => return Ok(()),
        };
        let text = self.token(name_idx).text(self.source);
        let name = self.interner.intern(text);
        match scope::set(env, name, value, &self.interner) {
            Err(EmberError::NotFound { name }) => {
                return Err(EmberError::Unbound {
                    name,
                    span: Some(self.token(name_idx).span),
                });
            }
            other => other?,
        }
        self.cache[span_id] = value;
        self.stack.pop();
        Ok(())
    }

    fn form_if(
        &mut self,
        span_id: usize,
        elements: &[Element],
        env: &ScopeRef,
        picked: Option<usize>,
    ) -> Result<(), EmberError> {
        let items = self.items(elements)?;
        if items.len() != 3 && items.len() != 4 {
            return Err(EmberError::eval_at(
                "if takes a condition, a then-branch, and an optional else-branch",
                self.span_of(span_id),
            ));
        }
        let branch = match picked {
            Some(b) => b,
            None => {
                let cond = match self.settled_value(items[1], env)? {
                    Some(v) => v,
                    None => return Ok(()),
                };
                let b = if cond.is_truthy() { 2 } else { 3 };
                if let Some(Frame::Eval { picked, .. }) = self.stack.last_mut() {
                    *picked = Some(b);
                }
                b
            }
        };
        if branch >= items.len() {
            self.cache[span_id] = Value::Nil;
            self.stack.pop();
            return Ok(());
        }
        let value = match self.settled_value(items[branch], env)? {
            Some(v) => v,
            None => return Ok(()),
        };
        self.cache[span_id] = value;
        self.stack.pop();
        Ok(())
    }

    /// The value of an item if it is available now; schedules the item's
    /// span and returns `None` when the caller must suspend.
    fn settled_value(&mut self, item: Item, env: &ScopeRef) -> Result<Option<Value>, EmberError> {
        if item.quoted() {
            return Ok(Some(self.reify_with_wraps(item.el, item.quotes - 1)?));
        }
        match item.el {
            Element::Atom(idx) => Ok(Some(self.eval_atom(idx, env)?)),
            Element::Span(id) => {
                if matches!(self.cache[id], Value::Undefined) {
                    self.stack.push(Frame::Eval {
                        span_id: id,
                        env: env.clone(),
                        picked: None,
                    });
                    Ok(None)
                } else {
                    Ok(Some(self.cache[id]))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Atoms and quoted data
    // ------------------------------------------------------------------

    /// Evaluate a single atom token. Oversized or overflowing numeric
    /// literals fall back to the interned symbol of their raw text.
    pub fn eval_atom(&mut self, idx: usize, env: &ScopeRef) -> Result<Value, EmberError> {
        let tok = *self.token(idx);
        let source = self.source;
        let text = tok.text(source);
        match tok.kind {
            TokenKind::Integer => {
                if text.len() > MAX_INTEGER_LITERAL {
                    return Ok(Value::Sym(self.interner.intern(text)));
                }
                match text.parse::<i64>() {
                    Ok(n) => Ok(Value::Int(n)),
                    Err(_) => Ok(Value::Sym(self.interner.intern(text))),
                }
            }
            TokenKind::Float => {
                if text.len() > MAX_FLOAT_LITERAL {
                    return Ok(Value::Sym(self.interner.intern(text)));
                }
                match text.parse::<f64>() {
                    Ok(f) => Ok(Value::Float(f)),
                    Err(_) => Ok(Value::Sym(self.interner.intern(text))),
                }
            }
            TokenKind::Str => {
                let unescaped = unescape(&text[1..text.len() - 1]);
                self.alloc_string(unescaped)
            }
            TokenKind::Identifier => {
                let sym = self.interner.intern(text);
                match scope::lookup(env, sym) {
                    Some(v) => Ok(v),
                    None => Err(EmberError::Unbound {
                        name: text.to_string(),
                        span: Some(tok.span),
                    }),
                }
            }
            TokenKind::Uninterned => Ok(Value::Sym(self.interner.fresh(text))),
            TokenKind::Quote | TokenKind::Quasiquote | TokenKind::Unquote => Err(
                EmberError::eval_at("quote mark in atom position", tok.span),
            ),
            TokenKind::Error => Err(EmberError::eval_at(
                format!("invalid token `{}`", text),
                tok.span,
            )),
            TokenKind::Ignored | TokenKind::LeftParen | TokenKind::RightParen => Err(
                EmberError::eval_at("malformed expression", tok.span),
            ),
        }
    }

    /// Turn an unevaluated element into data: atoms become immediates or
    /// symbols, spans become cons lists, and a quote mark inside data
    /// becomes a `(quote x)` list.
    pub fn reify_element(&mut self, el: Element) -> Result<Value, EmberError> {
        match el {
            Element::Atom(idx) => {
                let tok = *self.token(idx);
                let source = self.source;
                let text = tok.text(source);
                match tok.kind {
                    TokenKind::Integer => {
                        if text.len() <= MAX_INTEGER_LITERAL {
                            if let Ok(n) = text.parse::<i64>() {
                                return Ok(Value::Int(n));
                            }
                        }
                        Ok(Value::Sym(self.interner.intern(text)))
                    }
                    TokenKind::Float => {
                        if text.len() <= MAX_FLOAT_LITERAL {
                            if let Ok(f) = text.parse::<f64>() {
                                return Ok(Value::Float(f));
                            }
                        }
                        Ok(Value::Sym(self.interner.intern(text)))
                    }
                    TokenKind::Str => {
                        let unescaped = unescape(&text[1..text.len() - 1]);
                        self.alloc_string(unescaped)
                    }
                    TokenKind::Identifier => Ok(Value::Sym(self.interner.intern(text))),
                    TokenKind::Uninterned => Ok(Value::Sym(self.interner.fresh(text))),
                    _ => Err(EmberError::eval_at(
                        "stray token in quoted data",
                        tok.span,
                    )),
                }
            }
            Element::Span(id) => {
                let elements = self.flux.elements(id);
                let base = self.temp_roots.len();
                let mut i = 0;
                while i < elements.len() {
                    // Inside data, each quote mark becomes one wrap of
                    // `(quote _)` around the following element.
                    let mut quotes = 0;
                    let mut last_mark = Span::default();
                    while let Some(&Element::Atom(idx)) = elements.get(i) {
                        if self.token(idx).kind != TokenKind::Quote {
                            break;
                        }
                        quotes += 1;
                        last_mark = self.token(idx).span;
                        i += 1;
                    }
                    let el = match elements.get(i) {
                        Some(&el) => el,
                        None => {
                            return Err(EmberError::eval_at(
                                "quote without a following expression",
                                last_mark,
                            ));
                        }
                    };
                    let v = self.reify_with_wraps(el, quotes)?;
                    self.temp_roots.push(v);
                    i += 1;
                }
                // Fold into a proper list right-to-left; the partial list
                // stays rooted by writing it back into the slot it consumed.
                let mut acc = Value::Nil;
                let mut j = self.temp_roots.len();
                while j > base {
                    j -= 1;
                    let item = self.temp_roots[j];
                    acc = self.alloc_cons(item, acc)?;
                    self.temp_roots[j] = acc;
                }
                self.temp_roots.truncate(base);
                Ok(acc)
            }
        }
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Outcome of running a program: the rendered value of every top-level
/// form, everything `display` wrote, heap statistics, an exit code if the
/// program called `exit`, and the first error if one occurred.
#[derive(Debug)]
pub struct Interpretation {
    pub values: Vec<String>,
    pub output: String,
    pub stats: HeapStats,
    pub exit: Option<i32>,
    pub error: Option<EmberError>,
}

/// Run a source program with the default heap configuration.
pub fn interpret(source: &str) -> Interpretation {
    interpret_with_config(source, HeapConfig::default())
}

/// Run a source program. Never panics; failures are reported in the
/// returned record next to whatever output was produced before them.
pub fn interpret_with_config(source: &str, config: HeapConfig) -> Interpretation {
    let mut tokens = Lexer::new(source).tokenize();
    if tokens.is_empty() {
        return Interpretation {
            values: Vec::new(),
            output: String::new(),
            stats: HeapStats::default(),
            exit: None,
            error: None,
        };
    }

    let scratch = Scratch::new();
    if let Err(e) = annotate(&mut tokens, &scratch) {
        return Interpretation {
            values: Vec::new(),
            output: String::new(),
            stats: HeapStats::default(),
            exit: None,
            error: Some(e),
        };
    }

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
    let flux = match flux::build(&tokens, ctx) {
        Ok(f) => f,
        Err(e) => {
            return Interpretation {
                values: Vec::new(),
                output: String::new(),
                stats: HeapStats::default(),
                exit: None,
                error: Some(e),
            };
        }
    };

    let mut vm = match Vm::new(source, &flux, config) {
        Ok(vm) => vm,
        Err(e) => {
            return Interpretation {
                values: Vec::new(),
                output: String::new(),
                stats: HeapStats::default(),
                exit: None,
                error: Some(e),
            };
        }
    };

    let run = vm.eval_program();
    let values = vm
        .results()
        .iter()
        .map(|&v| value::external_form(v, &vm.heap, &vm.interner))
        .collect();
    let output = std::mem::take(&mut vm.output);
    let stats = vm.heap.stats();
    let (exit, error) = match run {
        Ok(()) => (None, None),
        Err(EmberError::Exit { code }) => (Some(code), None),
        Err(e) => (None, Some(e)),
    };
    Interpretation {
        values,
        output,
        stats,
        exit,
        error,
    }
}
