//! The primitive registry.
//!
//! A closed table of builtin procedures bound const into the global scope
//! at startup; spelling is exact and resolution happens through interned
//! symbols, so lookup never hashes name bytes twice. Every primitive has
//! the same shape: it reads its already-gathered arguments from the VM's
//! temp-root stack (where they stay visible to the collector), produces
//! one value, and completes in a single step.

use crate::error::EmberError;
use crate::scope::{BindingFlags, ScopeRef};
use crate::value::{self, Value};
use crate::eval::Vm;

/// A primitive call site: where the arguments sit on the temp-root stack,
/// and which span invoked it (absent for `apply`/`eval` re-entry).
pub struct Invocation {
    pub span: Option<usize>,
    pub base: usize,
    pub argc: usize,
}

pub type BuiltinFn = fn(&mut Vm, &ScopeRef, &Invocation) -> Result<Value, EmberError>;

pub struct Builtin {
    pub name: &'static str,
    pub run: BuiltinFn,
}

pub static TABLE: &[Builtin] = &[
    Builtin { name: "+", run: prim_add },
    Builtin { name: "-", run: prim_sub },
    Builtin { name: "*", run: prim_mul },
    Builtin { name: "/", run: prim_div },
    Builtin { name: "mod", run: prim_mod },
    Builtin { name: "=", run: prim_num_eq },
    Builtin { name: "<", run: prim_lt },
    Builtin { name: ">", run: prim_gt },
    Builtin { name: "<=", run: prim_le },
    Builtin { name: ">=", run: prim_ge },
    Builtin { name: "cons", run: prim_cons },
    Builtin { name: "car", run: prim_car },
    Builtin { name: "cdr", run: prim_cdr },
    Builtin { name: "list", run: prim_list },
    Builtin { name: "atom?", run: prim_is_atom },
    Builtin { name: "pair?", run: prim_is_pair },
    Builtin { name: "list?", run: prim_is_list },
    Builtin { name: "null?", run: prim_is_null },
    Builtin { name: "number?", run: prim_is_number },
    Builtin { name: "string?", run: prim_is_string },
    Builtin { name: "symbol?", run: prim_is_symbol },
    Builtin { name: "procedure?", run: prim_is_procedure },
    Builtin { name: "eq?", run: prim_eq },
    Builtin { name: "equal?", run: prim_equal },
    Builtin { name: "display", run: prim_display },
    Builtin { name: "newline", run: prim_newline },
    Builtin { name: "apply", run: prim_apply },
    Builtin { name: "eval", run: prim_eval },
    Builtin { name: "exit", run: prim_exit },
];

/// Bind the whole table into the global scope, const.
pub fn install(vm: &mut Vm) -> Result<(), EmberError> {
    let globals = vm.globals().clone();
    for (index, builtin) in TABLE.iter().enumerate() {
        let sym = vm.interner.intern(builtin.name);
        globals.borrow_mut().define(
            sym,
            Value::Builtin(index),
            BindingFlags::CONST | BindingFlags::GLOBAL,
            &vm.interner,
        )?;
    }
    Ok(())
}

fn expect_argc(name: &str, inv: &Invocation, argc: usize) -> Result<(), EmberError> {
    if inv.argc != argc {
        return Err(EmberError::argument(format!(
            "`{}` takes {} argument{}, got {}",
            name,
            argc,
            if argc == 1 { "" } else { "s" },
            inv.argc
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Numbers
// ----------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn number(name: &str, v: Value) -> Result<Num, EmberError> {
    match v {
        Value::Int(n) => Ok(Num::Int(n)),
        Value::Float(f) => Ok(Num::Float(f)),
        other => Err(EmberError::type_error(format!(
            "`{}` expects numbers, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn num_value(n: Num) -> Value {
    match n {
        Num::Int(i) => Value::Int(i),
        Num::Float(f) => Value::Float(f),
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

/// Integer arithmetic unless either side is a float.
fn num_binop(a: Num, b: Num, int_op: fn(i64, i64) -> i64, float_op: fn(f64, f64) -> f64) -> Num {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Num::Int(int_op(x, y)),
        _ => Num::Float(float_op(as_f64(a), as_f64(b))),
    }
}

fn prim_add(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    let mut acc = Num::Int(0);
    for i in 0..inv.argc {
        let n = number("+", vm.arg(inv, i))?;
        acc = num_binop(acc, n, i64::wrapping_add, |a, b| a + b);
    }
    Ok(num_value(acc))
}

fn prim_sub(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    if inv.argc == 0 {
        return Ok(Value::Int(0));
    }
    let first = number("-", vm.arg(inv, 0))?;
    if inv.argc == 1 {
        return Ok(num_value(num_binop(
            Num::Int(0),
            first,
            i64::wrapping_sub,
            |a, b| a - b,
        )));
    }
    let mut acc = first;
    for i in 1..inv.argc {
        let n = number("-", vm.arg(inv, i))?;
        acc = num_binop(acc, n, i64::wrapping_sub, |a, b| a - b);
    }
    Ok(num_value(acc))
}

fn prim_mul(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    let mut acc = Num::Int(1);
    for i in 0..inv.argc {
        let n = number("*", vm.arg(inv, i))?;
        acc = num_binop(acc, n, i64::wrapping_mul, |a, b| a * b);
    }
    Ok(num_value(acc))
}

/// Division always yields a float, preserving the mathematical quotient.
fn prim_div(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    if inv.argc == 0 {
        return Err(EmberError::argument("`/` takes at least one argument"));
    }
    let first = as_f64(number("/", vm.arg(inv, 0))?);
    if inv.argc == 1 {
        if first == 0.0 {
            return Err(EmberError::eval("division by zero"));
        }
        return Ok(Value::Float(1.0 / first));
    }
    let mut acc = first;
    for i in 1..inv.argc {
        let divisor = as_f64(number("/", vm.arg(inv, i))?);
        if divisor == 0.0 {
            return Err(EmberError::eval("division by zero"));
        }
        acc /= divisor;
    }
    Ok(Value::Float(acc))
}

fn prim_mod(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("mod", inv, 2)?;
    match (vm.arg(inv, 0), vm.arg(inv, 1)) {
        (Value::Int(_), Value::Int(0)) => Err(EmberError::eval("modulo by zero")),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(b))),
        (a, b) => Err(EmberError::type_error(format!(
            "`mod` expects integers, got {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn compare_chain(
    name: &str,
    vm: &mut Vm,
    inv: &Invocation,
    holds: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, EmberError> {
    for i in 1..inv.argc {
        let a = number(name, vm.arg(inv, i - 1))?;
        let b = number(name, vm.arg(inv, i))?;
        let ordering = match (a, b) {
            (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
            _ => as_f64(a).partial_cmp(&as_f64(b)),
        };
        match ordering {
            Some(o) if holds(o) => {}
            _ => return Ok(Value::Bool(false)),
        }
    }
    Ok(Value::Bool(true))
}

fn prim_num_eq(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    compare_chain("=", vm, inv, |o| o == std::cmp::Ordering::Equal)
}

fn prim_lt(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    compare_chain("<", vm, inv, |o| o == std::cmp::Ordering::Less)
}

fn prim_gt(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    compare_chain(">", vm, inv, |o| o == std::cmp::Ordering::Greater)
}

fn prim_le(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    compare_chain("<=", vm, inv, |o| o != std::cmp::Ordering::Greater)
}

fn prim_ge(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    compare_chain(">=", vm, inv, |o| o != std::cmp::Ordering::Less)
}

// ----------------------------------------------------------------------
// Pairs and lists
// ----------------------------------------------------------------------

fn prim_cons(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("cons", inv, 2)?;
    vm.alloc_cons(vm.arg(inv, 0), vm.arg(inv, 1))
}

fn prim_car(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("car", inv, 1)?;
    match vm.arg(inv, 0) {
        Value::Cons(r) => vm
            .heap
            .cons(r)
            .map(|(car, _)| car)
            .ok_or_else(|| EmberError::eval("dangling pair")),
        other => Err(EmberError::type_error(format!(
            "`car` expects a pair, got {}",
            other.type_name()
        ))),
    }
}

fn prim_cdr(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("cdr", inv, 1)?;
    match vm.arg(inv, 0) {
        Value::Cons(r) => vm
            .heap
            .cons(r)
            .map(|(_, cdr)| cdr)
            .ok_or_else(|| EmberError::eval("dangling pair")),
        other => Err(EmberError::type_error(format!(
            "`cdr` expects a pair, got {}",
            other.type_name()
        ))),
    }
}

fn prim_list(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    let mut acc = Value::Nil;
    for i in (0..inv.argc).rev() {
        acc = vm.alloc_cons(vm.arg(inv, i), acc)?;
    }
    Ok(acc)
}

// ----------------------------------------------------------------------
// Predicates
// ----------------------------------------------------------------------

fn prim_is_atom(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("atom?", inv, 1)?;
    Ok(Value::Bool(!matches!(vm.arg(inv, 0), Value::Cons(_))))
}

fn prim_is_pair(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("pair?", inv, 1)?;
    Ok(Value::Bool(matches!(vm.arg(inv, 0), Value::Cons(_))))
}

/// A proper list: a nil-terminated cons chain. Cyclic chains are not
/// proper lists.
fn prim_is_list(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("list?", inv, 1)?;
    let mut visited = std::collections::HashSet::new();
    let mut cursor = vm.arg(inv, 0);
    loop {
        match cursor {
            Value::Nil => return Ok(Value::Bool(true)),
            Value::Cons(r) => {
                if !visited.insert(r) {
                    return Ok(Value::Bool(false));
                }
                cursor = match vm.heap.cons(r) {
                    Some((_, cdr)) => cdr,
                    None => return Err(EmberError::eval("dangling pair")),
                };
            }
            _ => return Ok(Value::Bool(false)),
        }
    }
}

fn prim_is_null(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("null?", inv, 1)?;
    Ok(Value::Bool(matches!(vm.arg(inv, 0), Value::Nil)))
}

fn prim_is_number(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("number?", inv, 1)?;
    Ok(Value::Bool(vm.arg(inv, 0).is_number()))
}

fn prim_is_string(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("string?", inv, 1)?;
    Ok(Value::Bool(matches!(vm.arg(inv, 0), Value::Str(_))))
}

fn prim_is_symbol(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("symbol?", inv, 1)?;
    Ok(Value::Bool(matches!(vm.arg(inv, 0), Value::Sym(_))))
}

fn prim_is_procedure(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("procedure?", inv, 1)?;
    Ok(Value::Bool(matches!(
        vm.arg(inv, 0),
        Value::Func(_) | Value::Builtin(_)
    )))
}

// ----------------------------------------------------------------------
// Equality
// ----------------------------------------------------------------------

fn prim_eq(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("eq?", inv, 2)?;
    Ok(Value::Bool(value::identical(
        vm.arg(inv, 0),
        vm.arg(inv, 1),
    )))
}

fn prim_equal(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("equal?", inv, 2)?;
    Ok(Value::Bool(value::structural_eq(
        vm.arg(inv, 0),
        vm.arg(inv, 1),
        &vm.heap,
    )))
}

// ----------------------------------------------------------------------
// Output and control
// ----------------------------------------------------------------------

fn prim_display(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    for i in 0..inv.argc {
        let rendered = value::display_form(vm.arg(inv, i), &vm.heap, &vm.interner);
        vm.output.push_str(&rendered);
    }
    Ok(Value::Nil)
}

fn prim_newline(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("newline", inv, 0)?;
    vm.output.push('\n');
    Ok(Value::Nil)
}

/// `(apply f (a b c))` calls `f` with the list's members as arguments.
fn prim_apply(vm: &mut Vm, env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("apply", inv, 2)?;
    let f = vm.arg(inv, 0);
    let mut cursor = vm.arg(inv, 1);
    let base = vm.temp_len();
    loop {
        match cursor {
            Value::Nil => break,
            Value::Cons(r) => {
                let (car, cdr) = match vm.heap.cons(r) {
                    Some(pair) => pair,
                    None => {
                        vm.truncate_temp(base);
                        return Err(EmberError::eval("dangling pair"));
                    }
                };
                vm.push_temp(car);
                cursor = cdr;
            }
            other => {
                vm.truncate_temp(base);
                return Err(EmberError::type_error(format!(
                    "`apply` expects a proper argument list, got {}",
                    other.type_name()
                )));
            }
        }
    }
    let argc = vm.temp_len() - base;
    let result = match f {
        Value::Builtin(id) => {
            let inner = Invocation {
                span: inv.span,
                base,
                argc,
            };
            (TABLE[id].run)(vm, env, &inner)
        }
        Value::Func(r) => vm.call_function_nested(r, base, argc),
        other => Err(EmberError::type_error(format!(
            "`apply` expects a procedure, got {}",
            other.type_name()
        ))),
    };
    vm.truncate_temp(base);
    result
}

fn prim_eval(vm: &mut Vm, env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    expect_argc("eval", inv, 1)?;
    let datum = vm.arg(inv, 0);
    vm.eval_datum(datum, env)
}

fn prim_exit(vm: &mut Vm, _env: &ScopeRef, inv: &Invocation) -> Result<Value, EmberError> {
    let code = match inv.argc {
        0 => 0,
        1 => match vm.arg(inv, 0) {
            Value::Int(n) => n as i32,
            other => {
                return Err(EmberError::type_error(format!(
                    "`exit` expects an integer status, got {}",
                    other.type_name()
                )));
            }
        },
        _ => return Err(EmberError::argument("`exit` takes at most one argument")),
    };
    Err(EmberError::Exit { code })
}
