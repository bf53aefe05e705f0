//! Compiled expressions and the expression compiler.
//!
//! A [`CompiledExpr`] carries its static result types, its folded value when
//! it is a compile-time constant, and one evaluator specialized by how many
//! values it produces. Comparisons get their own unboxed `Bool` form so a
//! dispatch step can run them without building a `Value`.

use std::sync::Arc;

use super::ast::{BinOp, Expr, ExprKind, Span};
use super::code::{effect, test, Effect, Env, Test};
use super::comp::Comp;
use super::error::{CompileError, RunError};
use super::globals::Global;
use super::types::{type_list, Type};
use super::value::Value;

pub type ValueFn = Arc<dyn Fn(&mut Env<'_>) -> Result<Value, RunError> + Send + Sync>;
/// Yields the first result and the full result list.
pub type ManyFn = Arc<dyn Fn(&mut Env<'_>) -> Result<(Value, Vec<Value>), RunError> + Send + Sync>;

pub fn value_fn(f: impl Fn(&mut Env<'_>) -> Result<Value, RunError> + Send + Sync + 'static) -> ValueFn {
    Arc::new(f)
}

pub fn many_fn(
    f: impl Fn(&mut Env<'_>) -> Result<(Value, Vec<Value>), RunError> + Send + Sync + 'static,
) -> ManyFn {
    Arc::new(f)
}

#[derive(Clone)]
pub enum Eval {
    /// Nothing to run; the value lives in `CompiledExpr::value`.
    Const,
    Zero(Effect),
    One(ValueFn),
    Bool(Test),
    Many(ManyFn),
}

#[derive(Clone)]
pub struct CompiledExpr {
    pub types: Vec<Type>,
    pub value: Option<Value>,
    pub eval: Eval,
}

impl CompiledExpr {
    pub fn constant(value: Value, ty: Type) -> Self {
        Self {
            types: vec![ty],
            value: Some(value),
            eval: Eval::Const,
        }
    }

    pub fn one(ty: Type, f: ValueFn) -> Self {
        Self {
            types: vec![ty],
            value: None,
            eval: Eval::One(f),
        }
    }

    pub fn bool(t: Test) -> Self {
        Self {
            types: vec![Type::Bool],
            value: None,
            eval: Eval::Bool(t),
        }
    }

    pub fn zero(e: Effect) -> Self {
        Self {
            types: Vec::new(),
            value: None,
            eval: Eval::Zero(e),
        }
    }

    pub fn many(types: Vec<Type>, f: ManyFn) -> Self {
        Self {
            types,
            value: None,
            eval: Eval::Many(f),
        }
    }

    pub fn is_const(&self) -> bool {
        self.value.is_some()
    }

    /// Number of values produced.
    pub fn arity(&self) -> usize {
        self.types.len()
    }

    /// The single result type, if there is exactly one.
    pub fn ty(&self) -> Option<&Type> {
        match self.types.as_slice() {
            [one] => Some(one),
            _ => None,
        }
    }

    /// Replace a constant by its conversion to `ty`. Returns false, leaving
    /// `self` untouched, if the value is not representable there.
    pub fn convert_to(&mut self, ty: &Type) -> bool {
        let Some(converted) = self.value.as_ref().and_then(|v| v.convert(ty)) else {
            return false;
        };
        *self = CompiledExpr::constant(converted, ty.clone());
        true
    }

    pub fn as_value_fn(&self) -> ValueFn {
        if let Some(v) = &self.value {
            let v = v.clone();
            return value_fn(move |_| Ok(v.clone()));
        }
        match &self.eval {
            Eval::Const => value_fn(|_| Ok(Value::Nil)),
            Eval::One(f) => Arc::clone(f),
            Eval::Bool(t) => {
                let t = Arc::clone(t);
                value_fn(move |env| t(env).map(Value::Bool))
            }
            Eval::Zero(e) => {
                let e = Arc::clone(e);
                value_fn(move |env| e(env).map(|()| Value::Nil))
            }
            Eval::Many(f) => {
                let f = Arc::clone(f);
                value_fn(move |env| f(env).map(|(first, _)| first))
            }
        }
    }

    pub fn as_test(&self) -> Test {
        if let Some(v) = &self.value {
            let b = v.as_bool().unwrap_or(false);
            return test(move |_| Ok(b));
        }
        match &self.eval {
            Eval::Bool(t) => Arc::clone(t),
            _ => {
                let f = self.as_value_fn();
                test(move |env| Ok(f(env)?.as_bool().unwrap_or(false)))
            }
        }
    }

    /// Evaluate for side effects only.
    pub fn as_effect(&self) -> Effect {
        match &self.eval {
            Eval::Const => effect(|_| Ok(())),
            Eval::Zero(e) => Arc::clone(e),
            Eval::Bool(t) => {
                let t = Arc::clone(t);
                effect(move |env| t(env).map(drop))
            }
            Eval::One(f) => {
                let f = Arc::clone(f);
                effect(move |env| f(env).map(drop))
            }
            Eval::Many(f) => {
                let f = Arc::clone(f);
                effect(move |env| f(env).map(drop))
            }
        }
    }

    /// All results as a list.
    pub fn as_many_fn(&self) -> ManyFn {
        match &self.eval {
            Eval::Many(f) => Arc::clone(f),
            Eval::Zero(e) => {
                let e = Arc::clone(e);
                many_fn(move |env| {
                    e(env)?;
                    Ok((Value::Nil, Vec::new()))
                })
            }
            _ => {
                let f = self.as_value_fn();
                many_fn(move |env| {
                    let v = f(env)?;
                    Ok((v.clone(), vec![v]))
                })
            }
        }
    }
}

/// Reject `c` unless it produces exactly one value.
pub(crate) fn single(c: CompiledExpr, e: &Expr) -> Result<CompiledExpr, CompileError> {
    match c.arity() {
        1 => Ok(c),
        0 => Err(CompileError::value_count(
            format!("{e} (no value) used as value"),
            e.span,
        )),
        _ => Err(CompileError::value_count(
            format!(
                "multiple-value {e} (value of type {}) in single-value context",
                type_list(&c.types)
            ),
            e.span,
        )),
    }
}

/// Result of bringing two operands to a common type.
enum Unify {
    Same(Type),
    /// One side is `any`: compare dynamically.
    Dynamic,
}

impl Comp<'_> {
    pub(crate) fn expr(&mut self, e: &Expr) -> Result<CompiledExpr, CompileError> {
        match &e.kind {
            ExprKind::Lit(lit) => {
                let v = Value::from_literal(lit);
                let ty = v.type_of().unwrap_or(Type::Any);
                Ok(CompiledExpr::constant(v, ty))
            }
            ExprKind::Ident(name) => self.ident(name, e.span),
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right, e.span),
            ExprKind::Call { func, args } => self.call_expr(func, args, e.span),
        }
    }

    /// Compile an expression that must produce exactly one value.
    pub(crate) fn expr1(&mut self, e: &Expr) -> Result<CompiledExpr, CompileError> {
        let c = self.expr(e)?;
        single(c, e)
    }

    fn ident(&mut self, name: &str, span: Span) -> Result<CompiledExpr, CompileError> {
        if let Some(b) = self.lookup(name) {
            let slot = b.slot;
            return Ok(CompiledExpr::one(b.ty.clone(), value_fn(move |env| Ok(env.slot(slot)))));
        }
        match self.globals.get(name) {
            Some(Global::Const(v, ty)) => Ok(CompiledExpr::constant(v.clone(), ty.clone())),
            Some(Global::Func(f)) => Ok(CompiledExpr::constant(Value::Func(f.clone()), f.ty().clone())),
            None => Err(CompileError::undefined(format!("undefined: {name}"), span)),
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr, span: Span) -> Result<CompiledExpr, CompileError> {
        let mut x = self.expr1(left)?;
        let mut y = self.expr1(right)?;
        let mismatch = |reason: String| {
            CompileError::type_mismatch(
                format!("invalid operation: {left} {} {right} ({reason})", op.symbol()),
                span,
            )
        };
        match op {
            BinOp::Eq => self.eql(&mut x, &mut y, mismatch),
            BinOp::Ne => {
                let eq = self.eql(&mut x, &mut y, mismatch)?;
                if let Some(Value::Bool(b)) = eq.value {
                    return Ok(CompiledExpr::constant(Value::Bool(!b), Type::Bool));
                }
                let t = eq.as_test();
                Ok(CompiledExpr::bool(test(move |env| Ok(!t(env)?))))
            }
            BinOp::Add | BinOp::Sub | BinOp::Lt => {
                let ty = match unify(&mut x, &mut y) {
                    Some(Unify::Same(ty)) => ty,
                    Some(Unify::Dynamic) => {
                        return Err(mismatch(format!("operator {} not defined on any", op.symbol())))
                    }
                    None => return Err(mismatch(mismatched(&x, &y))),
                };
                let defined = match op {
                    BinOp::Add => ty.is_numeric() || ty == Type::String,
                    BinOp::Sub => ty.is_numeric(),
                    _ => ty.is_ordered(),
                };
                if !defined {
                    return Err(mismatch(format!("operator {} not defined on {ty}", op.symbol())));
                }
                self.arith(op, ty, &x, &y)
            }
        }
    }

    fn arith(&self, op: BinOp, ty: Type, x: &CompiledExpr, y: &CompiledExpr) -> Result<CompiledExpr, CompileError> {
        let result_ty = if op == BinOp::Lt { Type::Bool } else { ty };
        if let (Some(a), Some(b)) = (&x.value, &y.value) {
            if self.options.fold_constants {
                if let Some(v) = apply(op, a, b) {
                    tracing::trace!(%a, %b, op = op.symbol(), %v, "folded");
                    return Ok(CompiledExpr::constant(v, result_ty));
                }
            }
        }
        let (lf, rf) = (x.as_value_fn(), y.as_value_fn());
        let eval = value_fn(move |env| {
            let a = lf(env)?;
            let b = rf(env)?;
            apply(op, &a, &b).ok_or_else(|| RunError::Host(format!("invalid operands {a} {} {b}", op.symbol())))
        });
        Ok(CompiledExpr::one(result_ty, eval))
    }

    /// Compile `x == y`.
    ///
    /// A constant operand is first converted to the other operand's type.
    /// Two constants fold to a constant when folding is enabled; otherwise
    /// the result evaluates `x` then `y` and compares them exactly.
    pub(crate) fn eql(
        &self,
        x: &mut CompiledExpr,
        y: &mut CompiledExpr,
        mismatch: impl FnOnce(String) -> CompileError,
    ) -> Result<CompiledExpr, CompileError> {
        match unify(x, y) {
            Some(Unify::Same(ty)) if !ty.is_comparable() => {
                return Err(mismatch(format!("{ty} can only be compared to nil")))
            }
            Some(_) => {}
            None => return Err(mismatch(mismatched(x, y))),
        }

        match (&x.value, &y.value) {
            (Some(a), Some(b)) if self.options.fold_constants => {
                let eq = a.exact_eq(b);
                tracing::trace!(%a, %b, eq, "folded comparison");
                Ok(CompiledExpr::constant(Value::Bool(eq), Type::Bool))
            }
            (None, Some(b)) => {
                let (lf, b) = (x.as_value_fn(), b.clone());
                Ok(CompiledExpr::bool(test(move |env| Ok(lf(env)?.exact_eq(&b)))))
            }
            (Some(a), None) => {
                let (a, rf) = (a.clone(), y.as_value_fn());
                Ok(CompiledExpr::bool(test(move |env| Ok(a.exact_eq(&rf(env)?)))))
            }
            _ => {
                let (lf, rf) = (x.as_value_fn(), y.as_value_fn());
                Ok(CompiledExpr::bool(test(move |env| {
                    let a = lf(env)?;
                    let b = rf(env)?;
                    Ok(a.exact_eq(&b))
                })))
            }
        }
    }
}

/// Bring two single-valued operands to one type, converting a constant side
/// if needed. `None` if the types cannot be reconciled.
fn unify(x: &mut CompiledExpr, y: &mut CompiledExpr) -> Option<Unify> {
    let (xt, yt) = (x.ty()?.clone(), y.ty()?.clone());
    if xt == yt {
        return Some(Unify::Same(xt));
    }
    if xt == Type::Any || yt == Type::Any {
        return Some(Unify::Dynamic);
    }
    if y.is_const() && y.convert_to(&xt) {
        return Some(Unify::Same(xt));
    }
    if x.is_const() && x.convert_to(&yt) {
        return Some(Unify::Same(yt));
    }
    None
}

pub(crate) fn mismatched(x: &CompiledExpr, y: &CompiledExpr) -> String {
    let show = |c: &CompiledExpr| c.ty().map_or_else(|| type_list(&c.types), ToString::to_string);
    format!("mismatched types {} and {}", show(x), show(y))
}

fn apply(op: BinOp, a: &Value, b: &Value) -> Option<Value> {
    Some(match (op, a, b) {
        (BinOp::Add, Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
        (BinOp::Add, Value::Uint(a), Value::Uint(b)) => Value::Uint(a.wrapping_add(*b)),
        (BinOp::Add, Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        (BinOp::Add, Value::Complex(ar, ai), Value::Complex(br, bi)) => Value::Complex(ar + br, ai + bi),
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Value::str(&format!("{a}{b}")),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(*b)),
        (BinOp::Sub, Value::Uint(a), Value::Uint(b)) => Value::Uint(a.wrapping_sub(*b)),
        (BinOp::Sub, Value::Float(a), Value::Float(b)) => Value::Float(a - b),
        (BinOp::Sub, Value::Complex(ar, ai), Value::Complex(br, bi)) => Value::Complex(ar - br, ai - bi),
        (BinOp::Lt, Value::Int(a), Value::Int(b)) => Value::Bool(a < b),
        (BinOp::Lt, Value::Uint(a), Value::Uint(b)) => Value::Bool(a < b),
        (BinOp::Lt, Value::Float(a), Value::Float(b)) => Value::Bool(a < b),
        (BinOp::Lt, Value::Str(a), Value::Str(b)) => Value::Bool(a < b),
        _ => return None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::settings::CompileOptions;
    use crate::threaded::ast::{Expr, Stmt};
    use crate::threaded::error::ErrorKind;
    use crate::threaded::globals::Globals;
    use crate::threaded::compile;

    fn eval_const(e: &Expr) -> Option<Value> {
        let globals = Globals::with_builtins();
        let mut comp = Comp::new(&globals, CompileOptions::default());
        comp.expr(e).unwrap().value
    }

    fn compile_err(e: Expr) -> CompileError {
        let globals = Globals::with_builtins();
        let errors = compile(&[Stmt::expr(e)], &globals, &CompileOptions::default()).err().unwrap();
        errors.into_iter().next().unwrap()
    }

    #[test]
    fn constant_arithmetic_folds() {
        let e = Expr::binary(BinOp::Add, Expr::int(2), Expr::int(3));
        assert_eq!(eval_const(&e), Some(Value::Int(5)));
        let e = Expr::binary(BinOp::Lt, Expr::str("a"), Expr::str("b"));
        assert_eq!(eval_const(&e), Some(Value::Bool(true)));
        let e = Expr::binary(BinOp::Add, Expr::int(i64::MAX), Expr::int(1));
        assert_eq!(eval_const(&e), Some(Value::Int(i64::MIN)));
    }

    #[test]
    fn mixed_constants_convert() {
        let e = Expr::binary(BinOp::Eq, Expr::float(2.0), Expr::int(2));
        assert_eq!(eval_const(&e), Some(Value::Bool(true)));
        let e = Expr::binary(BinOp::Ne, Expr::float(0.0), Expr::float(-0.0));
        assert_eq!(eval_const(&e), Some(Value::Bool(false)));
        let e = Expr::binary(BinOp::Eq, Expr::float(f64::NAN), Expr::float(f64::NAN));
        assert_eq!(eval_const(&e), Some(Value::Bool(false)));
    }

    #[test]
    fn mismatched_comparison() {
        let err = compile_err(Expr::binary(BinOp::Eq, Expr::str("a"), Expr::int(1)));
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert_eq!(
            err.message,
            "invalid operation: \"a\" == 1 (mismatched types string and int)"
        );
    }

    #[test]
    fn funcs_cannot_be_compared() {
        let err = compile_err(Expr::binary(BinOp::Eq, Expr::ident("len"), Expr::ident("len")));
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert!(err.message.ends_with("(func(string) int can only be compared to nil)"));
    }

    #[test]
    fn no_value_used_as_value() {
        let err = compile_err(Expr::binary(
            BinOp::Eq,
            Expr::call("print", vec![Expr::int(1)]),
            Expr::int(1),
        ));
        assert_eq!(err.kind, ErrorKind::ValueCount);
        assert_eq!(err.message, "print(1) (no value) used as value");
    }

    #[test]
    fn multiple_values_in_single_value_context() {
        let err = compile_err(Expr::binary(
            BinOp::Add,
            Expr::call("divmod", vec![Expr::int(7), Expr::int(2)]),
            Expr::int(1),
        ));
        assert_eq!(
            err.message,
            "multiple-value divmod(7, 2) (value of type (int, int)) in single-value context"
        );
    }

    #[test]
    fn undefined_name() {
        let err = compile_err(Expr::ident("nope"));
        assert_eq!(err.kind, ErrorKind::Undefined);
        assert_eq!(err.message, "undefined: nope");
    }

    #[test]
    fn runtime_comparison_is_exact() {
        let globals = Globals::with_builtins();
        let body = vec![
            Stmt::define("x", Expr::float(-0.0)),
            Stmt::define("a", Expr::binary(BinOp::Eq, Expr::ident("x"), Expr::int(0))),
            Stmt::define("n", Expr::binary(BinOp::Sub, Expr::ident("x"), Expr::ident("x"))),
            Stmt::define("b", Expr::binary(BinOp::Lt, Expr::ident("n"), Expr::float(1.0))),
        ];
        let program = compile(&body, &globals, &CompileOptions::default()).unwrap();
        let env = program.run().unwrap();
        assert_eq!(env.get("a"), Some(Value::Bool(true)));
        assert_eq!(env.get("b"), Some(Value::Bool(true)));
    }
}
