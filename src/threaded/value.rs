use std::fmt;
use std::sync::Arc;

use super::ast::Literal;
use super::error::RunError;
use super::types::{FuncType, Type};

/// Runtime value. One representation for every static type, so a single
/// generic tag cache serves all switches.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex(f64, f64),
    Str(Arc<str>),
    Func(Function),
}

/// Host implementation returning every declared result.
pub type NativeFn = dyn Fn(&[Value]) -> Result<Vec<Value>, RunError> + Send + Sync;
/// Host implementation of a single-result function, called without building a result list.
pub type NativeFn1 = dyn Fn(&[Value]) -> Result<Value, RunError> + Send + Sync;

#[derive(Clone)]
enum Native {
    Multi(Arc<NativeFn>),
    Single(Arc<NativeFn1>),
}

/// A callable value backed by host code.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    ty: Type,
    native: Native,
}

impl Function {
    pub fn new(
        name: &str,
        ty: FuncType,
        f: impl Fn(&[Value]) -> Result<Vec<Value>, RunError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            ty: Type::Func(Arc::new(ty)),
            native: Native::Multi(Arc::new(f)),
        }
    }

    /// A function with exactly one result.
    pub fn single(
        name: &str,
        params: Vec<Type>,
        result: Type,
        f: impl Fn(&[Value]) -> Result<Value, RunError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            ty: Type::func(params, vec![result]),
            native: Native::Single(Arc::new(f)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    fn declared_results(&self) -> usize {
        self.ty.as_func().map_or(0, |ft| ft.results.len())
    }

    /// Call and return all results, checking the declared count.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, RunError> {
        let results = match &self.native {
            Native::Multi(f) => f(args)?,
            Native::Single(f) => vec![f(args)?],
        };
        let want = self.declared_results();
        if results.len() != want {
            return Err(RunError::ResultCount {
                func: self.name.to_string(),
                want,
                got: results.len(),
            });
        }
        Ok(results)
    }

    /// Call a single-result function.
    pub fn call1(&self, args: &[Value]) -> Result<Value, RunError> {
        match &self.native {
            Native::Single(f) => f(args),
            Native::Multi(f) => {
                let results = f(args)?;
                let got = results.len();
                match (results.into_iter().next(), got) {
                    (Some(v), 1) => Ok(v),
                    _ => Err(RunError::ResultCount {
                        func: self.name.to_string(),
                        want: 1,
                        got,
                    }),
                }
            }
        }
    }

    /// Call for side effects only.
    pub fn call0(&self, args: &[Value]) -> Result<(), RunError> {
        match &self.native {
            Native::Single(f) => f(args).map(drop),
            Native::Multi(f) => f(args).map(drop),
        }
    }

    fn same(&self, other: &Function) -> bool {
        match (&self.native, &other.native) {
            (Native::Multi(a), Native::Multi(b)) => Arc::ptr_eq(a, b),
            (Native::Single(a), Native::Single(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func {} {}", self.name, self.ty)
    }
}

/// Hashable form of a constant case value, used to reject duplicate cases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CaseKey {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(u64),
    Complex(u64, u64),
    Str(Arc<str>),
}

/// Bit pattern with `-0` folded into `0`; `None` for NaN.
fn float_key(v: f64) -> Option<u64> {
    if v.is_nan() {
        None
    } else if v == 0.0 {
        Some(0.0f64.to_bits())
    } else {
        Some(v.to_bits())
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(s.into())
    }

    pub fn from_literal(lit: &Literal) -> Value {
        match lit {
            Literal::Bool(v) => Value::Bool(*v),
            Literal::Int(v) => Value::Int(*v),
            Literal::Uint(v) => Value::Uint(*v),
            Literal::Float(v) => Value::Float(*v),
            Literal::Complex(re, im) => Value::Complex(*re, *im),
            Literal::Str(s) => Value::str(s),
        }
    }

    /// Dynamic type; `None` for `Nil`.
    pub fn type_of(&self) -> Option<Type> {
        Some(match self {
            Value::Nil => return None,
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Uint(_) => Type::Uint,
            Value::Float(_) => Type::Float,
            Value::Complex(..) => Type::Complex,
            Value::Str(_) => Type::String,
            Value::Func(f) => f.ty().clone(),
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Exact equality: same dynamic kind and same value. Floats and each
    /// complex component follow IEEE rules, so `NaN != NaN` and `0 == -0`.
    #[allow(clippy::float_cmp)]
    pub fn exact_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Complex(ar, ai), Value::Complex(br, bi)) => ar == br && ai == bi,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a.same(b),
            _ => false,
        }
    }

    /// Convert a constant to `ty` if it is exactly representable there.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::float_cmp
    )]
    pub fn convert(&self, ty: &Type) -> Option<Value> {
        let integral = |f: f64| f.is_finite() && f.fract() == 0.0;
        match (self, ty) {
            (_, Type::Any) => Some(self.clone()),
            (Value::Bool(_), Type::Bool)
            | (Value::Int(_), Type::Int)
            | (Value::Uint(_), Type::Uint)
            | (Value::Float(_), Type::Float)
            | (Value::Complex(..), Type::Complex)
            | (Value::Str(_), Type::String) => Some(self.clone()),
            (Value::Func(f), Type::Func(_)) if f.ty() == ty => Some(self.clone()),

            (Value::Int(v), Type::Uint) => u64::try_from(*v).ok().map(Value::Uint),
            (Value::Int(v), Type::Float) => Some(Value::Float(*v as f64)),
            (Value::Int(v), Type::Complex) => Some(Value::Complex(*v as f64, 0.0)),
            (Value::Uint(v), Type::Int) => i64::try_from(*v).ok().map(Value::Int),
            (Value::Uint(v), Type::Float) => Some(Value::Float(*v as f64)),
            (Value::Uint(v), Type::Complex) => Some(Value::Complex(*v as f64, 0.0)),
            (Value::Float(v), Type::Int) if integral(*v) && v.abs() < 9.2e18 => Some(Value::Int(*v as i64)),
            (Value::Float(v), Type::Uint) if integral(*v) && *v >= 0.0 && *v < 1.8e19 => {
                Some(Value::Uint(*v as u64))
            }
            (Value::Float(v), Type::Complex) => Some(Value::Complex(*v, 0.0)),
            (Value::Complex(re, im), _) if *im == 0.0 && *ty != Type::Complex => {
                Value::Float(*re).convert(ty)
            }
            _ => None,
        }
    }

    /// Key for duplicate-case detection. NaN never equals anything, so it has none.
    pub fn case_key(&self) -> Option<CaseKey> {
        match self {
            Value::Bool(b) => Some(CaseKey::Bool(*b)),
            Value::Int(v) => Some(CaseKey::Int(*v)),
            Value::Uint(v) => Some(CaseKey::Uint(*v)),
            Value::Float(v) => float_key(*v).map(CaseKey::Float),
            Value::Complex(re, im) => Some(CaseKey::Complex(float_key(*re)?, float_key(*im)?)),
            Value::Str(s) => Some(CaseKey::Str(Arc::clone(s))),
            Value::Nil | Value::Func(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.exact_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Complex(re, im) => write!(f, "({re:?}{im:+?}i)"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Func(func) => write!(f, "{}", func.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Func(func) => write!(f, "{func:?}"),
            other => write!(f, "{other}"),
        }
    }
}
