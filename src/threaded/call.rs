use std::sync::Arc;

use smallvec::SmallVec;

use super::ast::{Expr, Span};
use super::code::{effect, Env};
use super::comp::Comp;
use super::error::{CompileError, RunError};
use super::expr::{many_fn, value_fn, CompiledExpr, ValueFn};
use super::types::type_list;
use super::value::{Function, Value};

type Args = SmallVec<[Value; 4]>;

/// Runtime shape of a call: where the function comes from and how to
/// evaluate its arguments.
struct CallSite {
    /// Known at compile time when the callee is a global function.
    fixed: Option<Function>,
    callee: ValueFn,
    args: Vec<ValueFn>,
}

impl CallSite {
    /// Evaluate the callee, then the arguments left to right.
    fn prepare(&self, env: &mut Env<'_>) -> Result<(Function, Args), RunError> {
        let func = match &self.fixed {
            Some(f) => f.clone(),
            None => match (self.callee)(env)? {
                Value::Func(f) => f,
                _ => return Err(RunError::NilFunction),
            },
        };
        let args = self.args.iter().map(|arg| arg(env)).collect::<Result<Args, _>>()?;
        Ok((func, args))
    }
}

impl Comp<'_> {
    /// Compile `func(args...)`, specialized by the callee's result count.
    #[tracing::instrument(level = "debug", skip(self, func, args), fields(callee = %func, args = args.len()))]
    pub(crate) fn call_expr(&mut self, func: &Expr, args: &[Expr], span: Span) -> Result<CompiledExpr, CompileError> {
        let callee = self.expr1(func)?;
        let ty = callee.types.first().cloned();
        let Some(ft) = ty.as_ref().and_then(|t| t.as_func()).map(Arc::clone) else {
            let shown = ty.map_or_else(|| type_list(&callee.types), |t| t.to_string());
            return Err(CompileError::not_callable(
                format!("call of non-function: {func} <{shown}>"),
                func.span,
            ));
        };
        if ft.variadic {
            return Err(CompileError::unimplemented(
                format!("unimplemented: call to variadic function: {func} <{ft}>"),
                span,
            ));
        }

        let mut compiled = args.iter().map(|a| self.expr1(a)).collect::<Result<Vec<_>, _>>()?;
        if compiled.len() != ft.params.len() {
            let prefix = if compiled.len() > ft.params.len() {
                "too many"
            } else {
                "not enough"
            };
            let have: Vec<_> = compiled.iter().filter_map(|c| c.ty().cloned()).collect();
            return Err(CompileError::argument_count(
                format!(
                    "{prefix} arguments in call to {func}:\n\thave {}\n\twant {}",
                    type_list(&have),
                    type_list(&ft.params)
                ),
                span,
            ));
        }

        for ((arg, c), param) in args.iter().zip(compiled.iter_mut()).zip(&ft.params) {
            let Some(arg_ty) = c.ty().cloned() else {
                continue;
            };
            let ok = if c.is_const() {
                c.convert_to(param)
            } else {
                arg_ty.assignable_to(param)
            };
            if !ok {
                let shown = c.value.as_ref().map_or_else(|| arg.to_string(), ToString::to_string);
                return Err(CompileError::type_mismatch(
                    format!("cannot use {shown} <{arg_ty}> as <{param}> in argument to {func}"),
                    arg.span,
                ));
            }
        }

        let fixed = match &callee.value {
            Some(Value::Func(f)) => Some(f.clone()),
            _ => None,
        };
        let site = Arc::new(CallSite {
            fixed,
            callee: callee.as_value_fn(),
            args: compiled.iter().map(CompiledExpr::as_value_fn).collect(),
        });
        tracing::trace!(results = ft.results.len(), fixed = site.fixed.is_some(), "call compiled");

        Ok(match ft.results.as_slice() {
            [] => CompiledExpr::zero(effect(move |env| {
                let (f, args) = site.prepare(env)?;
                f.call0(&args)
            })),
            [ty] => CompiledExpr::one(
                ty.clone(),
                value_fn(move |env| {
                    let (f, args) = site.prepare(env)?;
                    f.call1(&args)
                }),
            ),
            types => CompiledExpr::many(
                types.to_vec(),
                many_fn(move |env| {
                    let (f, args) = site.prepare(env)?;
                    let all = f.call(&args)?;
                    let first = all.first().cloned().unwrap_or(Value::Nil);
                    Ok((first, all))
                }),
            ),
        })
    }
}
