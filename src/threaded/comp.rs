//! Compiler state and the statement compiler.

use indexmap::IndexMap;

use super::ast::{Expr, Span, Stmt};
use super::code::{effect, Code, LoopInfo, Program};
use super::error::CompileError;
use super::expr::{single, CompiledExpr};
use super::globals::Globals;
use super::types::Type;
use crate::settings::CompileOptions;

/// A local variable: its frame slot and static type.
#[derive(Debug, Clone)]
pub struct Binding {
    pub slot: usize,
    pub ty: Type,
}

pub struct Comp<'g> {
    pub(crate) code: Code,
    pub(crate) globals: &'g Globals,
    pub(crate) options: CompileOptions,
    scopes: Vec<IndexMap<String, Binding>>,
    frame_size: usize,
    /// Innermost breakable construct last.
    pub(crate) loops: Vec<LoopInfo>,
}

/// Compiler position to roll back to when a top-level statement fails.
struct Mark {
    code: usize,
    scopes: usize,
    bindings: usize,
    loops: usize,
}

/// Compile top-level statements into a program.
///
/// A statement that fails to compile is dropped along with any code and
/// bindings it produced; its siblings are still compiled so every
/// diagnostic is reported.
pub fn compile(stmts: &[Stmt], globals: &Globals, options: &CompileOptions) -> Result<Program, Vec<CompileError>> {
    let mut comp = Comp::new(globals, options.clone());
    let mut errors = Vec::new();
    for stmt in stmts {
        let mark = comp.mark();
        if let Err(err) = comp.stmt(stmt) {
            tracing::debug!(kind = ?err.kind, error = %err, "statement dropped");
            comp.rollback(&mark);
            errors.push(err);
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    comp.finish().map_err(|e| vec![e])
}

impl<'g> Comp<'g> {
    pub fn new(globals: &'g Globals, options: CompileOptions) -> Self {
        Self {
            code: Code::new(),
            globals,
            options,
            scopes: vec![IndexMap::new()],
            frame_size: 0,
            loops: Vec::new(),
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            code: self.code.len(),
            scopes: self.scopes.len(),
            bindings: self.scopes.last().map_or(0, IndexMap::len),
            loops: self.loops.len(),
        }
    }

    fn rollback(&mut self, mark: &Mark) {
        self.code.truncate(mark.code);
        self.scopes.truncate(mark.scopes);
        if let Some(scope) = self.scopes.last_mut() {
            scope.truncate(mark.bindings);
        }
        self.loops.truncate(mark.loops);
    }

    /// Link the emitted code. Variables of the outermost scope are exported.
    pub fn finish(self) -> Result<Program, CompileError> {
        let exports = self
            .scopes
            .first()
            .map(|scope| scope.iter().map(|(name, b)| (name.clone(), b.slot)).collect())
            .unwrap_or_default();
        self.code.link(
            self.frame_size,
            exports,
            self.options.specialize_dispatch,
            self.options.trace_execution,
        )
    }

    // ── Scopes ──────────────────────────────────────────────────

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(IndexMap::new());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Reserve a frame slot for a local or a cached value.
    pub(crate) fn alloc_slot(&mut self) -> usize {
        self.frame_size += 1;
        self.frame_size - 1
    }

    fn declare(&mut self, name: &str, ty: Type, span: Span) -> Result<usize, CompileError> {
        if self.in_current_scope(name).is_some() {
            return Err(CompileError::redeclared(format!("{name} redeclared in this block"), span));
        }
        let slot = self.alloc_slot();
        let Some(scope) = self.scopes.last_mut() else {
            return Err(CompileError::internal("no open scope"));
        };
        scope.insert(name.to_string(), Binding { slot, ty });
        Ok(slot)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn in_current_scope(&self, name: &str) -> Option<&Binding> {
        self.scopes.last().and_then(|scope| scope.get(name))
    }

    // ── Statements ──────────────────────────────────────────────

    pub(crate) fn stmts(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    /// Compile `stmts` inside a nested scope.
    pub(crate) fn block(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        self.push_scope();
        let result = self.stmts(stmts);
        // Pop even on error so nested failures leave the scope stack balanced.
        self.pop_scope();
        result
    }

    pub(crate) fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(e) => {
                let c = self.expr(e)?;
                if !c.is_const() {
                    self.code.exec("expr", c.as_effect());
                }
                Ok(())
            }
            Stmt::Define { names, value, span } => self.assign(names, value, *span, true),
            Stmt::Assign { names, value, span } => self.assign(names, value, *span, false),
            Stmt::Block { body, .. } => self.block(body),
            Stmt::Switch(sw) => self.switch_stmt(sw, Vec::new()),
            Stmt::Labeled { .. } => self.labeled(stmt),
            Stmt::Break { label, span } => self.break_stmt(label.as_deref(), *span),
            Stmt::Case(clause) => Err(CompileError::misplaced(
                if clause.is_default() {
                    "default clause outside of switch"
                } else {
                    "case clause outside of switch"
                },
                clause.span,
            )),
            Stmt::Fallthrough(span) => Err(CompileError::misplaced("fallthrough statement out of place", *span)),
        }
    }

    fn labeled(&mut self, mut stmt: &Stmt) -> Result<(), CompileError> {
        let mut labels = Vec::new();
        while let Stmt::Labeled { label, body, .. } = stmt {
            labels.push(label.clone());
            stmt = body.as_ref();
        }
        match stmt {
            Stmt::Switch(sw) => self.switch_stmt(sw, labels),
            other => self.stmt(other),
        }
    }

    fn break_stmt(&mut self, label: Option<&str>, span: Span) -> Result<(), CompileError> {
        let target = match label {
            None => self.loops.len().checked_sub(1),
            Some(l) => self.loops.iter().rposition(|info| info.has_label(l)),
        };
        let Some(target) = target else {
            return Err(match label {
                None => CompileError::misplaced("break is not in a loop, switch, or select", span),
                Some(l) => CompileError::misplaced(format!("invalid break label {l}"), span),
            });
        };
        let site = self.code.jump_pending();
        if let Some(info) = self.loops.get_mut(target) {
            info.defer_break(site);
        }
        Ok(())
    }

    /// `a, b := value` (when `define`) or `a, b = value`. `_` discards.
    fn assign(&mut self, names: &[String], value: &Expr, span: Span, define: bool) -> Result<(), CompileError> {
        let mut rhs = self.expr(value)?;
        let n = names.len();
        if n == 1 {
            rhs = single(rhs, value)?;
        } else if rhs.arity() != n {
            return Err(CompileError::value_count(
                format!(
                    "assignment mismatch: {n} variables but {value} returns {} value{}",
                    rhs.arity(),
                    if rhs.arity() == 1 { "" } else { "s" }
                ),
                span,
            ));
        }

        let mut slots = Vec::with_capacity(n);
        let mut fresh = Vec::new();
        for (name, ty) in names.iter().zip(&rhs.types) {
            if name == "_" {
                slots.push(None);
                continue;
            }
            let existing = if define {
                self.in_current_scope(name).cloned()
            } else {
                Some(
                    self.lookup(name)
                        .cloned()
                        .ok_or_else(|| CompileError::undefined(format!("undefined: {name}"), span))?,
                )
            };
            match existing {
                Some(b) => {
                    if !storable(&rhs, ty, &b.ty) {
                        return Err(CompileError::type_mismatch(
                            format!("cannot use {value} (value of type {ty}) as {} value in assignment", b.ty),
                            span,
                        ));
                    }
                    slots.push(Some((b.slot, b.ty)));
                }
                None => {
                    fresh.push((name.as_str(), ty.clone()));
                    slots.push(None);
                }
            }
        }
        if define && fresh.is_empty() {
            return Err(CompileError::redeclared("no new variables on left side of :=", span));
        }

        // Declared after the value is compiled: `x := x` reads the outer `x`.
        let mut fresh = fresh.into_iter();
        for (name, slot) in names.iter().zip(slots.iter_mut()) {
            if slot.is_none() && name != "_" {
                if let Some((fresh_name, ty)) = fresh.next() {
                    *slot = Some((self.declare(fresh_name, ty.clone(), span)?, ty));
                }
            }
        }

        self.emit_store(&rhs, slots);
        Ok(())
    }

    /// Emit the step writing `rhs` into `slots`; `None` discards.
    fn emit_store(&mut self, rhs: &CompiledExpr, slots: Vec<Option<(usize, Type)>>) {
        match slots.as_slice() {
            [target] => {
                let slot = target.as_ref().map(|(slot, _)| *slot);
                if let Some(v) = &rhs.value {
                    let Some((slot, ty)) = target else {
                        return;
                    };
                    let (slot, v) = (*slot, v.convert(ty).unwrap_or_else(|| v.clone()));
                    self.code.exec(
                        "store",
                        effect(move |env| {
                            env.set_slot(slot, v.clone());
                            Ok(())
                        }),
                    );
                    return;
                }
                let f = rhs.as_value_fn();
                self.code.exec(
                    "assign",
                    effect(move |env| {
                        let v = f(env)?;
                        if let Some(slot) = slot {
                            env.set_slot(slot, v);
                        }
                        Ok(())
                    }),
                );
            }
            _ => {
                let f = rhs.as_many_fn();
                let slots: Vec<Option<usize>> = slots.into_iter().map(|t| t.map(|(slot, _)| slot)).collect();
                self.code.exec(
                    "assign multi",
                    effect(move |env| {
                        let (_, all) = f(env)?;
                        for (slot, v) in slots.iter().zip(all) {
                            if let Some(slot) = slot {
                                env.set_slot(*slot, v);
                            }
                        }
                        Ok(())
                    }),
                );
            }
        }
    }
}

/// Whether `rhs` (whose result at this position has type `ty`) may be
/// stored into a variable of type `target`.
fn storable(rhs: &CompiledExpr, ty: &Type, target: &Type) -> bool {
    match &rhs.value {
        Some(v) if rhs.arity() == 1 => v.convert(target).is_some(),
        _ => ty.assignable_to(target),
    }
}
