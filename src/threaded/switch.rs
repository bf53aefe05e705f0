//! Expression switches.
//!
//! Layout of `switch tag { case a, b: A; default: D; case c: C }`:
//!
//! ```text
//!     [init] [tag cache]
//! h0: dispatch a, b          miss -> h1
//!     A...
//!     jump break
//! h1: jump h2                default head: never matches
//!     D...
//!     jump break
//! h2: dispatch c             miss -> tail
//!     C...
//!     jump break
//! tail: jump D               reached only when nothing matched
//! break:
//! ```
//!
//! Every clause owns exactly one head step. A body ending in `fallthrough`
//! ends in a jump that is patched to the next clause's body address once that
//! address is known, so it never runs the next head.

use indexmap::map::Entry;
use indexmap::IndexMap;

use super::ast::{CaseClause, Span, Stmt, SwitchStmt};
use super::code::{effect, LoopInfo, PatchSite};
use super::comp::Comp;
use super::error::CompileError;
use super::expr::{mismatched, value_fn, CompiledExpr};
use super::types::Type;
use super::value::{CaseKey, Value};

/// State shared by all clauses of one switch.
#[derive(Default)]
struct Clauses {
    /// Constant case values already used, with their position.
    seen: IndexMap<CaseKey, Span>,
    default: Option<DefaultClause>,
    /// Jump ending the previous body in `fallthrough`, waiting for this
    /// clause's body address.
    fallthrough: Option<PatchSite>,
}

struct DefaultClause {
    body: usize,
    span: Span,
}

impl Comp<'_> {
    #[tracing::instrument(level = "debug", skip_all, fields(clauses = sw.body.len(), labels = ?labels))]
    pub(crate) fn switch_stmt(&mut self, sw: &SwitchStmt, labels: Vec<String>) -> Result<(), CompileError> {
        let scoped = matches!(sw.init.as_deref(), Some(Stmt::Define { .. }));
        if scoped {
            self.push_scope();
        }
        let result = self.switch_inner(sw, labels);
        if scoped {
            self.pop_scope();
        }
        result
    }

    fn switch_inner(&mut self, sw: &SwitchStmt, labels: Vec<String>) -> Result<(), CompileError> {
        if let Some(init) = &sw.init {
            self.stmt(init)?;
        }

        let tag = match &sw.tag {
            None => CompiledExpr::constant(Value::Bool(true), Type::Bool),
            Some(e) => {
                let tag = self.expr1(e)?;
                if tag.is_const() {
                    tag
                } else {
                    self.switch_tag(&tag)
                }
            }
        };
        let tag_text = sw.tag.as_ref().map_or_else(|| "true".to_string(), ToString::to_string);

        self.loops.push(LoopInfo::new(labels));
        let clauses = self.switch_clauses(&sw.body, &tag, &tag_text);
        let info = self.loops.pop().ok_or_else(|| CompileError::internal("switch break target lost"))?;
        let default_body = clauses?;

        if let Some(body) = default_body {
            self.code.jump_to(body);
        }
        let ibreak = self.code.len();
        info.resolve(&mut self.code, ibreak)?;
        tracing::debug!(ibreak, default = ?default_body, "switch compiled");
        Ok(())
    }

    /// Evaluate the tag once per execution into a frame slot; the returned
    /// expression reads the slot back.
    fn switch_tag(&mut self, tag: &CompiledExpr) -> CompiledExpr {
        let slot = self.alloc_slot();
        let eval = tag.as_value_fn();
        self.code.exec(
            "switch tag",
            effect(move |env| {
                let v = eval(env)?;
                env.set_slot(slot, v);
                Ok(())
            }),
        );
        let ty = tag.ty().cloned().unwrap_or(Type::Any);
        CompiledExpr::one(ty, value_fn(move |env| Ok(env.slot(slot))))
    }

    /// Compile the clauses in order. Returns the default body's address.
    fn switch_clauses(
        &mut self,
        body: &[Stmt],
        tag: &CompiledExpr,
        tag_text: &str,
    ) -> Result<Option<usize>, CompileError> {
        let mut clauses = Clauses::default();
        let n = body.len();
        for (i, stmt) in body.iter().enumerate() {
            let can_fallthrough = i + 1 < n;
            let Stmt::Case(clause) = stmt else {
                return Err(CompileError::invalid_switch_statement(
                    format!(
                        "invalid statement inside switch: expecting case or default, found {}",
                        stmt.kind_name()
                    ),
                    stmt.span(),
                ));
            };
            if clause.is_default() {
                if let Some(first) = &clauses.default {
                    return Err(CompileError::multiple_defaults(
                        format!("multiple defaults in switch (first at {})", first.span),
                        clause.span,
                    )
                    .with_related(first.span));
                }
                self.default_clause(clause, can_fallthrough, &mut clauses)?;
            } else {
                self.case_clause(clause, tag, tag_text, can_fallthrough, &mut clauses)?;
            }
        }
        Ok(clauses.default.map(|d| d.body))
    }

    fn case_clause(
        &mut self,
        clause: &CaseClause,
        tag: &CompiledExpr,
        tag_text: &str,
        can_fallthrough: bool,
        clauses: &mut Clauses,
    ) -> Result<(), CompileError> {
        let mut tests = Vec::new();
        let mut matched = false;
        for value in &clause.values {
            let mut e = self.expr1(value)?;
            let mut t = tag.clone();
            let invalid = |reason: String| {
                CompileError::type_mismatch(
                    format!("invalid case {value} in switch on {tag_text} ({reason})"),
                    value.span,
                )
            };
            // The tag keeps its type; only the case value may convert.
            if !case_fits_tag(&mut e, &t) {
                return Err(invalid(mismatched(&t, &e)));
            }
            let cmp = self.eql(&mut t, &mut e, invalid)?;
            if let (Some(v), Some(ty)) = (&e.value, e.ty()) {
                update_seen(&mut clauses.seen, v, ty, value.span)?;
            }
            match cmp.value {
                Some(Value::Bool(true)) => {
                    // Later values cannot change the outcome.
                    matched = true;
                    break;
                }
                Some(_) => {}
                None => tests.push(cmp.as_test()),
            }
        }
        tracing::trace!(values = clause.values.len(), tests = tests.len(), matched, "case clause");

        let miss = match (matched, tests.is_empty()) {
            (true, true) => {
                self.code.nop();
                None
            }
            (true, false) => {
                self.code.probe(tests);
                None
            }
            (false, true) => Some(self.code.jump_pending()),
            (false, false) => Some(self.code.dispatch(tests)),
        };
        let body = self.code.len();
        self.enter_body(clauses, body)?;
        self.clause_body(&clause.body, can_fallthrough, clauses)?;
        if let Some(site) = miss {
            let next = self.code.len();
            self.code.patch(site, next)?;
        }
        Ok(())
    }

    /// The default's head always misses. Its body is entered by fallthrough
    /// or by the jump appended after the last clause.
    fn default_clause(
        &mut self,
        clause: &CaseClause,
        can_fallthrough: bool,
        clauses: &mut Clauses,
    ) -> Result<(), CompileError> {
        let head = self.code.jump_pending();
        let body = self.code.len();
        self.enter_body(clauses, body)?;
        clauses.default = Some(DefaultClause {
            body,
            span: clause.span,
        });
        self.clause_body(&clause.body, can_fallthrough, clauses)?;
        let next = self.code.len();
        self.code.patch(head, next)
    }

    fn enter_body(&mut self, clauses: &mut Clauses, body: usize) -> Result<(), CompileError> {
        if let Some(site) = clauses.fallthrough.take() {
            self.code.patch(site, body)?;
        }
        Ok(())
    }

    fn clause_body(&mut self, body: &[Stmt], can_fallthrough: bool, clauses: &mut Clauses) -> Result<(), CompileError> {
        let (stmts, falls) = match body.split_last() {
            Some((Stmt::Fallthrough(span), rest)) => {
                if !can_fallthrough {
                    return Err(CompileError::illegal_fallthrough(
                        "cannot fallthrough final case in switch",
                        *span,
                    ));
                }
                (rest, true)
            }
            _ => (body, false),
        };
        self.block(stmts)?;

        let site = self.code.jump_pending();
        if falls {
            clauses.fallthrough = Some(site);
        } else {
            let info = self
                .loops
                .last_mut()
                .ok_or_else(|| CompileError::internal("case body outside of switch"))?;
            info.defer_break(site);
        }
        Ok(())
    }
}

/// Whether `value` can be compared against `tag` without retyping the tag.
/// A constant value is converted to the tag's type in place.
fn case_fits_tag(value: &mut CompiledExpr, tag: &CompiledExpr) -> bool {
    let (Some(tag_ty), Some(value_ty)) = (tag.ty(), value.ty()) else {
        return false;
    };
    if tag_ty == value_ty || *tag_ty == Type::Any || *value_ty == Type::Any {
        return true;
    }
    let tag_ty = tag_ty.clone();
    value.is_const() && value.convert_to(&tag_ty)
}

/// Record a constant case value; reject it if the switch already has it.
fn update_seen(seen: &mut IndexMap<CaseKey, Span>, value: &Value, ty: &Type, span: Span) -> Result<(), CompileError> {
    let Some(key) = value.case_key() else {
        return Ok(());
    };
    match seen.entry(key) {
        Entry::Occupied(prev) => {
            let prev = *prev.get();
            tracing::debug!(%value, %prev, "duplicate case");
            Err(CompileError::duplicate_case(
                format!("duplicate case {value} <{ty}> in switch\n\tprevious case at {prev}"),
                span,
            )
            .with_related(prev))
        }
        Entry::Vacant(slot) => {
            slot.insert(span);
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::settings::CompileOptions;
    use crate::threaded::ast::{BinOp, Expr};
    use crate::threaded::code::Op;
    use crate::threaded::error::ErrorKind;
    use crate::threaded::globals::{Globals, Recorder};
    use crate::threaded::compile;

    fn mark(n: i64) -> Expr {
        Expr::call("mark", vec![Expr::int(n)])
    }

    fn mark_stmt(n: i64) -> Stmt {
        Stmt::expr(mark(n))
    }

    fn setup() -> (Globals, Recorder) {
        let mut globals = Globals::with_builtins();
        let rec = Recorder::new();
        rec.install(&mut globals);
        (globals, rec)
    }

    fn run_with(stmts: &[Stmt], options: &CompileOptions) -> Vec<i64> {
        let (globals, rec) = setup();
        let program = compile(stmts, &globals, options).unwrap();
        program.run().unwrap();
        rec.marks()
    }

    fn run(stmts: &[Stmt]) -> Vec<i64> {
        run_with(stmts, &CompileOptions::default())
    }

    fn errors(stmts: &[Stmt]) -> Vec<CompileError> {
        let (globals, _) = setup();
        compile(stmts, &globals, &CompileOptions::default()).err().unwrap()
    }

    #[test]
    fn constant_tag_runs_only_the_matching_clause() {
        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![
                Stmt::case(vec![Expr::int(1)], vec![mark_stmt(1)]),
                Stmt::case(vec![Expr::int(2)], vec![mark_stmt(2)]),
                Stmt::case(vec![Expr::int(3)], vec![mark_stmt(3)]),
            ],
        );
        assert_eq!(run(&[sw.clone()]), vec![2]);

        let (globals, _) = setup();
        let program = compile(&[sw], &globals, &CompileOptions::default()).unwrap();
        assert!(!program.ops().iter().any(|op| matches!(op, Op::Dispatch { .. } | Op::Probe { .. })));
        assert!(!program.ops().iter().any(|op| matches!(op, Op::Exec { what: "switch tag" })));
    }

    #[test]
    fn tag_is_evaluated_once() {
        let sw = Stmt::switch(
            Some(mark(3)),
            vec![
                Stmt::case(vec![Expr::int(1)], vec![]),
                Stmt::case(vec![Expr::int(2)], vec![]),
                Stmt::case(vec![Expr::int(3)], vec![mark_stmt(30)]),
            ],
        );
        assert_eq!(run(&[sw]), vec![3, 30]);
    }

    #[test]
    fn case_values_run_in_order_until_the_first_match() {
        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![
                Stmt::case(vec![mark(1), mark(5)], vec![mark_stmt(100)]),
                Stmt::case(vec![mark(2), mark(6)], vec![mark_stmt(200)]),
                Stmt::case(vec![mark(3)], vec![mark_stmt(300)]),
            ],
        );
        assert_eq!(run(&[sw]), vec![1, 5, 2, 200]);
    }

    #[test]
    fn constant_match_after_runtime_values_keeps_their_effects() {
        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![Stmt::case(vec![mark(1), Expr::int(2), mark(9)], vec![mark_stmt(20)])],
        );
        assert_eq!(run(&[sw]), vec![1, 20]);
    }

    #[test]
    fn fallthrough_skips_the_next_head() {
        let sw = Stmt::switch(
            Some(Expr::ident("x")),
            vec![
                Stmt::case(vec![mark(1)], vec![mark_stmt(10), Stmt::fallthrough()]),
                Stmt::case(vec![mark(2)], vec![mark_stmt(20)]),
                Stmt::case(vec![mark(1)], vec![mark_stmt(30)]),
            ],
        );
        let stmts = [Stmt::define("x", Expr::int(1)), sw];
        assert_eq!(run(&stmts), vec![1, 10, 20]);
    }

    #[test]
    fn fallthrough_on_last_clause_is_rejected() {
        let errs = errors(&[Stmt::switch(
            Some(Expr::int(1)),
            vec![
                Stmt::case(vec![Expr::int(1)], vec![]),
                Stmt::default_clause(vec![Stmt::fallthrough()]),
            ],
        )]);
        assert_eq!(errs[0].kind, ErrorKind::IllegalFallthrough);
        assert_eq!(errs[0].message, "cannot fallthrough final case in switch");
    }

    #[test]
    fn fallthrough_in_the_middle_of_a_body_is_misplaced() {
        let errs = errors(&[Stmt::switch(
            Some(Expr::int(1)),
            vec![
                Stmt::case(vec![Expr::int(1)], vec![Stmt::fallthrough(), mark_stmt(1)]),
                Stmt::default_clause(vec![]),
            ],
        )]);
        assert_eq!(errs[0].kind, ErrorKind::Misplaced);
    }

    #[test]
    fn duplicate_constants_cite_the_first() {
        let errs = errors(&[
            Stmt::define("x", Expr::int(0)),
            Stmt::switch(
                Some(Expr::ident("x")),
                vec![
                    Stmt::case(vec![Expr::int(1).at(20, 21), Expr::int(2).at(23, 24)], vec![]),
                    Stmt::case(vec![Expr::int(3).at(40, 41)], vec![]),
                    Stmt::case(vec![Expr::int(1).at(60, 61)], vec![]),
                ],
            ),
        ]);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::DuplicateCase);
        assert_eq!(errs[0].span, Span::new(60, 61));
        assert_eq!(errs[0].related, Some(Span::new(20, 21)));
        assert_eq!(
            errs[0].message,
            "duplicate case 1 <int> in switch\n\tprevious case at offset 20"
        );
    }

    #[test]
    fn converted_constants_are_duplicates() {
        let errs = errors(&[
            Stmt::define("f", Expr::float(1.0)),
            Stmt::switch(
                Some(Expr::ident("f")),
                vec![
                    Stmt::case(vec![Expr::int(1)], vec![]),
                    Stmt::case(vec![Expr::float(1.0)], vec![]),
                ],
            ),
        ]);
        assert_eq!(errs[0].message.lines().next(), Some("duplicate case 1.0 <float64> in switch"));
    }

    #[test]
    fn nan_cases_never_collide() {
        let sw = Stmt::switch(
            Some(Expr::ident("f")),
            vec![
                Stmt::case(vec![Expr::float(f64::NAN)], vec![mark_stmt(1)]),
                Stmt::case(vec![Expr::float(f64::NAN)], vec![mark_stmt(2)]),
                Stmt::default_clause(vec![mark_stmt(3)]),
            ],
        );
        let stmts = [Stmt::define("f", Expr::float(f64::NAN)), sw];
        assert_eq!(run(&stmts), vec![3]);
    }

    #[test]
    fn duplicates_are_found_without_folding() {
        let options = CompileOptions {
            fold_constants: false,
            ..CompileOptions::default()
        };
        let (globals, _) = setup();
        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![
                Stmt::case(vec![Expr::int(2)], vec![]),
                Stmt::case(vec![Expr::int(2)], vec![]),
            ],
        );
        let errs = compile(&[sw], &globals, &options).err().unwrap();
        assert_eq!(errs[0].kind, ErrorKind::DuplicateCase);

        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![
                Stmt::case(vec![Expr::int(1)], vec![mark_stmt(1)]),
                Stmt::case(vec![Expr::int(2)], vec![mark_stmt(2)]),
            ],
        );
        assert_eq!(run_with(&[sw], &options), vec![2]);
    }

    #[test]
    fn multiple_defaults() {
        let errs = errors(&[Stmt::switch(
            None,
            vec![Stmt::default_at(10, vec![]), Stmt::default_at(30, vec![])],
        )]);
        assert_eq!(errs[0].kind, ErrorKind::MultipleDefaults);
        assert_eq!(errs[0].message, "multiple defaults in switch (first at offset 10)");
        assert_eq!(errs[0].related, Some(Span::new(10, 17)));
    }

    #[test]
    fn non_clause_statement_in_body() {
        let errs = errors(&[Stmt::switch(None, vec![mark_stmt(1)])]);
        assert_eq!(errs[0].kind, ErrorKind::InvalidSwitchStatement);
        assert_eq!(
            errs[0].message,
            "invalid statement inside switch: expecting case or default, found expression statement"
        );
    }

    #[test]
    fn mismatched_case_type() {
        let errs = errors(&[
            Stmt::define("s", Expr::str("a")),
            Stmt::switch(Some(Expr::ident("s")), vec![Stmt::case(vec![Expr::int(1)], vec![])]),
        ]);
        assert_eq!(errs[0].kind, ErrorKind::TypeMismatch);
        assert_eq!(errs[0].message, "invalid case 1 in switch on s (mismatched types string and int)");
    }

    #[test]
    fn constant_tag_is_not_converted_to_the_case_type() {
        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![
                Stmt::case(vec![Expr::float(2.5)], vec![mark_stmt(1)]),
                Stmt::default_clause(vec![mark_stmt(0)]),
            ],
        );
        let errs = errors(&[sw]);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::TypeMismatch);
        assert_eq!(
            errs[0].message,
            "invalid case 2.5 in switch on 2 (mismatched types int and float64)"
        );
    }

    #[test]
    fn constant_tag_against_variable_of_other_type() {
        let sw = Stmt::switch(
            Some(Expr::int(1)),
            vec![
                Stmt::case(vec![Expr::ident("f")], vec![mark_stmt(1)]),
                Stmt::default_clause(vec![mark_stmt(0)]),
            ],
        );
        let errs = errors(&[Stmt::define("f", Expr::float(1.5)), sw]);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::TypeMismatch);
        assert_eq!(errs[0].message, "invalid case f in switch on 1 (mismatched types int and float64)");
    }

    #[test]
    fn integral_float_case_converts_to_an_int_tag() {
        let sw = Stmt::switch(
            Some(Expr::int(2)),
            vec![
                Stmt::case(vec![Expr::float(2.0)], vec![mark_stmt(1)]),
                Stmt::default_clause(vec![mark_stmt(0)]),
            ],
        );
        assert_eq!(run(&[sw]), vec![1]);
    }

    #[test]
    fn tagless_switch_picks_first_true_case() {
        let x = || Expr::ident("x");
        let sw = Stmt::switch(
            None,
            vec![
                Stmt::case(vec![Expr::binary(BinOp::Lt, x(), Expr::int(0))], vec![mark_stmt(-1)]),
                Stmt::case(vec![Expr::binary(BinOp::Lt, x(), Expr::int(10))], vec![mark_stmt(1)]),
                Stmt::default_clause(vec![mark_stmt(0)]),
            ],
        );
        assert_eq!(run(&[Stmt::define("x", Expr::int(5)), sw]), vec![1]);
    }

    #[test]
    fn init_scope_ends_with_the_switch() {
        let sw = Stmt::switch_with_init(
            Stmt::define("y", mark(4)),
            Some(Expr::ident("y")),
            vec![Stmt::case(vec![Expr::int(4)], vec![Stmt::expr(Expr::call("mark", vec![Expr::ident("y")]))])],
        );
        let (globals, rec) = setup();
        let program = compile(&[sw], &globals, &CompileOptions::default()).unwrap();
        let env = program.run().unwrap();
        assert_eq!(rec.marks(), vec![4, 4]);
        assert_eq!(env.get("y"), None);
    }

    #[test]
    fn break_leaves_the_clause_early() {
        let sw = Stmt::switch(
            Some(Expr::int(1)),
            vec![Stmt::case(vec![Expr::int(1)], vec![mark_stmt(1), Stmt::break_to(None), mark_stmt(2)])],
        );
        assert_eq!(run(&[sw, mark_stmt(3)]), vec![1, 3]);
    }

    #[test]
    fn labeled_break_leaves_the_outer_switch() {
        let inner = Stmt::switch(
            Some(Expr::int(2)),
            vec![Stmt::case(vec![Expr::int(2)], vec![mark_stmt(1), Stmt::break_to(Some("outer"))])],
        );
        let outer = Stmt::labeled(
            "outer",
            Stmt::switch(Some(Expr::int(1)), vec![Stmt::case(vec![Expr::int(1)], vec![inner, mark_stmt(2)])]),
        );
        assert_eq!(run(&[outer, mark_stmt(3)]), vec![1, 3]);

        let errs = errors(&[Stmt::switch(
            None,
            vec![Stmt::default_clause(vec![Stmt::break_to(Some("nowhere"))])],
        )]);
        assert_eq!(errs[0].message, "invalid break label nowhere");
    }

    #[test]
    fn one_head_per_clause() {
        let sw = Stmt::switch(
            Some(Expr::ident("x")),
            vec![
                Stmt::case(vec![Expr::int(1)], vec![]),
                Stmt::default_clause(vec![]),
                Stmt::case(vec![Expr::int(2), Expr::int(3)], vec![]),
            ],
        );
        let (globals, _) = setup();
        let program = compile(&[Stmt::define("x", Expr::int(0)), sw], &globals, &CompileOptions::default()).unwrap();
        let ops = program.ops();
        // store x, tag cache, then the three heads each followed by a break jump
        assert!(matches!(ops[0], Op::Exec { what: "store" }));
        assert!(matches!(ops[1], Op::Exec { what: "switch tag" }));
        assert_eq!(ops[2], Op::Dispatch { tests: 1, miss: 4 });
        assert_eq!(ops[4], Op::Jump { target: 6 });
        assert_eq!(ops[6], Op::Dispatch { tests: 2, miss: 8 });
        // no match: into the default body
        assert_eq!(ops[8], Op::Jump { target: 5 });
        assert_eq!(ops[3], Op::Jump { target: 9 });
        assert_eq!(ops.len(), 9);
    }
}
