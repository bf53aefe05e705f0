//! Threaded code: a flat array of closures addressed by an instruction pointer.
//!
//! While a construct is being compiled its steps are kept as patchable
//! instructions, because forward jump targets (the next clause, the break
//! address) are unknown until the code they point at has been emitted. Each
//! unknown target is recorded as a [`PatchSite`] and resolved exactly once.
//! [`Code::link`] then turns every instruction into a closure whose targets are
//! plain captured integers.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use super::error::{CompileError, RunError};
use super::value::Value;

/// One executable step. Returns the address of the next step.
pub type Step = Arc<dyn Fn(&mut Env<'_>) -> Result<usize, RunError> + Send + Sync>;
/// A side effect run by an `Exec` step.
pub type Effect = Arc<dyn Fn(&mut Env<'_>) -> Result<(), RunError> + Send + Sync>;
/// A boolean evaluator, e.g. one `tag == value` comparison.
pub type Test = Arc<dyn Fn(&mut Env<'_>) -> Result<bool, RunError> + Send + Sync>;

pub fn step(f: impl Fn(&mut Env<'_>) -> Result<usize, RunError> + Send + Sync + 'static) -> Step {
    Arc::new(f)
}

pub fn effect(f: impl Fn(&mut Env<'_>) -> Result<(), RunError> + Send + Sync + 'static) -> Effect {
    Arc::new(f)
}

pub fn test(f: impl Fn(&mut Env<'_>) -> Result<bool, RunError> + Send + Sync + 'static) -> Test {
    Arc::new(f)
}

/// Execution record: instruction pointer, program, and the per-execution frame
/// holding locals and switch tag caches.
pub struct Env<'p> {
    pub ip: usize,
    program: &'p Program,
    slots: Vec<Value>,
}

impl<'p> Env<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            ip: 0,
            program,
            slots: vec![Value::Nil; program.frame_size],
        }
    }

    pub fn slot(&self, index: usize) -> Value {
        self.slots.get(index).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_slot(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = value;
        }
    }

    /// Look up an exported top-level variable.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.program.exports.get(name).map(|&slot| self.slot(slot))
    }
}

/// Printable shape of a linked step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Run an effect, continue with the next step.
    Exec { what: &'static str },
    Jump { target: usize },
    /// Run tests until one is true: next step on a hit, `miss` otherwise.
    Dispatch { tests: usize, miss: usize },
    /// Run tests for their side effects, then continue with the next step.
    Probe { tests: usize },
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Pending,
    At(usize),
}

/// A jump target awaiting its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    at: usize,
}

pub(crate) enum Instr {
    Exec { what: &'static str, effect: Effect },
    Jump(Target),
    Dispatch { tests: Vec<Test>, miss: Target },
    Probe(Vec<Test>),
    Nop,
}

/// Instruction buffer a compilation appends to.
#[derive(Default)]
pub struct Code {
    instrs: Vec<Instr>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the next instruction to be emitted.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    fn append(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    pub fn exec(&mut self, what: &'static str, effect: Effect) {
        self.append(Instr::Exec { what, effect });
    }

    pub fn nop(&mut self) {
        self.append(Instr::Nop);
    }

    pub fn jump_to(&mut self, addr: usize) {
        self.append(Instr::Jump(Target::At(addr)));
    }

    /// Emit a jump whose target is filled in later.
    pub fn jump_pending(&mut self) -> PatchSite {
        let at = self.append(Instr::Jump(Target::Pending));
        PatchSite { at }
    }

    /// Emit a multi-way test; the miss target is filled in later.
    pub fn dispatch(&mut self, tests: Vec<Test>) -> PatchSite {
        let at = self.append(Instr::Dispatch {
            tests,
            miss: Target::Pending,
        });
        PatchSite { at }
    }

    pub fn probe(&mut self, tests: Vec<Test>) {
        self.append(Instr::Probe(tests));
    }

    /// Resolve a pending target. Each site resolves exactly once.
    pub fn patch(&mut self, site: PatchSite, addr: usize) -> Result<(), CompileError> {
        let target = match self.instrs.get_mut(site.at) {
            Some(Instr::Jump(target) | Instr::Dispatch { miss: target, .. }) => target,
            _ => {
                return Err(CompileError::internal(format!(
                    "patch site {} is not a jump",
                    site.at
                )))
            }
        };
        if *target != Target::Pending {
            return Err(CompileError::internal(format!(
                "patch site {} already resolved",
                site.at
            )));
        }
        *target = Target::At(addr);
        tracing::trace!(site = site.at, addr, "patched");
        Ok(())
    }

    /// Drop everything emitted at or after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.instrs.truncate(len);
    }

    /// Turn the buffer into a runnable program.
    pub fn link(
        self,
        frame_size: usize,
        exports: IndexMap<String, usize>,
        specialize: bool,
        trace: bool,
    ) -> Result<Program, CompileError> {
        let end = self.instrs.len();
        let resolve = |target: Target, at: usize| match target {
            Target::At(addr) if addr <= end => Ok(addr),
            Target::At(addr) => Err(CompileError::internal(format!(
                "jump at {at} targets {addr}, past the end of the program"
            ))),
            Target::Pending => Err(CompileError::internal(format!("unresolved jump at {at}"))),
        };

        let mut steps = Vec::with_capacity(end);
        let mut ops = Vec::with_capacity(end);
        for (at, instr) in self.instrs.into_iter().enumerate() {
            let next = at + 1;
            let (op, s) = match instr {
                Instr::Exec { what, effect } => (
                    Op::Exec { what },
                    step(move |env| {
                        effect(env)?;
                        Ok(next)
                    }),
                ),
                Instr::Jump(target) => {
                    let target = resolve(target, at)?;
                    (Op::Jump { target }, step(move |_| Ok(target)))
                }
                Instr::Dispatch { tests, miss } => {
                    let miss = resolve(miss, at)?;
                    let op = Op::Dispatch {
                        tests: tests.len(),
                        miss,
                    };
                    (op, dispatch_step(tests, next, miss, specialize))
                }
                Instr::Probe(tests) => {
                    let op = Op::Probe { tests: tests.len() };
                    // Every test runs until one is true; where control goes is fixed.
                    (op, dispatch_step(tests, next, next, specialize))
                }
                Instr::Nop => (Op::Nop, step(move |_| Ok(next))),
            };
            steps.push(s);
            ops.push(op);
        }
        tracing::debug!(steps = steps.len(), frame_size, "linked program");

        Ok(Program {
            steps,
            ops,
            frame_size,
            exports,
            trace,
        })
    }
}

/// Evaluate `tests` in order, stopping at the first true one.
fn dispatch_step(tests: Vec<Test>, hit: usize, miss: usize, specialize: bool) -> Step {
    if specialize {
        match tests.as_slice() {
            [] => return step(move |_| Ok(miss)),
            [only] => {
                let only = Arc::clone(only);
                return step(move |env| Ok(if only(env)? { hit } else { miss }));
            }
            [first, second] => {
                let (first, second) = (Arc::clone(first), Arc::clone(second));
                return step(move |env| Ok(if first(env)? || second(env)? { hit } else { miss }));
            }
            _ => {}
        }
    }
    step(move |env| {
        for t in &tests {
            if t(env)? {
                return Ok(hit);
            }
        }
        Ok(miss)
    })
}

/// A linked, immutable program. It is `Send + Sync`; run it from as many
/// environments at once as needed.
pub struct Program {
    steps: Vec<Step>,
    ops: Vec<Op>,
    frame_size: usize,
    exports: IndexMap<String, usize>,
    trace: bool,
}

impl Program {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Names of top-level variables readable after a run.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }

    /// Run from the first step with a fresh frame.
    pub fn run(&self) -> Result<Env<'_>, RunError> {
        let mut env = Env::new(self);
        Self::exec(&mut env)?;
        Ok(env)
    }

    /// Advance `env` one step at a time until it leaves the program.
    pub fn exec(env: &mut Env<'_>) -> Result<(), RunError> {
        let program = env.program;
        while let Some(step) = program.steps.get(env.ip) {
            if program.trace {
                tracing::trace!(ip = env.ip, op = ?program.ops.get(env.ip), "step");
            }
            env.ip = step(env)?;
        }
        Ok(())
    }
}

/// Control state of the switch being compiled.
#[derive(Debug, Default)]
pub struct LoopInfo {
    labels: Vec<String>,
    breaks: Vec<PatchSite>,
}

impl LoopInfo {
    pub fn new(mut labels: Vec<String>) -> Self {
        labels.sort();
        Self {
            labels,
            breaks: Vec::new(),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).is_ok()
    }

    /// Record a jump that must land on the break address.
    pub fn defer_break(&mut self, site: PatchSite) {
        self.breaks.push(site);
    }

    /// The break address is known: patch every pending break.
    pub fn resolve(self, code: &mut Code, addr: usize) -> Result<(), CompileError> {
        for site in self.breaks {
            code.patch(site, addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::threaded::error::ErrorKind;

    fn counter(slot: usize) -> Effect {
        effect(move |env| {
            let n = env.slot(slot).as_int().unwrap_or(0);
            env.set_slot(slot, Value::Int(n + 1));
            Ok(())
        })
    }

    fn link(code: Code, frame: usize) -> Result<Program, CompileError> {
        code.link(frame, IndexMap::new(), true, false)
    }

    #[test]
    fn forward_jump_skips_steps() {
        let mut code = Code::new();
        let site = code.jump_pending();
        code.exec("count", counter(0));
        let end = code.len();
        code.patch(site, end).unwrap();
        code.exec("count", counter(1));

        let program = link(code, 2).unwrap();
        let env = program.run().unwrap();
        assert_eq!(env.slot(0), Value::Nil);
        assert_eq!(env.slot(1), Value::Int(1));
        assert_eq!(program.ops()[0], Op::Jump { target: 2 });
    }

    #[test]
    fn patch_sites_resolve_once() {
        let mut code = Code::new();
        let site = code.jump_pending();
        code.patch(site, 1).unwrap();
        let err = code.patch(site, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn unresolved_jump_fails_to_link() {
        let mut code = Code::new();
        code.jump_pending();
        assert!(link(code, 0).is_err());
    }

    #[test]
    fn dispatch_stops_at_first_true() {
        let hits = |slot: usize, result: bool| {
            test(move |env| {
                let n = env.slot(slot).as_int().unwrap_or(0);
                env.set_slot(slot, Value::Int(n + 1));
                Ok(result)
            })
        };
        for specialize in [true, false] {
            let mut code = Code::new();
            let site = code.dispatch(vec![hits(0, false), hits(1, true), hits(2, true)]);
            code.exec("count", counter(3));
            let end = code.len();
            code.patch(site, end).unwrap();
            let program = code.link(4, IndexMap::new(), specialize, false).unwrap();
            let env = program.run().unwrap();
            assert_eq!(env.slot(0), Value::Int(1));
            assert_eq!(env.slot(1), Value::Int(1));
            assert_eq!(env.slot(2), Value::Nil);
            assert_eq!(env.slot(3), Value::Int(1));
        }
    }

    #[test]
    fn probe_runs_tests_and_falls_through() {
        let mut code = Code::new();
        code.probe(vec![test(|env| {
            env.set_slot(0, Value::Int(7));
            Ok(false)
        })]);
        code.exec("count", counter(1));
        let program = link(code, 2).unwrap();
        let env = program.run().unwrap();
        assert_eq!(env.slot(0), Value::Int(7));
        assert_eq!(env.slot(1), Value::Int(1));
        assert_eq!(program.ops()[0], Op::Probe { tests: 1 });
    }

    #[test]
    fn labels_are_sorted_for_lookup() {
        let info = LoopInfo::new(vec!["outer".into(), "alpha".into(), "mid".into()]);
        assert!(info.has_label("mid"));
        assert!(info.has_label("alpha"));
        assert!(!info.has_label("beta"));
    }

    #[test]
    fn errors_propagate_out_of_the_run_loop() {
        let mut code = Code::new();
        code.exec("fail", effect(|_| Err(RunError::Host("boom".into()))));
        code.exec("count", counter(0));
        let program = link(code, 1).unwrap();
        assert_eq!(program.run().err(), Some(RunError::Host("boom".into())));
    }
}
