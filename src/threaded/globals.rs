//! Names visible to every compiled program: constants and host functions.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::error::RunError;
use super::types::{FuncType, Type};
use super::value::{Function, Value};

#[derive(Debug, Clone)]
pub enum Global {
    Const(Value, Type),
    Func(Function),
}

/// Global name table consulted after local scopes.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    entries: IndexMap<String, Global>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// `print`, `len`, `divmod` and `fail`.
    pub fn with_builtins() -> Self {
        let mut g = Self::new();
        g.define_func(Function::new(
            "print",
            FuncType::new(vec![Type::Any], vec![]),
            |args| {
                if let Some(v) = args.first() {
                    println!("{v}");
                }
                Ok(Vec::new())
            },
        ));
        g.define_func(Function::single("len", vec![Type::String], Type::Int, |args| {
            match args.first() {
                Some(Value::Str(s)) => Ok(Value::Int(i64::try_from(s.len()).unwrap_or(i64::MAX))),
                _ => Err(RunError::Host("len: expected a string".into())),
            }
        }));
        g.define_func(Function::new(
            "divmod",
            FuncType::new(vec![Type::Int, Type::Int], vec![Type::Int, Type::Int]),
            |args| match args {
                [Value::Int(_), Value::Int(0)] => Err(RunError::Host("integer divide by zero".into())),
                [Value::Int(a), Value::Int(b)] => Ok(vec![
                    Value::Int(a.wrapping_div(*b)),
                    Value::Int(a.wrapping_rem(*b)),
                ]),
                _ => Err(RunError::Host("divmod: expected two ints".into())),
            },
        ));
        g.define_func(Function::single("fail", vec![Type::String], Type::Int, |args| {
            let msg = args.first().map_or_else(String::new, |v| match v {
                Value::Str(s) => s.to_string(),
                other => other.to_string(),
            });
            Err(RunError::Host(msg))
        }));
        g
    }

    pub fn define_const(&mut self, name: &str, value: Value) {
        let ty = value.type_of().unwrap_or(Type::Any);
        self.entries.insert(name.to_string(), Global::Const(value, ty));
    }

    pub fn define_func(&mut self, func: Function) {
        self.entries.insert(func.name().to_string(), Global::Func(func));
    }

    pub fn get(&self, name: &str) -> Option<&Global> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Records the arguments of every `mark` call, in call order. Shared across
/// threads; each clone sees the same log.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mark(int) int`, which records its argument and returns it.
    pub fn install(&self, globals: &mut Globals) {
        let log = Arc::clone(&self.log);
        globals.define_func(Function::single("mark", vec![Type::Int], Type::Int, move |args| {
            let v = args.first().cloned().unwrap_or(Value::Nil);
            log.lock().push(v.clone());
            Ok(v)
        }));
    }

    pub fn events(&self) -> Vec<Value> {
        self.log.lock().clone()
    }

    /// Recorded `mark` arguments as integers.
    pub fn marks(&self) -> Vec<i64> {
        self.log.lock().iter().filter_map(Value::as_int).collect()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}
