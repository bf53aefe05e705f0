//! Statement and expression trees handed to the compiler.
//!
//! Parsing lives upstream; these nodes arrive already classified (a switch body
//! is a list of `Stmt::Case` clauses) and can be loaded from JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset {}", self.start)
    }
}

/// A JSON program file: `{"body": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFile {
    pub body: Vec<Stmt>,
}

/// Literal constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex(f64, f64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprKind {
    Lit(Literal),
    /// Local variable, global constant or global function.
    Ident(String),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `f(a, b)`
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Eq,
    Ne,
    Lt,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Expr(Expr),
    /// `a, b := value`
    Define {
        names: Vec<String>,
        value: Expr,
        #[serde(default)]
        span: Span,
    },
    /// `a, b = value`
    Assign {
        names: Vec<String>,
        value: Expr,
        #[serde(default)]
        span: Span,
    },
    Block {
        body: Vec<Stmt>,
        #[serde(default)]
        span: Span,
    },
    Switch(Box<SwitchStmt>),
    /// A case clause. Only valid directly inside a switch body.
    Case(CaseClause),
    Labeled {
        label: String,
        body: Box<Stmt>,
        #[serde(default)]
        span: Span,
    },
    Break {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        span: Span,
    },
    Fallthrough(Span),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStmt {
    #[serde(default)]
    pub init: Option<Box<Stmt>>,
    /// `None` means `switch true`.
    #[serde(default)]
    pub tag: Option<Expr>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub span: Span,
}

/// `case a, b: ...` or, with no values, `default: ...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseClause {
    #[serde(default)]
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub span: Span,
}

impl CaseClause {
    pub fn is_default(&self) -> bool {
        self.values.is_empty()
    }
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr(e) => e.span,
            Stmt::Define { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::Block { span, .. }
            | Stmt::Labeled { span, .. }
            | Stmt::Break { span, .. }
            | Stmt::Fallthrough(span) => *span,
            Stmt::Switch(s) => s.span,
            Stmt::Case(c) => c.span,
        }
    }

    /// Short statement-kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Stmt::Expr(_) => "expression statement",
            Stmt::Define { .. } => "short variable declaration",
            Stmt::Assign { .. } => "assignment",
            Stmt::Block { .. } => "block",
            Stmt::Switch(_) => "switch statement",
            Stmt::Case(_) => "case clause",
            Stmt::Labeled { .. } => "labeled statement",
            Stmt::Break { .. } => "break statement",
            Stmt::Fallthrough(_) => "fallthrough statement",
        }
    }

    // ── Builders ────────────────────────────────────────────────

    pub fn expr(e: Expr) -> Stmt {
        Stmt::Expr(e)
    }

    pub fn define(name: &str, value: Expr) -> Stmt {
        Stmt::define_many(&[name], value)
    }

    pub fn define_many(names: &[&str], value: Expr) -> Stmt {
        let span = value.span;
        Stmt::Define {
            names: names.iter().map(|n| (*n).to_string()).collect(),
            value,
            span,
        }
    }

    pub fn assign_many(names: &[&str], value: Expr) -> Stmt {
        let span = value.span;
        Stmt::Assign {
            names: names.iter().map(|n| (*n).to_string()).collect(),
            value,
            span,
        }
    }

    pub fn case(values: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
        let span = values.first().map(|v| v.span).unwrap_or_default();
        Stmt::Case(CaseClause { values, body, span })
    }

    pub fn default_clause(body: Vec<Stmt>) -> Stmt {
        Stmt::Case(CaseClause {
            values: Vec::new(),
            body,
            span: Span::default(),
        })
    }

    /// A `default` clause positioned at `start`.
    pub fn default_at(start: usize, body: Vec<Stmt>) -> Stmt {
        Stmt::Case(CaseClause {
            values: Vec::new(),
            body,
            span: Span::new(start, start + 7),
        })
    }

    pub fn switch(tag: Option<Expr>, body: Vec<Stmt>) -> Stmt {
        Stmt::Switch(Box::new(SwitchStmt {
            init: None,
            tag,
            body,
            span: Span::default(),
        }))
    }

    pub fn switch_with_init(init: Stmt, tag: Option<Expr>, body: Vec<Stmt>) -> Stmt {
        Stmt::Switch(Box::new(SwitchStmt {
            init: Some(Box::new(init)),
            tag,
            body,
            span: Span::default(),
        }))
    }

    pub fn labeled(label: &str, body: Stmt) -> Stmt {
        let span = body.span();
        Stmt::Labeled {
            label: label.to_string(),
            body: Box::new(body),
            span,
        }
    }

    pub fn break_to(label: Option<&str>) -> Stmt {
        Stmt::Break {
            label: label.map(str::to_string),
            span: Span::default(),
        }
    }

    pub fn fallthrough() -> Stmt {
        Stmt::Fallthrough(Span::default())
    }
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            span: Span::default(),
        }
    }

    /// Reposition this expression (used by tests that check diagnostic spans).
    pub fn at(mut self, start: usize, end: usize) -> Self {
        self.span = Span::new(start, end);
        self
    }

    pub fn lit(lit: Literal) -> Self {
        Self::new(ExprKind::Lit(lit))
    }

    pub fn bool(v: bool) -> Self {
        Self::lit(Literal::Bool(v))
    }

    pub fn int(v: i64) -> Self {
        Self::lit(Literal::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::lit(Literal::Float(v))
    }

    pub fn str(v: &str) -> Self {
        Self::lit(Literal::Str(v.to_string()))
    }

    pub fn ident(name: &str) -> Self {
        Self::new(ExprKind::Ident(name.to_string()))
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        let span = left.span.merge(right.span);
        Self {
            kind: ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        }
    }

    pub fn call(func: &str, args: Vec<Expr>) -> Self {
        Self::call_expr(Self::ident(func), args)
    }

    pub fn call_expr(func: Expr, args: Vec<Expr>) -> Self {
        let span = func.span;
        Self {
            kind: ExprKind::Call {
                func: Box::new(func),
                args,
            },
            span,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Uint(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Complex(re, im) => write!(f, "({re:?}{im:+?}i)"),
            Literal::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Renders expressions roughly as written, for diagnostics.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Lit(lit) => write!(f, "{lit}"),
            ExprKind::Ident(name) => write!(f, "{name}"),
            ExprKind::Binary { op, left, right } => {
                write!(f, "{left} {} {right}", op.symbol())
            }
            ExprKind::Call { func, args } => {
                write!(f, "{func}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
