use serde::Serialize;
use thiserror::Error;

use super::ast::Span;

/// A compilation error with source location.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
    /// Earlier position the message refers to (first default, previous case).
    pub related: Option<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    MultipleDefaults,
    DuplicateCase,
    IllegalFallthrough,
    InvalidSwitchStatement,
    NotCallable,
    Unimplemented,
    ArgumentCountMismatch,
    TypeMismatch,
    /// No value, or several values, where exactly one (or a given count) is needed.
    ValueCount,
    Undefined,
    Redeclared,
    /// `case`, `break` or `fallthrough` somewhere it cannot appear.
    Misplaced,
    Internal,
}

impl CompileError {
    fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind,
            related: None,
        }
    }

    pub fn with_related(mut self, span: Span) -> Self {
        self.related = Some(span);
        self
    }

    pub fn multiple_defaults(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::MultipleDefaults, message, span)
    }

    pub fn duplicate_case(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::DuplicateCase, message, span)
    }

    pub fn illegal_fallthrough(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::IllegalFallthrough, message, span)
    }

    pub fn invalid_switch_statement(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::InvalidSwitchStatement, message, span)
    }

    pub fn not_callable(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::NotCallable, message, span)
    }

    pub fn unimplemented(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Unimplemented, message, span)
    }

    pub fn argument_count(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::ArgumentCountMismatch, message, span)
    }

    pub fn type_mismatch(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::TypeMismatch, message, span)
    }

    pub fn value_count(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::ValueCount, message, span)
    }

    pub fn undefined(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Undefined, message, span)
    }

    pub fn redeclared(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Redeclared, message, span)
    }

    pub fn misplaced(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Misplaced, message, span)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message, Span::default())
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        let (line, col) = offset_to_line_col(source, self.span.start);
        let mut out = format!("line {line}:{col}: {}", self.message);
        if let Some(related) = self.related {
            let (line, col) = offset_to_line_col(source, related.start);
            out.push_str(&format!(" (see line {line}:{col})"));
        }
        out
    }
}

fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Failure while executing a compiled program.
///
/// Host functions report failures through `Host`; the compiled code hands
/// those back to the caller untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("{0}")]
    Host(String),
    #[error("call of nil function value")]
    NilFunction,
    #[error("{func} returned {got} values, want {want}")]
    ResultCount { func: String, want: usize, got: usize },
}
