use std::fmt;

use serde::Serialize;

use crate::threaded::{CompileError, RunError};

/// Errors surfaced by the command-line front end: loading files, compiling,
/// and running programs. Serializes with a stable `code` for `--json` output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", content = "detail")]
pub enum AppError {
    Io { path: String, message: String },
    Json { message: String },
    Compile { errors: Vec<CompileError> },
    Run { message: String },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Io { path, message } => write!(f, "{path}: {message}"),
            AppError::Json { message } => write!(f, "invalid JSON: {message}"),
            AppError::Compile { errors } => match errors.as_slice() {
                [one] => write!(f, "{one}"),
                many => write!(f, "{} compile errors", many.len()),
            },
            AppError::Run { message } => write!(f, "runtime error: {message}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json {
            message: e.to_string(),
        }
    }
}

impl From<Vec<CompileError>> for AppError {
    fn from(errors: Vec<CompileError>) -> Self {
        AppError::Compile { errors }
    }
}

impl From<RunError> for AppError {
    fn from(e: RunError) -> Self {
        AppError::Run {
            message: e.to_string(),
        }
    }
}
