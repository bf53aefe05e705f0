use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Knobs for one compilation. Every field has a default, so `{}` is a valid
/// options file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Fold comparisons whose operands are both constants. When off, such
    /// comparisons become runtime tests; duplicate cases are still rejected.
    pub fold_constants: bool,
    /// Link 0/1/2-test dispatch steps as dedicated closures.
    pub specialize_dispatch: bool,
    /// Emit a `trace!` event for every executed step.
    pub trace_execution: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            fold_constants: true,
            specialize_dispatch: true,
            trace_execution: false,
        }
    }
}

/// Read a whole file, reporting failures with the path.
pub fn read_text(path: &Path) -> Result<String, AppError> {
    fs::read_to_string(path).map_err(|e| AppError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, AppError> {
    let data = read_text(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

/// Load compile options from a JSON file.
pub fn load(path: &Path) -> Result<CompileOptions, AppError> {
    let options: CompileOptions = read_json(path)?;
    tracing::debug!(path = %path.display(), ?options, "loaded compile options");
    Ok(options)
}
