// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for module loading

fn from_clause(parent: &Option<String>) -> String {
    match parent {
        Some(parent) => format!(" from '{parent}'"),
        None => String::new(),
    }
}

/// Failure of a module load request.
///
/// Every variant names the requested specifier and, when known, the path of
/// the module that requested it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Resolution or read failure
    #[error("Cannot find module '{specifier}'{}", from_clause(.parent))]
    NotFound {
        specifier: String,
        parent: Option<String>,
    },
    /// A data-description module failed to parse
    #[error("Failed to parse module '{specifier}' at {path}{}: {message}", from_clause(.parent))]
    Parse {
        specifier: String,
        parent: Option<String>,
        path: String,
        message: String,
    },
    /// The module body raised, or execution was vetoed
    #[error("Error executing module '{specifier}' at {path}{}: {message}", from_clause(.parent))]
    Execution {
        specifier: String,
        parent: Option<String>,
        path: String,
        message: String,
    },
}

impl ModuleError {
    pub fn not_found(specifier: &str, parent: Option<&str>) -> Self {
        ModuleError::NotFound {
            specifier: specifier.to_string(),
            parent: parent.map(str::to_string),
        }
    }

    /// Stable condition code
    pub fn code(&self) -> &'static str {
        match self {
            ModuleError::NotFound { .. } => "MODULE_NOT_FOUND",
            ModuleError::Parse { .. } => "PARSE_ERROR",
            ModuleError::Execution { .. } => "EXECUTION_ERROR",
        }
    }

    pub fn specifier(&self) -> &str {
        match self {
            ModuleError::NotFound { specifier, .. }
            | ModuleError::Parse { specifier, .. }
            | ModuleError::Execution { specifier, .. } => specifier,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            ModuleError::NotFound { parent, .. }
            | ModuleError::Parse { parent, .. }
            | ModuleError::Execution { parent, .. } => parent.as_deref(),
        }
    }
}

/// Failure reported by a host [`Evaluator`](crate::host::Evaluator)
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The evaluated code raised; carries the thrown message
    #[error("{0}")]
    Thrown(String),
    /// A typed module error raised by a nested load, propagated verbatim
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("dynamic import is not supported by this evaluator")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_specifier_and_parent() {
        let err = ModuleError::not_found("./missing", Some("/src/main.js"));
        assert_eq!(err.to_string(), "Cannot find module './missing' from '/src/main.js'");
        assert_eq!(err.code(), "MODULE_NOT_FOUND");
        assert_eq!(err.parent(), Some("/src/main.js"));

        let err = ModuleError::not_found("lodash", None);
        assert_eq!(err.to_string(), "Cannot find module 'lodash'");
    }

    #[test]
    fn nested_module_errors_stay_typed() {
        let inner = ModuleError::Parse {
            specifier: "./data.json".into(),
            parent: None,
            path: "/data.json".into(),
            message: "EOF while parsing".into(),
        };
        let eval: EvalError = inner.clone().into();
        assert_eq!(eval, EvalError::Module(inner.clone()));
        assert_eq!(eval.to_string(), inner.to_string());
        assert_eq!(inner.code(), "PARSE_ERROR");
    }
}
