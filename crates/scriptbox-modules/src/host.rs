// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capabilities the embedding host supplies to the loader

use async_trait::async_trait;

use crate::ephemeral::{EphemeralStore, GlobalNamespace};
use crate::error::EvalError;
use crate::exports::{Exports, ModuleRecord};
use crate::loader::Require;

/// Bindings visible to a module body while it runs
pub struct ModuleScope<'a> {
    pub exports: Exports,
    pub require: Require<'a>,
    pub module: ModuleRecord,
    pub filename: String,
    pub dirname: String,
}

/// What a host needs to load ephemeral module graphs
#[derive(Clone, Copy)]
pub struct ImportHost<'a> {
    pub resources: &'a EphemeralStore,
    pub globals: &'a GlobalNamespace,
}

/// Script engine adapter.
///
/// `evaluate` runs a module body to completion in the synchronous dialect.
/// Hosts that can load modules from ephemeral URLs also implement
/// `dynamic_import`; the loader uses it only when `supports_dynamic_import`
/// returns true.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, source: &str, scope: ModuleScope<'_>) -> Result<(), EvalError>;

    fn supports_dynamic_import(&self) -> bool {
        false
    }

    async fn dynamic_import(&self, url: &str, host: ImportHost<'_>) -> Result<Exports, EvalError> {
        let _ = (url, host);
        Err(EvalError::Unsupported)
    }
}

/// Source-to-source transform for TypeScript, JSX and module syntax.
/// `None` leaves the source unchanged.
#[cfg_attr(test, mockall::automock)]
pub trait SourceTransform: Send + Sync {
    fn transform(&self, source: &str, path: &str) -> Option<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateVerdict {
    Allow,
    Deny { reason: String },
}

/// Pre-execution policy hook. `None` means allowed.
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionGate: Send + Sync {
    fn check(&self, path: &str, source: &str) -> Option<GateVerdict>;
}
