// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Module resolution, caching and execution for the scriptbox runtime.
//!
//! [`ModuleLoader`] resolves specifiers against a [`scriptbox_vfs::VirtualFs`],
//! caches one [`ModuleRecord`] per absolute path and runs module bodies
//! through a host-supplied [`Evaluator`]. Two dialects are offered: the
//! synchronous `require` and the asynchronous `import`, which materializes a
//! whole dependency graph as ephemeral resources and degrades to `require`
//! whenever that is not possible.

pub mod cache;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod exports;
pub mod host;
pub mod loader;
pub mod resolver;
pub mod scan;
pub mod testing;

pub use cache::ModuleCache;
pub use config::LoaderConfig;
pub use ephemeral::{EphemeralGraph, EphemeralStore, GlobalNamespace};
pub use error::{EvalError, ModuleError};
pub use exports::{Exports, ModuleRecord};
pub use host::{Evaluator, ExecutionGate, GateVerdict, ImportHost, ModuleScope, SourceTransform};
pub use loader::{ModuleLoader, ModuleLoaderBuilder, Require};
pub use resolver::{module_format, resolve, BuiltinNames, ModuleFormat, Resolution, Resolver};
