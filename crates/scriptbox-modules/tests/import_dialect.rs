// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tests for the asynchronous `import` dialect.
//!
//! Tests cover graph materialization order, built-in shims, resource
//! cleanup and every path that degrades to the synchronous dialect.

use async_trait::async_trait;
use scriptbox_modules::testing::{fs_with_files, LineEvaluator, ModuleSyntaxTransform};
use scriptbox_modules::{
    EvalError, Evaluator, ExecutionGate, Exports, GateVerdict, ImportHost, LoaderConfig, ModuleLoader, ModuleScope,
};
use serde_json::json;
use std::sync::Arc;

fn async_loader(files: &[(&str, &str)]) -> (ModuleLoader, Arc<LineEvaluator>) {
    let evaluator = Arc::new(LineEvaluator::with_dynamic_import());
    let loader = ModuleLoader::builder(fs_with_files(files), evaluator.clone())
        .transform(ModuleSyntaxTransform)
        .build();
    (loader, evaluator)
}

struct DenyPaths(&'static [&'static str]);

impl ExecutionGate for DenyPaths {
    fn check(&self, path: &str, _source: &str) -> Option<GateVerdict> {
        self.0.contains(&path).then(|| GateVerdict::Deny {
            reason: format!("{path} is blocked"),
        })
    }
}

/// Host whose dynamic import never settles
struct StalledHost;

#[async_trait]
impl Evaluator for StalledHost {
    fn evaluate(&self, _source: &str, _scope: ModuleScope<'_>) -> Result<(), EvalError> {
        Ok(())
    }

    fn supports_dynamic_import(&self) -> bool {
        true
    }

    async fn dynamic_import(&self, _url: &str, _host: ImportHost<'_>) -> Result<Exports, EvalError> {
        futures::future::pending().await
    }
}

fn assert_released(loader: &ModuleLoader) {
    assert_eq!(loader.resources().live_count(), 0, "ephemeral resources leaked");
    assert!(loader.globals().is_empty(), "global namespace entry leaked");
}

/// Test that dependencies run depth-first, once each, before the root
#[tokio::test]
async fn test_dependencies_run_before_root() {
    let (loader, evaluator) = async_loader(&[
        (
            "/app/main.mjs",
            "import * as a from './a.mjs'\nimport * as b from './b.mjs'\nlog('main')\nexport const total = a.value",
        ),
        (
            "/app/a.mjs",
            "import * as shared from './shared.mjs'\nlog('a')\nexport const value = shared.base",
        ),
        ("/app/b.mjs", "import './shared.mjs'\nlog('b')"),
        ("/app/shared.mjs", "log('shared')\nexport const base = 1"),
    ]);

    let namespace = loader.import("./app/main.mjs", "/index.js").await.unwrap();
    assert_eq!(namespace.get("total"), Some(json!(1)));
    assert_eq!(evaluator.log(), vec!["shared", "a", "b", "main"]);
    // nothing went through the synchronous dialect
    assert!(loader.cache().is_empty());
    assert_released(&loader);
}

/// Test that built-ins and data modules are reachable from ephemeral graphs
#[tokio::test]
async fn test_builtins_and_json_in_graph() {
    let (loader, _) = async_loader(&[
        (
            "/main.mjs",
            "import fs from 'fs'\nimport * as path from 'node:path'\nimport data from './data.json'\nexport const kind = fs.kind\nexport const sep = path.default.sep\nexport const name = data.name",
        ),
        ("/data.json", r#"{"name":"test","version":"1.0.0"}"#),
    ]);
    loader.register_builtin("fs", json!({ "kind": "virtual" }));
    loader.register_builtin("path", json!({ "sep": "/" }));

    let namespace = loader.import("/main.mjs", "/").await.unwrap();
    assert_eq!(namespace.get("kind"), Some(json!("virtual")));
    assert_eq!(namespace.get("sep"), Some(json!("/")));
    assert_eq!(namespace.get("name"), Some(json!("test")));
    assert_released(&loader);
}

/// Test that importing a built-in returns its exports directly
#[tokio::test]
async fn test_import_builtin_directly() {
    let (loader, _) = async_loader(&[]);
    loader.register_builtin("os", json!({ "platform": "scriptbox" }));
    let os = loader.import("node:os", "/main.mjs").await.unwrap();
    assert_eq!(os.get("platform"), Some(json!("scriptbox")));
    assert_eq!(loader.resources().live_count(), 0);
}

/// Test that a cycle cannot be materialized and degrades to `require`
#[tokio::test]
async fn test_cycle_falls_back_to_require() {
    let (loader, _) = async_loader(&[
        ("/c1.mjs", "import * as c2 from './c2.mjs'\nexport const name = 'c1'"),
        (
            "/c2.mjs",
            "import * as c1 from './c1.mjs'\nexport const name = 'c2'\nexport const peer = c1.name",
        ),
    ]);

    let namespace = loader.import("./c1.mjs", "/main.js").await.unwrap();
    assert_eq!(namespace.get("name"), Some(json!("c1")));
    assert!(loader.cache().has("/c1.mjs"));
    let c2 = loader.cache().get("/c2.mjs").unwrap().exports();
    assert_eq!(c2.get("peer"), Some(json!(null)));
    assert_released(&loader);
}

/// Test that an unresolvable dependency falls back and surfaces MODULE_NOT_FOUND
#[tokio::test]
async fn test_missing_dependency_reports_not_found() {
    let (loader, _) = async_loader(&[("/root.mjs", "import * as gone from './gone.mjs'")]);
    let err = loader.import("/root.mjs", "/").await.unwrap_err();
    assert_eq!(err.code(), "MODULE_NOT_FOUND");
    assert_eq!(err.specifier(), "./gone.mjs");
    assert_eq!(err.parent(), Some("/root.mjs"));
    assert_released(&loader);
}

/// Test that a throwing root falls back and reports EXECUTION_ERROR
#[tokio::test]
async fn test_throwing_root_falls_back() {
    let (loader, evaluator) = async_loader(&[("/bad.mjs", "log('ran')\nthrow 'nope'")]);
    let err = loader.import("/bad.mjs", "/").await.unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
    // once through the ephemeral graph, once through require
    assert_eq!(evaluator.log(), vec!["ran", "ran"]);
    assert!(loader.cache().is_empty());
    assert_released(&loader);
}

/// Test that evaluators without dynamic import use the synchronous dialect
#[tokio::test]
async fn test_unsupported_evaluator_uses_require() {
    let fs = fs_with_files(&[("/lib.js", "exports.sync = true"), ("/esm.mjs", "export const x = 1")]);
    let loader = ModuleLoader::builder(fs, Arc::new(LineEvaluator::new())).build();

    let lib = loader.import("./lib.js", "/main.js").await.unwrap();
    assert_eq!(lib.get("sync"), Some(json!(true)));
    assert!(loader.cache().has("/lib.js"));

    // without a transform, module syntax cannot run in the synchronous dialect
    let err = loader.import("./esm.mjs", "/main.js").await.unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
}

/// Test that disabling async imports in the config forces `require`
#[tokio::test]
async fn test_async_imports_disabled() {
    let config = LoaderConfig {
        async_imports: false,
        ..LoaderConfig::default()
    };
    let fs = fs_with_files(&[("/m.mjs", "export const x = 1")]);
    let loader = ModuleLoader::builder(fs, Arc::new(LineEvaluator::with_dynamic_import()))
        .transform(ModuleSyntaxTransform)
        .config(config)
        .build();
    let exports = loader.import("/m.mjs", "/").await.unwrap();
    assert_eq!(exports.get("x"), Some(json!(1)));
    assert!(loader.cache().has("/m.mjs"));
}

/// Test that `load` picks the dialect from the detected format
#[tokio::test]
async fn test_load_dispatches_on_format() {
    let (loader, _) = async_loader(&[
        ("/esm/package.json", r#"{"type": "module"}"#),
        ("/esm/main.js", "export const dialect = 'module'"),
        ("/cjs/main.js", "exports.dialect = 'commonjs'"),
    ]);

    let esm = loader.load("./esm/main.js", "/index.js").await.unwrap();
    assert_eq!(esm.get("dialect"), Some(json!("module")));
    assert!(!loader.cache().has("/esm/main.js"));

    let cjs = loader.load("./cjs/main.js", "/index.js").await.unwrap();
    assert_eq!(cjs.get("dialect"), Some(json!("commonjs")));
    assert!(loader.cache().has("/cjs/main.js"));
}

/// Test that the execution gate vetoes modules reached through the graph
#[tokio::test]
async fn test_gate_denies_graph_dependency() {
    let evaluator = Arc::new(LineEvaluator::with_dynamic_import());
    let fs = fs_with_files(&[
        (
            "/main.mjs",
            "import * as evil from './evil.mjs'\nlog('main')\nexport const x = evil.x",
        ),
        ("/evil.mjs", "log('evil ran')\nexport const x = 1"),
    ]);
    let loader = ModuleLoader::builder(fs, evaluator.clone())
        .transform(ModuleSyntaxTransform)
        .gate(DenyPaths(&["/evil.mjs"]))
        .build();

    let err = loader.import("/main.mjs", "/").await.unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
    assert!(err.to_string().contains("execution denied: /evil.mjs is blocked"));
    assert!(evaluator.log().is_empty(), "vetoed graph ran: {:?}", evaluator.log());
    assert!(loader.cache().is_empty());
    assert_released(&loader);
}

/// Test that a vetoed root never runs through either async entry point
#[tokio::test]
async fn test_gate_denies_graph_root() {
    let evaluator = Arc::new(LineEvaluator::with_dynamic_import());
    let fs = fs_with_files(&[("/evil.mjs", "log('evil ran')\nexport const x = 1")]);
    let loader = ModuleLoader::builder(fs, evaluator.clone())
        .transform(ModuleSyntaxTransform)
        .gate(DenyPaths(&["/evil.mjs"]))
        .build();

    let err = loader.import("./evil.mjs", "/main.js").await.unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
    let err = loader.load("./evil.mjs", "/main.js").await.unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
    assert!(evaluator.log().is_empty(), "vetoed root ran: {:?}", evaluator.log());
    assert_released(&loader);
}

/// Test that abandoning an in-flight import releases its resources
#[tokio::test]
async fn test_abandoned_import_releases_resources() {
    let fs = fs_with_files(&[
        ("/main.mjs", "import * as dep from './dep.mjs'"),
        ("/dep.mjs", "export const x = 1"),
    ]);
    let loader = ModuleLoader::builder(fs, Arc::new(StalledHost)).build();

    let mut in_flight = Box::pin(loader.import("/main.mjs", "/"));
    assert!(futures::poll!(in_flight.as_mut()).is_pending());
    assert_eq!(loader.resources().live_count(), 2);
    assert_eq!(loader.globals().len(), 1);

    drop(in_flight);
    assert_released(&loader);
}
