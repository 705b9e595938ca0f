// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Module loader: the synchronous `require` dialect and the asynchronous
//! `import` dialect over a shared [`VirtualFs`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::{BoxFuture, FutureExt};
use scriptbox_vfs::{path, VirtualFs};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::ModuleCache;
use crate::config::LoaderConfig;
use crate::ephemeral::{EphemeralGraph, EphemeralStore, GlobalNamespace};
use crate::error::{EvalError, ModuleError};
use crate::exports::{Exports, ModuleRecord};
use crate::host::{Evaluator, ExecutionGate, GateVerdict, ModuleScope, SourceTransform};
use crate::resolver::{ModuleFormat, Resolution, Resolver};
use crate::scan;

/// Extensions whose sources always go through the transform
const TRANSFORMED_EXTENSIONS: &[&str] = &[".ts", ".tsx", ".jsx", ".mts", ".cts"];

const GLOBAL_KEY_PREFIX: &str = "__scriptbox_builtins_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dialect {
    Sync,
    Async,
}

fn is_json(file: &str) -> bool {
    path::extname(file) == ".json"
}

/// Decode module bytes, dropping a byte order mark and blanking a leading
/// `#!` line so line numbers are preserved.
fn decode_source(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(text.as_ref());
    if text.starts_with("#!") {
        match text.find('\n') {
            Some(idx) => text[idx..].to_string(),
            None => String::new(),
        }
    } else {
        text.to_string()
    }
}

/// A `require` bound to the module that performs the request
#[derive(Clone)]
pub struct Require<'a> {
    loader: &'a ModuleLoader,
    parent: String,
}

impl<'a> Require<'a> {
    pub fn new(loader: &'a ModuleLoader, parent: impl Into<String>) -> Self {
        Self {
            loader,
            parent: parent.into(),
        }
    }

    pub fn call(&self, specifier: &str) -> Result<Exports, ModuleError> {
        self.loader.require(specifier, &self.parent)
    }

    /// Resolved path or built-in name, without executing anything
    pub fn resolve(&self, specifier: &str) -> Result<String, ModuleError> {
        self.loader
            .resolve(specifier, &self.parent)
            .map(|resolution| resolution.as_str().to_string())
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }
}

pub struct ModuleLoaderBuilder {
    fs: Arc<VirtualFs>,
    evaluator: Arc<dyn Evaluator>,
    config: LoaderConfig,
    transform: Option<Arc<dyn SourceTransform>>,
    gate: Option<Arc<dyn ExecutionGate>>,
}

impl ModuleLoaderBuilder {
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transform(mut self, transform: impl SourceTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn gate(mut self, gate: impl ExecutionGate + 'static) -> Self {
        self.gate = Some(Arc::new(gate));
        self
    }

    pub fn build(self) -> ModuleLoader {
        ModuleLoader {
            fs: self.fs,
            evaluator: self.evaluator,
            config: self.config,
            transform: self.transform,
            gate: self.gate,
            cache: ModuleCache::new(),
            builtins: RwLock::new(BTreeMap::new()),
            resources: EphemeralStore::new(),
            globals: GlobalNamespace::new(),
            next_graph_id: AtomicU64::new(0),
        }
    }
}

/// Resolves, caches and executes modules stored in a [`VirtualFs`]
pub struct ModuleLoader {
    fs: Arc<VirtualFs>,
    evaluator: Arc<dyn Evaluator>,
    config: LoaderConfig,
    transform: Option<Arc<dyn SourceTransform>>,
    gate: Option<Arc<dyn ExecutionGate>>,
    cache: ModuleCache,
    builtins: RwLock<BTreeMap<String, Exports>>,
    resources: EphemeralStore,
    globals: GlobalNamespace,
    next_graph_id: AtomicU64,
}

impl ModuleLoader {
    pub fn builder(fs: Arc<VirtualFs>, evaluator: Arc<dyn Evaluator>) -> ModuleLoaderBuilder {
        ModuleLoaderBuilder {
            fs,
            evaluator,
            config: LoaderConfig::default(),
            transform: None,
            gate: None,
        }
    }

    pub fn fs(&self) -> &Arc<VirtualFs> {
        &self.fs
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub fn resources(&self) -> &EphemeralStore {
        &self.resources
    }

    pub fn globals(&self) -> &GlobalNamespace {
        &self.globals
    }

    /// Register (or replace) a built-in module
    pub fn register_builtin(&self, name: impl Into<String>, exports: impl Into<Exports>) {
        let name = name.into();
        debug!(name = %name, "registered builtin");
        self.builtins.write().unwrap().insert(name, exports.into());
    }

    pub fn builtin_names(&self) -> Vec<String> {
        self.builtins.read().unwrap().keys().cloned().collect()
    }

    fn builtin(&self, name: &str) -> Option<Exports> {
        self.builtins.read().unwrap().get(name).cloned()
    }

    /// Drop every cached module record; built-ins are kept
    pub fn clear_cache(&self) {
        debug!(entries = self.cache.len(), "clearing module cache");
        self.cache.clear();
    }

    pub fn resolve(&self, specifier: &str, parent: &str) -> Result<Resolution, ModuleError> {
        let builtins = self.builtins.read().unwrap();
        Resolver::new(&self.fs, &self.config).resolve(specifier, parent, &*builtins)
    }

    pub fn module_format(&self, file: &str) -> ModuleFormat {
        Resolver::new(&self.fs, &self.config).module_format(file)
    }

    fn builtin_or_not_found(&self, name: &str, specifier: &str, parent: &str) -> Result<Exports, ModuleError> {
        self.builtin(name)
            .ok_or_else(|| ModuleError::not_found(specifier, Some(parent)))
    }

    /// Load a module in the synchronous dialect.
    ///
    /// A module that is still executing (a cycle) yields its partially
    /// populated exports. A failed body leaves no cache entry behind.
    pub fn require(&self, specifier: &str, parent: &str) -> Result<Exports, ModuleError> {
        let file = match self.resolve(specifier, parent)? {
            Resolution::Builtin(name) => return self.builtin_or_not_found(&name, specifier, parent),
            Resolution::Path(file) => file,
        };

        if let Some(record) = self.cache.get(&file) {
            debug!(path = %file, loaded = record.is_loaded(), "module cache hit");
            return Ok(record.exports());
        }

        let bytes = self.fs.read_file(&file).map_err(|err| {
            debug!(path = %file, %err, "module read failed");
            ModuleError::not_found(specifier, Some(parent))
        })?;

        if is_json(&file) {
            return self.load_json(specifier, parent, &file, &bytes);
        }

        let source = self.prepare_source(&file, &bytes, Dialect::Sync);
        self.check_gate(specifier, Some(parent), &file, &source)?;

        let record = ModuleRecord::new(file.clone());
        self.cache.set(file.clone(), record.clone());
        let scope = ModuleScope {
            exports: record.exports(),
            require: Require::new(self, file.clone()),
            module: record.clone(),
            filename: file.clone(),
            dirname: path::dirname(&file),
        };

        match self.evaluator.evaluate(&source, scope) {
            Ok(()) => {
                record.mark_loaded();
                debug!(path = %file, "module loaded");
                Ok(record.exports())
            }
            Err(err) => {
                self.cache.delete(&file);
                debug!(path = %file, %err, "module execution failed; evicted");
                Err(match err {
                    EvalError::Module(inner) => inner,
                    other => ModuleError::Execution {
                        specifier: specifier.to_string(),
                        parent: Some(parent.to_string()),
                        path: file,
                        message: other.to_string(),
                    },
                })
            }
        }
    }

    fn load_json(&self, specifier: &str, parent: &str, file: &str, bytes: &[u8]) -> Result<Exports, ModuleError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|err| ModuleError::Parse {
            specifier: specifier.to_string(),
            parent: Some(parent.to_string()),
            path: file.to_string(),
            message: err.to_string(),
        })?;
        let record = ModuleRecord::with_exports(file, Exports::from(value), true);
        self.cache.set(file, record.clone());
        debug!(path = %file, "data module loaded");
        Ok(record.exports())
    }

    fn needs_transform(&self, file: &str, source: &str, dialect: Dialect) -> bool {
        if TRANSFORMED_EXTENSIONS.contains(&path::extname(file).as_str()) {
            return true;
        }
        dialect == Dialect::Sync && scan::looks_like_module_syntax(source)
    }

    fn prepare_source(&self, file: &str, bytes: &[u8], dialect: Dialect) -> String {
        let source = decode_source(bytes);
        if !self.needs_transform(file, &source, dialect) {
            return source;
        }
        let Some(transform) = &self.transform else {
            debug!(path = %file, "no source transform configured; using source as-is");
            return source;
        };
        match transform.transform(&source, file) {
            Some(transformed) => {
                debug!(path = %file, ?dialect, "source transformed");
                transformed
            }
            None => source,
        }
    }

    fn check_gate(
        &self,
        specifier: &str,
        parent: Option<&str>,
        file: &str,
        source: &str,
    ) -> Result<(), ModuleError> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        match gate.check(file, source) {
            Some(GateVerdict::Deny { reason }) => {
                warn!(path = %file, %reason, "module execution denied");
                Err(ModuleError::Execution {
                    specifier: specifier.to_string(),
                    parent: parent.map(str::to_string),
                    path: file.to_string(),
                    message: format!("execution denied: {reason}"),
                })
            }
            Some(GateVerdict::Allow) | None => Ok(()),
        }
    }

    /// Load a module in the asynchronous dialect.
    ///
    /// The whole dependency graph is materialized as ephemeral resources
    /// before the root is handed to the evaluator. Any failure falls back to
    /// [`require`](Self::require) for the same specifier.
    pub async fn import(&self, specifier: &str, parent: &str) -> Result<Exports, ModuleError> {
        if !self.config.async_imports || !self.evaluator.supports_dynamic_import() {
            debug!(specifier, "asynchronous dialect unavailable; using require");
            return self.require(specifier, parent);
        }

        let file = match self.resolve(specifier, parent) {
            Ok(Resolution::Builtin(name)) => return self.builtin_or_not_found(&name, specifier, parent),
            Ok(Resolution::Path(file)) => file,
            Err(_) => return self.require(specifier, parent),
        };

        match self.import_through_graph(&file).await {
            Ok(namespace) => {
                debug!(path = %file, "module imported");
                Ok(namespace)
            }
            Err(reason) => {
                warn!(specifier, parent, %reason, "asynchronous import failed; falling back to require");
                self.require(specifier, parent)
            }
        }
    }

    /// Materialize the graph rooted at `file` and hand the root to the
    /// evaluator. The graph, and every resource it created, is released
    /// when this future completes or is dropped.
    async fn import_through_graph(&self, file: &str) -> Result<Exports, String> {
        let global_key = format!(
            "{GLOBAL_KEY_PREFIX}{}",
            self.next_graph_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        let builtins = self.builtins.read().unwrap().clone();
        let mut graph = EphemeralGraph::new(&self.resources, &self.globals, global_key, builtins);
        let url = match self.materialize(&mut graph, file).await {
            Ok(Some(url)) => url,
            Ok(None) => return Err(format!("{file} is already being materialized")),
            Err(err) => return Err(err.to_string()),
        };
        let namespace = self.evaluator.dynamic_import(&url, graph.host()).await;
        namespace.map_err(|err| err.to_string())
    }

    /// Materialize `file` and its dependencies depth-first. Returns `None`
    /// when `file` is already in progress further up the graph. Every
    /// non-data file passes the execution gate before anything is handed
    /// to the evaluator.
    fn materialize<'s, 'g: 's>(
        &'s self,
        graph: &'s mut EphemeralGraph<'g>,
        file: &'s str,
    ) -> BoxFuture<'s, Result<Option<String>, ModuleError>> {
        async move {
            if let Some(url) = graph.url_for(file) {
                return Ok(Some(url));
            }
            if !graph.begin(file) {
                debug!(path = %file, "cycle while materializing; specifier left as-is");
                return Ok(None);
            }

            let bytes = self
                .fs
                .read_file(file)
                .map_err(|_| ModuleError::not_found(file, None))?;
            let source = if is_json(file) {
                let value: Value = serde_json::from_slice(&bytes).map_err(|err| ModuleError::Parse {
                    specifier: file.to_string(),
                    parent: None,
                    path: file.to_string(),
                    message: err.to_string(),
                })?;
                format!("export default {value};")
            } else {
                let source = self.prepare_source(file, &bytes, Dialect::Async);
                self.check_gate(file, None, file, &source)?;
                source
            };

            let refs = scan::scan_specifiers(&source);
            let mut replacements: HashMap<String, String> = HashMap::new();
            for specifier in scan::unique_specifiers(&refs) {
                let replacement = match self.resolve(specifier, file)? {
                    Resolution::Builtin(name) => Some(graph.builtin_url(&name)),
                    Resolution::Path(dependency) => self.materialize(&mut *graph, &dependency).await?,
                };
                if let Some(url) = replacement {
                    replacements.insert(specifier.to_string(), url);
                }
            }

            let rewritten = scan::rewrite(&source, &refs, |specifier| replacements.get(specifier).cloned());
            Ok(Some(graph.finish(file, rewritten)))
        }
        .boxed()
    }

    /// Load with the dialect suggested by the target's format
    pub async fn load(&self, specifier: &str, parent: &str) -> Result<Exports, ModuleError> {
        match self.resolve(specifier, parent) {
            Ok(Resolution::Path(file)) if self.module_format(&file) == ModuleFormat::EsModule => {
                self.import(specifier, parent).await
            }
            _ => self.require(specifier, parent),
        }
    }
}
