// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reference host implementations for exercising the loader without a
//! script engine.
//!
//! [`LineEvaluator`] understands one statement per line (or `;`-separated
//! statements), enough to express exports, requires, imports, throws and
//! observable side effects:
//!
//! ```text
//! // comment
//! const dep = require('./dep')        let / var work too
//! exports.name = dep.value            module.exports = { "json": true }
//! log('side effect')                  throw new Error('boom')
//! import * as ns from 'ephemeral:1'   import value from 'ephemeral:2'
//! export const answer = 42            export default ns.answer
//! ```
//!
//! Expressions are string, number, boolean, null or JSON literals,
//! identifiers with `.member` chains, `require('x')`, `require.resolve('x')`
//! and `globalThis["key"]["name"]`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scriptbox_vfs::{path, VirtualFs};
use serde_json::Value;

use crate::ephemeral::is_ephemeral_url;
use crate::error::EvalError;
use crate::exports::Exports;
use crate::host::{Evaluator, ImportHost, ModuleScope, SourceTransform};

/// Build a filesystem holding `files`, creating parent directories
pub fn fs_with_files(files: &[(&str, &str)]) -> Arc<VirtualFs> {
    let fs = VirtualFs::default();
    for (file, content) in files {
        fs.mkdir(&path::dirname(file), true)
            .unwrap_or_else(|err| panic!("mkdir for {file}: {err}"));
        fs.write_file(file, content)
            .unwrap_or_else(|err| panic!("write {file}: {err}"));
    }
    Arc::new(fs)
}

#[derive(Clone, Debug)]
enum Binding {
    Module(Exports),
    Value(Value),
}

impl Binding {
    fn member(&self, key: &str) -> Binding {
        let value = match self {
            Binding::Module(exports) => exports.get(key),
            Binding::Value(value) => value.get(key).cloned(),
        };
        Binding::Value(value.unwrap_or(Value::Null))
    }

    fn into_value(self) -> Value {
        match self {
            Binding::Module(exports) => exports.to_value(),
            Binding::Value(value) => value,
        }
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn thrown(message: impl Into<String>) -> EvalError {
    EvalError::Thrown(message.into())
}

fn string_literal(text: &str) -> Option<&str> {
    let text = text.trim();
    let quote = text.chars().next()?;
    if (quote == '\'' || quote == '"') && text.len() >= 2 && text.ends_with(quote) {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Split source into statements on newlines and on `;` outside quotes
fn statements(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in source.lines() {
        let mut current = String::new();
        let mut quote: Option<char> = None;
        for c in line.chars() {
            match (quote, c) {
                (None, '\'' | '"') => {
                    quote = Some(c);
                    current.push(c);
                }
                (Some(q), c) if c == q => {
                    quote = None;
                    current.push(c);
                }
                (None, ';') => out.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        out.push(current);
    }
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.starts_with("//"))
        .collect()
}

/// Parsed `import` statement: (local binding, specifier)
enum ImportStatement<'s> {
    Namespace(&'s str, &'s str),
    Default(&'s str, &'s str),
    SideEffect(&'s str),
}

fn parse_import(statement: &str) -> Option<ImportStatement<'_>> {
    let rest = statement.strip_prefix("import")?;
    if let Some(specifier) = string_literal(rest) {
        return Some(ImportStatement::SideEffect(specifier));
    }
    let (clause, source) = rest.split_once(" from ")?;
    let specifier = string_literal(source)?;
    let clause = clause.trim();
    if let Some(name) = clause.strip_prefix("* as ") {
        return Some(ImportStatement::Namespace(name.trim(), specifier));
    }
    is_identifier(clause).then_some(ImportStatement::Default(clause, specifier))
}

enum Context<'c> {
    Script(&'c ModuleScope<'c>),
    Module { host: ImportHost<'c>, namespace: Exports },
}

struct Frame<'c> {
    context: Context<'c>,
    env: HashMap<String, Binding>,
}

impl Frame<'_> {
    fn is_module(&self) -> bool {
        matches!(self.context, Context::Module { .. })
    }

    fn script(&self, what: &str) -> Result<&ModuleScope<'_>, EvalError> {
        match &self.context {
            Context::Script(scope) => Ok(*scope),
            Context::Module { .. } => Err(thrown(format!("ReferenceError: {what} is not defined"))),
        }
    }

    fn eval(&self, expr: &str) -> Result<Binding, EvalError> {
        let expr = expr.trim();
        if let Some(text) = string_literal(expr) {
            return Ok(Binding::Value(Value::String(text.to_string())));
        }
        if expr.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '{' || c == '[')
            || matches!(expr, "true" | "false" | "null")
        {
            return serde_json::from_str(expr)
                .map(Binding::Value)
                .map_err(|err| thrown(format!("SyntaxError: {expr}: {err}")));
        }
        if let Some(rest) = expr.strip_prefix("require.resolve(") {
            let specifier = rest
                .strip_suffix(')')
                .and_then(string_literal)
                .ok_or_else(|| thrown(format!("SyntaxError: {expr}")))?;
            let resolved = self.script("require")?.require.resolve(specifier)?;
            return Ok(Binding::Value(Value::String(resolved)));
        }
        if let Some(rest) = expr.strip_prefix("require(") {
            let (argument, members) = rest
                .split_once(')')
                .ok_or_else(|| thrown(format!("SyntaxError: {expr}")))?;
            let specifier =
                string_literal(argument).ok_or_else(|| thrown(format!("SyntaxError: {expr}")))?;
            let exports = self.script("require")?.require.call(specifier)?;
            return Self::members(Binding::Module(exports), members);
        }
        if let Some(rest) = expr.strip_prefix("globalThis[") {
            return self.global(rest);
        }
        let (head, chain) = expr.split_once('.').unwrap_or((expr, ""));
        let (base, chain) = self.identifier(head, chain)?;
        Self::members(base, chain)
    }

    /// Look up an identifier; `module` consumes the member that follows it
    fn identifier<'e>(&self, name: &str, chain: &'e str) -> Result<(Binding, &'e str), EvalError> {
        if let Some(binding) = self.env.get(name) {
            return Ok((binding.clone(), chain));
        }
        if let Context::Script(scope) = &self.context {
            match name {
                "exports" => return Ok((Binding::Module(scope.exports.clone()), chain)),
                "__filename" => return Ok((Binding::Value(scope.filename.clone().into()), chain)),
                "__dirname" => return Ok((Binding::Value(scope.dirname.clone().into()), chain)),
                "module" => {
                    let (first, rest) = chain.split_once('.').unwrap_or((chain, ""));
                    let binding = match first {
                        "exports" => Binding::Module(scope.module.exports()),
                        "id" => Binding::Value(scope.module.id().into()),
                        "loaded" => Binding::Value(scope.module.is_loaded().into()),
                        _ => Binding::Value(Value::Null),
                    };
                    return Ok((binding, rest));
                }
                _ => {}
            }
        }
        Err(thrown(format!("ReferenceError: {name} is not defined")))
    }

    fn members(mut binding: Binding, chain: &str) -> Result<Binding, EvalError> {
        for key in chain.split('.').filter(|k| !k.is_empty()) {
            if !is_identifier(key) {
                return Err(thrown(format!("SyntaxError: unexpected member {key}")));
            }
            binding = binding.member(key);
        }
        Ok(binding)
    }

    /// `globalThis["key"]["name"]`, given the text after `globalThis[`
    fn global(&self, rest: &str) -> Result<Binding, EvalError> {
        let Context::Module { host, .. } = &self.context else {
            return Err(thrown("TypeError: globalThis is not available here"));
        };
        let parsed = rest.split_once(']').and_then(|(key, tail)| {
            let name = tail.strip_prefix('[')?.strip_suffix(']')?;
            Some((string_literal(key)?, string_literal(name)?))
        });
        let (key, name) = parsed.ok_or_else(|| thrown(format!("SyntaxError: globalThis[{rest}")))?;
        host.globals
            .get(key, name)
            .map(Binding::Module)
            .ok_or_else(|| thrown(format!("TypeError: Cannot read properties of undefined (reading '{name}')")))
    }

    fn exec(&mut self, statement: &str, log: &Mutex<Vec<String>>) -> Result<(), EvalError> {
        if let Some(inner) = statement.strip_prefix("log(").and_then(|s| s.strip_suffix(')')) {
            let value = self.eval(inner)?.into_value();
            log.lock().unwrap().push(display(&value));
            return Ok(());
        }
        if let Some(rest) = statement.strip_prefix("throw ") {
            let inner = rest
                .trim()
                .strip_prefix("new Error(")
                .and_then(|s| s.strip_suffix(')'))
                .unwrap_or(rest);
            let value = self.eval(inner)?.into_value();
            return Err(thrown(display(&value)));
        }
        for keyword in ["const ", "let ", "var "] {
            if let Some(rest) = statement.strip_prefix(keyword) {
                let (name, expr) = rest
                    .split_once('=')
                    .ok_or_else(|| thrown(format!("SyntaxError: {statement}")))?;
                let binding = self.eval(expr)?;
                self.env.insert(name.trim().to_string(), binding);
                return Ok(());
            }
        }

        let is_module_syntax = statement.starts_with("import ")
            || statement.starts_with("import{")
            || statement.starts_with("export ");
        if is_module_syntax && !self.is_module() {
            return Err(thrown("SyntaxError: Cannot use import statement outside a module"));
        }
        if let Context::Module { namespace, .. } = &self.context {
            let namespace = namespace.clone();
            if parse_import(statement).is_some() {
                // hoisted and already executed
                return Ok(());
            }
            if let Some(rest) = statement.strip_prefix("export const ") {
                let (name, expr) = rest
                    .split_once('=')
                    .ok_or_else(|| thrown(format!("SyntaxError: {statement}")))?;
                let name = name.trim().to_string();
                let binding = self.eval(expr)?;
                namespace.set(name.clone(), binding.clone().into_value());
                self.env.insert(name, binding);
                return Ok(());
            }
            if let Some(expr) = statement.strip_prefix("export default ") {
                namespace.set("default", self.eval(expr)?.into_value());
                return Ok(());
            }
        }

        if let Some((target, expr)) = statement.split_once('=') {
            let target = target.trim();
            if target == "module.exports" {
                let value = self.eval(expr)?.into_value();
                self.script("module")?.module.exports().replace(value);
                return Ok(());
            }
            let key = target
                .strip_prefix("exports.")
                .or_else(|| target.strip_prefix("module.exports."));
            if let Some(key) = key.filter(|k| is_identifier(k)) {
                let value = self.eval(expr)?.into_value();
                self.script("exports")?.exports.set(key, value);
                return Ok(());
            }
            return Err(thrown(format!("SyntaxError: unsupported assignment: {statement}")));
        }

        // bare expression statement, e.g. `require('./side-effect')`
        self.eval(statement).map(|_| ())
    }
}

/// Line-oriented reference [`Evaluator`]
#[derive(Debug, Default)]
pub struct LineEvaluator {
    dynamic_import: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl LineEvaluator {
    /// An evaluator for the synchronous dialect only
    pub fn new() -> Self {
        Self::default()
    }

    /// An evaluator that can also load ephemeral module graphs
    pub fn with_dynamic_import() -> Self {
        Self {
            dynamic_import: true,
            ..Self::default()
        }
    }

    /// Everything passed to `log(...)` so far, in order
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn run_module(
        &self,
        url: &str,
        host: ImportHost<'_>,
        loaded: &mut HashMap<String, Exports>,
    ) -> Result<Exports, EvalError> {
        if let Some(namespace) = loaded.get(url) {
            return Ok(namespace.clone());
        }
        let source = host
            .resources
            .get(url)
            .ok_or_else(|| thrown(format!("TypeError: Failed to fetch dynamically imported module: {url}")))?;
        let namespace = Exports::new();
        loaded.insert(url.to_string(), namespace.clone());

        let statements = statements(&source);
        let mut frame = Frame {
            context: Context::Module {
                host,
                namespace: namespace.clone(),
            },
            env: HashMap::new(),
        };
        for statement in &statements {
            let Some(import) = parse_import(statement) else {
                continue;
            };
            let specifier = match import {
                ImportStatement::Namespace(_, s) | ImportStatement::Default(_, s) | ImportStatement::SideEffect(s) => s,
            };
            if !is_ephemeral_url(specifier) {
                return Err(thrown(format!(
                    "TypeError: Failed to resolve module specifier \"{specifier}\""
                )));
            }
            let dependency = self.run_module(specifier, host, loaded)?;
            match import {
                ImportStatement::Namespace(name, _) => {
                    frame.env.insert(name.to_string(), Binding::Module(dependency));
                }
                ImportStatement::Default(name, _) => {
                    let value = dependency.get("default").unwrap_or(Value::Null);
                    frame.env.insert(name.to_string(), Binding::Value(value));
                }
                ImportStatement::SideEffect(_) => {}
            }
        }
        for statement in &statements {
            frame.exec(statement, &self.log)?;
        }
        Ok(namespace)
    }
}

#[async_trait]
impl Evaluator for LineEvaluator {
    fn evaluate(&self, source: &str, scope: ModuleScope<'_>) -> Result<(), EvalError> {
        let mut frame = Frame {
            context: Context::Script(&scope),
            env: HashMap::new(),
        };
        for statement in statements(source) {
            frame.exec(&statement, &self.log)?;
        }
        Ok(())
    }

    fn supports_dynamic_import(&self) -> bool {
        self.dynamic_import
    }

    async fn dynamic_import(&self, url: &str, host: ImportHost<'_>) -> Result<Exports, EvalError> {
        self.run_module(url, host, &mut HashMap::new())
    }
}

/// Rewrites module-dialect statements into their `require`/`exports`
/// equivalents, statement by statement
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleSyntaxTransform;

impl SourceTransform for ModuleSyntaxTransform {
    fn transform(&self, source: &str, _path: &str) -> Option<String> {
        let mut changed = false;
        let lines: Vec<String> = source
            .lines()
            .map(|line| {
                let rewritten = rewrite_module_line(line);
                changed |= rewritten.is_some();
                rewritten.unwrap_or_else(|| line.to_string())
            })
            .collect();
        changed.then(|| lines.join("\n"))
    }
}

fn rewrite_module_line(line: &str) -> Option<String> {
    let statement = line.trim().trim_end_matches(';');
    if let Some(import) = parse_import(statement) {
        return Some(match import {
            ImportStatement::Namespace(name, s) | ImportStatement::Default(name, s) => {
                format!("const {name} = require('{s}')")
            }
            ImportStatement::SideEffect(s) => format!("require('{s}')"),
        });
    }
    if let Some(rest) = statement.strip_prefix("export const ") {
        let (name, expr) = rest.split_once('=')?;
        let name = name.trim();
        return Some(format!("const {name} = {}; exports.{name} = {name}", expr.trim()));
    }
    statement
        .strip_prefix("export default ")
        .map(|expr| format!("exports.default = {}", expr.trim()))
}
