// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Specifier resolution and module format detection

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use scriptbox_vfs::{path, VirtualFs};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::LoaderConfig;
use crate::error::ModuleError;

/// Prefix that may address a registered built-in
pub const BUILTIN_PREFIX: &str = "node:";

/// Outcome of resolving a specifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Absolute path of an existing file
    Path(String),
    /// Name of a registered built-in
    Builtin(String),
}

impl Resolution {
    /// The path or built-in name
    pub fn as_str(&self) -> &str {
        match self {
            Resolution::Path(path) => path,
            Resolution::Builtin(name) => name,
        }
    }
}

/// Module dialect of a file, as far as it can be told without parsing it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleFormat {
    CommonJs,
    EsModule,
    Json,
}

impl std::fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModuleFormat::CommonJs => "commonjs",
            ModuleFormat::EsModule => "module",
            ModuleFormat::Json => "json",
        };
        f.write_str(name)
    }
}

/// Membership test over the set of registered built-in names
pub trait BuiltinNames {
    fn contains_builtin(&self, name: &str) -> bool;
}

impl<V> BuiltinNames for BTreeMap<String, V> {
    fn contains_builtin(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

impl<V> BuiltinNames for HashMap<String, V> {
    fn contains_builtin(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

impl BuiltinNames for BTreeSet<String> {
    fn contains_builtin(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl BuiltinNames for HashSet<String> {
    fn contains_builtin(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl BuiltinNames for [&str] {
    fn contains_builtin(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

fn is_path_like(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || path::is_absolute(specifier)
}

/// Resolve `specifier` as requested by the module at `parent`.
///
/// Built-ins win over files. Relative and absolute specifiers are probed
/// against the parent's directory; bare specifiers search the dependency
/// directory of every ancestor, nearest first.
pub fn resolve<B: BuiltinNames + ?Sized>(
    specifier: &str,
    parent: &str,
    fs: &VirtualFs,
    builtins: &B,
    config: &LoaderConfig,
) -> Result<Resolution, ModuleError> {
    Resolver::new(fs, config).resolve(specifier, parent, builtins)
}

/// Detect the module format of `file`
pub fn module_format(file: &str, fs: &VirtualFs, config: &LoaderConfig) -> ModuleFormat {
    Resolver::new(fs, config).module_format(file)
}

/// Filesystem probing bound to one filesystem and configuration
pub struct Resolver<'a> {
    fs: &'a VirtualFs,
    config: &'a LoaderConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(fs: &'a VirtualFs, config: &'a LoaderConfig) -> Self {
        Self { fs, config }
    }

    pub fn resolve<B: BuiltinNames + ?Sized>(
        &self,
        specifier: &str,
        parent: &str,
        builtins: &B,
    ) -> Result<Resolution, ModuleError> {
        if builtins.contains_builtin(specifier) {
            return Ok(Resolution::Builtin(specifier.to_string()));
        }
        if let Some(name) = specifier.strip_prefix(BUILTIN_PREFIX) {
            if builtins.contains_builtin(name) {
                return Ok(Resolution::Builtin(name.to_string()));
            }
        }

        let found = if specifier.is_empty() {
            None
        } else if is_path_like(specifier) {
            let base = path::dirname(parent);
            let target = path::resolve(&base, specifier);
            self.probe(&target, specifier.ends_with('/'))
        } else {
            self.probe_dependency_dirs(specifier, parent)
        };

        match found {
            Some(found) => {
                debug!(specifier, parent, resolved = %found, "resolved module");
                Ok(Resolution::Path(found))
            }
            None => Err(ModuleError::not_found(specifier, Some(parent))),
        }
    }

    fn probe_dependency_dirs(&self, specifier: &str, parent: &str) -> Option<String> {
        let mut dir = path::dirname(parent);
        loop {
            // `<deps>/<deps>` is never searched
            if path::basename(&dir, None) != self.config.dependency_dir {
                let candidate = path::join(&[dir.as_str(), self.config.dependency_dir.as_str(), specifier]);
                if let Some(found) = self.probe(&candidate, false) {
                    return Some(found);
                }
            }
            if dir == "/" {
                return None;
            }
            dir = path::dirname(&dir);
        }
    }

    /// Probe `target` as a file, then as a directory. A trailing slash on
    /// the specifier restricts the probe to directories.
    fn probe(&self, target: &str, directory_only: bool) -> Option<String> {
        if !directory_only {
            if let Some(found) = self.probe_file(target) {
                return Some(found);
            }
        }
        self.probe_directory(target)
    }

    fn probe_file(&self, target: &str) -> Option<String> {
        if self.is_file(target) {
            return Some(target.to_string());
        }
        self.config
            .extensions
            .iter()
            .map(|ext| format!("{target}{ext}"))
            .find(|candidate| self.is_file(candidate))
    }

    fn probe_directory(&self, dir: &str) -> Option<String> {
        if !self.is_directory(dir) {
            return None;
        }
        if let Some(main) = self.descriptor_main(dir) {
            let main_path = path::resolve(dir, &main);
            if let Some(found) = self.probe_file(&main_path).or_else(|| self.probe_index(&main_path)) {
                return Some(found);
            }
            trace!(dir, main = %main, "descriptor main entry did not resolve");
        }
        self.probe_index(dir)
    }

    fn probe_index(&self, dir: &str) -> Option<String> {
        if !self.is_directory(dir) {
            return None;
        }
        let base = path::join(&[dir, self.config.index_name.as_str()]);
        self.config
            .extensions
            .iter()
            .map(|ext| format!("{base}{ext}"))
            .find(|candidate| self.is_file(candidate))
    }

    fn is_file(&self, candidate: &str) -> bool {
        let hit = self.fs.stat(candidate).map(|s| s.is_file()).unwrap_or(false);
        trace!(candidate, hit, "probe");
        hit
    }

    fn is_directory(&self, candidate: &str) -> bool {
        self.fs.stat(candidate).map(|s| s.is_directory()).unwrap_or(false)
    }

    /// Parsed descriptor in `dir`. An unreadable or malformed descriptor is
    /// treated as absent.
    fn descriptor(&self, dir: &str) -> Option<Value> {
        let descriptor_path = path::join(&[dir, self.config.descriptor_file.as_str()]);
        if !self.is_file(&descriptor_path) {
            return None;
        }
        let bytes = self.fs.read_file(&descriptor_path).ok()?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %descriptor_path, %err, "ignoring malformed package descriptor");
                None
            }
        }
    }

    fn descriptor_main(&self, dir: &str) -> Option<String> {
        self.descriptor(dir)?
            .get("main")
            .and_then(Value::as_str)
            .filter(|main| !main.is_empty())
            .map(str::to_string)
    }

    pub fn module_format(&self, file: &str) -> ModuleFormat {
        match path::extname(file).as_str() {
            ".mjs" | ".mts" => return ModuleFormat::EsModule,
            ".cjs" | ".cts" => return ModuleFormat::CommonJs,
            ".json" => return ModuleFormat::Json,
            _ => {}
        }
        let mut dir = path::dirname(file);
        loop {
            if let Some(descriptor) = self.descriptor(&dir) {
                return match descriptor.get("type").and_then(Value::as_str) {
                    Some("module") => ModuleFormat::EsModule,
                    _ => ModuleFormat::CommonJs,
                };
            }
            if dir == "/" {
                return ModuleFormat::CommonJs;
            }
            dir = path::dirname(&dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fs_with_files;

    const NO_BUILTINS: &[&str] = &[];

    fn resolve_path(fs: &VirtualFs, specifier: &str, parent: &str) -> Result<Resolution, ModuleError> {
        resolve(specifier, parent, fs, NO_BUILTINS, &LoaderConfig::default())
    }

    #[test]
    fn relative_specifier_probes_extensions() {
        let fs = fs_with_files(&[("/src/main.js", ""), ("/src/math.js", "")]);
        assert_eq!(
            resolve_path(&fs, "./math", "/src/main.js").unwrap(),
            Resolution::Path("/src/math.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "../src/math.js", "/src/main.js").unwrap(),
            Resolution::Path("/src/math.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "/src/math", "/other/x.js").unwrap(),
            Resolution::Path("/src/math.js".into())
        );
    }

    #[test]
    fn exact_file_wins_over_extensions() {
        let fs = fs_with_files(&[("/lib/util", "bare"), ("/lib/util.js", "js")]);
        assert_eq!(
            resolve_path(&fs, "./util", "/lib/main.js").unwrap(),
            Resolution::Path("/lib/util".into())
        );
    }

    #[test]
    fn extension_order_is_respected() {
        let fs = fs_with_files(&[("/a/mod.ts", ""), ("/a/mod.json", "{}")]);
        assert_eq!(
            resolve_path(&fs, "./mod", "/a/main.js").unwrap(),
            Resolution::Path("/a/mod.ts".into())
        );
    }

    #[test]
    fn directory_main_then_index() {
        let fs = fs_with_files(&[
            ("/p/lib/package.json", r#"{"main": "dist/entry"}"#),
            ("/p/lib/dist/entry.js", ""),
            ("/p/lib/index.js", ""),
            ("/p/plain/index.ts", ""),
            ("/p/broken/package.json", "{ not json"),
            ("/p/broken/index.js", ""),
            ("/p/nested/package.json", r#"{"main": "out"}"#),
            ("/p/nested/out/index.js", ""),
        ]);
        assert_eq!(
            resolve_path(&fs, "./lib", "/p/main.js").unwrap(),
            Resolution::Path("/p/lib/dist/entry.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "./plain", "/p/main.js").unwrap(),
            Resolution::Path("/p/plain/index.ts".into())
        );
        assert_eq!(
            resolve_path(&fs, "./broken", "/p/main.js").unwrap(),
            Resolution::Path("/p/broken/index.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "./nested", "/p/main.js").unwrap(),
            Resolution::Path("/p/nested/out/index.js".into())
        );
    }

    #[test]
    fn trailing_slash_forces_directory() {
        let fs = fs_with_files(&[("/x/dep.js", ""), ("/x/dep/index.js", "")]);
        assert_eq!(
            resolve_path(&fs, "./dep", "/x/main.js").unwrap(),
            Resolution::Path("/x/dep.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "./dep/", "/x/main.js").unwrap(),
            Resolution::Path("/x/dep/index.js".into())
        );
    }

    #[test]
    fn bare_specifiers_walk_dependency_dirs() {
        let fs = fs_with_files(&[
            ("/app/node_modules/near/index.js", ""),
            ("/node_modules/near/index.js", ""),
            ("/node_modules/far/package.json", r#"{"main": "main.js"}"#),
            ("/node_modules/far/main.js", ""),
            ("/node_modules/scoped/sub/file.js", ""),
        ]);
        let parent = "/app/src/deep/main.js";
        assert_eq!(
            resolve_path(&fs, "near", parent).unwrap(),
            Resolution::Path("/app/node_modules/near/index.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "far", parent).unwrap(),
            Resolution::Path("/node_modules/far/main.js".into())
        );
        assert_eq!(
            resolve_path(&fs, "scoped/sub/file", parent).unwrap(),
            Resolution::Path("/node_modules/scoped/sub/file.js".into())
        );
    }

    #[test]
    fn builtins_take_precedence() {
        let fs = fs_with_files(&[("/node_modules/fs/index.js", "")]);
        let builtins: BTreeSet<String> = ["fs".to_string()].into_iter().collect();
        let config = LoaderConfig::default();
        assert_eq!(
            resolve("fs", "/main.js", &fs, &builtins, &config).unwrap(),
            Resolution::Builtin("fs".into())
        );
        assert_eq!(
            resolve("node:fs", "/main.js", &fs, &builtins, &config).unwrap(),
            Resolution::Builtin("fs".into())
        );
        assert!(resolve("node:path", "/main.js", &fs, &builtins, &config).is_err());
    }

    #[test]
    fn exhaustion_names_specifier_and_parent() {
        let fs = fs_with_files(&[("/src/main.js", "")]);
        let err = resolve_path(&fs, "./missing", "/src/main.js").unwrap_err();
        assert_eq!(err, ModuleError::not_found("./missing", Some("/src/main.js")));
        assert_eq!(err.code(), "MODULE_NOT_FOUND");

        assert!(resolve_path(&fs, "", "/src/main.js").is_err());
        assert!(resolve_path(&fs, "nothing-here", "/src/main.js").is_err());
    }

    #[test]
    fn directories_are_not_files() {
        let fs = fs_with_files(&[("/d/sub/readme.txt", "")]);
        assert!(resolve_path(&fs, "./sub", "/d/main.js").is_err());
    }

    #[test]
    fn symlinked_files_resolve_to_link_path() {
        let fs = fs_with_files(&[("/real/impl.js", "")]);
        fs.mkdir("/src", true).unwrap();
        fs.symlink("/real/impl.js", "/src/alias.js").unwrap();
        assert_eq!(
            resolve_path(&fs, "./alias", "/src/main.js").unwrap(),
            Resolution::Path("/src/alias.js".into())
        );
    }

    #[test]
    fn format_detection() {
        let fs = fs_with_files(&[
            ("/esm/package.json", r#"{"type": "module"}"#),
            ("/esm/a.js", ""),
            ("/esm/sub/b.js", ""),
            ("/esm/sub/legacy/package.json", r#"{"type": "commonjs"}"#),
            ("/esm/sub/legacy/c.js", ""),
            ("/plain/d.js", ""),
        ]);
        let config = LoaderConfig::default();
        let format = |p: &str| module_format(p, &fs, &config);
        assert_eq!(format("/esm/a.js"), ModuleFormat::EsModule);
        assert_eq!(format("/esm/sub/b.js"), ModuleFormat::EsModule);
        assert_eq!(format("/esm/sub/legacy/c.js"), ModuleFormat::CommonJs);
        assert_eq!(format("/esm/sub/legacy/x.mjs"), ModuleFormat::EsModule);
        assert_eq!(format("/esm/x.cts"), ModuleFormat::CommonJs);
        assert_eq!(format("/plain/d.js"), ModuleFormat::CommonJs);
        assert_eq!(format("/plain/data.json"), ModuleFormat::Json);
        assert_eq!(ModuleFormat::EsModule.to_string(), "module");
    }
}
