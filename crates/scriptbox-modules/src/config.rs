// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Loader configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoaderConfig {
    /// Extensions probed, in order, after the exact path
    pub extensions: Vec<String>,
    /// Directory searched for bare specifiers in every ancestor directory
    pub dependency_dir: String,
    /// Package descriptor consulted for `main` and `type`
    pub descriptor_file: String,
    /// Base name of directory index files
    pub index_name: String,
    /// Allow the asynchronous dialect when the evaluator supports it
    pub async_imports: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            extensions: [".js", ".ts", ".tsx", ".jsx", ".mjs", ".cjs", ".json", ".mts", ".cts"]
                .into_iter()
                .map(String::from)
                .collect(),
            dependency_dir: "node_modules".to_string(),
            descriptor_file: "package.json".to_string(),
            index_name: "index".to_string(),
            async_imports: true,
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("parsing loader config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading loader config {:?}", path))?;
        Self::from_toml_str(&content)
    }
}
