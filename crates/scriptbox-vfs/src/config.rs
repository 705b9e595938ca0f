// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Virtual filesystem configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FsConfig {
    /// Permission bits for files created without an explicit mode
    pub default_file_mode: u32,
    /// Permission bits for directories, including synthesized ones
    pub default_dir_mode: u32,
    /// Deliver watch events to registered listeners
    pub track_events: bool,
    /// Maximum symlink hops followed during a single path resolution
    pub max_symlink_hops: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            track_events: true,
            max_symlink_hops: 40,
        }
    }
}

impl FsConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("parsing filesystem config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading filesystem config {:?}", path))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = FsConfig::from_toml_str("track-events = false\nmax-symlink-hops = 8\n").unwrap();
        assert!(!config.track_events);
        assert_eq!(config.max_symlink_hops, 8);
        assert_eq!(config.default_file_mode, 0o644);
        assert_eq!(config.default_dir_mode, 0o755);
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(FsConfig::from_toml_str("track-events = \"yes\"").is_err());
    }
}
