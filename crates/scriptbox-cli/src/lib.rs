// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Command implementations behind the `scriptbox` binary

use anyhow::{anyhow, Context, Result};
use scriptbox_modules::{LoaderConfig, ModuleFormat, Resolution, Resolver};
use scriptbox_vfs::snapshot::decode_entries;
use scriptbox_vfs::{path, VirtualFs};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Counts of nodes copied by [`pack_host_dir`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackStats {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> Option<u32> {
    None
}

/// Copy the host directory tree under `source` into `vfs` at its root.
/// Symlink targets are copied verbatim, not followed.
pub fn pack_host_dir(source: &Path, vfs: &VirtualFs) -> Result<PackStats> {
    let meta = fs::metadata(source).with_context(|| format!("reading {:?}", source))?;
    if !meta.is_dir() {
        return Err(anyhow!("{:?} is not a directory", source));
    }
    let mut stats = PackStats::default();
    pack_dir(source, "/", vfs, &mut stats)?;
    info!(?stats, source = %source.display(), "packed host directory");
    Ok(stats)
}

fn pack_dir(host_dir: &Path, vfs_dir: &str, vfs: &VirtualFs, stats: &mut PackStats) -> Result<()> {
    let mut entries = fs::read_dir(host_dir)
        .with_context(|| format!("listing {:?}", host_dir))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry
            .file_name()
            .into_string()
            .map_err(|raw| anyhow!("non UTF-8 file name {:?} in {:?}", raw, host_dir))?;
        let host_path = entry.path();
        let vfs_path = path::join(&[vfs_dir, name.as_str()]);
        let meta = fs::symlink_metadata(&host_path).with_context(|| format!("reading {:?}", host_path))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(&host_path)?;
            let target = target
                .to_str()
                .ok_or_else(|| anyhow!("non UTF-8 symlink target at {:?}", host_path))?;
            vfs.symlink(target, &vfs_path)?;
            stats.symlinks += 1;
        } else if file_type.is_dir() {
            vfs.mkdir(&vfs_path, false)?;
            if let Some(mode) = permission_bits(&meta) {
                vfs.chmod(&vfs_path, mode)?;
            }
            stats.directories += 1;
            pack_dir(&host_path, &vfs_path, vfs, stats)?;
        } else if file_type.is_file() {
            let content = fs::read(&host_path).with_context(|| format!("reading {:?}", host_path))?;
            vfs.write_file(&vfs_path, content)?;
            if let Some(mode) = permission_bits(&meta) {
                vfs.chmod(&vfs_path, mode)?;
            }
            stats.files += 1;
        } else {
            debug!(path = %host_path.display(), "skipping special file");
        }
    }
    Ok(())
}

pub fn write_snapshot(vfs: &VirtualFs, output: &Path) -> Result<usize> {
    let bytes = vfs.serialize()?;
    fs::write(output, &bytes).with_context(|| format!("writing snapshot {:?}", output))?;
    Ok(bytes.len())
}

pub fn load_snapshot(input: &Path) -> Result<VirtualFs> {
    let bytes = fs::read(input).with_context(|| format!("reading snapshot {:?}", input))?;
    let vfs = VirtualFs::default();
    vfs.deserialize(&bytes)
        .with_context(|| format!("decoding snapshot {:?}", input))?;
    Ok(vfs)
}

/// One line per snapshot entry: kind, octal mode, size, path
pub fn list_snapshot(bytes: &[u8]) -> Result<Vec<String>> {
    let entries = decode_entries(bytes).context("decoding snapshot")?;
    Ok(entries
        .iter()
        .map(|entry| {
            format!(
                "{:<7} {:04o} {:>10} {}",
                entry.kind().to_string(),
                entry.mode,
                entry.size(),
                entry.path
            )
        })
        .collect())
}

/// Resolve `specifier` from `parent` inside `vfs` and describe the result
pub fn describe_resolution(
    vfs: &VirtualFs,
    specifier: &str,
    parent: &str,
    builtins: &BTreeSet<String>,
    config: &LoaderConfig,
) -> Result<String> {
    let resolver = Resolver::new(vfs, config);
    let line = match resolver.resolve(specifier, parent, builtins)? {
        Resolution::Builtin(name) => format!("BUILTIN\t{name}"),
        Resolution::Path(file) => {
            let format: ModuleFormat = resolver.module_format(&file);
            format!("PATH\t{file}\tFORMAT\t{format}")
        }
    };
    Ok(line)
}
