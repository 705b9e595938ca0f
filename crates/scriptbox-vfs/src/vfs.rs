// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Virtual filesystem implementation

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::node::{FsNode, Stats, PERMISSION_MASK};
use crate::path;
use crate::watch::{WatchEvent, WatchEventKind, WatchHandle, WatchListener, WatchRegistry};

/// In-memory hierarchical filesystem.
///
/// The tree is owned by a single root directory behind a mutex; every
/// operation takes `&self` so the filesystem can be shared behind an `Arc`
/// between the module loader and the fs emulation layer.
pub struct VirtualFs {
    config: FsConfig,
    root: Mutex<FsNode>,
    watchers: WatchRegistry,
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new(FsConfig::default())
    }
}

impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFs").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Join resolved components back into an absolute path
fn to_abs_path(parts: &[String]) -> String {
    path::join(parts)
}

fn split_last(parts: &[String]) -> Option<(&[String], &str)> {
    parts.split_last().map(|(name, parent)| (parent, name.as_str()))
}

impl VirtualFs {
    pub fn new(config: FsConfig) -> Self {
        let root = FsNode::directory(config.default_dir_mode);
        Self {
            config,
            root: Mutex::new(root),
            watchers: WatchRegistry::default(),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub(crate) fn lock_root(&self) -> MutexGuard<'_, FsNode> {
        self.root.lock().unwrap()
    }

    pub(crate) fn emit(&self, events: Vec<WatchEvent>) {
        if self.config.track_events {
            self.watchers.dispatch(&events);
        }
    }

    /// Resolve `path` to the components of the node it designates, following
    /// symlinks in intermediate components (and in the final one when
    /// `follow_last` is set). The final component does not need to exist.
    fn canonical(&self, root: &FsNode, path: &str, follow_last: bool) -> FsResult<Vec<String>> {
        let mut pending: Vec<String> =
            path::components(path).into_iter().rev().map(str::to_string).collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(name) = pending.pop() {
            resolved.push(name);
            let is_last = pending.is_empty();
            match root.lookup(&resolved) {
                Some(FsNode::Symlink(link)) if !is_last || follow_last => {
                    hops += 1;
                    if hops > self.config.max_symlink_hops {
                        return Err(FsError::SymlinkLoop(path.to_string()));
                    }
                    let base = to_abs_path(&resolved[..resolved.len() - 1]);
                    let target = path::resolve(&base, &link.target);
                    trace!(link = %to_abs_path(&resolved), target = %target, "following symlink");
                    resolved.clear();
                    pending.extend(path::components(&target).into_iter().rev().map(str::to_string));
                }
                Some(FsNode::Directory(_)) | Some(FsNode::Symlink(_)) => {}
                Some(FsNode::File(_)) if !is_last => {
                    return Err(FsError::NotADirectory(path.to_string()));
                }
                Some(FsNode::File(_)) => {}
                None if !is_last => return Err(FsError::NotFound(path.to_string())),
                None => {}
            }
        }
        Ok(resolved)
    }

    /// Components of an existing node
    fn existing(&self, root: &FsNode, path: &str, follow_last: bool) -> FsResult<Vec<String>> {
        let parts = self.canonical(root, path, follow_last)?;
        if root.lookup(&parts).is_none() {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(parts)
    }

    fn parent_dir_mut<'a>(
        root: &'a mut FsNode,
        parent: &[String],
        path: &str,
    ) -> FsResult<&'a mut crate::node::DirNode> {
        match root.lookup_mut(parent) {
            Some(FsNode::Directory(dir)) => Ok(dir),
            Some(_) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let mut root = self.lock_root();
        let parts = self.canonical(&root, path, true)?;
        match root.lookup_mut(&parts) {
            Some(FsNode::File(file)) => {
                file.meta.atime_ms = crate::node::now_ms();
                Ok(file.content.clone())
            }
            Some(FsNode::Directory(_)) => Err(FsError::IsADirectory(path.to_string())),
            Some(FsNode::Symlink(_)) => Err(FsError::SymlinkLoop(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    pub fn read_to_string(&self, path: &str) -> FsResult<String> {
        let bytes = self.read_file(path)?;
        String::from_utf8(bytes)
            .map_err(|_| FsError::InvalidArgument(format!("{path} is not valid UTF-8")))
    }

    pub fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        self.store(path, data.as_ref(), false, None)
    }

    /// Append to a file, creating it when missing
    pub fn append_file(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        self.store(path, data.as_ref(), true, None)
    }

    /// Copy a file's content; a newly created destination inherits the
    /// source's permission bits
    pub fn copy_file(&self, from: &str, to: &str) -> FsResult<()> {
        let data = self.read_file(from)?;
        let mode = self.stat(from)?.permissions();
        self.store(to, &data, false, Some(mode))
    }

    fn store(&self, path: &str, data: &[u8], append: bool, mode: Option<u32>) -> FsResult<()> {
        let event = {
            let mut root = self.lock_root();
            let parts = self.canonical(&root, path, true)?;
            let Some((parent, name)) = split_last(&parts) else {
                return Err(FsError::IsADirectory(path.to_string()));
            };
            let dir = Self::parent_dir_mut(&mut root, parent, path)?;
            let display_path = to_abs_path(&parts);
            match dir.children.get_mut(name) {
                Some(FsNode::File(file)) => {
                    if append {
                        file.content.extend_from_slice(data);
                    } else {
                        file.content = data.to_vec();
                    }
                    file.meta.size = file.content.len() as u64;
                    file.meta.touch_modified();
                    WatchEvent {
                        kind: WatchEventKind::Change,
                        path: display_path,
                    }
                }
                Some(FsNode::Directory(_)) => return Err(FsError::IsADirectory(path.to_string())),
                Some(FsNode::Symlink(_)) => return Err(FsError::SymlinkLoop(path.to_string())),
                None => {
                    let mode = mode.unwrap_or(self.config.default_file_mode);
                    dir.children.insert(name.to_string(), FsNode::file(data.to_vec(), mode));
                    dir.meta.touch_modified();
                    WatchEvent {
                        kind: WatchEventKind::Rename,
                        path: display_path,
                    }
                }
            }
        };
        trace!(path = %event.path, bytes = data.len(), append, "stored file");
        self.emit(vec![event]);
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        let root = self.lock_root();
        self.canonical(&root, path, true)
            .map(|parts| root.lookup(&parts).is_some())
            .unwrap_or(false)
    }

    /// Create a directory. With `recursive`, missing ancestors are created and
    /// an already existing directory is not an error.
    pub fn mkdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        let mut events = Vec::new();
        {
            let mut root = self.lock_root();
            if recursive {
                let wanted = path::components(path);
                for depth in 1..=wanted.len() {
                    let prefix = path::join(&wanted[..depth]);
                    let parts = self.canonical(&root, &prefix, true)?;
                    match root.lookup(&parts) {
                        Some(FsNode::Directory(_)) => continue,
                        Some(_) if depth == wanted.len() => {
                            return Err(FsError::AlreadyExists(path.to_string()));
                        }
                        Some(_) => return Err(FsError::NotADirectory(path.to_string())),
                        None => {
                            events.push(self.insert_dir(&mut root, &parts, path)?);
                        }
                    }
                }
            } else {
                let parts = self.canonical(&root, path, false)?;
                if root.lookup(&parts).is_some() {
                    return Err(FsError::AlreadyExists(path.to_string()));
                }
                events.push(self.insert_dir(&mut root, &parts, path)?);
            }
        }
        self.emit(events);
        Ok(())
    }

    fn insert_dir(&self, root: &mut FsNode, parts: &[String], path: &str) -> FsResult<WatchEvent> {
        let Some((parent, name)) = split_last(parts) else {
            return Err(FsError::AlreadyExists(path.to_string()));
        };
        let dir = Self::parent_dir_mut(root, parent, path)?;
        dir.children.insert(name.to_string(), FsNode::directory(self.config.default_dir_mode));
        dir.meta.touch_modified();
        Ok(WatchEvent {
            kind: WatchEventKind::Rename,
            path: to_abs_path(parts),
        })
    }

    /// Names of a directory's entries, sorted
    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let root = self.lock_root();
        let parts = self.canonical(&root, path, true)?;
        match root.lookup(&parts) {
            Some(FsNode::Directory(dir)) => Ok(dir.children.keys().cloned().collect()),
            Some(_) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    pub fn rmdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        let event = {
            let mut root = self.lock_root();
            let parts = self.existing(&root, path, false)?;
            let Some((parent, name)) = split_last(&parts) else {
                return Err(FsError::InvalidArgument("cannot remove the root directory".into()));
            };
            match root.lookup(&parts) {
                Some(FsNode::Directory(dir)) if !recursive && !dir.children.is_empty() => {
                    return Err(FsError::DirectoryNotEmpty(path.to_string()));
                }
                Some(FsNode::Directory(_)) => {}
                _ => return Err(FsError::NotADirectory(path.to_string())),
            }
            let dir = Self::parent_dir_mut(&mut root, parent, path)?;
            dir.children.remove(name);
            dir.meta.touch_modified();
            WatchEvent {
                kind: WatchEventKind::Rename,
                path: to_abs_path(&parts),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Remove a file or symlink (the link itself, not its target)
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let event = {
            let mut root = self.lock_root();
            let parts = self.existing(&root, path, false)?;
            let Some((parent, name)) = split_last(&parts) else {
                return Err(FsError::IsADirectory(path.to_string()));
            };
            if root.lookup(&parts).is_some_and(FsNode::is_directory) {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            let dir = Self::parent_dir_mut(&mut root, parent, path)?;
            dir.children.remove(name);
            dir.meta.touch_modified();
            WatchEvent {
                kind: WatchEventKind::Rename,
                path: to_abs_path(&parts),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Create a symlink at `path` pointing to `target` (stored verbatim)
    pub fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        let event = {
            let mut root = self.lock_root();
            let parts = self.canonical(&root, path, false)?;
            if root.lookup(&parts).is_some() {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            let Some((parent, name)) = split_last(&parts) else {
                return Err(FsError::AlreadyExists(path.to_string()));
            };
            let dir = Self::parent_dir_mut(&mut root, parent, path)?;
            dir.children.insert(name.to_string(), FsNode::symlink(target));
            dir.meta.touch_modified();
            WatchEvent {
                kind: WatchEventKind::Rename,
                path: to_abs_path(&parts),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> FsResult<String> {
        let root = self.lock_root();
        let parts = self.existing(&root, path, false)?;
        match root.lookup(&parts) {
            Some(FsNode::Symlink(link)) => Ok(link.target.clone()),
            _ => Err(FsError::InvalidArgument(format!("{path} is not a symbolic link"))),
        }
    }

    /// Canonical absolute path with every symlink resolved
    pub fn realpath(&self, path: &str) -> FsResult<String> {
        let root = self.lock_root();
        let parts = self.existing(&root, path, true)?;
        Ok(to_abs_path(&parts))
    }

    /// Status of the node at `path`, following symlinks
    pub fn stat(&self, path: &str) -> FsResult<Stats> {
        let root = self.lock_root();
        let parts = self.existing(&root, path, true)?;
        root.lookup(&parts).map(FsNode::stats).ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Status of the node at `path` itself; a symlink reports as a symlink
    pub fn lstat(&self, path: &str) -> FsResult<Stats> {
        let root = self.lock_root();
        let parts = self.existing(&root, path, false)?;
        root.lookup(&parts).map(FsNode::stats).ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let event = {
            let mut root = self.lock_root();
            let parts = self.existing(&root, path, true)?;
            let node = root.lookup_mut(&parts).ok_or_else(|| FsError::NotFound(path.to_string()))?;
            let meta = node.meta_mut();
            meta.mode = mode & PERMISSION_MASK;
            meta.touch_changed();
            WatchEvent {
                kind: WatchEventKind::Change,
                path: to_abs_path(&parts),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Move a node. An existing destination file or symlink is replaced; an
    /// existing destination directory is replaced only by a directory and
    /// only when empty.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let events = {
            let mut root = self.lock_root();
            let src = self.existing(&root, from, false)?;
            let dst = self.canonical(&root, to, false)?;
            if src == dst {
                return Ok(());
            }
            let (Some((src_parent, src_name)), Some((dst_parent, dst_name))) =
                (split_last(&src), split_last(&dst))
            else {
                return Err(FsError::InvalidArgument("cannot rename the root directory".into()));
            };
            if dst.starts_with(&src) {
                return Err(FsError::InvalidArgument(format!(
                    "cannot move {from} into its own subtree {to}"
                )));
            }

            let src_is_dir = root.lookup(&src).is_some_and(FsNode::is_directory);
            match root.lookup(dst_parent) {
                Some(FsNode::Directory(_)) => {}
                Some(_) => return Err(FsError::NotADirectory(to.to_string())),
                None => return Err(FsError::NotFound(to.to_string())),
            }
            match root.lookup(&dst) {
                Some(FsNode::Directory(dir)) => {
                    if !src_is_dir {
                        return Err(FsError::IsADirectory(to.to_string()));
                    }
                    if !dir.children.is_empty() {
                        return Err(FsError::DirectoryNotEmpty(to.to_string()));
                    }
                }
                Some(_) if src_is_dir => return Err(FsError::NotADirectory(to.to_string())),
                _ => {}
            }

            let src_dir = Self::parent_dir_mut(&mut root, src_parent, from)?;
            let mut node = src_dir
                .children
                .remove(src_name)
                .ok_or_else(|| FsError::NotFound(from.to_string()))?;
            src_dir.meta.touch_modified();
            node.meta_mut().touch_changed();

            let dst_dir = Self::parent_dir_mut(&mut root, dst_parent, to)?;
            dst_dir.children.insert(dst_name.to_string(), node);
            dst_dir.meta.touch_modified();

            vec![
                WatchEvent {
                    kind: WatchEventKind::Rename,
                    path: to_abs_path(&src),
                },
                WatchEvent {
                    kind: WatchEventKind::Rename,
                    path: to_abs_path(&dst),
                },
            ]
        };
        self.emit(events);
        Ok(())
    }

    /// Watch `path` (and its direct children; all descendants with
    /// `recursive`). The path does not have to exist yet.
    pub fn watch<L>(&self, path: &str, recursive: bool, listener: L) -> WatchHandle
    where
        L: WatchListener + 'static,
    {
        self.watchers.register(path::normalize(path), recursive, Arc::new(listener))
    }

    /// Number of live watch registrations
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}
