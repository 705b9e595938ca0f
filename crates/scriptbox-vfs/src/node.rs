// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem node model: the tagged node tree and per-node metadata

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// File-type bits OR-ed into [`Stats::mode`]
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// Permission bits kept in [`FsMetadata::mode`]
pub const PERMISSION_MASK: u32 = 0o7777;

static NEXT_INO: AtomicU64 = AtomicU64::new(1);

/// Allocate the next identity number. Numbers are never reused.
pub fn allocate_ino() -> u64 {
    NEXT_INO.fetch_add(1, Ordering::Relaxed)
}

/// Reset the identity counter so that the next allocated `ino` is 1.
///
/// Only test harnesses that need deterministic identity numbers should call
/// this; it breaks uniqueness against nodes that are still alive.
pub fn reset_ino_counter() {
    NEXT_INO.store(1, Ordering::Relaxed);
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Kind of a filesystem node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

impl NodeKind {
    /// Tag byte used by the snapshot codec
    pub fn tag(self) -> u8 {
        match self {
            NodeKind::File => 0,
            NodeKind::Directory => 1,
            NodeKind::Symlink => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(NodeKind::File),
            1 => Some(NodeKind::Directory),
            2 => Some(NodeKind::Symlink),
            _ => None,
        }
    }

    fn type_bits(self) -> u32 {
        match self {
            NodeKind::File => S_IFREG,
            NodeKind::Directory => S_IFDIR,
            NodeKind::Symlink => S_IFLNK,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Directory => write!(f, "dir"),
            NodeKind::Symlink => write!(f, "symlink"),
        }
    }
}

/// Per-node metadata. Timestamps are milliseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsMetadata {
    pub mode: u32,
    pub size: u64,
    pub atime_ms: u64,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub birthtime_ms: u64,
    pub ino: u64,
}

impl FsMetadata {
    /// Fresh metadata with a newly allocated `ino` and all times set to now
    pub fn new(mode: u32, size: u64) -> Self {
        let now = now_ms();
        Self {
            mode: mode & PERMISSION_MASK,
            size,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            birthtime_ms: now,
            ino: allocate_ino(),
        }
    }

    pub(crate) fn touch_modified(&mut self) {
        let now = now_ms();
        self.mtime_ms = now;
        self.ctime_ms = now;
    }

    pub(crate) fn touch_changed(&mut self) {
        self.ctime_ms = now_ms();
    }
}

#[derive(Clone, Debug)]
pub struct FileNode {
    pub content: Vec<u8>,
    pub meta: FsMetadata,
}

#[derive(Clone, Debug)]
pub struct DirNode {
    pub children: BTreeMap<String, FsNode>,
    pub meta: FsMetadata,
}

#[derive(Clone, Debug)]
pub struct SymlinkNode {
    /// Target as written; resolved lazily relative to the link's directory
    pub target: String,
    pub meta: FsMetadata,
}

/// A node of the virtual filesystem tree. Directories own their children.
#[derive(Clone, Debug)]
pub enum FsNode {
    File(FileNode),
    Directory(DirNode),
    Symlink(SymlinkNode),
}

impl FsNode {
    pub fn file(content: Vec<u8>, mode: u32) -> Self {
        let meta = FsMetadata::new(mode, content.len() as u64);
        FsNode::File(FileNode { content, meta })
    }

    pub fn directory(mode: u32) -> Self {
        FsNode::Directory(DirNode {
            children: BTreeMap::new(),
            meta: FsMetadata::new(mode, 0),
        })
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        let target = target.into();
        let meta = FsMetadata::new(0o777, target.len() as u64);
        FsNode::Symlink(SymlinkNode { target, meta })
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            FsNode::File(_) => NodeKind::File,
            FsNode::Directory(_) => NodeKind::Directory,
            FsNode::Symlink(_) => NodeKind::Symlink,
        }
    }

    pub fn meta(&self) -> &FsMetadata {
        match self {
            FsNode::File(f) => &f.meta,
            FsNode::Directory(d) => &d.meta,
            FsNode::Symlink(s) => &s.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut FsMetadata {
        match self {
            FsNode::File(f) => &mut f.meta,
            FsNode::Directory(d) => &mut d.meta,
            FsNode::Symlink(s) => &mut s.meta,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, FsNode::Directory(_))
    }

    /// Look up a descendant by already-normalized components, without
    /// following symlinks
    pub fn lookup<S: AsRef<str>>(&self, parts: &[S]) -> Option<&FsNode> {
        let mut current = self;
        for part in parts {
            match current {
                FsNode::Directory(dir) => current = dir.children.get(part.as_ref())?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn lookup_mut<S: AsRef<str>>(&mut self, parts: &[S]) -> Option<&mut FsNode> {
        let mut current = self;
        for part in parts {
            match current {
                FsNode::Directory(dir) => current = dir.children.get_mut(part.as_ref())?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn stats(&self) -> Stats {
        let meta = self.meta();
        Stats {
            kind: self.kind(),
            mode: meta.mode | self.kind().type_bits(),
            size: meta.size,
            atime_ms: meta.atime_ms,
            mtime_ms: meta.mtime_ms,
            ctime_ms: meta.ctime_ms,
            birthtime_ms: meta.birthtime_ms,
            ino: meta.ino,
        }
    }
}

/// Result of `stat`/`lstat`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub kind: NodeKind,
    /// Permission bits combined with the file-type bits
    pub mode: u32,
    pub size: u64,
    pub atime_ms: u64,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub birthtime_ms: u64,
    pub ino: u64,
}

impl Stats {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == NodeKind::Symlink
    }

    pub fn permissions(&self) -> u32 {
        self.mode & PERMISSION_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inos_strictly_increase() {
        let a = FsNode::file(Vec::new(), 0o644);
        let b = FsNode::directory(0o755);
        let c = FsNode::symlink("/a");
        assert!(a.meta().ino < b.meta().ino);
        assert!(b.meta().ino < c.meta().ino);
    }

    #[test]
    fn stats_carry_type_bits() {
        let file = FsNode::file(b"abc".to_vec(), 0o100644);
        let stats = file.stats();
        assert!(stats.is_file());
        assert_eq!(stats.size, 3);
        assert_eq!(stats.permissions(), 0o644);
        assert_eq!(stats.mode, S_IFREG | 0o644);

        let link = FsNode::symlink("../target");
        assert!(link.stats().is_symlink());
        assert_eq!(link.stats().size, "../target".len() as u64);
    }

    #[test]
    fn lookup_walks_directories_only() {
        let mut root = FsNode::directory(0o755);
        if let FsNode::Directory(dir) = &mut root {
            let mut sub = FsNode::directory(0o755);
            if let FsNode::Directory(sub_dir) = &mut sub {
                sub_dir.children.insert("f.txt".into(), FsNode::file(b"x".to_vec(), 0o644));
            }
            dir.children.insert("sub".into(), sub);
        }
        assert!(root.lookup(&["sub", "f.txt"]).is_some());
        assert!(root.lookup(&["sub", "f.txt", "deeper"]).is_none());
        assert!(root.lookup::<&str>(&[]).is_some_and(FsNode::is_directory));
        assert_eq!(NodeKind::from_tag(NodeKind::Symlink.tag()), Some(NodeKind::Symlink));
        assert_eq!(NodeKind::from_tag(7), None);
    }
}
