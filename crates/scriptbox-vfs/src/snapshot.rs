// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Binary snapshot codec for the virtual filesystem.
//!
//! Layout (little-endian, unsigned):
//!
//! ```text
//! entry_count: u32
//! entry_count times:
//!   path_len: u16, path: utf8[path_len]      leading '/'
//!   kind: u8                                 0=file 1=dir 2=symlink
//!   mode: u16
//!   file:    content_len: u32, content[content_len]
//!   symlink: target_len: u16, target: utf8[target_len]
//! ```
//!
//! Entries are emitted depth-first with every directory before its
//! descendants. The root itself is never emitted.

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::node::{FsNode, NodeKind, PERMISSION_MASK};
use crate::path;
use crate::vfs::VirtualFs;
use crate::watch::{WatchEvent, WatchEventKind};

/// Payload of one snapshot entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotBody {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

/// One decoded snapshot entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: String,
    pub mode: u32,
    pub body: SnapshotBody,
}

impl SnapshotEntry {
    pub fn kind(&self) -> NodeKind {
        match self.body {
            SnapshotBody::File(_) => NodeKind::File,
            SnapshotBody::Directory => NodeKind::Directory,
            SnapshotBody::Symlink(_) => NodeKind::Symlink,
        }
    }

    /// Content length for files, target length for symlinks, 0 for directories
    pub fn size(&self) -> u64 {
        match &self.body {
            SnapshotBody::File(content) => content.len() as u64,
            SnapshotBody::Directory => 0,
            SnapshotBody::Symlink(target) => target.len() as u64,
        }
    }
}

/// Flatten a tree into entries, parents before children
pub fn collect_entries(root: &FsNode) -> Vec<SnapshotEntry> {
    fn walk(node: &FsNode, prefix: &str, out: &mut Vec<SnapshotEntry>) {
        let FsNode::Directory(dir) = node else {
            return;
        };
        for (name, child) in &dir.children {
            let child_path = format!("{}/{}", prefix, name);
            let mode = child.meta().mode & PERMISSION_MASK;
            let body = match child {
                FsNode::File(file) => SnapshotBody::File(file.content.clone()),
                FsNode::Directory(_) => SnapshotBody::Directory,
                FsNode::Symlink(link) => SnapshotBody::Symlink(link.target.clone()),
            };
            out.push(SnapshotEntry {
                path: child_path.clone(),
                mode,
                body,
            });
            walk(child, &child_path, out);
        }
    }

    let mut out = Vec::new();
    walk(root, "", &mut out);
    out
}

fn put_str_u16(buf: &mut Vec<u8>, value: &str, what: &str) -> FsResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| FsError::Snapshot(format!("{what} too long: {} bytes", value.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Encode entries into the wire format
pub fn encode_entries(entries: &[SnapshotEntry]) -> FsResult<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| FsError::Snapshot(format!("too many entries: {}", entries.len())))?;
    let mut buf = Vec::new();
    buf.extend_from_slice(&count.to_le_bytes());
    for entry in entries {
        put_str_u16(&mut buf, &entry.path, "path")?;
        buf.push(entry.kind().tag());
        buf.extend_from_slice(&((entry.mode & PERMISSION_MASK) as u16).to_le_bytes());
        match &entry.body {
            SnapshotBody::File(content) => {
                let len = u32::try_from(content.len()).map_err(|_| {
                    FsError::Snapshot(format!("{} too large: {} bytes", entry.path, content.len()))
                })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(content);
            }
            SnapshotBody::Directory => {}
            SnapshotBody::Symlink(target) => put_str_u16(&mut buf, target, "symlink target")?,
        }
    }
    Ok(buf)
}

/// Bounds-checked little-endian reader over a snapshot buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> FsResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len()).ok_or_else(|| {
            FsError::Snapshot(format!("truncated at offset {} (wanted {len} bytes)", self.pos))
        })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> FsResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> FsResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> FsResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string_u16(&mut self, what: &str) -> FsResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FsError::Snapshot(format!("{what} is not valid UTF-8")))
    }
}

/// Decode the wire format into entries
pub fn decode_entries(bytes: &[u8]) -> FsResult<Vec<SnapshotEntry>> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let count = reader.u32()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let path = reader.string_u16("path")?;
        let tag = reader.u8()?;
        let kind = NodeKind::from_tag(tag)
            .ok_or_else(|| FsError::Snapshot(format!("unknown node kind {tag} for {path}")))?;
        let mode = reader.u16()? as u32;
        let body = match kind {
            NodeKind::File => {
                let len = reader.u32()? as usize;
                SnapshotBody::File(reader.take(len)?.to_vec())
            }
            NodeKind::Directory => SnapshotBody::Directory,
            NodeKind::Symlink => SnapshotBody::Symlink(reader.string_u16("symlink target")?),
        };
        entries.push(SnapshotEntry { path, mode, body });
    }
    if reader.pos != bytes.len() {
        return Err(FsError::Snapshot(format!(
            "{} trailing bytes after {count} entries",
            bytes.len() - reader.pos
        )));
    }
    Ok(entries)
}

/// Build a fresh tree from entries, synthesizing any ancestor directory
/// that was not emitted explicitly
pub fn build_tree(entries: &[SnapshotEntry], dir_mode: u32) -> FsResult<FsNode> {
    let mut root = FsNode::directory(dir_mode);
    for entry in entries {
        let parts = path::components(&entry.path);
        let Some((name, ancestors)) = parts.split_last() else {
            // An explicit root entry only carries the root's mode
            root.meta_mut().mode = entry.mode & PERMISSION_MASK;
            continue;
        };

        let mut dir = &mut root;
        for ancestor in ancestors {
            let FsNode::Directory(current) = dir else {
                return Err(FsError::Snapshot(format!("{} nests under a non-directory", entry.path)));
            };
            dir = current
                .children
                .entry(ancestor.to_string())
                .or_insert_with(|| FsNode::directory(dir_mode));
        }
        let FsNode::Directory(parent) = dir else {
            return Err(FsError::Snapshot(format!("{} nests under a non-directory", entry.path)));
        };

        // A synthesized directory keeps its children and takes the explicit mode
        if entry.body == SnapshotBody::Directory {
            if let Some(FsNode::Directory(existing)) = parent.children.get_mut(*name) {
                existing.meta.mode = entry.mode & PERMISSION_MASK;
                continue;
            }
        }
        let node = match &entry.body {
            SnapshotBody::File(content) => FsNode::file(content.clone(), entry.mode),
            SnapshotBody::Directory => FsNode::directory(entry.mode),
            SnapshotBody::Symlink(target) => {
                let mut link = FsNode::symlink(target.clone());
                link.meta_mut().mode = entry.mode & PERMISSION_MASK;
                link
            }
        };
        parent.children.insert(name.to_string(), node);
    }
    Ok(root)
}

impl VirtualFs {
    /// Serialize the whole tree into the snapshot wire format
    pub fn serialize(&self) -> FsResult<Vec<u8>> {
        let entries = {
            let root = self.lock_root();
            collect_entries(&root)
        };
        let bytes = encode_entries(&entries)?;
        debug!(entries = entries.len(), bytes = bytes.len(), "serialized filesystem snapshot");
        Ok(bytes)
    }

    /// Replace the whole tree with the one described by `bytes`. The current
    /// tree is left untouched when the snapshot is malformed.
    pub fn deserialize(&self, bytes: &[u8]) -> FsResult<()> {
        let entries = decode_entries(bytes)?;
        let tree = build_tree(&entries, self.config().default_dir_mode)?;
        *self.lock_root() = tree;
        debug!(entries = entries.len(), bytes = bytes.len(), "restored filesystem snapshot");
        self.emit(vec![WatchEvent {
            kind: WatchEventKind::Rename,
            path: "/".to_string(),
        }]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fs() -> VirtualFs {
        let fs = VirtualFs::default();
        fs.mkdir("/empty", false).unwrap();
        fs.write_file("/bin.dat", [0u8, 255, 128]).unwrap();
        fs.mkdir("/nested/deeper", true).unwrap();
        fs.write_file("/nested/deeper/file.txt", b"inside").unwrap();
        fs.chmod("/nested", 0o700).unwrap();
        fs.chmod("/bin.dat", 0o600).unwrap();
        fs.symlink("nested/deeper/file.txt", "/link").unwrap();
        fs
    }

    #[test]
    fn round_trip_preserves_tree() {
        let original = sample_fs();
        let bytes = original.serialize().unwrap();

        let restored = VirtualFs::default();
        restored.write_file("/stale.txt", b"discarded").unwrap();
        restored.deserialize(&bytes).unwrap();

        assert!(!restored.exists("/stale.txt"));
        assert!(restored.stat("/empty").unwrap().is_directory());
        assert!(restored.readdir("/empty").unwrap().is_empty());
        assert_eq!(restored.read_file("/bin.dat").unwrap(), vec![0, 255, 128]);
        assert_eq!(restored.stat("/bin.dat").unwrap().permissions(), 0o600);
        assert_eq!(restored.stat("/nested").unwrap().permissions(), 0o700);
        assert_eq!(restored.read_file("/nested/deeper/file.txt").unwrap(), b"inside");
        assert!(restored.lstat("/link").unwrap().is_symlink());
        assert_eq!(restored.readlink("/link").unwrap(), "nested/deeper/file.txt");
        assert_eq!(restored.read_file("/link").unwrap(), b"inside");

        assert_eq!(restored.serialize().unwrap(), bytes);
    }

    #[test]
    fn parents_precede_children() {
        let entries = collect_entries(&sample_fs().lock_root());
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/bin.dat",
                "/empty",
                "/link",
                "/nested",
                "/nested/deeper",
                "/nested/deeper/file.txt"
            ]
        );
    }

    #[test]
    fn wire_layout_is_exact() {
        let fs = VirtualFs::default();
        fs.write_file("/a", [7u8]).unwrap();
        let bytes = fs.serialize().unwrap();
        let expected: Vec<u8> = vec![
            1, 0, 0, 0, // entry_count
            2, 0, b'/', b'a', // path
            0,    // kind=file
            0xa4, 0x01, // mode 0o644
            1, 0, 0, 0, // content_len
            7,
        ];
        assert_eq!(bytes, expected);
        assert_eq!(VirtualFs::default().serialize().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn missing_ancestors_are_synthesized() {
        let bytes = encode_entries(&[SnapshotEntry {
            path: "/a/b/file.txt".into(),
            mode: 0o644,
            body: SnapshotBody::File(b"deep".to_vec()),
        }])
        .unwrap();
        let fs = VirtualFs::default();
        fs.deserialize(&bytes).unwrap();
        assert!(fs.stat("/a").unwrap().is_directory());
        assert!(fs.stat("/a/b").unwrap().is_directory());
        assert_eq!(fs.stat("/a/b").unwrap().permissions(), 0o755);
        assert_eq!(fs.read_file("/a/b/file.txt").unwrap(), b"deep");
    }

    #[test]
    fn late_directory_entry_applies_mode_and_keeps_children() {
        let entries = vec![
            SnapshotEntry {
                path: "/d/f".into(),
                mode: 0o644,
                body: SnapshotBody::File(Vec::new()),
            },
            SnapshotEntry {
                path: "/d".into(),
                mode: 0o711,
                body: SnapshotBody::Directory,
            },
        ];
        let tree = build_tree(&entries, 0o755).unwrap();
        assert_eq!(tree.lookup(&["d"]).unwrap().meta().mode, 0o711);
        assert!(tree.lookup(&["d", "f"]).is_some());
    }

    #[test]
    fn malformed_snapshots_leave_tree_untouched() {
        let fs = sample_fs();
        let good = fs.serialize().unwrap();

        let truncated = &good[..good.len() - 1];
        assert!(matches!(fs.deserialize(truncated), Err(FsError::Snapshot(_))));

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(matches!(fs.deserialize(&trailing), Err(FsError::Snapshot(_))));

        let bad_kind = vec![1, 0, 0, 0, 2, 0, b'/', b'x', 9, 0, 0];
        assert!(matches!(fs.deserialize(&bad_kind), Err(FsError::Snapshot(_))));

        let nested_under_file = encode_entries(&[
            SnapshotEntry {
                path: "/f".into(),
                mode: 0o644,
                body: SnapshotBody::File(Vec::new()),
            },
            SnapshotEntry {
                path: "/f/child".into(),
                mode: 0o644,
                body: SnapshotBody::File(Vec::new()),
            },
        ])
        .unwrap();
        assert!(matches!(fs.deserialize(&nested_under_file), Err(FsError::Snapshot(_))));

        assert_eq!(fs.serialize().unwrap(), good);
    }

    #[test]
    fn oversized_paths_are_rejected() {
        let entry = SnapshotEntry {
            path: format!("/{}", "x".repeat(u16::MAX as usize)),
            mode: 0o644,
            body: SnapshotBody::Directory,
        };
        assert!(matches!(encode_entries(&[entry]), Err(FsError::Snapshot(_))));
    }
}
