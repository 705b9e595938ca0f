// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory virtual filesystem for the scriptbox runtime.
//!
//! The filesystem is a tree of [`FsNode`]s owned by a single root directory.
//! It offers synchronous file, directory and symlink operations, path
//! watching, and a byte-exact snapshot codec used to persist or transfer the
//! whole tree.

pub mod config;
pub mod error;
pub mod node;
pub mod path;
pub mod snapshot;
pub mod vfs;
pub mod watch;

pub use config::FsConfig;
pub use error::{FsError, FsResult};
pub use node::{reset_ino_counter, FsMetadata, FsNode, NodeKind, Stats};
pub use snapshot::{SnapshotBody, SnapshotEntry};
pub use vfs::VirtualFs;
pub use watch::{WatchEvent, WatchEventKind, WatchHandle, WatchId, WatchListener};
