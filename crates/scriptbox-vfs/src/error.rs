// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the scriptbox virtual filesystem

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),
    #[error("malformed snapshot: {0}")]
    Snapshot(String),
}

impl FsError {
    /// POSIX-style error code, as surfaced to scripts by the fs emulation layer
    pub fn code(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "ENOENT",
            FsError::AlreadyExists(_) => "EEXIST",
            FsError::NotADirectory(_) => "ENOTDIR",
            FsError::IsADirectory(_) => "EISDIR",
            FsError::DirectoryNotEmpty(_) => "ENOTEMPTY",
            FsError::InvalidArgument(_) => "EINVAL",
            FsError::SymlinkLoop(_) => "ELOOP",
            FsError::Snapshot(_) => "EINVAL",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type FsResult<T> = Result<T, FsError>;
