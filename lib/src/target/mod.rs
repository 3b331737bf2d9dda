//! # Storage backend capabilities
//!
//! The pack and unpack pipelines are written against [`Target`] only,
//! never against a concrete backend. A backend exposes a directory tree
//! through absolute UTF-8 paths; `/` is the root of whatever the handle
//! grants access to.
//!
//! "Does not exist" is always reported as [`std::io::ErrorKind::NotFound`],
//! and optional capabilities (symbolic links) as
//! [`std::io::ErrorKind::Unsupported`].

use std::io::{Read, Write};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::operation::Operation;

mod local;
pub use local::*;
mod memory;
pub use memory::*;

/// The type of a backend entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A directory.
    Directory,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
    /// A fifo, socket or device node.
    Other,
}

/// Metadata for a single backend entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Final path component; `/` for the root.
    pub name: String,
    /// What kind of entry this is.
    pub kind: EntryKind,
    /// Content length in bytes for regular files.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
}

impl EntryInfo {
    /// The directory hint.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A capability handle to a directory-tree-shaped store.
///
/// Every call receives the [`Operation`] of the transfer driving it.
/// No call is assumed to be atomic with respect to another one; callers
/// check for existence before creating.
pub trait Target: Send + Sync + std::fmt::Debug {
    /// Metadata for `path`, without following a final symbolic link.
    fn lookup(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<EntryInfo>;

    /// Metadata for the children of the directory `path`, in no particular order.
    fn read_dir(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<Vec<EntryInfo>>;

    /// Open a regular file for reading.
    fn open(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<Box<dyn Read + Send>>;

    /// Create (or truncate) a regular file for writing.
    fn open_file(
        &self,
        op: &Operation,
        path: &Utf8Path,
        mode: u32,
    ) -> std::io::Result<Box<dyn Write + Send>>;

    /// Create a single directory; the parent must exist.
    fn mkdir(&self, op: &Operation, path: &Utf8Path, mode: u32) -> std::io::Result<()>;

    /// Remove a file, symbolic link or empty directory.
    fn remove(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<()>;

    /// Read the target of a symbolic link.
    fn read_link(&self, _op: &Operation, _path: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
        Err(std::io::ErrorKind::Unsupported.into())
    }

    /// Create a symbolic link at `path` pointing to `link_target`.
    fn symlink(
        &self,
        _op: &Operation,
        _link_target: &Utf8Path,
        _path: &Utf8Path,
    ) -> std::io::Result<()> {
        Err(std::io::ErrorKind::Unsupported.into())
    }
}

/// Convenience helpers over any [`Target`].
pub trait TargetExt: Target {
    /// Like [`Target::lookup`], but maps "does not exist" to `None`.
    fn lookup_optional(
        &self,
        op: &Operation,
        path: &Utf8Path,
    ) -> std::io::Result<Option<EntryInfo>> {
        match self.lookup(op, path) {
            Ok(info) => Ok(Some(info)),
            Err(e) if crate::error::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: Target + ?Sized> TargetExt for T {}

/// Place an absolute archive-namespace path beneath a backend root.
///
/// Only named components are used, so the result never leaves `root`.
pub fn backend_path(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let mut ret = root.to_owned();
    for part in path.components() {
        if let Utf8Component::Normal(part) = part {
            ret.push(part);
        }
    }
    ret
}
