//! A [`Target`] over a local directory capability.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, DirBuilder, Metadata, OpenOptions};
use cap_std_ext::dirext::CapStdExtDirExt;
use cap_std_ext::{
    cap_primitives::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt},
    cap_std,
};
use fn_error_context::context;

use super::{EntryInfo, EntryKind, Target};
use crate::operation::Operation;

/// A local directory tree, confined beneath a [`Dir`] handle.
///
/// Symbolic links are supported in both directions; link targets are
/// stored verbatim and never followed by this backend.
#[derive(Debug)]
pub struct LocalTarget {
    root: Dir,
}

/// Map an absolute backend path onto a path relative to the handle.
fn rel(path: &Utf8Path) -> &Path {
    let path = path.as_str().trim_start_matches('/');
    if path.is_empty() {
        Path::new(".")
    } else {
        Path::new(path)
    }
}

fn entry_info(name: &str, meta: &Metadata) -> EntryInfo {
    let ftype = meta.file_type();
    let kind = if ftype.is_dir() {
        EntryKind::Directory
    } else if ftype.is_file() {
        EntryKind::File
    } else if ftype.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Other
    };
    EntryInfo {
        name: name.to_owned(),
        kind,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        mode: meta.mode() & 0o7777,
        mtime: u64::try_from(meta.mtime()).unwrap_or_default(),
    }
}

impl LocalTarget {
    /// Wrap an already opened directory.
    pub fn new(root: Dir) -> Self {
        Self { root }
    }

    /// Open a directory of the host filesystem.
    #[context("Opening {path}")]
    pub fn open_ambient(path: &Utf8Path) -> Result<Self> {
        let root = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self::new(root))
    }
}

impl Target for LocalTarget {
    fn lookup(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<EntryInfo> {
        let meta = self.root.symlink_metadata(rel(path))?;
        Ok(entry_info(path.file_name().unwrap_or("/"), &meta))
    }

    fn read_dir(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<Vec<EntryInfo>> {
        let mut ret = Vec::new();
        for entry in self.root.read_dir(rel(path))? {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|name| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid UTF-8 filename: {name:?}"),
                )
            })?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                // Removed since the listing; leave it to the caller's lookup.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            ret.push(entry_info(&name, &meta));
        }
        Ok(ret)
    }

    fn open(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<Box<dyn Read + Send>> {
        let f = self.root.open(rel(path))?;
        Ok(Box::new(f))
    }

    fn open_file(
        &self,
        _op: &Operation,
        path: &Utf8Path,
        mode: u32,
    ) -> std::io::Result<Box<dyn Write + Send>> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true).mode(mode);
        let f = self.root.open_with(rel(path), &opts)?;
        Ok(Box::new(f))
    }

    fn mkdir(&self, _op: &Operation, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
        let mut db = DirBuilder::new();
        db.mode(mode);
        self.root.create_dir_with(rel(path), &db)
    }

    fn remove(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<()> {
        let path = rel(path);
        if self.root.symlink_metadata(path)?.is_dir() {
            self.root.remove_dir(path)
        } else {
            self.root.remove_file(path)
        }
    }

    fn read_link(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
        let target = self.root.read_link_contents(rel(path))?;
        Utf8PathBuf::try_from(target).map_err(|e| e.into_io_error())
    }

    fn symlink(
        &self,
        _op: &Operation,
        link_target: &Utf8Path,
        path: &Utf8Path,
    ) -> std::io::Result<()> {
        self.root.symlink_contents(link_target, rel(path))
    }
}
