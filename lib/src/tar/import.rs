//! Writing a tar stream into a backend.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio::io::AsyncRead;
use tracing::instrument;

use crate::error::ArchiveError;
use crate::filter::FilterSpec;
use crate::operation::{CancellableRead, Operation};
use crate::target::{backend_path, Target, TargetExt};

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;

/// What an import did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Directory entries applied.
    pub directories: u64,
    /// Regular files written.
    pub files: u64,
    /// Symbolic links created.
    pub symlinks: u64,
    /// Entries left out by the filter, or of a kind that is not transferred.
    pub skipped: u64,
    /// Symbolic links the backend could not represent.
    pub unsupported: u64,
}

fn corrupt(e: std::io::Error) -> ArchiveError {
    ArchiveError::StreamCorrupt(e)
}

fn entry_mode(header: &tar::Header, default: u32) -> Result<u32> {
    let mode = header.mode().map_err(corrupt)? & 0o7777;
    Ok(if mode == 0 { default } else { mode })
}

/// Create `path` and any missing ancestors below `root`, outermost first.
///
/// Missing ancestors are created with mode 0755; `path` itself with `mode`.
/// Existing directories are left untouched.
fn mkdir_all(
    op: &Operation,
    target: &dyn Target,
    root: &Utf8Path,
    path: &Utf8Path,
    mode: u32,
) -> Result<()> {
    let mut todo: Vec<&Utf8Path> = path.ancestors().take_while(|p| *p != root).collect();
    todo.reverse();
    for dir in todo {
        let mode = if dir == path { mode } else { DEFAULT_DIR_MODE };
        match target.lookup_optional(op, dir)? {
            Some(info) if info.is_dir() => continue,
            Some(_) => {
                return Err(ArchiveError::Conflict {
                    path: dir.to_owned(),
                    reason: "not a directory",
                }
                .into())
            }
            None => {}
        }
        match target.mkdir(op, dir, mode) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost a race with someone else creating it
                if !target.lookup(op, dir)?.is_dir() {
                    return Err(ArchiveError::Conflict {
                        path: dir.to_owned(),
                        reason: "not a directory",
                    }
                    .into());
                }
            }
            Err(e) => return Err(e).with_context(|| format!("Creating directory {dir}")),
        }
    }
    Ok(())
}

/// Clear the way for a non-directory at `path`.
fn prepare_leaf(op: &Operation, target: &dyn Target, root: &Utf8Path, path: &Utf8Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdir_all(op, target, root, parent, DEFAULT_DIR_MODE)?;
    }
    match target.lookup_optional(op, path)? {
        Some(info) if info.is_dir() => Err(ArchiveError::Conflict {
            path: path.to_owned(),
            reason: "existing directory",
        }
        .into()),
        Some(_) => target
            .remove(op, path)
            .with_context(|| format!("Removing {path}")),
        None => Ok(()),
    }
}

struct Importer<'a> {
    op: &'a Operation,
    target: &'a dyn Target,
    spec: &'a FilterSpec,
    root: &'a Utf8Path,
    summary: ImportSummary,
}

impl Importer<'_> {
    fn import_entry<R: Read>(&mut self, mut entry: tar::Entry<'_, R>) -> Result<()> {
        let name = entry.path().map_err(corrupt)?.into_owned();
        let name = Utf8PathBuf::try_from(name).map_err(|e| corrupt(e.into_io_error()))?;
        if self.spec.excluded(name.as_str()) {
            tracing::debug!("Excluded: {name}");
            self.summary.skipped += 1;
            return Ok(());
        }
        let Some(dest) = self.spec.rewrite(name.as_str()) else {
            self.summary.skipped += 1;
            return Ok(());
        };
        let dest = backend_path(self.root, &dest);
        let (op, target, root) = (self.op, self.target, self.root);
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                let mode = entry_mode(entry.header(), DEFAULT_DIR_MODE)?;
                mkdir_all(op, target, root, &dest, mode)?;
                self.summary.directories += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mode = entry_mode(entry.header(), DEFAULT_FILE_MODE)?;
                let size = entry.size();
                prepare_leaf(op, target, root, &dest)?;
                let mut out = target
                    .open_file(op, &dest, mode)
                    .with_context(|| format!("Creating {dest}"))?;
                let n = std::io::copy(&mut CancellableRead::new(op, &mut entry), &mut out)
                    .with_context(|| format!("Writing {dest}"))?;
                out.flush().with_context(|| format!("Writing {dest}"))?;
                if n != size {
                    return Err(corrupt(std::io::ErrorKind::UnexpectedEof.into()))
                        .with_context(|| format!("Reading {name}"));
                }
                self.summary.files += 1;
            }
            tar::EntryType::Symlink => {
                let Some(link_target) = entry.link_name().map_err(corrupt)? else {
                    tracing::debug!("Symbolic link without a target: {name}");
                    self.summary.skipped += 1;
                    return Ok(());
                };
                let link_target = Utf8PathBuf::try_from(link_target.into_owned())
                    .map_err(|e| corrupt(e.into_io_error()))?;
                prepare_leaf(op, target, root, &dest)?;
                match target.symlink(op, &link_target, &dest) {
                    Ok(()) => self.summary.symlinks += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                        tracing::info!("Symbolic links unsupported, skipping {name}");
                        self.summary.unsupported += 1;
                    }
                    Err(e) => return Err(e).with_context(|| format!("Creating link {dest}")),
                }
            }
            tar::EntryType::Link => {
                tracing::warn!("Skipping hard link {name}");
                self.summary.skipped += 1;
            }
            o => {
                tracing::debug!("Skipping {name} of type {o:?}");
                self.summary.skipped += 1;
            }
        }
        Ok(())
    }
}

/// Write the entries of a tar stream beneath `root`, as selected and
/// relocated by `spec`.
///
/// `root` must exist. There is no rollback: a failure leaves whatever was
/// written so far in place.
#[context("Importing into {root}")]
#[instrument(level = "debug", skip_all, fields(op = %op.id()))]
pub fn unpack(
    op: &Operation,
    target: &dyn Target,
    root: &Utf8Path,
    spec: &FilterSpec,
    src: impl Read,
) -> Result<ImportSummary> {
    match target.lookup_optional(op, root)? {
        Some(info) if info.is_dir() => {}
        Some(_) => {
            return Err(ArchiveError::Conflict {
                path: root.to_owned(),
                reason: "not a directory",
            }
            .into())
        }
        None => return Err(ArchiveError::NotFound(root.to_owned()).into()),
    }
    let mut importer = Importer {
        op,
        target,
        spec,
        root,
        summary: Default::default(),
    };
    let mut archive = tar::Archive::new(src);
    for entry in archive.entries().map_err(corrupt)? {
        op.check_cancelled()?;
        let entry = entry.map_err(corrupt)?;
        importer.import_entry(entry)?;
    }
    // A failing producer may still report its error after the end-of-archive marker
    let mut rest = archive.into_inner();
    std::io::copy(&mut rest, &mut std::io::sink()).context("Reading past end of archive")?;
    tracing::debug!("Imported: {:?}", importer.summary);
    Ok(importer.summary)
}

/// Asynchronous wrapper for [`unpack`].
pub async fn unpack_async(
    op: &Operation,
    target: Arc<dyn Target>,
    root: &Utf8Path,
    spec: &FilterSpec,
    src: impl AsyncRead + Send + 'static,
) -> Result<ImportSummary> {
    // The source must be moved to the heap so we know it is stable for passing to the worker thread
    let src = Box::pin(src);
    let op = op.clone();
    let root = root.to_owned();
    let spec = spec.clone();
    let span = op.span();
    crate::tokio_util::spawn_blocking_flatten(move || {
        let _entered = span.enter();
        let src = tokio_util::io::SyncIoBridge::new(src);
        unpack(&op, target.as_ref(), &root, &spec, src)
    })
    .await
}
