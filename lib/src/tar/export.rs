//! Producing a tar stream from a backend.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::instrument;

use crate::error::{is_not_found, ArchiveError};
use crate::filter::FilterSpec;
use crate::operation::{CancellableRead, Operation};
use crate::target::{backend_path, EntryInfo, EntryKind, Target, TargetExt};

type Chunk = std::io::Result<Bytes>;

/// Tuning for [`pack`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ExportOptions {
    /// Size of the chunks handed to the consumer.
    pub chunk_size: usize,
    /// Number of chunks that may be in flight before the producer blocks.
    pub queue_depth: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            queue_depth: 4,
        }
    }
}

/// The readable end of an export.
///
/// Yields the archive bytes, then either a clean end of stream or a single
/// error carrying the failure that stopped the producer. Dropping it stops
/// the producer at its next write.
pub struct ExportStream {
    inner: StreamReader<ReceiverStream<Chunk>, Bytes>,
}

impl std::fmt::Debug for ExportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportStream").finish_non_exhaustive()
    }
}

impl ExportStream {
    fn new(rx: mpsc::Receiver<Chunk>) -> Self {
        Self {
            inner: StreamReader::new(ReceiverStream::new(rx)),
        }
    }
}

impl AsyncRead for ExportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Buffers the tar builder's output into chunks and hands them to the
/// consumer, blocking while the queue is full.
struct ChannelWriter {
    tx: Option<mpsc::Sender<Chunk>>,
    buf: BytesMut,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Chunk>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            tx: Some(tx),
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn send(&mut self, item: Chunk) -> std::io::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        };
        tx.blocking_send(item)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    /// Deliver the single terminal item and close the channel.
    fn finish(mut self, r: Result<()>) {
        let r = match r {
            Ok(()) => self.flush(),
            Err(e) => {
                // A partial tail is of no use once the archive is known to be incomplete
                self.buf.clear();
                tracing::debug!("Export failed: {e:#}");
                let kind = e
                    .chain()
                    .find_map(|c| c.downcast_ref::<std::io::Error>())
                    .map(|e| e.kind())
                    .unwrap_or(std::io::ErrorKind::Other);
                self.send(Err(std::io::Error::new(kind, e)))
            }
        };
        if r.is_err() {
            tracing::debug!("Export consumer went away");
        }
        self.tx = None;
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= self.chunk_size {
            let chunk = self.buf.split().freeze();
            self.send(Ok(chunk))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = self.buf.split().freeze();
            self.send(Ok(chunk))?;
        }
        Ok(())
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        // Only reached with a live sender if the producer unwound
        if self.tx.is_some() {
            let _ = self.send(Err(std::io::Error::other(
                "Export producer terminated unexpectedly",
            )));
        }
    }
}

fn new_header(info: &EntryInfo, entry_type: tar::EntryType) -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(entry_type);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mode(info.mode);
    h.set_mtime(info.mtime);
    h.set_size(0);
    h
}

/// Output of the tar builder that goes quiet once the walk has failed.
///
/// Dropping a [`tar::Builder`] appends the end-of-archive marker; after a
/// failure that would make a truncated archive look complete.
struct FailableWriter<W> {
    inner: W,
    failed: bool,
}

impl<W: Write> Write for FailableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.failed || std::thread::panicking() {
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.failed {
            return Ok(());
        }
        self.inner.flush()
    }
}

struct Exporter<'a, W: Write> {
    op: &'a Operation,
    target: &'a dyn Target,
    spec: &'a FilterSpec,
    /// Backend path of the archive root.
    scope: Utf8PathBuf,
    out: tar::Builder<FailableWriter<W>>,
}

impl<W: Write> Exporter<'_, W> {
    fn run(mut self) -> Result<W> {
        match self.walk() {
            Ok(()) => Ok(self.out.into_inner()?.inner),
            Err(e) => {
                self.out.get_mut().failed = true;
                Err(e)
            }
        }
    }

    fn walk(&mut self) -> Result<()> {
        let mut queue: VecDeque<Utf8PathBuf> = self
            .spec
            .walk_seeds()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect();
        while let Some(path) = queue.pop_front() {
            self.visit(&path, &mut queue)?;
        }
        Ok(())
    }

    fn visit(&mut self, path: &Utf8Path, queue: &mut VecDeque<Utf8PathBuf>) -> Result<()> {
        self.op.check_cancelled()?;
        let backend = backend_path(&self.scope, path);
        let excluded = self.spec.excluded_path(&self.scope, &backend);
        if excluded && !self.spec.must_descend(path) {
            tracing::debug!("Excluded: {path}");
            return Ok(());
        }
        let Some(info) = self
            .target
            .lookup_optional(self.op, &backend)
            .with_context(|| format!("Querying {backend}"))?
        else {
            tracing::debug!("Vanished before lookup: {path}");
            return Ok(());
        };
        let name = path.as_str().trim_start_matches('/');
        match info.kind {
            EntryKind::Directory => {
                if !excluded && !name.is_empty() {
                    let mut h = new_header(&info, tar::EntryType::Directory);
                    self.out
                        .append_data(&mut h, format!("{name}/"), std::io::empty())?;
                }
                let mut children = match self.target.read_dir(self.op, &backend) {
                    Ok(c) => c,
                    Err(e) if is_not_found(&e) => {
                        tracing::debug!("Vanished before listing: {path}");
                        return Ok(());
                    }
                    Err(e) => return Err(e).with_context(|| format!("Listing {backend}")),
                };
                children.sort_by(|a, b| a.name.cmp(&b.name));
                queue.extend(children.into_iter().map(|c| path.join(c.name)));
            }
            _ if excluded => {}
            EntryKind::File => self.append_file(name, &backend, &info)?,
            EntryKind::Symlink => self.append_symlink(name, &backend, &info)?,
            EntryKind::Other => tracing::debug!("Skipping special file: {path}"),
        }
        Ok(())
    }

    fn append_file(&mut self, name: &str, backend: &Utf8Path, info: &EntryInfo) -> Result<()> {
        let mut h = new_header(info, tar::EntryType::Regular);
        let src = match self.target.open(self.op, backend) {
            Ok(src) => src,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::debug!("Permission denied, writing header only: {backend}");
                self.out.append_data(&mut h, name, std::io::empty())?;
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {
                tracing::debug!("Vanished before open: {backend}");
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("Opening {backend}")),
        };
        let size = info.size;
        h.set_size(size);
        // Exactly `size` bytes, whatever happens to the file meanwhile
        let src = CancellableRead::new(self.op, src)
            .take(size)
            .chain(std::io::repeat(0))
            .take(size);
        self.out
            .append_data(&mut h, name, src)
            .with_context(|| format!("Copying {backend}"))?;
        Ok(())
    }

    fn append_symlink(&mut self, name: &str, backend: &Utf8Path, info: &EntryInfo) -> Result<()> {
        let mut h = new_header(info, tar::EntryType::Symlink);
        match self.target.read_link(self.op, backend) {
            Ok(link_target) => self.out.append_link(&mut h, name, link_target)?,
            Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                tracing::info!("Symbolic links unsupported, writing {name} without a target");
                self.out.append_data(&mut h, name, std::io::empty())?;
            }
            Err(e) if is_not_found(&e) => {
                tracing::debug!("Vanished before readlink: {backend}");
            }
            Err(e) => return Err(e).with_context(|| format!("Reading link {backend}")),
        }
        Ok(())
    }
}

/// Synchronously write the filtered tree rooted at `root` + the target path
/// of `spec` as a tar stream.
///
/// The scope root must exist. Entries that disappear while the tree is
/// being walked are skipped.
#[context("Exporting {root}")]
pub fn write_tar<W: Write>(
    op: &Operation,
    target: &dyn Target,
    root: &Utf8Path,
    spec: &FilterSpec,
    out: W,
) -> Result<W> {
    let scope = backend_path(root, spec.target());
    check_scope(op, target, &scope)?;
    let exporter = Exporter {
        op,
        target,
        spec,
        scope,
        out: tar::Builder::new(FailableWriter {
            inner: out,
            failed: false,
        }),
    };
    exporter.run()
}

fn check_scope(op: &Operation, target: &dyn Target, scope: &Utf8Path) -> Result<()> {
    match target.lookup_optional(op, scope)? {
        Some(info) if info.is_dir() => Ok(()),
        Some(_) => Err(ArchiveError::Conflict {
            path: scope.to_owned(),
            reason: "not a directory",
        }
        .into()),
        None => Err(ArchiveError::NotFound(scope.to_owned()).into()),
    }
}

/// Start exporting the filtered tree rooted at `root` + the target path of
/// `spec`.
///
/// A missing scope root is reported here; everything after that arrives
/// through the returned stream. The walk runs on a blocking thread of the
/// current Tokio runtime; `guard` is dropped there once the walk is over,
/// before the consumer sees the end of the stream.
pub(crate) fn pack_with_guard<G: Send + 'static>(
    op: &Operation,
    target: Arc<dyn Target>,
    root: &Utf8Path,
    spec: &FilterSpec,
    include_data: bool,
    opts: ExportOptions,
    guard: G,
) -> Result<ExportStream> {
    let handle = tokio::runtime::Handle::try_current()
        .context("Exporting requires a Tokio runtime")?;
    if !include_data {
        tracing::debug!("Metadata-only export requested; file data is included regardless");
    }
    check_scope(op, target.as_ref(), &backend_path(root, spec.target()))
        .with_context(|| format!("Exporting {root}"))?;
    let (tx, rx) = mpsc::channel(opts.queue_depth.max(1));
    let op = op.clone();
    let root = root.to_owned();
    let spec = spec.clone();
    let span = op.span();
    handle.spawn_blocking(move || {
        let _entered = span.enter();
        let mut writer = ChannelWriter::new(tx, opts.chunk_size);
        let r = write_tar(&op, target.as_ref(), &root, &spec, &mut writer).map(drop);
        drop(target);
        drop(guard);
        writer.finish(r);
    });
    Ok(ExportStream::new(rx))
}

/// Export the filtered tree rooted at `root` + the target path of `spec`
/// as a tar stream.
///
/// `include_data` is reserved: file contents are always included.
#[instrument(level = "debug", skip_all, fields(op = %op.id()))]
pub fn pack(
    op: &Operation,
    target: Arc<dyn Target>,
    root: &Utf8Path,
    spec: &FilterSpec,
    include_data: bool,
    opts: ExportOptions,
) -> Result<ExportStream> {
    pack_with_guard(op, target, root, spec, include_data, opts, ())
}
