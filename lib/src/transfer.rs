//! # Data sources and sinks
//!
//! A [`DataSource`] or [`DataSink`] binds a backend handle and a root path
//! together with a [`Release`] action (typically an unmount) that must run
//! exactly once when the transfer is over.
//!
//! [`VolumeStore`] is the usual way of getting one: it mounts a backend
//! through a [`MountService`] and scopes the transfer to one volume
//! directory.

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio::io::AsyncRead;
use tracing::instrument;

use crate::error::ArchiveError;
use crate::filter::FilterSpec;
use crate::operation::Operation;
use crate::tar::{pack_with_guard, unpack, unpack_async, ExportOptions, ExportStream, ImportSummary};
use crate::target::{LocalTarget, Target};

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send + Sync>;

/// An action that runs exactly once: on [`Release::close`], or else when
/// dropped.
pub struct Release {
    name: String,
    action: Option<ReleaseFn>,
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("name", &self.name)
            .field("pending", &self.action.is_some())
            .finish()
    }
}

impl Release {
    /// Wrap a release action; `name` is used when logging a failure.
    pub fn new(
        name: impl Into<String>,
        action: impl FnOnce() -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Some(Box::new(action)),
        }
    }

    /// Nothing to release.
    pub fn noop() -> Self {
        Self {
            name: String::new(),
            action: None,
        }
    }

    /// Run the action now and return its result.
    pub fn close(mut self) -> Result<()> {
        match self.action.take() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Some(f) = self.action.take() {
            if let Err(e) = f() {
                tracing::error!("Failed to release {}: {e:#}", self.name);
            }
        }
    }
}

/// A readable backend subtree.
#[derive(Debug)]
pub struct DataSource {
    target: Arc<dyn Target>,
    root: Utf8PathBuf,
    release: Release,
}

impl DataSource {
    /// Bind `root` on `target`; `release` runs once the source is done.
    pub fn new(target: Arc<dyn Target>, root: impl Into<Utf8PathBuf>, release: Release) -> Self {
        Self {
            target,
            root: root.into(),
            release,
        }
    }

    /// The backend path exports are rooted at.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Start an export; see [`crate::tar::pack`].
    ///
    /// The source is consumed: its release action runs on the producer
    /// thread when the walk is over, and its failure is only logged.
    pub fn export(
        self,
        op: &Operation,
        spec: &FilterSpec,
        include_data: bool,
    ) -> Result<ExportStream> {
        let Self {
            target,
            root,
            release,
        } = self;
        pack_with_guard(
            op,
            target,
            &root,
            spec,
            include_data,
            ExportOptions::default(),
            release,
        )
    }

    /// Release without exporting.
    pub fn close(self) -> Result<()> {
        self.release.close()
    }
}

/// A writable backend subtree.
#[derive(Debug)]
pub struct DataSink {
    target: Arc<dyn Target>,
    root: Utf8PathBuf,
    release: Release,
}

impl DataSink {
    /// Bind `root` on `target`; `release` runs once the sink is closed.
    pub fn new(target: Arc<dyn Target>, root: impl Into<Utf8PathBuf>, release: Release) -> Self {
        Self {
            target,
            root: root.into(),
            release,
        }
    }

    /// The backend path imports are written beneath.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Import a tar stream; see [`crate::tar::unpack`].
    pub fn import(
        &self,
        op: &Operation,
        spec: &FilterSpec,
        src: impl Read,
    ) -> Result<ImportSummary> {
        unpack(op, self.target.as_ref(), &self.root, spec, src)
    }

    /// Import an asynchronous tar stream; see [`crate::tar::unpack_async`].
    pub async fn import_async(
        &self,
        op: &Operation,
        spec: &FilterSpec,
        src: impl AsyncRead + Send + 'static,
    ) -> Result<ImportSummary> {
        unpack_async(op, Arc::clone(&self.target), &self.root, spec, src).await
    }

    /// Run the release action and return its result.
    pub fn close(self) -> Result<()> {
        self.release.close()
    }
}

/// Something that makes a backend available for the length of a transfer.
pub trait MountService: Send + Sync + std::fmt::Debug {
    /// Make the backend available.
    fn mount(&self, op: &Operation) -> Result<Arc<dyn Target>>;
    /// Undo a previous [`MountService::mount`].
    fn unmount(&self, op: &Operation) -> Result<()>;
}

/// A directory of the host filesystem; mounting just opens it.
#[derive(Debug)]
pub struct LocalMount {
    path: Utf8PathBuf,
}

impl LocalMount {
    /// Serve the directory at `path`.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MountService for LocalMount {
    fn mount(&self, _op: &Operation) -> Result<Arc<dyn Target>> {
        let target = LocalTarget::open_ambient(&self.path)?;
        Ok(Arc::new(target))
    }

    fn unmount(&self, op: &Operation) -> Result<()> {
        tracing::debug!("{}: releasing {}", op.id(), self.path);
        Ok(())
    }
}

/// Volumes stored as directories below `<dir>/volumes` of a mounted backend.
#[derive(Debug)]
pub struct VolumeStore {
    service: Arc<dyn MountService>,
    dir: Utf8PathBuf,
}

impl VolumeStore {
    /// Create a store over `service`, with volumes beneath `dir`.
    pub fn new(service: Arc<dyn MountService>, dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            service,
            dir: dir.into(),
        }
    }

    /// The backend path of a volume. The id must be a single plain path
    /// component.
    pub fn volume_path(&self, id: &str) -> Result<Utf8PathBuf, ArchiveError> {
        let mut components = Utf8Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Utf8Component::Normal(name)), None) if name == id && !id.contains('\0') => {
                Ok(self.dir.join("volumes").join(id))
            }
            _ => Err(ArchiveError::InvalidVolume(id.to_owned())),
        }
    }

    fn mount(&self, op: &Operation) -> Result<(Arc<dyn Target>, Release)> {
        let target = self.service.mount(op)?;
        let service = Arc::clone(&self.service);
        let op = op.clone();
        let release = Release::new(format!("mount for {}", op.id()), move || {
            service.unmount(&op)
        });
        Ok((target, release))
    }

    /// Mount the backend and bind the volume for reading.
    #[context("Opening volume {id}")]
    pub fn new_data_source(&self, op: &Operation, id: &str) -> Result<DataSource> {
        let root = self.volume_path(id)?;
        let (target, release) = self.mount(op)?;
        Ok(DataSource::new(target, root, release))
    }

    /// Mount the backend and bind the volume for writing.
    #[context("Opening volume {id}")]
    pub fn new_data_sink(&self, op: &Operation, id: &str) -> Result<DataSink> {
        let root = self.volume_path(id)?;
        let (target, release) = self.mount(op)?;
        Ok(DataSink::new(target, root, release))
    }

    /// Import a tar stream into a volume.
    ///
    /// The backend is released before returning, whatever the outcome; a
    /// failure to release is logged but does not change the result.
    #[instrument(level = "debug", skip_all, fields(op = %op.id(), volume = id))]
    pub async fn import(
        &self,
        op: &Operation,
        id: &str,
        spec: &FilterSpec,
        src: impl AsyncRead + Send + 'static,
    ) -> Result<ImportSummary> {
        let sink = self.new_data_sink(op, id)?;
        let r = sink.import_async(op, spec, src).await;
        if let Err(e) = sink.close() {
            tracing::error!("Failed to release volume {id}: {e:#}");
        }
        r
    }

    /// Export a volume as a tar stream. The backend is released once the
    /// stream is complete.
    #[instrument(level = "debug", skip_all, fields(op = %op.id(), volume = id))]
    pub fn export(
        &self,
        op: &Operation,
        id: &str,
        spec: &FilterSpec,
        include_data: bool,
    ) -> Result<ExportStream> {
        self.new_data_source(op, id)?
            .export(op, spec, include_data)
    }
}
