//! # Filtered tar transfer CLI
//!
//! Command line frontend to export a directory tree as a tar stream and to
//! import one back, under the control of a filter specification.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use treetar_utils::PathQuotedDisplay;

use crate::error::ArchiveError;
use crate::filter::{FilterSpec, FilterType};
use crate::operation::Operation;
use crate::target::LocalTarget;
use crate::transfer::{DataSink, DataSource, LocalMount, Release, VolumeStore};

/// Options shared by export and import that build the filter specification.
#[derive(Debug, clap::Args)]
pub(crate) struct FilterOpts {
    /// Root of the transfer, relative to DIR (or to the volume)
    #[clap(long)]
    pub(crate) target: Option<String>,

    /// Force inclusion of a path relative to the target, even beneath an exclusion
    #[clap(long)]
    pub(crate) include: Vec<String>,

    /// Leave out a path relative to the target, and everything beneath it
    #[clap(long)]
    pub(crate) exclude: Vec<String>,

    /// Write imported entries beneath this path instead of the target
    #[clap(long)]
    pub(crate) rebase: Option<String>,

    /// Remove this prefix from imported entry names
    #[clap(long)]
    pub(crate) strip: Option<String>,

    /// Read additional roles from a JSON object mapping paths to
    /// `target`, `include`, `exclude`, `rebase` or `strip`
    #[clap(long, value_name = "FILE")]
    pub(crate) spec: Option<Utf8PathBuf>,

    /// Treat DIR as a volume store and transfer the volume with this id
    #[clap(long, value_name = "ID")]
    pub(crate) volume: Option<String>,
}

/// Write a filtered directory tree as a tar stream
#[derive(Debug, Parser)]
pub(crate) struct ExportOpts {
    /// Directory to read from
    pub(crate) dir: Utf8PathBuf,

    /// Write the archive here instead of to standard output
    #[clap(long, short = 'o')]
    pub(crate) output: Option<Utf8PathBuf>,

    #[clap(flatten)]
    pub(crate) filter: FilterOpts,
}

/// Unpack a tar stream into a directory tree
#[derive(Debug, Parser)]
pub(crate) struct ImportOpts {
    /// Directory to write into; it must exist
    pub(crate) dir: Utf8PathBuf,

    /// Read the archive from here instead of from standard input
    #[clap(long, short = 'i')]
    pub(crate) input: Option<Utf8PathBuf>,

    #[clap(flatten)]
    pub(crate) filter: FilterOpts,
}

/// Move directory trees in and out of tar streams, selecting paths with
/// inclusion and exclusion rules.
#[derive(Debug, Parser)]
#[clap(name = "treetar", version)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Write a directory tree to a tar stream
    Export(ExportOpts),
    /// Unpack a tar stream into a directory tree
    Import(ImportOpts),
}

fn roles_from_json(buf: &str) -> Result<BTreeMap<String, FilterType>> {
    serde_json::from_str(buf).map_err(Into::into)
}

#[context("Reading filter spec {}", PathQuotedDisplay::new(path))]
fn read_roles(path: &Utf8Path) -> Result<BTreeMap<String, FilterType>> {
    let buf = std::fs::read_to_string(path)?;
    roles_from_json(&buf)
}

impl FilterOpts {
    fn roles(&self) -> Result<Vec<(String, FilterType)>> {
        let mut roles = Vec::new();
        if let Some(path) = self.spec.as_deref() {
            roles.extend(read_roles(path)?);
        }
        let flags = [
            (&self.target, FilterType::Target),
            (&self.rebase, FilterType::Rebase),
            (&self.strip, FilterType::Strip),
        ];
        roles.extend(
            flags
                .into_iter()
                .filter_map(|(path, role)| path.clone().map(|p| (p, role))),
        );
        roles.extend(self.include.iter().map(|p| (p.clone(), FilterType::Include)));
        roles.extend(self.exclude.iter().map(|p| (p.clone(), FilterType::Exclude)));
        // The whole of DIR unless told otherwise
        if !roles.iter().any(|(_, role)| *role == FilterType::Target) {
            roles.push(("/".to_owned(), FilterType::Target));
        }
        Ok(roles)
    }

    pub(crate) fn to_spec(&self) -> Result<FilterSpec> {
        Ok(FilterSpec::new(self.roles()?)?)
    }
}

fn data_source(op: &Operation, dir: &Utf8Path, volume: Option<&str>) -> Result<DataSource> {
    match volume {
        Some(id) => VolumeStore::new(Arc::new(LocalMount::new(dir)), "/").new_data_source(op, id),
        None => {
            let target = LocalTarget::open_ambient(dir)?;
            Ok(DataSource::new(Arc::new(target), "/", Release::noop()))
        }
    }
}

fn data_sink(op: &Operation, dir: &Utf8Path, volume: Option<&str>) -> Result<DataSink> {
    match volume {
        Some(id) => VolumeStore::new(Arc::new(LocalMount::new(dir)), "/").new_data_sink(op, id),
        None => {
            let target = LocalTarget::open_ambient(dir)?;
            Ok(DataSink::new(Arc::new(target), "/", Release::noop()))
        }
    }
}

/// Implementation of `treetar export`
async fn export(opts: ExportOpts) -> Result<()> {
    let op = Operation::new("export");
    let spec = opts.filter.to_spec()?;
    let source = data_source(&op, &opts.dir, opts.filter.volume.as_deref())?;
    let mut out: Box<dyn AsyncWrite + Send + Unpin> = match opts.output.as_deref() {
        Some(path) => Box::new(tokio::fs::File::create(path).await.with_context(|| {
            format!("Creating {}", PathQuotedDisplay::new(path))
        })?),
        None => Box::new(tokio::io::stdout()),
    };
    let mut stream = source.export(&op, &spec, true)?;
    let copy = async {
        tokio::io::copy(&mut stream, &mut out).await?;
        out.flush().await?;
        Ok::<_, anyhow::Error>(())
    };
    tokio::select! {
        r = copy => r,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the stream stops the producer too
            op.cancel();
            Err(ArchiveError::Cancelled(op.id().to_owned()).into())
        }
    }
}

/// Implementation of `treetar import`
async fn import(opts: ImportOpts) -> Result<()> {
    let op = Operation::new("import");
    let spec = opts.filter.to_spec()?;
    let src: Box<dyn AsyncRead + Send + Unpin> = match opts.input.as_deref() {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Opening {}", PathQuotedDisplay::new(path)))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let sink = data_sink(&op, &opts.dir, opts.filter.volume.as_deref())?;
    let r = {
        let import = sink.import_async(&op, &spec, src);
        tokio::pin!(import);
        tokio::select! {
            r = &mut import => r,
            _ = tokio::signal::ctrl_c() => {
                op.cancel();
                // Let the worker notice and stop
                import.await
            }
        }
    };
    if let Err(e) = sink.close() {
        tracing::error!("Failed to release {}: {e:#}", PathQuotedDisplay::new(&opts.dir));
    }
    let summary = r?;
    println!(
        "Imported {} directories, {} files, {} symbolic links ({} skipped, {} unsupported)",
        summary.directories, summary.files, summary.symlinks, summary.skipped, summary.unsupported
    );
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Export(opts) => export(opts).await,
        Opt::Import(opts) => import(opts).await,
    }
}

#[test]
fn test_parse_export_args() {
    let o = Opt::try_parse_from([
        "treetar",
        "export",
        "/srv/data",
        "-o",
        "out.tar",
        "--target",
        "/app",
        "--exclude",
        "/cache",
        "--exclude",
        "/tmp",
        "--include",
        "/cache/keep",
    ])
    .unwrap();
    let o = match o {
        Opt::Export(o) => o,
        o => panic!("Expected export opts, not {o:?}"),
    };
    assert_eq!(o.dir.as_str(), "/srv/data");
    assert_eq!(o.output.as_deref().map(|p| p.as_str()), Some("out.tar"));
    let spec = o.filter.to_spec().unwrap();
    assert_eq!(spec.target().as_str(), "/app");
    assert_eq!(spec.exclusions().len(), 2);
    assert!(spec.excluded("cache/x"));
    assert!(!spec.excluded("cache/keep/x"));
}

#[test]
fn test_filter_opts_defaults() {
    let o = Opt::try_parse_from(["treetar", "import", "/dst", "--rebase", "/restored"]).unwrap();
    let o = match o {
        Opt::Import(o) => o,
        o => panic!("Expected import opts, not {o:?}"),
    };
    assert!(o.input.is_none());
    let spec = o.filter.to_spec().unwrap();
    assert_eq!(spec.target().as_str(), "/");
    assert_eq!(spec.rebase().as_str(), "/restored");
    assert_eq!(spec.strip().as_str(), "/");

    // Only one target flag
    assert!(Opt::try_parse_from(["treetar", "export", "/d", "--target", "/a", "--target", "/b"]).is_err());
}

#[test]
fn test_roles_from_json() {
    let roles = roles_from_json(r#"{"/data": "target", "/data/tmp": "exclude"}"#).unwrap();
    assert_eq!(roles.get("/data"), Some(&FilterType::Target));
    assert_eq!(roles.get("/data/tmp"), Some(&FilterType::Exclude));
    assert!(roles_from_json(r#"{"/data": "bogus"}"#).is_err());
    assert!(roles_from_json("[]").is_err());
}
