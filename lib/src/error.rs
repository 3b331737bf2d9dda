//! # Typed failures of the transfer engine
//!
//! Pipelines return [`anyhow::Result`], but every failure that a caller
//! may want to act on is rooted in either an [`ArchiveError`] or a backend
//! [`std::io::Error`]. [`classify`] maps an error chain back onto the
//! engine's error taxonomy.

use camino::Utf8PathBuf;

/// A failure raised by the engine itself, as opposed to a backend.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The filter role mapping could not be turned into a [`crate::filter::FilterSpec`].
    #[error("Invalid filter spec: {0}")]
    InvalidFilter(String),
    /// The root of a transfer does not exist on the backend.
    #[error("Target not found: {0}")]
    NotFound(Utf8PathBuf),
    /// A write path exists with an incompatible type.
    #[error("Conflict at {path}: {reason}")]
    Conflict {
        /// The backend path that was being written.
        path: Utf8PathBuf,
        /// What was found in its place.
        reason: &'static str,
    },
    /// The incoming archive could not be decoded.
    #[error("Malformed archive stream")]
    StreamCorrupt(#[source] std::io::Error),
    /// The operation was cancelled by its caller.
    #[error("Operation {0} was cancelled")]
    Cancelled(String),
    /// A volume identifier that does not name a single directory.
    #[error("Invalid volume id: {0:?}")]
    InvalidVolume(String),
}

/// The engine's error taxonomy.
///
/// `TransientRace`, `Unsupported` and `PermissionDenied` are normally
/// recovered inside the pipelines; they only reach a caller when a backend
/// surfaces them outside of the recoverable spots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Target root or referenced path absent.
    NotFound,
    /// Write path exists with an incompatible type.
    Conflict,
    /// An entry vanished between listing and lookup.
    TransientRace,
    /// The backend cannot represent the requested object.
    Unsupported,
    /// Access to a path was refused.
    PermissionDenied,
    /// The archive stream is malformed.
    StreamCorrupt,
    /// The filter role mapping was rejected.
    InvalidFilter,
    /// The caller cancelled the operation.
    Cancelled,
    /// Any other failure.
    Fatal,
}

/// Classify an error chain.
///
/// The outermost [`ArchiveError`] wins; otherwise the first
/// [`std::io::Error`] found in the chain decides.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(classify_cause)
        .unwrap_or(ErrorKind::Fatal)
}

fn classify_cause(cause: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
    if let Some(e) = cause.downcast_ref::<ArchiveError>() {
        return Some(e.kind());
    }
    let e = cause.downcast_ref::<std::io::Error>()?;
    // Errors that crossed the export stream carry the original chain inside.
    let mut inner = e.get_ref().map(|i| i as &(dyn std::error::Error + 'static));
    while let Some(cause) = inner {
        if let Some(kind) = classify_cause(cause) {
            return Some(kind);
        }
        inner = cause.source();
    }
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::Unsupported => ErrorKind::Unsupported,
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::Fatal,
    };
    Some(kind)
}

impl ArchiveError {
    /// Where this error sits in the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::InvalidFilter(_) | ArchiveError::InvalidVolume(_) => {
                ErrorKind::InvalidFilter
            }
            ArchiveError::NotFound(_) => ErrorKind::NotFound,
            ArchiveError::Conflict { .. } => ErrorKind::Conflict,
            ArchiveError::StreamCorrupt(_) => ErrorKind::StreamCorrupt,
            ArchiveError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// Returns true if this backend error means the path does not exist.
pub(crate) fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}
