//! # Operation handles
//!
//! Every entry point takes an [`Operation`]: a correlation id for logging
//! plus a cancellation token. It is passed unchanged into every backend
//! call, so a backend can log against the same id and give up early.

use std::io::Read;

use tokio_util::sync::CancellationToken;

use crate::error::ArchiveError;

/// A cancellable, identifiable unit of work.
#[derive(Debug, Clone)]
pub struct Operation {
    id: String,
    token: CancellationToken,
}

impl Operation {
    /// Start a new top-level operation.
    pub fn new(name: &str) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}.{name}", &uuid[..8]),
            token: CancellationToken::new(),
        }
    }

    /// Derive an operation that shares our id prefix and is cancelled
    /// whenever we are; cancelling the child leaves the parent alone.
    pub fn child(&self, name: &str) -> Self {
        Self {
            id: format!("{}.{name}", self.id),
            token: self.token.child_token(),
        }
    }

    /// The correlation identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        tracing::debug!("Cancelling operation {}", self.id);
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Return an error if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), ArchiveError> {
        if self.is_cancelled() {
            return Err(ArchiveError::Cancelled(self.id.clone()));
        }
        Ok(())
    }

    /// The underlying token, for use in `tokio::select!`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A span carrying the correlation id.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("op", id = %self.id)
    }
}

/// A reader that fails once its operation is cancelled.
///
/// Used around backend file streams so that a long byte copy is abandoned
/// at the next read instead of running to completion.
#[derive(Debug)]
pub(crate) struct CancellableRead<'a, R> {
    op: &'a Operation,
    inner: R,
}

impl<'a, R: Read> CancellableRead<'a, R> {
    pub(crate) fn new(op: &'a Operation, inner: R) -> Self {
        Self { op, inner }
    }
}

impl<R: Read> Read for CancellableRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Not ErrorKind::Interrupted: io::copy would just retry.
        self.op.check_cancelled().map_err(std::io::Error::other)?;
        self.inner.read(buf)
    }
}
