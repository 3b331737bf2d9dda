//! An in-memory [`Target`], used by tests and as a scratch backend.
//!
//! Symbolic links are not supported. Faults can be injected per path to
//! exercise the recoverable error paths of the pipelines.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use super::{backend_path, EntryInfo, EntryKind, Target};
use crate::operation::Operation;

#[derive(Debug, Clone)]
enum Node {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<Utf8PathBuf, Node>,
    open_errors: BTreeMap<Utf8PathBuf, ErrorKind>,
    vanished: BTreeSet<Utf8PathBuf>,
}

impl State {
    fn get(&self, path: &Utf8Path) -> std::io::Result<&Node> {
        if self.vanished.contains(path) {
            return Err(ErrorKind::NotFound.into());
        }
        self.nodes.get(path).ok_or_else(|| ErrorKind::NotFound.into())
    }

    /// The parent of `path` must be an existing directory.
    fn check_parent(&self, path: &Utf8Path) -> std::io::Result<()> {
        let Some(parent) = path.parent() else {
            // The root itself
            return Err(ErrorKind::AlreadyExists.into());
        };
        match self.get(parent)? {
            Node::Dir { .. } => Ok(()),
            Node::File { .. } => Err(ErrorKind::NotADirectory.into()),
        }
    }

    fn check_open_error(&self, path: &Utf8Path) -> std::io::Result<()> {
        match self.open_errors.get(path) {
            Some(kind) => Err((*kind).into()),
            None => Ok(()),
        }
    }
}

/// A directory tree held in memory.
///
/// Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemTarget {
    state: Arc<Mutex<State>>,
}

impl Default for MemTarget {
    fn default() -> Self {
        Self::new()
    }
}

fn key(path: &Utf8Path) -> Utf8PathBuf {
    backend_path(Utf8Path::new("/"), path)
}

fn entry_info(path: &Utf8Path, node: &Node) -> EntryInfo {
    let (kind, size, mode) = match node {
        Node::Dir { mode } => (EntryKind::Directory, 0, *mode),
        Node::File { mode, data } => (EntryKind::File, data.len() as u64, *mode),
    };
    EntryInfo {
        name: path.file_name().unwrap_or("/").to_owned(),
        kind,
        size,
        mode,
        mtime: 0,
    }
}

impl MemTarget {
    /// Create an empty tree; only the root directory exists.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(Utf8PathBuf::from("/"), Node::Dir { mode: 0o755 });
        Self {
            state: Arc::new(Mutex::new(State {
                nodes,
                open_errors: Default::default(),
                vanished: Default::default(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a directory and any missing parents.
    pub fn insert_dir(&self, path: impl AsRef<Utf8Path>, mode: u32) {
        let path = key(path.as_ref());
        let mut state = self.state();
        for ancestor in path.ancestors() {
            state
                .nodes
                .entry(ancestor.to_owned())
                .or_insert(Node::Dir { mode: 0o755 });
        }
        state.nodes.insert(path, Node::Dir { mode });
    }

    /// Create a regular file, replacing any previous entry and creating
    /// missing parents.
    pub fn insert_file(&self, path: impl AsRef<Utf8Path>, mode: u32, data: impl Into<Vec<u8>>) {
        let path = key(path.as_ref());
        if let Some(parent) = path.parent() {
            let mut state = self.state();
            for ancestor in parent.ancestors() {
                state
                    .nodes
                    .entry(ancestor.to_owned())
                    .or_insert(Node::Dir { mode: 0o755 });
            }
        }
        let data = data.into();
        self.state().nodes.insert(path, Node::File { mode, data });
    }

    /// Make [`Target::open`] and [`Target::open_file`] fail on `path`.
    pub fn inject_open_error(&self, path: impl AsRef<Utf8Path>, kind: ErrorKind) {
        self.state().open_errors.insert(key(path.as_ref()), kind);
    }

    /// Keep listing `path` in its parent, but report it as gone everywhere
    /// else; this is what a concurrent deletion looks like to a walker.
    pub fn inject_vanish(&self, path: impl AsRef<Utf8Path>) {
        self.state().vanished.insert(key(path.as_ref()));
    }

    /// The contents of a regular file.
    pub fn read_file(&self, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        match self.state().nodes.get(&key(path.as_ref())) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// The permission bits of an entry.
    pub fn mode(&self, path: impl AsRef<Utf8Path>) -> Option<u32> {
        self.state()
            .nodes
            .get(&key(path.as_ref()))
            .map(|node| match node {
                Node::Dir { mode } | Node::File { mode, .. } => *mode,
            })
    }

    /// Every path in the tree except the root, in sorted order.
    /// Directories carry a trailing `/`.
    pub fn paths(&self) -> Vec<String> {
        self.state()
            .nodes
            .iter()
            .filter(|(k, _)| k.as_str() != "/")
            .map(|(k, v)| match v {
                Node::Dir { .. } => format!("{k}/"),
                Node::File { .. } => k.to_string(),
            })
            .collect()
    }
}

/// Appends into a file node; the node must still exist.
struct MemWriter {
    state: Arc<Mutex<State>>,
    path: Utf8PathBuf,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.nodes.get_mut(&self.path) {
            Some(Node::File { data, .. }) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(ErrorKind::NotFound.into()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Target for MemTarget {
    fn lookup(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<EntryInfo> {
        let path = key(path);
        let state = self.state();
        state.get(&path).map(|node| entry_info(&path, node))
    }

    fn read_dir(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<Vec<EntryInfo>> {
        let path = key(path);
        let state = self.state();
        if let Node::File { .. } = state.get(&path)? {
            return Err(ErrorKind::NotADirectory.into());
        }
        let children = state
            .nodes
            .iter()
            .filter(|(k, _)| k.parent() == Some(path.as_path()))
            .map(|(k, v)| entry_info(k, v))
            .collect();
        Ok(children)
    }

    fn open(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<Box<dyn Read + Send>> {
        let path = key(path);
        let state = self.state();
        state.check_open_error(&path)?;
        match state.get(&path)? {
            Node::File { data, .. } => Ok(Box::new(Cursor::new(data.clone()))),
            Node::Dir { .. } => Err(ErrorKind::IsADirectory.into()),
        }
    }

    fn open_file(
        &self,
        _op: &Operation,
        path: &Utf8Path,
        mode: u32,
    ) -> std::io::Result<Box<dyn Write + Send>> {
        let path = key(path);
        let mut state = self.state();
        state.check_open_error(&path)?;
        state.check_parent(&path)?;
        if let Some(Node::Dir { .. }) = state.nodes.get(&path) {
            return Err(ErrorKind::IsADirectory.into());
        }
        state.vanished.remove(&path);
        state.nodes.insert(
            path.clone(),
            Node::File {
                mode,
                data: Vec::new(),
            },
        );
        Ok(Box::new(MemWriter {
            state: Arc::clone(&self.state),
            path,
        }))
    }

    fn mkdir(&self, _op: &Operation, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
        let path = key(path);
        let mut state = self.state();
        if state.nodes.contains_key(&path) {
            return Err(ErrorKind::AlreadyExists.into());
        }
        state.check_parent(&path)?;
        state.nodes.insert(path, Node::Dir { mode });
        Ok(())
    }

    fn remove(&self, _op: &Operation, path: &Utf8Path) -> std::io::Result<()> {
        let path = key(path);
        let mut state = self.state();
        if path.parent().is_none() {
            return Err(ErrorKind::InvalidInput.into());
        }
        if let Node::Dir { .. } = state.get(&path)? {
            if state.nodes.keys().any(|k| k.parent() == Some(path.as_path())) {
                return Err(ErrorKind::DirectoryNotEmpty.into());
            }
        }
        state.nodes.remove(&path);
        Ok(())
    }
}
