//! # Filter specifications
//!
//! A [`FilterSpec`] decides, for every path of a transfer, whether it takes
//! part, and where an imported entry is written.
//!
//! There are two namespaces involved:
//!
//!  * the *backend* namespace, in which the target path lives (relative to
//!    the root of a data source or sink);
//!  * the *archive* namespace, rooted at the target path. Inclusions,
//!    exclusions and the strip prefix are expressed here, as are the names
//!    of tar entries.
//!
//! Resolution is longest-prefix by path segments: the deepest matching
//! exclusion is compared with the deepest matching inclusion, and the
//! inclusion wins when it is at least as deep. So excluding `/a` while
//! including `/a/b` keeps everything under `/a/b` and drops the rest of
//! `/a`.

use std::collections::BTreeSet;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// The role a path plays in a filter role mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// The root of the transfer inside the backend; exactly one is required.
    Target,
    /// Force inclusion, even beneath an exclusion.
    Include,
    /// Omit this path and everything beneath it.
    Exclude,
    /// Prefix prepended to every entry written on import.
    Rebase,
    /// Prefix removed from every entry name on import.
    Strip,
}

/// Which paths take part in a transfer, and how imported entries are
/// relocated. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    target: Utf8PathBuf,
    inclusions: BTreeSet<Utf8PathBuf>,
    exclusions: BTreeSet<Utf8PathBuf>,
    rebase: Utf8PathBuf,
    strip: Utf8PathBuf,
}

fn invalid(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::InvalidFilter(msg.into())
}

/// Normalize a caller-supplied path into absolute form, e.g. `foo//./bar`
/// into `/foo/bar`. The empty string names the root.
fn normalize(path: &str) -> Result<Utf8PathBuf, ArchiveError> {
    if path.contains('\0') {
        return Err(invalid(format!("Invalid path: {path:?}")));
    }
    let mut ret = Utf8PathBuf::from("/");
    for part in Utf8Path::new(path).components() {
        match part {
            Utf8Component::RootDir | Utf8Component::CurDir => {}
            Utf8Component::Normal(part) => ret.push(part),
            // Uplinks are ambiguous in a filter; barf on them along with Windows prefixes
            Utf8Component::ParentDir | Utf8Component::Prefix(_) => {
                return Err(invalid(format!("Invalid path: {path}")))
            }
        }
    }
    Ok(ret)
}

/// Lexically resolve an archive entry name to an absolute path below the
/// archive root. Returns `None` if the name climbs above the root.
pub(crate) fn archive_path(name: &str) -> Option<Utf8PathBuf> {
    let mut parts = Vec::new();
    for part in Utf8Path::new(name).components() {
        match part {
            Utf8Component::RootDir | Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                parts.pop()?;
            }
            Utf8Component::Normal(part) => parts.push(part),
            Utf8Component::Prefix(_) => return None,
        }
    }
    let mut ret = Utf8PathBuf::from("/");
    ret.extend(parts);
    Some(ret)
}

/// Number of named segments; `/` has depth 0.
fn depth(path: &Utf8Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Utf8Component::Normal(_)))
        .count()
}

/// Depth of the deepest member of `set` that is a segment-wise prefix of `path`.
fn longest_prefix(set: &BTreeSet<Utf8PathBuf>, path: &Utf8Path) -> Option<usize> {
    set.iter()
        .filter(|p| path.starts_with(p))
        .map(|p| depth(p))
        .max()
}

fn set_once(
    slot: &mut Option<Utf8PathBuf>,
    path: Utf8PathBuf,
    role: FilterType,
) -> Result<(), ArchiveError> {
    if let Some(prev) = slot {
        return Err(invalid(format!(
            "Multiple {role:?} paths: {prev} and {path}"
        )));
    }
    *slot = Some(path);
    Ok(())
}

impl FilterSpec {
    /// Build a spec from a `path -> role` mapping.
    ///
    /// Exactly one [`FilterType::Target`] is required, and at most one
    /// rebase and one strip path. A path may not be both included and
    /// excluded. Without an explicit rebase path, imports are written
    /// beneath the target path.
    pub fn new<I, P>(roles: I) -> Result<Self, ArchiveError>
    where
        I: IntoIterator<Item = (P, FilterType)>,
        P: AsRef<str>,
    {
        let mut target = None;
        let mut rebase = None;
        let mut strip = None;
        let mut inclusions = BTreeSet::new();
        let mut exclusions = BTreeSet::new();
        for (path, role) in roles {
            let path = normalize(path.as_ref())?;
            match role {
                FilterType::Target => set_once(&mut target, path, role)?,
                FilterType::Rebase => set_once(&mut rebase, path, role)?,
                FilterType::Strip => set_once(&mut strip, path, role)?,
                FilterType::Include => {
                    inclusions.insert(path);
                }
                FilterType::Exclude => {
                    exclusions.insert(path);
                }
            }
        }
        let Some(target) = target else {
            return Err(invalid("No target path specified"));
        };
        if let Some(p) = inclusions.intersection(&exclusions).next() {
            return Err(invalid(format!("{p} is both included and excluded")));
        }
        let rebase = rebase.unwrap_or_else(|| target.clone());
        let strip = strip.unwrap_or_else(|| "/".into());
        let spec = Self {
            target,
            inclusions,
            exclusions,
            rebase,
            strip,
        };
        tracing::debug!("Created filter spec: {spec:?}");
        Ok(spec)
    }

    /// The root of the transfer inside the backend.
    pub fn target(&self) -> &Utf8Path {
        &self.target
    }

    /// Paths forced to be included.
    pub fn inclusions(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.inclusions
    }

    /// Paths omitted along with everything beneath them.
    pub fn exclusions(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.exclusions
    }

    /// Prefix prepended to entries written on import.
    pub fn rebase(&self) -> &Utf8Path {
        &self.rebase
    }

    /// Prefix removed from entry names on import.
    pub fn strip(&self) -> &Utf8Path {
        &self.strip
    }

    fn resolve_excluded(&self, path: &Utf8Path) -> bool {
        let Some(exclusion) = longest_prefix(&self.exclusions, path) else {
            return false;
        };
        match longest_prefix(&self.inclusions, path) {
            Some(inclusion) => inclusion < exclusion,
            None => true,
        }
    }

    /// Whether an archive-relative name is left out of the transfer.
    ///
    /// Names that climb above the archive root are never part of it.
    pub fn excluded(&self, name: &str) -> bool {
        match archive_path(name) {
            Some(path) => self.resolve_excluded(&path),
            None => true,
        }
    }

    /// Whether a backend path is left out of a transfer scoped at `scope`
    /// (the backend path of the target root).
    pub fn excluded_path(&self, scope: &Utf8Path, path: &Utf8Path) -> bool {
        match path.strip_prefix(scope) {
            Ok(rel) => self.excluded(rel.as_str()),
            Err(_) => true,
        }
    }

    /// Whether an excluded directory still has to be walked because an
    /// inclusion lies strictly beneath it.
    pub fn must_descend(&self, path: &Utf8Path) -> bool {
        self.inclusions
            .iter()
            .any(|i| i.as_path() != path && i.starts_with(path))
    }

    /// The deterministic walk root: the lexicographically smallest
    /// inclusion, or the target root (`/`) when there are none.
    ///
    /// An export walk only starts here when the target root is excluded.
    pub fn read_target(&self) -> &Utf8Path {
        self.inclusions
            .first()
            .map(|p| p.as_path())
            .unwrap_or(Utf8Path::new("/"))
    }

    /// Archive paths at which an export walk starts.
    ///
    /// When the target root is itself included, the walk starts there
    /// alone. Otherwise there is no single obvious root and the walk starts
    /// at each inclusion that is not nested in another, beginning with
    /// [`Self::read_target`].
    pub fn walk_seeds(&self) -> Vec<&Utf8Path> {
        let root = Utf8Path::new("/");
        if !self.resolve_excluded(root) {
            return vec![root];
        }
        if self.inclusions.is_empty() {
            return Vec::new();
        }
        let mut seeds = vec![self.read_target()];
        // Sorted, so a parent is always seen before its children
        for inclusion in self.inclusions.iter().skip(1) {
            if seeds.iter().any(|s| inclusion.starts_with(s)) {
                continue;
            }
            seeds.push(inclusion);
        }
        seeds
    }

    /// Compute where an archive entry lands: `strip` is removed by path
    /// segments (names outside of it are kept whole) and the result is
    /// placed beneath `rebase`. Returns `None` for names that climb above
    /// the archive root.
    pub fn rewrite(&self, name: &str) -> Option<Utf8PathBuf> {
        let path = archive_path(name)?;
        let rel = path
            .strip_prefix(&self.strip)
            .or_else(|_| path.strip_prefix("/"))
            .ok()?;
        if rel.as_str().is_empty() {
            return Some(self.rebase.clone());
        }
        Some(self.rebase.join(rel))
    }
}
