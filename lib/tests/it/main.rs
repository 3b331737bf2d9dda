//! Integration tests for filtered tar export and import.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::PermissionsExt;
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;
use tokio::io::AsyncReadExt;

use treetar_lib::error::{classify, ErrorKind};
use treetar_lib::filter::{FilterSpec, FilterType};
use treetar_lib::operation::Operation;
use treetar_lib::tar::{pack, unpack, unpack_async, ExportOptions, ImportSummary};
use treetar_lib::target::{EntryInfo, LocalTarget, MemTarget, Target};
use treetar_lib::transfer::{DataSource, Release};

use FilterType::{Exclude, Include, Rebase, Strip, Target as TargetRole};

const DIRS: &[&str] = &[
    "path1dir1",
    "path2dir1",
    "path1dir1/path1dir2",
    "path1dir1/path1dir3",
    "path2dir1/path2dir2",
    "path2dir1/path2dir3",
    "path1dir1/path1dir3/path1dir4",
];

const FILES: &[&str] = &[
    "file1",
    "file2",
    "path1dir1/file1",
    "path1dir1/file2",
    "path2dir1/file1",
    "path2dir1/file2",
    "path1dir1/path1dir3/file1",
    "path2dir1/path2dir2/file1",
];

/// The fixture tree as an archive; every file holds its own name.
fn fixture_tar() -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());
    for d in DIRS {
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Directory);
        h.set_mode(0o755);
        h.set_size(0);
        b.append_data(&mut h, format!("{d}/"), std::io::empty())
            .unwrap();
    }
    for f in FILES {
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Regular);
        h.set_mode(0o644);
        h.set_size(f.len() as u64);
        b.append_data(&mut h, f, f.as_bytes()).unwrap();
    }
    b.into_inner().unwrap()
}

/// The fixture tree beneath `prefix` of a backend.
fn populate(t: &MemTarget, prefix: &str) {
    let prefix = Utf8Path::new(prefix);
    t.insert_dir(prefix, 0o755);
    for d in DIRS {
        t.insert_dir(prefix.join(d), 0o755);
    }
    for f in FILES {
        t.insert_file(prefix.join(f), 0o644, f.as_bytes());
    }
}

/// Names of the fixture, with the trailing `/` on directories.
fn fixture_names() -> BTreeSet<String> {
    DIRS.iter()
        .map(|d| format!("{d}/"))
        .chain(FILES.iter().map(|f| f.to_string()))
        .collect()
}

fn fixture_without(absent: &[&str]) -> BTreeSet<String> {
    let mut names = fixture_names();
    for p in absent {
        assert!(names.remove(*p), "{p} is not part of the fixture");
    }
    names
}

/// Paths below `prefix` of a backend, relative to it.
fn imported(t: &MemTarget, prefix: &str) -> BTreeSet<String> {
    let prefix = format!("{}/", prefix.trim_end_matches('/'));
    t.paths()
        .into_iter()
        .filter_map(|p| p.strip_prefix(&prefix).map(ToOwned::to_owned))
        .filter(|p| !p.is_empty())
        .collect()
}

fn entry_names(buf: &[u8]) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(buf);
    let mut ret = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        ret.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(ret)
}

async fn export_bytes(target: Arc<dyn Target>, spec: &FilterSpec) -> Result<Vec<u8>> {
    let op = Operation::new("export");
    let mut stream = pack(&op, target, Utf8Path::new("/"), spec, true, ExportOptions::default())?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Import the fixture archive into a backend holding an empty `dest`.
fn import_fixture(roles: &[(&str, FilterType)], dest: &str) -> Result<BTreeSet<String>> {
    let op = Operation::new("import");
    let t = MemTarget::new();
    t.insert_dir(dest, 0o755);
    let spec = FilterSpec::new(roles.iter().copied())?;
    unpack(&op, &t, Utf8Path::new("/"), &spec, fixture_tar().as_slice())?;
    Ok(imported(&t, dest))
}

/// Export the fixture from `/data/src` with the filter, and import the
/// result unfiltered.
async fn export_fixture(roles: &[(&str, FilterType)]) -> Result<BTreeSet<String>> {
    let src = MemTarget::new();
    populate(&src, "/data/src");
    let mut roles = roles.to_vec();
    roles.push(("/data/src", TargetRole));
    let spec = FilterSpec::new(roles)?;
    let buf = export_bytes(Arc::new(src), &spec).await?;

    let op = Operation::new("import");
    let dest = MemTarget::new();
    let spec = FilterSpec::new([("/", TargetRole)])?;
    unpack(&op, &dest, Utf8Path::new("/"), &spec, buf.as_slice())?;
    Ok(imported(&dest, "/"))
}

/// Check a filter on both sides of a transfer.
async fn check_filter(filters: &[(&str, FilterType)], expected: &BTreeSet<String>) -> Result<()> {
    let mut roles = filters.to_vec();
    roles.push(("/", TargetRole));
    similar_asserts::assert_eq!(&import_fixture(&roles, "/")?, expected);

    let mut roles = filters.to_vec();
    roles.push(("/data/target", TargetRole));
    similar_asserts::assert_eq!(&import_fixture(&roles, "/data/target")?, expected);

    similar_asserts::assert_eq!(&export_fixture(filters).await?, expected);
    Ok(())
}

#[tokio::test]
async fn test_simple_write() -> Result<()> {
    check_filter(&[], &fixture_names()).await
}

#[test]
fn test_import_contents() -> Result<()> {
    let op = Operation::new("import");
    let t = MemTarget::new();
    t.insert_dir("/data/target", 0o755);
    let spec = FilterSpec::new([("/data/target", TargetRole)])?;
    let summary = unpack(&op, &t, Utf8Path::new("/"), &spec, fixture_tar().as_slice())?;
    assert_eq!(summary.directories, DIRS.len() as u64);
    assert_eq!(summary.files, FILES.len() as u64);
    for f in FILES {
        let path = Utf8Path::new("/data/target").join(f);
        assert_eq!(t.read_file(&path).as_deref(), Some(f.as_bytes()));
        assert_eq!(t.mode(&path), Some(0o644));
    }
    // Nothing escapes the target
    assert!(t
        .paths()
        .iter()
        .all(|p| p == "/data/" || p.starts_with("/data/target/")));
    Ok(())
}

#[tokio::test]
async fn test_simple_exclusion() -> Result<()> {
    let expected = fixture_without(&[
        "path2dir1/",
        "path2dir1/path2dir2/",
        "path2dir1/path2dir3/",
        "path2dir1/file1",
        "path2dir1/file2",
        "path2dir1/path2dir2/file1",
    ]);
    check_filter(&[("/path2dir1", Exclude)], &expected).await
}

#[tokio::test]
async fn test_inclusion_after_exclusion() -> Result<()> {
    // The parents of the included file come back as plain directories
    let expected = fixture_without(&[
        "path2dir1/path2dir3/",
        "path2dir1/file1",
        "path2dir1/file2",
    ]);
    check_filter(
        &[
            ("/path2dir1", Exclude),
            ("/path2dir1/path2dir2/file1", Include),
        ],
        &expected,
    )
    .await
}

#[tokio::test]
async fn test_multi_exclusion() -> Result<()> {
    let expected = fixture_without(&[
        "path1dir1/path1dir3/",
        "path1dir1/path1dir3/file1",
        "path1dir1/path1dir3/path1dir4/",
        "path2dir1/path2dir2/",
        "path2dir1/path2dir2/file1",
        "file2",
    ]);
    check_filter(
        &[
            ("/path1dir1/path1dir3", Exclude),
            ("/path2dir1/path2dir2", Exclude),
            ("/file2", Exclude),
        ],
        &expected,
    )
    .await
}

#[tokio::test]
async fn test_multi_exclusion_multi_inclusion() -> Result<()> {
    let expected = fixture_without(&["path1dir1/path1dir3/path1dir4/"]);
    check_filter(
        &[
            ("/path2dir1/path2dir2", Exclude),
            ("/path1dir1/path1dir3", Exclude),
            ("/path1dir1/path1dir3/file1", Include),
            ("/path2dir1/path2dir2/file1", Include),
        ],
        &expected,
    )
    .await
}

#[tokio::test]
async fn test_multi_exclusion_multi_inclusion_directories() -> Result<()> {
    let expected = fixture_without(&[
        "path1dir1/file1",
        "path1dir1/file2",
        "path1dir1/path1dir2/",
        "path2dir1/file1",
        "path2dir1/file2",
        "path2dir1/path2dir3/",
    ]);
    check_filter(
        &[
            ("/path1dir1", Exclude),
            ("/path2dir1", Exclude),
            ("/path1dir1/path1dir3", Include),
            ("/path2dir1/path2dir2", Include),
        ],
        &expected,
    )
    .await
}

#[tokio::test]
async fn test_export_root_excluded() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    let spec = FilterSpec::new([
        ("/", TargetRole),
        ("/", Exclude),
        ("/path1dir1/path1dir3", Include),
    ])?;
    let buf = export_bytes(Arc::new(src), &spec).await?;
    similar_asserts::assert_eq!(
        entry_names(&buf)?,
        [
            "path1dir1/path1dir3/",
            "path1dir1/path1dir3/file1",
            "path1dir1/path1dir3/path1dir4/"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_export_order_is_stable() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let src: Arc<dyn Target> = Arc::new(src);
    let a = export_bytes(Arc::clone(&src), &spec).await?;
    let b = export_bytes(src, &spec).await?;
    let names = entry_names(&a)?;
    similar_asserts::assert_eq!(&names, &entry_names(&b)?);
    // Breadth-first
    let depth = |n: &String| n.trim_end_matches('/').matches('/').count();
    assert!(names.windows(2).all(|w| depth(&w[0]) <= depth(&w[1])));
    assert_eq!(names.first().map(String::as_str), Some("file1"));
    Ok(())
}

#[tokio::test]
async fn test_specificity() -> Result<()> {
    let src = MemTarget::new();
    src.insert_file("/a/b/x", 0o644, "x");
    src.insert_file("/a/b/y/z", 0o644, "z");
    src.insert_file("/a/c", 0o644, "c");
    src.insert_file("/c/d", 0o644, "d");
    src.insert_file("/e", 0o644, "e");
    let spec = FilterSpec::new([
        ("/", TargetRole),
        ("/a", Exclude),
        ("/c", Exclude),
        ("/a/b", Include),
    ])?;
    let buf = export_bytes(Arc::new(src), &spec).await?;
    let names: BTreeSet<_> = entry_names(&buf)?.into_iter().collect();
    let expected: BTreeSet<_> = ["a/b/", "a/b/x", "a/b/y/", "a/b/y/z", "e"]
        .into_iter()
        .map(String::from)
        .collect();
    similar_asserts::assert_eq!(names, expected);
    Ok(())
}

#[tokio::test]
async fn test_rebase_strip() -> Result<()> {
    let mut b = tar::Builder::new(Vec::new());
    for (name, data) in [("vol/a/x", "x"), ("vol/b", "b"), ("other/c", "c")] {
        let mut h = tar::Header::new_ustar();
        h.set_mode(0o644);
        h.set_size(data.len() as u64);
        b.append_data(&mut h, name, data.as_bytes())?;
    }
    let buf = b.into_inner()?;

    let op = Operation::new("import");
    let t = MemTarget::new();
    t.insert_dir("/restored", 0o755);
    let spec = FilterSpec::new([
        ("/", TargetRole),
        ("/vol", Strip),
        ("/restored", Rebase),
    ])?;
    let summary = unpack(&op, &t, Utf8Path::new("/"), &spec, buf.as_slice())?;
    assert_eq!(summary.files, 3);
    assert_eq!(t.read_file("/restored/a/x").as_deref(), Some(&b"x"[..]));
    assert_eq!(t.read_file("/restored/b").as_deref(), Some(&b"b"[..]));
    // Outside of the strip prefix, kept whole
    assert_eq!(t.read_file("/restored/other/c").as_deref(), Some(&b"c"[..]));

    // Exporting the rebased tree yields the stripped names again
    let spec = FilterSpec::new([("/restored", TargetRole)])?;
    let buf = export_bytes(Arc::new(t), &spec).await?;
    let dest = MemTarget::new();
    let spec = FilterSpec::new([("/", TargetRole)])?;
    unpack(&op, &dest, Utf8Path::new("/"), &spec, buf.as_slice())?;
    similar_asserts::assert_eq!(dest.paths(), ["/a/", "/a/x", "/b", "/other/", "/other/c"]);
    Ok(())
}

#[tokio::test]
async fn test_round_trip_local() -> Result<()> {
    let src = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    src.create_dir_all("etc/app")?;
    src.atomic_write("etc/app/config", "key=value\n")?;
    src.atomic_write_with_perms(
        "etc/app/secret",
        "hunter2",
        cap_std::fs::Permissions::from_mode(0o600),
    )?;
    src.create_dir_all("var/empty")?;
    src.symlink_contents("app/config", "etc/config")?;
    let big = vec![0x5a_u8; 300 * 1024];
    src.atomic_write("var/big", &big)?;

    let spec = FilterSpec::new([("/", TargetRole)])?;
    let buf = export_bytes(Arc::new(LocalTarget::new(src.try_clone()?)), &spec).await?;

    let dest = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    let op = Operation::new("import");
    let target = LocalTarget::new(dest.try_clone()?);
    let summary = unpack(&op, &target, Utf8Path::new("/"), &spec, buf.as_slice())?;
    assert_eq!(summary.files, 3);
    assert_eq!(summary.symlinks, 1);
    assert_eq!(summary.directories, 4);

    assert_eq!(dest.read_to_string("etc/app/config")?, "key=value\n");
    assert_eq!(dest.read_to_string("etc/config")?, "key=value\n");
    assert_eq!(
        dest.read_link_contents("etc/config")?.to_str(),
        Some("app/config")
    );
    assert_eq!(dest.read("var/big")?, big);
    assert!(dest.metadata("var/empty")?.is_dir());
    assert_eq!(
        dest.metadata("etc/app/secret")?.permissions().mode() & 0o7777,
        0o600
    );
    Ok(())
}

/// Import the fixture plus three symbolic links, one of them dangling, into
/// `target` on the local filesystem.
fn check_broken_symlinks(target: &str) -> Result<()> {
    let mut b = tar::Builder::new(Vec::new());
    let mut archive_in = fixture_tar();
    // Drop the end-of-archive blocks, then append the links
    archive_in.truncate(archive_in.len() - 1024);
    b.get_mut().extend_from_slice(&archive_in);
    for (name, link_target) in [
        ("path1dir1/link1", "../file1"),
        ("path1dir1/BrokenSymLink", "../DOES_NOT_EXIST"),
        ("path1dir1/DirSymLink", "../path2dir1"),
    ] {
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Symlink);
        h.set_mode(0o777);
        h.set_size(0);
        b.append_link(&mut h, name, link_target)?;
    }
    let buf = b.into_inner()?;

    let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    let prefix = Utf8Path::new(target.trim_start_matches('/'));
    if !prefix.as_str().is_empty() {
        td.create_dir_all(prefix)?;
    }
    let op = Operation::new("import");
    let spec = FilterSpec::new([(target, TargetRole)])?;
    let local = LocalTarget::new(td.try_clone()?);
    let summary = unpack(&op, &local, Utf8Path::new("/"), &spec, buf.as_slice())?;
    assert_eq!(summary.symlinks, 3);

    let broken = prefix.join("path1dir1/BrokenSymLink");
    assert!(td.symlink_metadata(&broken)?.file_type().is_symlink());
    let e = td.metadata(&broken).unwrap_err();
    assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
    assert_eq!(td.read_to_string(prefix.join("path1dir1/link1"))?, "file1");
    assert!(td.metadata(prefix.join("path1dir1/DirSymLink"))?.is_dir());
    for f in FILES {
        assert_eq!(td.read_to_string(prefix.join(f))?, *f);
    }
    Ok(())
}

#[test]
fn test_broken_symlinks() -> Result<()> {
    check_broken_symlinks("/")
}

#[test]
fn test_broken_symlinks_non_root_target() -> Result<()> {
    check_broken_symlinks("/data/target")
}

/// Local filesystem access without symbolic link support.
#[derive(Debug)]
struct NoLinks(LocalTarget);

impl Target for NoLinks {
    fn lookup(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<EntryInfo> {
        self.0.lookup(op, path)
    }

    fn read_dir(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<Vec<EntryInfo>> {
        self.0.read_dir(op, path)
    }

    fn open(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<Box<dyn Read + Send>> {
        self.0.open(op, path)
    }

    fn open_file(
        &self,
        op: &Operation,
        path: &Utf8Path,
        mode: u32,
    ) -> std::io::Result<Box<dyn std::io::Write + Send>> {
        self.0.open_file(op, path, mode)
    }

    fn mkdir(&self, op: &Operation, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
        self.0.mkdir(op, path, mode)
    }

    fn remove(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<()> {
        self.0.remove(op, path)
    }
}

#[tokio::test]
async fn test_export_unsupported_symlink() -> Result<()> {
    let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    td.atomic_write("file", "data")?;
    td.symlink_contents("file", "link")?;
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let buf = export_bytes(Arc::new(NoLinks(LocalTarget::new(td.try_clone()?))), &spec).await?;
    similar_asserts::assert_eq!(entry_names(&buf)?, ["file", "link"]);

    // A link without a target is skipped on the way in
    let op = Operation::new("import");
    let dest = MemTarget::new();
    let summary = unpack(&op, &dest, Utf8Path::new("/"), &spec, buf.as_slice())?;
    assert_eq!(summary.files, 1);
    assert_eq!(summary.skipped, 1);
    similar_asserts::assert_eq!(dest.paths(), ["/file"]);
    Ok(())
}

#[tokio::test]
async fn test_export_skips_vanished() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    src.inject_vanish("/path2dir1/file1");
    src.inject_vanish("/path1dir1/path1dir3");
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let buf = export_bytes(Arc::new(src), &spec).await?;
    let names: BTreeSet<_> = entry_names(&buf)?.into_iter().collect();
    let expected = fixture_without(&[
        "path2dir1/file1",
        "path1dir1/path1dir3/",
        "path1dir1/path1dir3/file1",
        "path1dir1/path1dir3/path1dir4/",
    ]);
    similar_asserts::assert_eq!(names, expected);
    Ok(())
}

#[tokio::test]
async fn test_export_permission_denied() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    src.inject_open_error("/path1dir1/file1", std::io::ErrorKind::PermissionDenied);
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let buf = export_bytes(Arc::new(src), &spec).await?;

    let mut archive = tar::Archive::new(buf.as_slice());
    let mut found = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = String::new();
        entry.read_to_string(&mut data)?;
        if name == "path1dir1/file1" {
            assert_eq!(entry.size(), 0);
            found = true;
        } else if entry.header().entry_type() == tar::EntryType::Regular {
            // Framing is intact for everything else
            assert_eq!(data, name);
        }
    }
    assert!(found);
    Ok(())
}

#[tokio::test]
async fn test_export_terminal_error() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    src.inject_open_error("/path2dir1/file2", std::io::ErrorKind::Other);
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let err = export_bytes(Arc::new(src), &spec).await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Fatal);
    assert!(format!("{err:#}").contains("/path2dir1/file2"), "{err:#}");
    Ok(())
}

/// Cancels the operation driving the walk once it looks up `path`.
#[derive(Debug)]
struct CancelAt {
    inner: MemTarget,
    path: &'static str,
}

impl Target for CancelAt {
    fn lookup(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<EntryInfo> {
        if path.as_str() == self.path {
            op.cancel();
        }
        self.inner.lookup(op, path)
    }

    fn read_dir(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<Vec<EntryInfo>> {
        self.inner.read_dir(op, path)
    }

    fn open(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<Box<dyn Read + Send>> {
        self.inner.open(op, path)
    }

    fn open_file(
        &self,
        op: &Operation,
        path: &Utf8Path,
        mode: u32,
    ) -> std::io::Result<Box<dyn std::io::Write + Send>> {
        self.inner.open_file(op, path, mode)
    }

    fn mkdir(&self, op: &Operation, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
        self.inner.mkdir(op, path, mode)
    }

    fn remove(&self, op: &Operation, path: &Utf8Path) -> std::io::Result<()> {
        self.inner.remove(op, path)
    }
}

/// Stream an export of `src` straight into an import.
async fn transfer(src: Arc<dyn Target>) -> Result<(ImportSummary, MemTarget)> {
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let stream = pack(
        &Operation::new("export"),
        src,
        Utf8Path::new("/"),
        &spec,
        true,
        ExportOptions::default(),
    )?;
    let dest = MemTarget::new();
    let summary = unpack_async(
        &Operation::new("import"),
        Arc::new(dest.clone()),
        Utf8Path::new("/"),
        &spec,
        stream,
    )
    .await?;
    Ok((summary, dest))
}

#[tokio::test]
async fn test_failed_export_fails_import() -> Result<()> {
    // Just under one chunk, so the failure comes while the data is buffered
    let src = MemTarget::new();
    src.insert_file("/a", 0o644, vec![b'a'; 64000]);
    src.insert_file("/b", 0o644, "b");
    src.inject_open_error("/b", std::io::ErrorKind::Other);
    let err = transfer(Arc::new(src)).await.unwrap_err();
    assert!(format!("{err:#}").contains("Opening /b"), "{err:#}");

    // Cancelled between two entries
    let src = MemTarget::new();
    src.insert_file("/a", 0o644, vec![b'a'; 64000]);
    src.insert_dir("/b", 0o755);
    src.insert_file("/c", 0o644, "c");
    let err = transfer(Arc::new(CancelAt {
        inner: src,
        path: "/b",
    }))
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("cancelled"), "{err:#}");

    // The same tree goes through when nothing fails
    let src = MemTarget::new();
    src.insert_file("/a", 0o644, vec![b'a'; 64000]);
    src.insert_dir("/b", 0o755);
    src.insert_file("/c", 0o644, "c");
    let (summary, dest) = transfer(Arc::new(src)).await?;
    assert_eq!(summary.files, 2);
    similar_asserts::assert_eq!(dest.paths(), ["/a", "/b/", "/c"]);
    Ok(())
}

#[tokio::test]
async fn test_export_missing_target() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    let op = Operation::new("export");
    let spec = FilterSpec::new([("/nonexistent", TargetRole)])?;
    let err = pack(&op, Arc::new(src.clone()), Utf8Path::new("/"), &spec, true, Default::default())
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::NotFound);

    let spec = FilterSpec::new([("/file1", TargetRole)])?;
    let err = pack(&op, Arc::new(src), Utf8Path::new("/"), &spec, true, Default::default()).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Conflict);
    Ok(())
}

#[tokio::test]
async fn test_export_cancelled() -> Result<()> {
    let src = MemTarget::new();
    populate(&src, "/");
    let op = Operation::new("export");
    op.cancel();
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let mut stream = pack(&op, Arc::new(src), Utf8Path::new("/"), &spec, true, Default::default())?;
    let mut buf = Vec::new();
    let err = anyhow::Error::new(stream.read_to_end(&mut buf).await.unwrap_err());
    assert_eq!(classify(&err), ErrorKind::Cancelled);
    Ok(())
}

#[test]
fn test_import_cancelled() -> Result<()> {
    let op = Operation::new("import");
    op.child("worker").cancel();
    assert!(!op.is_cancelled());
    op.cancel();
    let t = MemTarget::new();
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let err = unpack(&op, &t, Utf8Path::new("/"), &spec, fixture_tar().as_slice()).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Cancelled);
    similar_asserts::assert_eq!(t.paths(), Vec::<String>::new());
    Ok(())
}

#[test]
fn test_import_errors() -> Result<()> {
    let op = Operation::new("import");
    let spec = FilterSpec::new([("/", TargetRole)])?;

    // Missing root
    let t = MemTarget::new();
    let err = unpack(&op, &t, Utf8Path::new("/nonexistent"), &spec, fixture_tar().as_slice()).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::NotFound);

    // A file where the archive has a directory
    let t = MemTarget::new();
    t.insert_file("/path1dir1", 0o644, "");
    let err = unpack(&op, &t, Utf8Path::new("/"), &spec, fixture_tar().as_slice()).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Conflict);

    // A directory where the archive has a file
    let t = MemTarget::new();
    t.insert_dir("/file1", 0o755);
    let err = unpack(&op, &t, Utf8Path::new("/"), &spec, fixture_tar().as_slice()).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Conflict);

    // Garbage
    let t = MemTarget::new();
    let garbage = vec![0xff_u8; 1024];
    let err = unpack(&op, &t, Utf8Path::new("/"), &spec, garbage.as_slice()).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::StreamCorrupt);

    // Cut off inside of file data
    let t = MemTarget::new();
    let buf = fixture_tar();
    let cut = &buf[..buf.len() - 1024 - 512 + 3];
    let err = unpack(&op, &t, Utf8Path::new("/"), &spec, cut).unwrap_err();
    assert_eq!(classify(&err), ErrorKind::StreamCorrupt);
    Ok(())
}

fn counted_release(counter: &Arc<AtomicUsize>) -> Release {
    let counter = Arc::clone(counter);
    Release::new("test", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[tokio::test]
async fn test_data_source_releases_once() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let src = MemTarget::new();
    populate(&src, "/vol");
    let source = DataSource::new(Arc::new(src), "/vol", counted_release(&counter));
    assert_eq!(source.root().as_str(), "/vol");
    let op = Operation::new("export");
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let mut stream = source.export(&op, &spec, true)?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let names: BTreeSet<_> = entry_names(&buf)?.into_iter().collect();
    similar_asserts::assert_eq!(names, fixture_names());
    drop(stream);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_consumer_drop_releases() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let src = MemTarget::new();
    src.insert_file("/big", 0o644, vec![0_u8; 8 * 1024 * 1024]);
    let source = DataSource::new(Arc::new(src), "/", counted_release(&counter));
    let op = Operation::new("export");
    let spec = FilterSpec::new([("/", TargetRole)])?;
    let stream = source.export(&op, &spec, true)?;
    drop(stream);
    // The producer notices on its next write
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) == 1 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("Source was not released after the consumer went away")
}

#[tokio::test]
async fn test_cli_round_trip() -> Result<()> {
    let td = tempfile::tempdir()?;
    let base = Utf8PathBuf::try_from(td.path().to_owned())?;
    let src = base.join("src");
    std::fs::create_dir_all(src.join("keep/nested"))?;
    std::fs::create_dir_all(src.join("skip"))?;
    std::fs::write(src.join("keep/nested/a"), "a")?;
    std::fs::write(src.join("skip/b"), "b")?;
    std::fs::write(src.join("c"), "c")?;
    let archive = base.join("out.tar");
    treetar_lib::cli::run_from_iter([
        "treetar",
        "export",
        src.as_str(),
        "-o",
        archive.as_str(),
        "--exclude",
        "/skip",
    ])
    .await?;

    let dest = base.join("dest");
    std::fs::create_dir(&dest)?;
    treetar_lib::cli::run_from_iter([
        "treetar",
        "import",
        dest.as_str(),
        "-i",
        archive.as_str(),
        "--rebase",
        "/restored",
    ])
    .await?;
    assert_eq!(std::fs::read_to_string(dest.join("restored/keep/nested/a"))?, "a");
    assert_eq!(std::fs::read_to_string(dest.join("restored/c"))?, "c");
    assert!(!dest.join("restored/skip").exists());

    // Importing into a missing directory fails
    let r = treetar_lib::cli::run_from_iter([
        "treetar",
        "import",
        base.join("nonexistent").as_str(),
        "-i",
        archive.as_str(),
    ])
    .await;
    assert!(r.is_err());
    Ok(())
}

#[tokio::test]
async fn test_cli_volumes() -> Result<()> {
    let td = tempfile::tempdir()?;
    let base = Utf8PathBuf::try_from(td.path().to_owned())?;
    let store = base.join("store");
    std::fs::create_dir_all(store.join("volumes/v1/data"))?;
    std::fs::create_dir_all(store.join("volumes/v2"))?;
    std::fs::write(store.join("volumes/v1/data/file"), "contents")?;
    let archive = base.join("v1.tar");
    treetar_lib::cli::run_from_iter([
        "treetar",
        "export",
        store.as_str(),
        "--volume",
        "v1",
        "-o",
        archive.as_str(),
    ])
    .await?;
    treetar_lib::cli::run_from_iter([
        "treetar",
        "import",
        store.as_str(),
        "--volume",
        "v2",
        "-i",
        archive.as_str(),
    ])
    .await?;
    assert_eq!(
        std::fs::read_to_string(store.join("volumes/v2/data/file"))?,
        "contents"
    );

    let r = treetar_lib::cli::run_from_iter([
        "treetar",
        "export",
        store.as_str(),
        "--volume",
        "../v1",
        "-o",
        archive.as_str(),
    ])
    .await;
    assert_eq!(classify(&r.unwrap_err()), ErrorKind::InvalidFilter);
    Ok(())
}
