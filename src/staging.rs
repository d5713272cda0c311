// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The staging tree: an authoritative file-metadata table plus a best-effort
on-disk mirror.

Package content is assembled without root. Attributes the host refuses to a
plain process (ownership changes, device nodes) are recorded in the in-memory
[FileEntry] table only; the on-disk tree carries a zero-byte placeholder
where needed. The composer later writes the recorded attributes into the
output archive metadata, which is the only place they matter.

The table is guarded by a reader-writer lock: mutations take the writer lock
briefly, the composer's traversal holds the reader lock for its duration.
Merges racing on the same path serialize through per-path locks; when an
operation needs several paths at once they are acquired in (depth, name)
order to prevent deadlock.
*/

use {
    crate::{
        cache::Cache,
        error::{BuildError, Result},
    },
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        path::{Path, PathBuf},
        sync::{Arc, RwLock},
    },
};

/// Node kind of a staging tree entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// Payload reference of a staging tree entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// No payload (directories, fifos).
    None,
    /// Content-addressed regular file data.
    Blob(String),
    /// Symlink target, verbatim.
    Symlink(String),
    /// Hardlink target path plus the target's blob at link time.
    ///
    /// The blob lets the composer fall back to emitting a regular entry if
    /// the target is later replaced.
    Hardlink { target: String, blob: String },
    /// Device numbers.
    Device { major: u32, minor: u32 },
}

/// One node of the staging tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileEntry {
    /// Path relative to the stage root, normalized (no `./`, `..` or
    /// leading `/`).
    pub path: String,
    pub kind: FileKind,
    /// Permission bits (12 bits: rwx + setuid/setgid/sticky).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub size: u64,
    pub payload: Payload,
    /// Originating package name, or `overlay`.
    pub origin: String,
}

/// Origin marker for host-file overlays.
pub const OVERLAY_ORIGIN: &str = "overlay";

/// Normalize a path coming out of an archive or a config file.
///
/// Strips `./` prefixes and trailing slashes, rejects `..` components and
/// absolute escapes. Returns `None` for the root entry itself.
pub fn normalize_entry_path(path: &str) -> Result<Option<String>> {
    let trimmed = path
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');

    if trimmed.is_empty() || trimmed == "." {
        return Ok(None);
    }

    if trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(BuildError::IllegalPath(path.to_string()));
    }

    Ok(Some(trimmed.to_string()))
}

fn path_depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Collapse `.` and `..` components, erroring when `..` escapes the root.
fn collapse_dotdot(path: &str) -> Result<String> {
    let mut stack: Vec<&str> = vec![];

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(BuildError::IllegalPath(path.to_string()));
                }
            }
            part => stack.push(part),
        }
    }

    Ok(stack.join("/"))
}

/// The staging tree table plus its on-disk mirror.
pub struct StagingTree {
    root: PathBuf,
    cache: Cache,
    entries: RwLock<BTreeMap<String, FileEntry>>,
    path_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    replaces: RwLock<HashMap<String, HashSet<String>>>,
}

impl StagingTree {
    /// Create a staging tree rooted at a directory.
    ///
    /// Blob payloads are shared with (and persisted through) the cache.
    pub fn new(root: impl Into<PathBuf>, cache: Cache) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            cache,
            entries: RwLock::new(BTreeMap::new()),
            path_locks: std::sync::Mutex::new(HashMap::new()),
            replaces: RwLock::new(HashMap::new()),
        })
    }

    /// The on-disk root of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The blob store backing regular-file payloads.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Acquire the merge lock for one path.
    ///
    /// Extraction workers run on the blocking pool, so this blocks rather
    /// than awaits.
    pub fn lock_path(&self, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .path_locks
            .lock()
            .expect("path lock table should not be poisoned")
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        lock.blocking_lock_owned()
    }

    /// Acquire merge locks for two paths in (depth, name) order.
    pub fn lock_pair(
        &self,
        a: &str,
        b: &str,
    ) -> (
        tokio::sync::OwnedMutexGuard<()>,
        Option<tokio::sync::OwnedMutexGuard<()>>,
    ) {
        if a == b {
            return (self.lock_path(a), None);
        }

        let first_is_a = (path_depth(a), a) <= (path_depth(b), b);
        let (first, second) = if first_is_a { (a, b) } else { (b, a) };

        let first_guard = self.lock_path(first);
        let second_guard = self.lock_path(second);

        (first_guard, Some(second_guard))
    }

    /// Look up an entry by path.
    pub fn entry(&self, path: &str) -> Option<FileEntry> {
        self.entries
            .read()
            .expect("entry table should not be poisoned")
            .get(path)
            .cloned()
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("entry table should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a closure over the sorted entry table under the read lock.
    ///
    /// This is the composer's traversal entry point: the table cannot change
    /// while the closure runs.
    pub fn with_entries<T>(&self, f: impl FnOnce(&BTreeMap<String, FileEntry>) -> T) -> T {
        f(&self
            .entries
            .read()
            .expect("entry table should not be poisoned"))
    }

    /// Record missing parent directories for a path.
    ///
    /// Parent entries inherit the child's origin and get conventional
    /// directory attributes (0755, root-owned).
    fn ensure_parents(&self, path: &str, mtime: u64, origin: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .expect("entry table should not be poisoned");

        let mut prefix = String::new();

        let components: Vec<&str> = path.split('/').collect();
        for part in &components[..components.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);

            match entries.get(&prefix) {
                Some(existing) if existing.kind == FileKind::Directory => {}
                Some(existing) => {
                    return Err(BuildError::FileConflict {
                        path: prefix.clone(),
                        first: existing.origin.clone(),
                        second: origin.to_string(),
                    });
                }
                None => {
                    entries.insert(
                        prefix.clone(),
                        FileEntry {
                            path: prefix.clone(),
                            kind: FileKind::Directory,
                            mode: 0o755,
                            uid: 0,
                            gid: 0,
                            mtime,
                            size: 0,
                            payload: Payload::None,
                            origin: origin.to_string(),
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Canonicalize a path through recorded directory symlinks.
    ///
    /// With merged-usr trees, packages still ship paths like `bin/sh` while
    /// `bin` is a symlink to `usr/bin`; content must land under the link
    /// target. Only parent components resolve, never the leaf.
    pub fn resolve_parents(&self, path: &str) -> Result<String> {
        let mut path = path.to_string();

        // Symlink chains are short in practice; the bound only guards
        // against loops.
        for _ in 0..40 {
            let rewritten = {
                let entries = self
                    .entries
                    .read()
                    .expect("entry table should not be poisoned");

                let parts: Vec<&str> = path.split('/').collect();
                let mut prefix = String::new();
                let mut rewrite = None;

                for (i, part) in parts[..parts.len().saturating_sub(1)].iter().enumerate() {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(part);

                    if let Some(entry) = entries.get(&prefix) {
                        if let Payload::Symlink(target) = &entry.payload {
                            let parent = match prefix.rfind('/') {
                                Some(pos) => &prefix[..pos],
                                None => "",
                            };

                            let base = if let Some(absolute) = target.strip_prefix('/') {
                                absolute.to_string()
                            } else if parent.is_empty() {
                                target.clone()
                            } else {
                                format!("{}/{}", parent, target)
                            };

                            let rest = parts[i + 1..].join("/");
                            rewrite = Some(collapse_dotdot(&format!("{}/{}", base, rest))?);
                            break;
                        }
                    }
                }

                rewrite
            };

            match rewritten {
                Some(p) => path = p,
                None => return Ok(path),
            }
        }

        Err(BuildError::IllegalPath(path))
    }

    /// Declare the package names an origin `Replaces`.
    ///
    /// Registered before a package unpacks, so collision decisions do not
    /// depend on the order concurrent extractions reach a path.
    pub fn register_replaces(&self, origin: &str, names: HashSet<String>) {
        self.replaces
            .write()
            .expect("replaces table should not be poisoned")
            .insert(origin.to_string(), names);
    }

    fn origin_replaces(&self, origin: &str, other: &str) -> bool {
        self.replaces
            .read()
            .expect("replaces table should not be poisoned")
            .get(origin)
            .map(|names| names.contains(other))
            .unwrap_or(false)
    }

    /// Merge an entry into the table, applying the collision policy.
    ///
    /// Identical regular content is shared silently. A package that
    /// `Replaces` the existing entry's origin wins regardless of unpack
    /// order, and overlay entries always win over package entries.
    ///
    /// Returns whether the entry was actually stored (`false` when an
    /// existing identical file is silently shared or an existing directory
    /// is kept).
    pub fn insert(&self, mut entry: FileEntry) -> Result<bool> {
        entry.path = self.resolve_parents(&entry.path)?;

        self.ensure_parents(&entry.path, entry.mtime, &entry.origin)?;

        let mut entries = self
            .entries
            .write()
            .expect("entry table should not be poisoned");

        match entries.get(&entry.path) {
            None => {
                entries.insert(entry.path.clone(), entry);
                Ok(true)
            }
            Some(existing) => {
                // Directories merge: the first recorded attributes stick,
                // except an overlay may restate them.
                if existing.kind == FileKind::Directory && entry.kind == FileKind::Directory {
                    if entry.origin == OVERLAY_ORIGIN {
                        entries.insert(entry.path.clone(), entry);
                        return Ok(true);
                    }
                    return Ok(false);
                }

                // Identical regular content is shared silently.
                if let (Payload::Blob(a), Payload::Blob(b)) = (&existing.payload, &entry.payload) {
                    if a == b && existing.kind == entry.kind {
                        return Ok(false);
                    }
                }

                let existing_origin = existing.origin.clone();

                if entry.origin == OVERLAY_ORIGIN
                    || self.origin_replaces(&entry.origin, &existing_origin)
                {
                    entries.insert(entry.path.clone(), entry);
                    Ok(true)
                } else if existing_origin == OVERLAY_ORIGIN
                    || self.origin_replaces(&existing_origin, &entry.origin)
                {
                    // The entry already present is the replacement.
                    Ok(false)
                } else {
                    Err(BuildError::FileConflict {
                        path: entry.path.clone(),
                        first: existing_origin,
                        second: entry.origin.clone(),
                    })
                }
            }
        }
    }

    /// Mirror an entry onto the host filesystem, best effort.
    ///
    /// `content` must be given for regular files. Operations the host
    /// refuses (device nodes, ownership) leave a placeholder; the table
    /// stays authoritative.
    pub fn materialize(&self, entry: &FileEntry, content: Option<&[u8]>) -> Result<()> {
        let disk_path = self.root.join(&entry.path);

        if let Some(parent) = disk_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match &entry.kind {
            FileKind::Directory => {
                std::fs::create_dir_all(&disk_path)?;
                set_mode(&disk_path, entry.mode);
            }
            FileKind::Regular => {
                let content = content.ok_or_else(|| BuildError::Extraction {
                    package: entry.origin.clone(),
                    message: format!("no content for regular file {}", entry.path),
                })?;

                remove_existing(&disk_path);
                std::fs::write(&disk_path, content)?;
                set_mode(&disk_path, entry.mode);
            }
            FileKind::Symlink => {
                let target = match &entry.payload {
                    Payload::Symlink(target) => target.clone(),
                    _ => {
                        return Err(BuildError::Extraction {
                            package: entry.origin.clone(),
                            message: format!("symlink {} has no target", entry.path),
                        })
                    }
                };

                remove_existing(&disk_path);
                #[cfg(unix)]
                std::os::unix::fs::symlink(target, &disk_path)?;
            }
            FileKind::Hardlink => {
                let target = match &entry.payload {
                    Payload::Hardlink { target, .. } => self.root.join(target),
                    _ => {
                        return Err(BuildError::Extraction {
                            package: entry.origin.clone(),
                            message: format!("hardlink {} has no target", entry.path),
                        })
                    }
                };

                remove_existing(&disk_path);

                // Fall back to a copy when the link cannot be created.
                if std::fs::hard_link(&target, &disk_path).is_err() {
                    if let Payload::Hardlink { blob, .. } = &entry.payload {
                        std::fs::write(&disk_path, self.cache.read_blob(blob)?)?;
                        set_mode(&disk_path, entry.mode);
                    }
                }
            }
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo => {
                // No privilege to mknod; the table carries the real node.
                remove_existing(&disk_path);
                std::fs::write(&disk_path, b"")?;
            }
        }

        Ok(())
    }

    /// Insert an entry and mirror it to disk in one step.
    pub fn insert_and_materialize(&self, mut entry: FileEntry, content: Option<&[u8]>) -> Result<()> {
        entry.path = self.resolve_parents(&entry.path)?;

        if self.insert(entry.clone())? {
            self.materialize(&entry, content)?;
        }

        Ok(())
    }

    /// Store regular-file content and return its blob digest.
    pub fn store_payload(&self, content: &[u8]) -> Result<String> {
        self.cache.store_blob(content)
    }

    /// Read back the payload of a regular-file entry.
    pub fn payload_of(&self, entry: &FileEntry) -> Result<Vec<u8>> {
        match &entry.payload {
            Payload::Blob(blob) | Payload::Hardlink { blob, .. } => self.cache.read_blob(blob),
            _ => Ok(vec![]),
        }
    }

    /// Remove the on-disk tree (table survives; used by cancellation
    /// cleanup where the whole instance is dropped anyway).
    pub fn clean_disk(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }

        Ok(())
    }
}

fn remove_existing(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod test {
    use super::*;

    fn tree() -> (tempfile::TempDir, StagingTree) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();
        let tree = StagingTree::new(dir.path().join("stage"), cache).unwrap();

        (dir, tree)
    }

    fn file_entry(path: &str, blob: &str, origin: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            kind: FileKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 1_600_000_000,
            size: 4,
            payload: Payload::Blob(blob.to_string()),
            origin: origin.to_string(),
        }
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(
            normalize_entry_path("./usr/bin/hello").unwrap(),
            Some("usr/bin/hello".to_string())
        );
        assert_eq!(
            normalize_entry_path("/etc/passwd").unwrap(),
            Some("etc/passwd".to_string())
        );
        assert_eq!(normalize_entry_path("./").unwrap(), None);
        assert_eq!(normalize_entry_path(".").unwrap(), None);
        assert!(normalize_entry_path("a/../b").is_err());
    }

    #[test]
    fn parents_are_recorded() -> Result<()> {
        let (_dir, tree) = tree();

        let blob = tree.store_payload(b"data")?;
        tree.insert(file_entry("usr/bin/hello", &blob, "hello"))?;

        assert_eq!(tree.entry("usr").unwrap().kind, FileKind::Directory);
        assert_eq!(tree.entry("usr/bin").unwrap().kind, FileKind::Directory);
        assert_eq!(tree.len(), 3);

        Ok(())
    }

    #[test]
    fn identical_content_is_shared() -> Result<()> {
        let (_dir, tree) = tree();

        let blob = tree.store_payload(b"data")?;
        tree.insert(file_entry("usr/share/f", &blob, "pkg-a"))?;
        let stored = tree.insert(file_entry("usr/share/f", &blob, "pkg-b"))?;

        assert!(!stored);
        // The first origin sticks.
        assert_eq!(tree.entry("usr/share/f").unwrap().origin, "pkg-a");

        Ok(())
    }

    #[test]
    fn differing_content_conflicts() -> Result<()> {
        let (_dir, tree) = tree();

        let blob_a = tree.store_payload(b"aaa")?;
        let blob_b = tree.store_payload(b"bbb")?;

        tree.insert(file_entry("etc/conf", &blob_a, "pkg-a"))?;
        let res = tree.insert(file_entry("etc/conf", &blob_b, "pkg-b"));

        match res {
            Err(BuildError::FileConflict { path, first, second }) => {
                assert_eq!(path, "etc/conf");
                assert_eq!(first, "pkg-a");
                assert_eq!(second, "pkg-b");
            }
            other => panic!("expected FileConflict, got {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn replaces_lets_later_package_win() -> Result<()> {
        let (_dir, tree) = tree();

        let blob_a = tree.store_payload(b"aaa")?;
        let blob_b = tree.store_payload(b"bbb")?;

        tree.insert(file_entry("etc/conf", &blob_a, "pkg-a"))?;

        tree.register_replaces("pkg-b", HashSet::from(["pkg-a".to_string()]));
        let stored = tree.insert(file_entry("etc/conf", &blob_b, "pkg-b"))?;

        assert!(stored);
        assert_eq!(tree.entry("etc/conf").unwrap().origin, "pkg-b");

        Ok(())
    }

    #[test]
    fn replaces_holds_in_either_unpack_order() -> Result<()> {
        let (_dir, tree) = tree();

        let blob_a = tree.store_payload(b"aaa")?;
        let blob_b = tree.store_payload(b"bbb")?;

        // The replacement lands first; the replaced package arrives later
        // and must not override or conflict.
        tree.register_replaces("pkg-b", HashSet::from(["pkg-a".to_string()]));
        tree.insert(file_entry("etc/conf", &blob_b, "pkg-b"))?;
        let stored = tree.insert(file_entry("etc/conf", &blob_a, "pkg-a"))?;

        assert!(!stored);
        assert_eq!(tree.entry("etc/conf").unwrap().origin, "pkg-b");

        Ok(())
    }

    #[test]
    fn overlay_always_wins() -> Result<()> {
        let (_dir, tree) = tree();

        let blob_a = tree.store_payload(b"aaa")?;
        let blob_b = tree.store_payload(b"bbb")?;

        tree.insert(file_entry("etc/conf", &blob_a, "pkg-a"))?;
        tree.insert(file_entry("etc/conf", &blob_b, OVERLAY_ORIGIN))?;

        assert_eq!(tree.entry("etc/conf").unwrap().origin, OVERLAY_ORIGIN);

        Ok(())
    }

    #[test]
    fn content_lands_through_directory_symlinks() -> Result<()> {
        let (_dir, tree) = tree();

        // Merged-usr layout: bin is a symlink to usr/bin.
        tree.insert(FileEntry {
            path: "usr/bin".to_string(),
            kind: FileKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            payload: Payload::None,
            origin: "base-files".to_string(),
        })?;
        tree.insert(FileEntry {
            path: "bin".to_string(),
            kind: FileKind::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            payload: Payload::Symlink("usr/bin".to_string()),
            origin: "base-files".to_string(),
        })?;

        // A package still shipping /bin/busybox lands under the target.
        let blob = tree.store_payload(b"busybox")?;
        tree.insert(file_entry("bin/busybox", &blob, "busybox-static"))?;

        assert!(tree.entry("usr/bin/busybox").is_some());
        assert!(tree.entry("bin/busybox").is_none());
        // The symlink itself survives untouched.
        assert_eq!(tree.entry("bin").unwrap().kind, FileKind::Symlink);

        Ok(())
    }

    #[test]
    fn dotdot_in_symlink_target_collapses() {
        assert_eq!(collapse_dotdot("usr/lib64/../lib/x").unwrap(), "usr/lib/x");
        assert!(collapse_dotdot("../escape").is_err());
    }

    #[test]
    fn device_nodes_get_placeholders() -> Result<()> {
        let (_dir, tree) = tree();

        let entry = FileEntry {
            path: "dev/console".to_string(),
            kind: FileKind::CharDevice,
            mode: 0o600,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            payload: Payload::Device { major: 5, minor: 1 },
            origin: "base-files".to_string(),
        };

        tree.insert_and_materialize(entry.clone(), None)?;

        // The disk carries a placeholder; the table carries the node.
        let disk = tree.root().join("dev/console");
        assert!(disk.is_file());
        assert_eq!(std::fs::metadata(&disk)?.len(), 0);
        assert_eq!(
            tree.entry("dev/console").unwrap().payload,
            Payload::Device { major: 5, minor: 1 }
        );

        Ok(())
    }

    #[test]
    fn materializes_regular_files_and_symlinks() -> Result<()> {
        let (_dir, tree) = tree();

        let blob = tree.store_payload(b"#!/bin/sh\n")?;
        tree.insert_and_materialize(
            FileEntry {
                path: "usr/bin/hello".to_string(),
                kind: FileKind::Regular,
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 10,
                payload: Payload::Blob(blob),
                origin: "hello".to_string(),
            },
            Some(b"#!/bin/sh\n"),
        )?;

        tree.insert_and_materialize(
            FileEntry {
                path: "bin".to_string(),
                kind: FileKind::Symlink,
                mode: 0o777,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 0,
                payload: Payload::Symlink("usr/bin".to_string()),
                origin: "base-files".to_string(),
            },
            None,
        )?;

        assert_eq!(
            std::fs::read(tree.root().join("usr/bin/hello"))?,
            b"#!/bin/sh\n"
        );
        assert_eq!(
            std::fs::read_link(tree.root().join("bin"))?,
            PathBuf::from("usr/bin")
        );

        Ok(())
    }
}
