// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Unpacking package archives into the staging tree.

The extractor opens a downloaded `.deb`, sanity-checks its control paragraph
against the resolved candidate, and streams the data archive into the
[StagingTree]: regular-file content goes into the content-addressed blob
store, every node is recorded as a [FileEntry], and the on-disk tree is
mirrored best-effort. Maintainer scripts are captured but never executed;
what to do with them is the surrounding generator's decision.
*/

use {
    crate::{
        cancel::CancelToken,
        deb::{open_deb, ControlArchive},
        error::{BuildError, Result},
        resolver::ResolvedPackage,
        staging::{normalize_entry_path, FileEntry, FileKind, Payload, StagingTree},
    },
    std::{collections::HashSet, io::Read, path::Path, sync::Arc},
};

/// Metadata retained from an unpacked package.
#[derive(Clone, Debug)]
pub struct ExtractedPackage {
    pub name: String,
    /// Parsed `control.tar` content: control paragraph, conffiles, md5sums
    /// and maintainer scripts (stored, not run).
    pub control: ControlArchive,
}

/// Unpacks `.deb` archives into a staging tree.
pub struct Extractor {
    staging: Arc<StagingTree>,
    cancel: CancelToken,
}

impl Extractor {
    pub fn new(staging: Arc<StagingTree>, cancel: CancelToken) -> Self {
        Self { staging, cancel }
    }

    /// Unpack one resolved package from its downloaded archive.
    ///
    /// Blocking: callers dispatch this to the CPU-bound worker pool.
    pub fn unpack(&self, resolved: &ResolvedPackage, deb_path: &Path) -> Result<ExtractedPackage> {
        self.cancel.check()?;

        let file = std::fs::File::open(deb_path)?;
        let opened = open_deb(std::io::BufReader::new(file))?;

        self.check_control(resolved, &opened.control)?;

        self.staging
            .register_replaces(&resolved.name, self.replaced_names(resolved)?);

        let mut data = opened.data;

        for entry in data.entries()? {
            self.cancel.check()?;
            self.unpack_entry(resolved, entry?)?;
        }

        tracing::debug!(package = %resolved.name, "unpacked");

        Ok(ExtractedPackage {
            name: resolved.name.clone(),
            control: opened.control,
        })
    }

    /// The advertised identity must match the archive's own control file.
    fn check_control(&self, resolved: &ResolvedPackage, control: &ControlArchive) -> Result<()> {
        let mismatch = |message: String| {
            Err(BuildError::DebControlMismatch {
                package: resolved.name.clone(),
                message,
            })
        };

        match control.control.field_str("Package") {
            Some(name) if name == resolved.name => {}
            other => return mismatch(format!("control names package {:?}", other)),
        }

        match control.control.field_str("Version") {
            Some(version) if version == resolved.version.to_string() => {}
            other => {
                return mismatch(format!(
                    "control declares version {:?}, index said {}",
                    other, resolved.version
                ))
            }
        }

        Ok(())
    }

    fn replaced_names(&self, resolved: &ResolvedPackage) -> Result<HashSet<String>> {
        Ok(resolved
            .candidate
            .replaces()?
            .map(|list| {
                list.requirements()
                    .flat_map(|variants| variants.iter())
                    .map(|dep| dep.package.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn unpack_entry<R: Read>(&self, resolved: &ResolvedPackage, mut entry: tar::Entry<R>) -> Result<()> {
        let raw_path = entry.path()?.display().to_string();

        let path = match normalize_entry_path(&raw_path)? {
            Some(path) => path,
            // The `./` root entry.
            None => return Ok(()),
        };

        let header = entry.header();
        let mode = header.mode()? & 0o7777;
        let uid = header.uid()? as u32;
        let gid = header.gid()? as u32;
        let mtime = header.mtime()?;
        let entry_type = header.entry_type();

        let extraction_error = |message: String| BuildError::Extraction {
            package: resolved.name.clone(),
            message,
        };

        let make_entry = |kind, size, payload| FileEntry {
            path: path.clone(),
            kind,
            mode,
            uid,
            gid,
            mtime,
            size,
            payload,
            origin: resolved.name.clone(),
        };

        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                let mut content = vec![];
                entry.read_to_end(&mut content)?;

                let blob = self.staging.store_payload(&content)?;
                let file_entry =
                    make_entry(FileKind::Regular, content.len() as u64, Payload::Blob(blob));

                let _guard = self.staging.lock_path(&path);
                self.staging
                    .insert_and_materialize(file_entry, Some(&content))?;
            }
            tar::EntryType::Directory => {
                let file_entry = make_entry(FileKind::Directory, 0, Payload::None);

                let _guard = self.staging.lock_path(&path);
                self.staging.insert_and_materialize(file_entry, None)?;
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| extraction_error(format!("symlink {} lacks target", path)))?
                    .display()
                    .to_string();

                let file_entry = make_entry(FileKind::Symlink, 0, Payload::Symlink(target));

                let _guard = self.staging.lock_path(&path);
                self.staging.insert_and_materialize(file_entry, None)?;
            }
            tar::EntryType::Link => {
                let raw_target = entry
                    .link_name()?
                    .ok_or_else(|| extraction_error(format!("hardlink {} lacks target", path)))?
                    .display()
                    .to_string();

                let target = normalize_entry_path(&raw_target)?.ok_or_else(|| {
                    extraction_error(format!("hardlink {} targets the root", path))
                })?;
                let target = self.staging.resolve_parents(&target)?;

                // Lock both paths in canonical order, then resolve the
                // target's payload under the lock.
                let _guards = self.staging.lock_pair(&path, &target);

                let target_entry = self.staging.entry(&target).ok_or_else(|| {
                    BuildError::HardlinkTargetMissing {
                        path: path.clone(),
                        target: target.clone(),
                    }
                })?;

                let blob = match &target_entry.payload {
                    Payload::Blob(blob) => blob.clone(),
                    _ => {
                        return Err(BuildError::HardlinkTargetMissing {
                            path,
                            target,
                        })
                    }
                };

                let file_entry = FileEntry {
                    path: path.clone(),
                    kind: FileKind::Hardlink,
                    mode: target_entry.mode,
                    uid: target_entry.uid,
                    gid: target_entry.gid,
                    mtime,
                    size: target_entry.size,
                    payload: Payload::Hardlink {
                        target,
                        blob,
                    },
                    origin: resolved.name.clone(),
                };

                self.staging.insert_and_materialize(file_entry, None)?;
            }
            tar::EntryType::Char | tar::EntryType::Block => {
                let major = header
                    .device_major()?
                    .ok_or_else(|| extraction_error(format!("device {} lacks major", path)))?;
                let minor = header
                    .device_minor()?
                    .ok_or_else(|| extraction_error(format!("device {} lacks minor", path)))?;

                let kind = if entry_type == tar::EntryType::Char {
                    FileKind::CharDevice
                } else {
                    FileKind::BlockDevice
                };

                let file_entry = make_entry(kind, 0, Payload::Device { major, minor });

                let _guard = self.staging.lock_path(&path);
                self.staging.insert_and_materialize(file_entry, None)?;
            }
            tar::EntryType::Fifo => {
                let file_entry = make_entry(FileKind::Fifo, 0, Payload::None);

                let _guard = self.staging.lock_path(&path);
                self.staging.insert_and_materialize(file_entry, None)?;
            }
            // Extended header records are consumed by the tar reader itself.
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use {
        crate::{
            candidate::PackageCandidate, control::parse_control_paragraphs,
            package_version::PackageVersion, resolver::ResolvedPackage,
        },
        std::sync::Arc,
        url::Url,
    };

    /// Fabricate a [ResolvedPackage] for driving the extractor directly.
    pub fn resolved_package_with(
        name: &str,
        version: &str,
        replaces: Option<&str>,
    ) -> ResolvedPackage {
        let mut paragraph = format!(
            "Package: {}\nVersion: {}\nArchitecture: arm64\nFilename: pool/{}.deb\nSize: 1\nSHA256: {}\n",
            name,
            version,
            name,
            crate::cache::sha256_hex(name.as_bytes()),
        );

        if let Some(replaces) = replaces {
            paragraph.push_str(&format!("Replaces: {}\n", replaces));
        }

        let candidate = Arc::new(PackageCandidate::new(
            parse_control_paragraphs(&paragraph).unwrap().remove(0),
            "test-repo",
            0,
        ));

        ResolvedPackage {
            sha256: candidate.sha256_hex().unwrap(),
            size: 1,
            url: Url::parse("http://repo.test/pool/x.deb").unwrap(),
            name: name.to_string(),
            version: PackageVersion::parse(version).unwrap(),
            architecture: "arm64".to_string(),
            candidate,
        }
    }

    pub fn resolved_package(name: &str, version: &str) -> ResolvedPackage {
        resolved_package_with(name, version, None)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{cache::Cache, deb::test_support::*, resolver::ResolvedPackage},
    };

    fn resolved(name: &str, version: &str, replaces: Option<&str>) -> ResolvedPackage {
        super::test_fixtures::resolved_package_with(name, version, replaces)
    }

    fn fixture() -> (tempfile::TempDir, std::sync::Arc<StagingTree>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();
        let tree = StagingTree::new(dir.path().join("stage"), cache).unwrap();

        (dir, std::sync::Arc::new(tree))
    }

    fn write_deb(dir: &tempfile::TempDir, name: &str, deb: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(format!("{}.deb", name));
        std::fs::write(&path, deb).unwrap();
        path
    }

    fn hello_entries() -> Vec<TestEntry> {
        vec![
            TestEntry::Dir {
                path: "usr/",
                mode: 0o755,
            },
            TestEntry::Dir {
                path: "usr/bin/",
                mode: 0o755,
            },
            TestEntry::File {
                path: "usr/bin/hello",
                mode: 0o4755,
                uid: 0,
                gid: 7,
                content: b"#!/bin/sh\necho hello\n",
            },
            TestEntry::Symlink {
                path: "usr/bin/hi",
                target: "hello",
            },
            TestEntry::Hardlink {
                path: "usr/bin/hello-hard",
                target: "usr/bin/hello",
            },
            TestEntry::CharDev {
                path: "dev/console",
                mode: 0o600,
                major: 5,
                minor: 1,
            },
        ]
    }

    #[test]
    fn unpack_records_all_node_kinds() -> Result<()> {
        let (dir, tree) = fixture();

        let deb = build_deb(
            "Package: hello\nVersion: 2.10-2\nArchitecture: arm64\n",
            &[],
            &hello_entries(),
            TestCompression::Xz,
        );
        let path = write_deb(&dir, "hello", &deb);

        let resolved = resolved("hello", "2.10-2", None);

        let extracted = Extractor::new(tree.clone(), CancelToken::new()).unpack(&resolved, &path)?;

        assert_eq!(extracted.name, "hello");

        let exe = tree.entry("usr/bin/hello").unwrap();
        assert_eq!(exe.kind, FileKind::Regular);
        assert_eq!(exe.mode, 0o4755);
        assert_eq!(exe.gid, 7);
        assert_eq!(exe.size, 21);
        assert_eq!(exe.origin, "hello");

        let link = tree.entry("usr/bin/hi").unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.payload, Payload::Symlink("hello".to_string()));

        let hard = tree.entry("usr/bin/hello-hard").unwrap();
        assert_eq!(hard.kind, FileKind::Hardlink);
        assert_eq!(hard.size, exe.size);

        let dev = tree.entry("dev/console").unwrap();
        assert_eq!(dev.kind, FileKind::CharDevice);
        assert_eq!(dev.payload, Payload::Device { major: 5, minor: 1 });

        // On-disk mirror exists where the host allows it.
        assert!(tree.root().join("usr/bin/hello").is_file());
        assert!(tree.root().join("dev/console").is_file());

        Ok(())
    }

    #[test]
    fn control_mismatch_is_rejected() {
        let (dir, tree) = fixture();

        let deb = build_deb(
            "Package: impostor\nVersion: 2.10-2\nArchitecture: arm64\n",
            &[],
            &[],
            TestCompression::Gzip,
        );
        let path = write_deb(&dir, "hello", &deb);

        let resolved = resolved("hello", "2.10-2", None);

        let res = Extractor::new(tree.clone(), CancelToken::new()).unpack(&resolved, &path);

        assert!(matches!(res, Err(BuildError::DebControlMismatch { .. })));
    }

    #[test]
    fn file_conflict_between_packages() {
        let (dir, tree) = fixture();

        let entries = [TestEntry::File {
            path: "etc/shared.conf",
            mode: 0o644,
            uid: 0,
            gid: 0,
            content: b"from-a\n",
        }];
        let deb_a = build_deb(
            "Package: pkg-a\nVersion: 1\nArchitecture: arm64\n",
            &[],
            &entries,
            TestCompression::Gzip,
        );

        let entries = [TestEntry::File {
            path: "etc/shared.conf",
            mode: 0o644,
            uid: 0,
            gid: 0,
            content: b"from-b\n",
        }];
        let deb_b = build_deb(
            "Package: pkg-b\nVersion: 1\nArchitecture: arm64\n",
            &[],
            &entries,
            TestCompression::Gzip,
        );

        let path_a = write_deb(&dir, "pkg-a", &deb_a);
        let path_b = write_deb(&dir, "pkg-b", &deb_b);

        let extractor = Extractor::new(tree.clone(), CancelToken::new());
        extractor.unpack(&resolved("pkg-a", "1", None), &path_a).unwrap();

        let res = extractor.unpack(&resolved("pkg-b", "1", None), &path_b);
        assert!(matches!(res, Err(BuildError::FileConflict { .. })));
    }

    #[test]
    fn replaces_overrides_file_conflict() {
        let (dir, tree) = fixture();

        let entries = [TestEntry::File {
            path: "etc/shared.conf",
            mode: 0o644,
            uid: 0,
            gid: 0,
            content: b"from-a\n",
        }];
        let deb_a = build_deb(
            "Package: pkg-a\nVersion: 1\nArchitecture: arm64\n",
            &[],
            &entries,
            TestCompression::Gzip,
        );

        let entries = [TestEntry::File {
            path: "etc/shared.conf",
            mode: 0o644,
            uid: 0,
            gid: 0,
            content: b"from-b\n",
        }];
        let deb_b = build_deb(
            "Package: pkg-b\nVersion: 1\nArchitecture: arm64\nReplaces: pkg-a\n",
            &[],
            &entries,
            TestCompression::Gzip,
        );

        let path_a = write_deb(&dir, "pkg-a", &deb_a);
        let path_b = write_deb(&dir, "pkg-b", &deb_b);

        let extractor = Extractor::new(tree.clone(), CancelToken::new());
        extractor.unpack(&resolved("pkg-a", "1", None), &path_a).unwrap();
        extractor
            .unpack(&resolved("pkg-b", "1", Some("pkg-a")), &path_b)
            .unwrap();

        // Later-unpacked wins under Replaces.
        let entry = tree.entry("etc/shared.conf").unwrap();
        assert_eq!(entry.origin, "pkg-b");
    }

    #[test]
    fn identical_files_are_shared() {
        let (dir, tree) = fixture();

        let entries = [TestEntry::File {
            path: "usr/share/doc/LICENSE",
            mode: 0o644,
            uid: 0,
            gid: 0,
            content: b"MIT\n",
        }];

        let deb_a = build_deb(
            "Package: pkg-a\nVersion: 1\nArchitecture: arm64\n",
            &[],
            &entries,
            TestCompression::Gzip,
        );
        let deb_b = build_deb(
            "Package: pkg-b\nVersion: 1\nArchitecture: arm64\n",
            &[],
            &entries,
            TestCompression::Gzip,
        );

        let path_a = write_deb(&dir, "pkg-a", &deb_a);
        let path_b = write_deb(&dir, "pkg-b", &deb_b);

        let extractor = Extractor::new(tree.clone(), CancelToken::new());
        extractor.unpack(&resolved("pkg-a", "1", None), &path_a).unwrap();
        extractor.unpack(&resolved("pkg-b", "1", None), &path_b).unwrap();

        assert_eq!(tree.entry("usr/share/doc/LICENSE").unwrap().origin, "pkg-a");
    }

    #[test]
    fn cancelled_extraction_stops() {
        let (dir, tree) = fixture();

        let deb = build_deb(
            "Package: hello\nVersion: 2.10-2\nArchitecture: arm64\n",
            &[],
            &hello_entries(),
            TestCompression::Gzip,
        );
        let path = write_deb(&dir, "hello", &deb);

        let cancel = CancelToken::new();
        cancel.cancel();

        let res = Extractor::new(tree.clone(), cancel).unpack(&resolved("hello", "2.10-2", None), &path);

        assert!(matches!(res, Err(BuildError::Cancelled)));
        assert!(tree.is_empty());
    }
}
