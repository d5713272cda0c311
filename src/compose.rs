// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deterministic artifact emission.

The composer walks the staging tree's entry table in sorted path order and
writes a tar or cpio (newc) archive whose bytes are a pure function of the
table. Metadata comes from the table, never from host `stat`: ownership is
numeric-only, names are empty, and with reproducibility enabled every mtime
is clamped to a fixed timestamp (`SOURCE_DATE_EPOCH`, else zero).
*/

use {
    crate::{
        error::{BuildError, Result},
        staging::{FileEntry, FileKind, Payload, StagingTree},
    },
    serde::Deserialize,
    std::{io::Write, str::FromStr},
};

/// Container format of the output artifact.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Tar,
    Cpio,
}

/// Outer compression of the output artifact.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    None,
    Gzip,
    Xz,
    Zstd,
}

/// Output format: container plus optional compression.
///
/// Parses from the `{tar|cpio}[:{gzip|xz|zstd}]` config syntax.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputFormat {
    pub archive: ArchiveFormat,
    pub compression: CompressionFormat,
}

impl OutputFormat {
    pub const TAR: Self = Self {
        archive: ArchiveFormat::Tar,
        compression: CompressionFormat::None,
    };

    pub const CPIO_GZIP: Self = Self {
        archive: ArchiveFormat::Cpio,
        compression: CompressionFormat::Gzip,
    };

    /// Conventional filename extension for this format.
    pub fn extension(&self) -> &'static str {
        match (self.archive, self.compression) {
            (ArchiveFormat::Tar, CompressionFormat::None) => ".tar",
            (ArchiveFormat::Tar, CompressionFormat::Gzip) => ".tar.gz",
            (ArchiveFormat::Tar, CompressionFormat::Xz) => ".tar.xz",
            (ArchiveFormat::Tar, CompressionFormat::Zstd) => ".tar.zst",
            (ArchiveFormat::Cpio, CompressionFormat::None) => ".cpio",
            (ArchiveFormat::Cpio, CompressionFormat::Gzip) => ".cpio.gz",
            (ArchiveFormat::Cpio, CompressionFormat::Xz) => ".cpio.xz",
            (ArchiveFormat::Cpio, CompressionFormat::Zstd) => ".cpio.zst",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        let (archive, compression) = match s.split_once(':') {
            Some((archive, compression)) => (archive, Some(compression)),
            None => (s, None),
        };

        let archive = match archive {
            "tar" => ArchiveFormat::Tar,
            "cpio" => ArchiveFormat::Cpio,
            other => {
                return Err(BuildError::Config(format!(
                    "unknown archive format: {}",
                    other
                )))
            }
        };

        let compression = match compression {
            None | Some("none") => CompressionFormat::None,
            Some("gzip") | Some("gz") => CompressionFormat::Gzip,
            Some("xz") => CompressionFormat::Xz,
            Some("zstd") | Some("zst") => CompressionFormat::Zstd,
            Some(other) => {
                return Err(BuildError::Config(format!(
                    "unknown compression format: {}",
                    other
                )))
            }
        };

        Ok(Self {
            archive,
            compression,
        })
    }
}

impl<'de> Deserialize<'de> for OutputFormat {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Composition options.
#[derive(Clone, Debug, Default)]
pub struct ComposeOptions {
    /// Apply all determinism rules.
    pub reproducible: bool,
    /// Fixed timestamp override. When unset, `SOURCE_DATE_EPOCH` from the
    /// environment applies, then zero.
    pub source_date_epoch: Option<u64>,
}

impl ComposeOptions {
    /// The fixed mtime in effect, when reproducibility is requested.
    fn fixed_mtime(&self) -> Option<u64> {
        if !self.reproducible {
            return None;
        }

        Some(
            self.source_date_epoch
                .or_else(|| {
                    std::env::var("SOURCE_DATE_EPOCH")
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(0),
        )
    }
}

/// Emits archives from a staging tree.
pub struct Composer<'a> {
    staging: &'a StagingTree,
}

impl<'a> Composer<'a> {
    pub fn new(staging: &'a StagingTree) -> Self {
        Self { staging }
    }

    /// Compose the staging tree into archive bytes.
    ///
    /// Entries are emitted in byte-wise sorted path order. The entry table
    /// is read-locked for the whole traversal.
    pub fn compose(&self, format: OutputFormat, options: &ComposeOptions) -> Result<Vec<u8>> {
        let fixed_mtime = options.fixed_mtime();

        let archive = self.staging.with_entries(|entries| {
            let ordered = entries.values();

            match format.archive {
                ArchiveFormat::Tar => self.write_tar(ordered, fixed_mtime),
                ArchiveFormat::Cpio => self.write_cpio(ordered, fixed_mtime),
            }
        })?;

        let out = match format.compression {
            CompressionFormat::None => archive,
            CompressionFormat::Gzip => {
                // Fixed MTIME header, no filename field.
                let mut encoder = flate2::GzBuilder::new().mtime(
                    fixed_mtime.map(|t| t as u32).unwrap_or(0),
                ).write(vec![], flate2::Compression::best());
                encoder.write_all(&archive)?;
                encoder.finish()?
            }
            CompressionFormat::Xz => {
                // Single-threaded: block layout stays independent of the
                // worker count.
                let mut encoder = xz2::write::XzEncoder::new(vec![], 6);
                encoder.write_all(&archive)?;
                encoder.finish()?
            }
            CompressionFormat::Zstd => zstd::stream::encode_all(archive.as_slice(), 0)?,
        };

        tracing::info!(
            bytes = out.len(),
            format = ?format,
            "artifact composed"
        );

        Ok(out)
    }

    fn entry_mtime(entry: &FileEntry, fixed_mtime: Option<u64>) -> u64 {
        match fixed_mtime {
            // Clamp: never later than the fixed timestamp.
            Some(fixed) => entry.mtime.min(fixed),
            None => entry.mtime,
        }
    }

    fn write_tar<'e>(
        &self,
        entries: impl Iterator<Item = &'e FileEntry>,
        fixed_mtime: Option<u64>,
    ) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(vec![]);

        for entry in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_uid(entry.uid as u64);
            header.set_gid(entry.gid as u64);
            header.set_mtime(Self::entry_mtime(entry, fixed_mtime));
            header.set_size(0);

            match entry.kind {
                FileKind::Regular => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(entry.size);

                    let content = self.staging.payload_of(entry)?;
                    builder.append_data(&mut header, &entry.path, content.as_slice())?;
                }
                FileKind::Directory => {
                    header.set_entry_type(tar::EntryType::Directory);
                    builder.append_data(&mut header, &entry.path, std::io::empty())?;
                }
                FileKind::Symlink => {
                    let target = match &entry.payload {
                        Payload::Symlink(target) => target,
                        _ => {
                            return Err(BuildError::Extraction {
                                package: entry.origin.clone(),
                                message: format!("symlink {} has no target", entry.path),
                            })
                        }
                    };

                    header.set_entry_type(tar::EntryType::Symlink);
                    builder.append_link(&mut header, &entry.path, target)?;
                }
                FileKind::Hardlink => {
                    let (target, blob) = match &entry.payload {
                        Payload::Hardlink { target, blob } => (target, blob),
                        _ => {
                            return Err(BuildError::Extraction {
                                package: entry.origin.clone(),
                                message: format!("hardlink {} has no target", entry.path),
                            })
                        }
                    };

                    // If the target still carries the same content, emit a
                    // real link entry; otherwise fall back to a regular
                    // entry from the recorded blob.
                    let target_matches = matches!(
                        self.staging.entry(target).map(|e| e.payload),
                        Some(Payload::Blob(b)) if &b == blob
                    );

                    if target_matches {
                        header.set_entry_type(tar::EntryType::Link);
                        builder.append_link(&mut header, &entry.path, target)?;
                    } else {
                        let content = self.staging.cache().read_blob(blob)?;
                        header.set_entry_type(tar::EntryType::Regular);
                        header.set_size(content.len() as u64);
                        builder.append_data(&mut header, &entry.path, content.as_slice())?;
                    }
                }
                FileKind::CharDevice | FileKind::BlockDevice => {
                    let (major, minor) = match &entry.payload {
                        Payload::Device { major, minor } => (*major, *minor),
                        _ => (0, 0),
                    };

                    header.set_entry_type(if entry.kind == FileKind::CharDevice {
                        tar::EntryType::Char
                    } else {
                        tar::EntryType::Block
                    });
                    header.set_device_major(major)?;
                    header.set_device_minor(minor)?;
                    builder.append_data(&mut header, &entry.path, std::io::empty())?;
                }
                FileKind::Fifo => {
                    header.set_entry_type(tar::EntryType::Fifo);
                    builder.append_data(&mut header, &entry.path, std::io::empty())?;
                }
            }
        }

        Ok(builder.into_inner()?)
    }

    fn write_cpio<'e>(
        &self,
        entries: impl Iterator<Item = &'e FileEntry>,
        fixed_mtime: Option<u64>,
    ) -> Result<Vec<u8>> {
        let mut out = vec![];

        // Deterministic inode numbers: sequential in emission (sorted) order.
        let mut inode = 1u32;

        for entry in entries {
            let type_bits = match entry.kind {
                FileKind::Regular | FileKind::Hardlink => 0o100000,
                FileKind::Directory => 0o040000,
                FileKind::Symlink => 0o120000,
                FileKind::CharDevice => 0o020000,
                FileKind::BlockDevice => 0o060000,
                FileKind::Fifo => 0o010000,
            };

            // Hardlinks are emitted as independent regular entries carrying
            // the shared content; the initramfs unpacker accepts this and
            // the output stays a pure function of the table.
            let data = match (&entry.kind, &entry.payload) {
                (FileKind::Regular, _) | (FileKind::Hardlink, _) => {
                    self.staging.payload_of(entry)?
                }
                (_, Payload::Symlink(target)) => target.as_bytes().to_vec(),
                _ => vec![],
            };

            let (rdev_major, rdev_minor) = match &entry.payload {
                Payload::Device { major, minor } => (*major, *minor),
                _ => (0, 0),
            };

            write_newc_record(
                &mut out,
                NewcRecord {
                    inode,
                    mode: type_bits | (entry.mode & 0o7777),
                    uid: entry.uid,
                    gid: entry.gid,
                    nlink: if entry.kind == FileKind::Directory { 2 } else { 1 },
                    mtime: Self::entry_mtime(entry, fixed_mtime) as u32,
                    rdev_major,
                    rdev_minor,
                    name: &entry.path,
                },
                &data,
            )?;

            inode += 1;
        }

        write_newc_record(
            &mut out,
            NewcRecord {
                inode: 0,
                mode: 0,
                uid: 0,
                gid: 0,
                nlink: 1,
                mtime: 0,
                rdev_major: 0,
                rdev_minor: 0,
                name: "TRAILER!!!",
            },
            &[],
        )?;

        Ok(out)
    }
}

/// Header fields of one newc record.
struct NewcRecord<'a> {
    inode: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    rdev_major: u32,
    rdev_minor: u32,
    name: &'a str,
}

/// Write one *New ASCII format* record: `070701` magic, 13 8-digit hex
/// fields, NUL-terminated name padded to 4 bytes, data padded to 4 bytes.
fn write_newc_record(out: &mut Vec<u8>, record: NewcRecord<'_>, data: &[u8]) -> Result<()> {
    let name_size = record.name.len() as u32 + 1;

    out.extend_from_slice(b"070701");

    for field in [
        record.inode,
        record.mode,
        record.uid,
        record.gid,
        record.nlink,
        record.mtime,
        data.len() as u32,
        0, // dev_major
        0, // dev_minor
        record.rdev_major,
        record.rdev_minor,
        name_size,
        0, // checksum (unused in 070701)
    ] {
        out.extend_from_slice(format!("{:08x}", field).as_bytes());
    }

    out.extend_from_slice(record.name.as_bytes());
    out.push(0);

    // Records start 4-aligned, so padding the running length covers the
    // 110-byte header plus name, and afterwards the data.
    while out.len() % 4 != 0 {
        out.push(0);
    }

    out.extend_from_slice(data);

    while out.len() % 4 != 0 {
        out.push(0);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            cache::Cache,
            staging::{FileEntry, FileKind, Payload, StagingTree},
        },
        std::io::Read,
    };

    fn tree() -> (tempfile::TempDir, StagingTree) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();
        let tree = StagingTree::new(dir.path().join("stage"), cache).unwrap();

        (dir, tree)
    }

    fn add_file(tree: &StagingTree, path: &str, content: &[u8], mode: u32, mtime: u64) {
        let blob = tree.store_payload(content).unwrap();

        tree.insert_and_materialize(
            FileEntry {
                path: path.to_string(),
                kind: FileKind::Regular,
                mode,
                uid: 0,
                gid: 0,
                mtime,
                size: content.len() as u64,
                payload: Payload::Blob(blob),
                origin: "test".to_string(),
            },
            Some(content),
        )
        .unwrap();
    }

    fn reproducible() -> ComposeOptions {
        ComposeOptions {
            reproducible: true,
            source_date_epoch: Some(0),
        }
    }

    #[test]
    fn tar_is_byte_identical_across_runs() -> Result<()> {
        let (_dir, tree) = tree();

        add_file(&tree, "usr/bin/a", b"aaa", 0o755, 1_600_000_000);
        add_file(&tree, "etc/b", b"bbb", 0o644, 1_700_000_000);

        let composer = Composer::new(&tree);
        let first = composer.compose(OutputFormat::TAR, &reproducible())?;
        let second = composer.compose(OutputFormat::TAR, &reproducible())?;

        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn independent_builds_are_identical() -> Result<()> {
        // Same logical content staged into two separate trees, inserted in
        // different orders, composes to identical bytes.
        let (_dir_a, tree_a) = tree();
        add_file(&tree_a, "usr/bin/a", b"aaa", 0o755, 1_600_000_000);
        add_file(&tree_a, "etc/b", b"bbb", 0o644, 1_600_000_000);

        let (_dir_b, tree_b) = tree();
        add_file(&tree_b, "etc/b", b"bbb", 0o644, 1_600_000_000);
        add_file(&tree_b, "usr/bin/a", b"aaa", 0o755, 1_600_000_000);

        let first = Composer::new(&tree_a).compose(OutputFormat::TAR, &reproducible())?;
        let second = Composer::new(&tree_b).compose(OutputFormat::TAR, &reproducible())?;

        assert_eq!(first, second);

        let first = Composer::new(&tree_a).compose(OutputFormat::CPIO_GZIP, &reproducible())?;
        let second = Composer::new(&tree_b).compose(OutputFormat::CPIO_GZIP, &reproducible())?;

        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn mtimes_are_clamped() -> Result<()> {
        let (_dir, tree) = tree();

        add_file(&tree, "late", b"x", 0o644, 1_900_000_000);
        add_file(&tree, "early", b"y", 0o644, 5);

        let options = ComposeOptions {
            reproducible: true,
            source_date_epoch: Some(100),
        };

        let data = Composer::new(&tree).compose(OutputFormat::TAR, &options)?;

        let mut archive = tar::Archive::new(data.as_slice());
        let mtimes = archive
            .entries()?
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().display().to_string(),
                    e.header().mtime().unwrap(),
                )
            })
            .collect::<Vec<_>>();

        // Later than the fixed time clamps down; earlier survives.
        assert!(mtimes.contains(&("late".to_string(), 100)));
        assert!(mtimes.contains(&("early".to_string(), 5)));

        Ok(())
    }

    #[test]
    fn table_metadata_overrides_disk() -> Result<()> {
        let (_dir, tree) = tree();

        // Ownership and device numbers that the host would refuse are
        // still emitted, straight from the table.
        tree.insert_and_materialize(
            FileEntry {
                path: "dev".to_string(),
                kind: FileKind::Directory,
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 0,
                payload: Payload::None,
                origin: "base".to_string(),
            },
            None,
        )?;

        tree.insert_and_materialize(
            FileEntry {
                path: "dev/console".to_string(),
                kind: FileKind::CharDevice,
                mode: 0o600,
                uid: 0,
                gid: 5,
                mtime: 0,
                size: 0,
                payload: Payload::Device { major: 5, minor: 1 },
                origin: "base".to_string(),
            },
            None,
        )?;

        let data = Composer::new(&tree).compose(OutputFormat::TAR, &reproducible())?;

        let mut archive = tar::Archive::new(data.as_slice());
        let console = archive
            .entries()?
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().display().to_string() == "dev/console")
            .unwrap();

        assert_eq!(console.header().entry_type(), tar::EntryType::Char);
        assert_eq!(console.header().device_major().unwrap(), Some(5));
        assert_eq!(console.header().device_minor().unwrap(), Some(1));
        assert_eq!(console.header().gid().unwrap(), 5);
        assert_eq!(console.header().username().unwrap(), Some(""));

        Ok(())
    }

    #[test]
    fn gzip_header_has_fixed_mtime_and_no_name() -> Result<()> {
        let (_dir, tree) = tree();
        add_file(&tree, "f", b"data", 0o644, 1_600_000_000);

        let format = OutputFormat {
            archive: ArchiveFormat::Tar,
            compression: CompressionFormat::Gzip,
        };

        let options = ComposeOptions {
            reproducible: true,
            source_date_epoch: Some(42),
        };

        let data = Composer::new(&tree).compose(format, &options)?;

        // RFC 1952: MTIME is bytes 4..8 little-endian; FLG is byte 3 and
        // FNAME is bit 3.
        assert_eq!(&data[4..8], &42u32.to_le_bytes());
        assert_eq!(data[3] & 0b0000_1000, 0);

        Ok(())
    }

    #[test]
    fn cpio_newc_layout() -> Result<()> {
        let (_dir, tree) = tree();
        add_file(&tree, "init", b"#!/bin/sh\n", 0o755, 0);

        let format = OutputFormat {
            archive: ArchiveFormat::Cpio,
            compression: CompressionFormat::None,
        };

        let data = Composer::new(&tree).compose(format, &reproducible())?;

        assert_eq!(&data[0..6], b"070701");
        // Records stay 4-byte aligned throughout.
        assert_eq!(data.len() % 4, 0);

        let text = String::from_utf8_lossy(&data);
        assert!(text.contains("init"));
        assert!(text.contains("TRAILER!!!"));

        // File size field of the first record (field 7, offset 6 + 6*8).
        let size_hex = std::str::from_utf8(&data[6 + 6 * 8..6 + 7 * 8]).unwrap();
        assert_eq!(u32::from_str_radix(size_hex, 16).unwrap(), 10);

        Ok(())
    }

    #[test]
    fn round_trips_deb_content_through_tar() -> Result<()> {
        use crate::{
            cancel::CancelToken,
            deb::test_support::*,
            extract::Extractor,
        };

        let (dir, tree) = tree();

        let deb = build_deb(
            "Package: hello\nVersion: 2.10-2\nArchitecture: arm64\n",
            &[],
            &[
                TestEntry::Dir { path: "usr/", mode: 0o755 },
                TestEntry::Dir { path: "usr/bin/", mode: 0o755 },
                TestEntry::File {
                    path: "usr/bin/hello",
                    mode: 0o755,
                    uid: 0,
                    gid: 7,
                    content: b"#!/bin/sh\necho hello\n",
                },
                TestEntry::Symlink { path: "usr/bin/hi", target: "hello" },
            ],
            TestCompression::Gzip,
        );

        let deb_path = dir.path().join("hello.deb");
        std::fs::write(&deb_path, &deb)?;

        let tree = std::sync::Arc::new(tree);
        let resolved = crate::extract::test_fixtures::resolved_package("hello", "2.10-2");
        Extractor::new(tree.clone(), CancelToken::new()).unpack(&resolved, &deb_path)?;

        let data = Composer::new(&tree).compose(OutputFormat::TAR, &reproducible())?;

        // Every FileEntry survives with identical metadata and payload.
        let mut archive = tar::Archive::new(data.as_slice());
        let mut seen = 0;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.display().to_string();

            let recorded = tree.entry(&path).unwrap();
            seen += 1;

            let header = entry.header();
            assert_eq!(header.mode()? & 0o7777, recorded.mode, "{}", path);
            assert_eq!(header.uid()? as u32, recorded.uid, "{}", path);
            assert_eq!(header.gid()? as u32, recorded.gid, "{}", path);
            assert_eq!(header.size()?, recorded.size, "{}", path);

            if recorded.kind == FileKind::Regular {
                let mut content = vec![];
                entry.read_to_end(&mut content)?;
                assert_eq!(
                    crate::cache::sha256_hex(&content),
                    match &recorded.payload {
                        Payload::Blob(blob) => blob.clone(),
                        other => panic!("unexpected payload {:?}", other),
                    },
                    "{}",
                    path
                );
            }
        }

        assert_eq!(seen, tree.len());

        Ok(())
    }
}
