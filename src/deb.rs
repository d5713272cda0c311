// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! .deb file reading.

A `.deb` binary package is an `ar(5)` archive with three members in canonical
order:

1. `debian-binary` holding the package format version (`2.0\n`).
2. `control.tar[.gz|.xz|.zst]` holding package metadata.
3. `data.tar[.gz|.xz|.zst]` holding file content.
*/

use {
    crate::{
        control::{parse_control_paragraphs, ControlParagraph},
        error::{BuildError, Result},
    },
    std::{
        collections::HashMap,
        io::{Cursor, Read},
    },
};

/// Obtain a decompressing reader matching an archive member extension.
fn reader_for_extension(extension: &str, data: Cursor<Vec<u8>>) -> Result<Box<dyn Read>> {
    match extension {
        "" => Ok(Box::new(data)),
        ".gz" => Ok(Box::new(flate2::read::GzDecoder::new(data))),
        ".xz" => Ok(Box::new(xz2::read::XzDecoder::new(data))),
        ".zst" => Ok(Box::new(zstd::stream::read::Decoder::new(data)?)),
        _ => Err(BuildError::DebUnknownCompression(extension.to_string())),
    }
}

/// An entry in a `.deb` archive.
pub enum BinaryPackageEntry {
    /// The `debian-binary` member content.
    DebianBinary(Vec<u8>),
    /// The `control.tar` archive, decompression applied.
    Control(tar::Archive<Box<dyn Read>>),
    /// The `data.tar` archive, decompression applied.
    Data(tar::Archive<Box<dyn Read>>),
}

/// A reader of `.deb` files.
pub struct BinaryPackageReader<R: Read> {
    archive: ar::Archive<R>,
}

impl<R: Read> BinaryPackageReader<R> {
    /// Construct a new instance from a reader.
    pub fn new(reader: R) -> Self {
        Self {
            archive: ar::Archive::new(reader),
        }
    }

    /// Obtain the next member of the underlying ar archive.
    pub fn next_entry(&mut self) -> Option<Result<BinaryPackageEntry>> {
        let entry = self.archive.next_entry()?;

        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e.into())),
        };

        // Member names are ASCII per the format.
        let filename = String::from_utf8_lossy(entry.header().identifier()).to_string();

        let mut data = vec![];
        if let Err(e) = entry.read_to_end(&mut data) {
            return Some(Err(e.into()));
        }

        let data = Cursor::new(data);

        if filename == "debian-binary" {
            Some(Ok(BinaryPackageEntry::DebianBinary(data.into_inner())))
        } else if let Some(tail) = filename.strip_prefix("control.tar") {
            Some(
                reader_for_extension(tail, data)
                    .map(|r| BinaryPackageEntry::Control(tar::Archive::new(r))),
            )
        } else if let Some(tail) = filename.strip_prefix("data.tar") {
            Some(
                reader_for_extension(tail, data)
                    .map(|r| BinaryPackageEntry::Data(tar::Archive::new(r))),
            )
        } else {
            Some(Err(BuildError::DebUnknownEntry(filename)))
        }
    }
}

/// Parsed content of a package's `control.tar` archive.
///
/// Maintainer scripts are stored verbatim; nothing here ever executes them.
#[derive(Clone, Debug, Default)]
pub struct ControlArchive {
    /// The `control` file's single paragraph.
    pub control: ControlParagraph<'static>,
    /// Paths listed in `conffiles`.
    pub conffiles: Vec<String>,
    /// `(md5 hex, path)` pairs from `md5sums`.
    pub md5sums: Vec<(String, String)>,
    /// Maintainer scripts by name (`preinst`, `postinst`, `prerm`, `postrm`).
    pub scripts: HashMap<String, Vec<u8>>,
}

impl ControlArchive {
    /// Read the interesting members out of a `control.tar` archive.
    pub fn from_tar(mut archive: tar::Archive<Box<dyn Read>>) -> Result<Self> {
        let mut slf = Self::default();

        for entry in archive.entries()? {
            let mut entry = entry?;

            let path = entry.path()?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            // Directory entries and unknown members are skipped.
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let mut data = vec![];
            entry.read_to_end(&mut data)?;

            match name.as_str() {
                "control" => {
                    let text = String::from_utf8_lossy(&data).to_string();
                    let mut paragraphs = parse_control_paragraphs(&text)?;

                    if paragraphs.is_empty() {
                        return Err(BuildError::ControlParse(
                            "control member has no paragraph".to_string(),
                        ));
                    }

                    slf.control = paragraphs.remove(0);
                }
                "conffiles" => {
                    slf.conffiles = String::from_utf8_lossy(&data)
                        .lines()
                        .filter(|l| !l.trim().is_empty())
                        .map(|l| l.trim().to_string())
                        .collect();
                }
                "md5sums" => {
                    slf.md5sums = String::from_utf8_lossy(&data)
                        .lines()
                        .filter_map(|l| {
                            let mut parts = l.split_whitespace();
                            let digest = parts.next()?;
                            let path = parts.next()?;
                            Some((digest.to_string(), path.to_string()))
                        })
                        .collect();
                }
                "preinst" | "postinst" | "prerm" | "postrm" => {
                    slf.scripts.insert(name, data);
                }
                _ => {}
            }
        }

        Ok(slf)
    }
}

/// A fully opened `.deb`: validated format version, parsed control archive
/// and the (not yet consumed) data archive.
pub struct OpenedDeb {
    pub control: ControlArchive,
    pub data: tar::Archive<Box<dyn Read>>,
}

/// Open a `.deb`, validating member order and the format version.
pub fn open_deb<R: Read>(reader: R) -> Result<OpenedDeb> {
    let mut reader = BinaryPackageReader::new(reader);

    // debian-binary must come first and declare format 2.0.
    match reader.next_entry() {
        Some(Ok(BinaryPackageEntry::DebianBinary(data))) => {
            if data != b"2.0\n" {
                return Err(BuildError::DebBadFormatVersion(
                    String::from_utf8_lossy(&data).to_string(),
                ));
            }
        }
        Some(Ok(_)) => {
            return Err(BuildError::DebUnknownEntry(
                "expected debian-binary first".to_string(),
            ))
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(BuildError::DebUnknownEntry(
                "archive has no members".to_string(),
            ))
        }
    }

    let control = match reader.next_entry() {
        Some(Ok(BinaryPackageEntry::Control(archive))) => ControlArchive::from_tar(archive)?,
        Some(Ok(_)) => {
            return Err(BuildError::DebUnknownEntry(
                "expected control.tar second".to_string(),
            ))
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(BuildError::DebUnknownEntry(
                "archive ends before control.tar".to_string(),
            ))
        }
    };

    let data = match reader.next_entry() {
        Some(Ok(BinaryPackageEntry::Data(archive))) => archive,
        Some(Ok(_)) => {
            return Err(BuildError::DebUnknownEntry(
                "expected data.tar third".to_string(),
            ))
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(BuildError::DebUnknownEntry(
                "archive ends before data.tar".to_string(),
            ))
        }
    };

    Ok(OpenedDeb { control, data })
}


#[cfg(test)]
mod test {
    use {super::test_support::*, super::*};

    const CONTROL: &str = "Package: hello\nVersion: 2.10-2\nArchitecture: arm64\n";

    fn entries() -> Vec<TestEntry> {
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
                mode: 0o755,
                uid: 0,
                gid: 0,
                content: b"#!/bin/sh\necho hello\n",
            },
        ]
    }

    #[test]
    fn reads_all_compressions() -> Result<()> {
        for compression in [
            TestCompression::None,
            TestCompression::Gzip,
            TestCompression::Xz,
            TestCompression::Zstd,
        ] {
            let deb = build_deb(CONTROL, &[], &entries(), compression);
            let opened = open_deb(Cursor::new(deb))?;

            assert_eq!(opened.control.control.field_str("Package"), Some("hello"));

            let mut data = opened.data;
            let paths = data
                .entries()?
                .map(|e| e.unwrap().path().unwrap().display().to_string())
                .collect::<Vec<_>>();
            assert!(paths.contains(&"usr/bin/hello".to_string()));
        }

        Ok(())
    }

    #[test]
    fn parses_control_archive_members() -> Result<()> {
        let deb = build_deb(
            CONTROL,
            &[
                ("conffiles", b"/etc/hello.conf\n" as &[u8]),
                ("md5sums", b"d41d8cd98f00b204e9800998ecf8427e  usr/bin/hello\n"),
                ("postinst", b"#!/bin/sh\nexit 0\n"),
            ],
            &entries(),
            TestCompression::Gzip,
        );

        let opened = open_deb(Cursor::new(deb))?;

        assert_eq!(opened.control.conffiles, vec!["/etc/hello.conf"]);
        assert_eq!(opened.control.md5sums.len(), 1);
        assert_eq!(opened.control.md5sums[0].1, "usr/bin/hello");
        assert!(opened.control.scripts.contains_key("postinst"));
        assert!(!opened.control.scripts.contains_key("preinst"));

        Ok(())
    }

    #[test]
    fn rejects_bad_format_version() {
        let mut builder = ar::Builder::new(vec![]);
        let header = ar::Header::new(b"debian-binary".to_vec(), 4);
        builder.append(&header, &b"3.0\n"[..]).unwrap();
        let deb = builder.into_inner().unwrap();

        let res = open_deb(Cursor::new(deb));
        assert!(matches!(res, Err(BuildError::DebBadFormatVersion(_))));
    }

    #[test]
    fn rejects_unknown_member() {
        let mut builder = ar::Builder::new(vec![]);
        let header = ar::Header::new(b"debian-binary".to_vec(), 4);
        builder.append(&header, &b"2.0\n"[..]).unwrap();
        let header = ar::Header::new(b"surprise.tar".to_vec(), 2);
        builder.append(&header, &b"xx"[..]).unwrap();
        let deb = builder.into_inner().unwrap();

        let res = open_deb(Cursor::new(deb));
        assert!(matches!(res, Err(BuildError::DebUnknownEntry(_))));
    }

    #[test]
    fn rejects_non_archive() {
        let res = open_deb(Cursor::new(b"this is not an ar archive".to_vec()));
        assert!(res.is_err());
    }
}
