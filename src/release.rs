// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` file primitives.

A `Release` (or the clear-signed `InRelease`) file is the top-level metadata
file of a repository distribution: one control paragraph listing the suite,
components and architectures, plus digest blocks mapping relative paths to
`(hash, size)` for every index file in the distribution.
*/

use {
    crate::{
        control::{ControlParagraph, parse_control_paragraphs},
        error::{BuildError, Result},
    },
    chrono::{DateTime, TimeZone, Utc},
    mailparse::dateparse,
    std::str::FromStr,
};

/// Compression format of an index file, in retrieval preference order.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IndexCompression {
    Xz,
    Gzip,
    None,
}

impl IndexCompression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::None => "",
        }
    }

    /// Retrieval preference order: best compression first.
    pub fn preferred_order() -> impl Iterator<Item = IndexCompression> {
        [Self::Xz, Self::Gzip, Self::None].into_iter()
    }
}

/// An entry in the `SHA256` block of a release file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseIndexEntry {
    /// Path of the file relative to the release file's directory.
    pub path: String,
    /// Lowercase hex SHA-256 of the file.
    pub sha256: String,
    /// Size of the file in bytes.
    pub size: u64,
}

/// A `Packages` index described by a release file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackagesIndexEntry {
    /// The underlying release file entry.
    pub entry: ReleaseIndexEntry,
    /// Component parsed from the path (e.g. `main`).
    pub component: String,
    /// Architecture parsed from the path (e.g. `arm64`).
    pub architecture: String,
    /// File-level compression.
    pub compression: IndexCompression,
}

/// A parsed `Release` / `InRelease` file.
///
/// Wrapper around the single control paragraph such files contain.
#[derive(Clone, Debug)]
pub struct ReleaseFile {
    paragraph: ControlParagraph<'static>,
}

impl ReleaseFile {
    /// Parse a release file from its (unsigned) textual content.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| BuildError::ControlParse(format!("release file is not UTF-8: {}", e)))?;

        let mut paragraphs = parse_control_paragraphs(text)?;

        if paragraphs.len() != 1 {
            return Err(BuildError::ControlParse(format!(
                "expected 1 paragraph in release file; got {}",
                paragraphs.len()
            )));
        }

        Ok(Self {
            paragraph: paragraphs.remove(0),
        })
    }

    /// Obtain the inner control paragraph.
    pub fn paragraph(&self) -> &ControlParagraph<'static> {
        &self.paragraph
    }

    /// Origin of the repository.
    pub fn origin(&self) -> Option<&str> {
        self.paragraph.field_str("Origin")
    }

    /// Suite of this distribution (e.g. `stable`).
    pub fn suite(&self) -> Option<&str> {
        self.paragraph.field_str("Suite")
    }

    /// Codename of this distribution (e.g. `bullseye`).
    pub fn codename(&self) -> Option<&str> {
        self.paragraph.field_str("Codename")
    }

    /// Component names in this distribution.
    pub fn components(&self) -> Vec<&str> {
        self.paragraph
            .field_iter_words("Components")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// Architectures in this distribution.
    pub fn architectures(&self) -> Vec<&str> {
        self.paragraph
            .field_iter_words("Architectures")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// Creation time, normalized to UTC.
    pub fn date(&self) -> Option<Result<DateTime<Utc>>> {
        self.paragraph.field_str("Date").map(|v| {
            Ok(Utc
                .timestamp_opt(dateparse(v)?, 0)
                .single()
                .ok_or_else(|| BuildError::ControlParse(format!("bad release date: {}", v)))?)
        })
    }

    /// Whether clients should fetch index files via `by-hash` paths.
    pub fn acquire_by_hash(&self) -> bool {
        self.paragraph.field_bool("Acquire-By-Hash").unwrap_or(false)
    }

    /// Iterate entries of the `SHA256` block.
    ///
    /// Errors if the block is absent; entries parse lazily.
    pub fn iter_index_entries(
        &self,
    ) -> Result<impl Iterator<Item = Result<ReleaseIndexEntry>> + '_> {
        let lines = self
            .paragraph
            .field_iter_lines("SHA256")
            .ok_or(BuildError::ReleaseNoSha256)?;

        Ok(lines.filter(|line| !line.is_empty()).map(|line| {
            // <digest> <size> <path>
            let mut parts = line.split_ascii_whitespace();

            let digest = parts
                .next()
                .ok_or_else(|| BuildError::ReleaseIndexLine(line.to_string()))?;
            let size = parts
                .next()
                .ok_or_else(|| BuildError::ReleaseIndexLine(line.to_string()))?;
            let path = parts
                .next()
                .ok_or_else(|| BuildError::ReleaseIndexLine(line.to_string()))?;

            if parts.next().is_some() {
                return Err(BuildError::ReleaseIndexLine(line.to_string()));
            }

            hex::decode(digest)?;

            Ok(ReleaseIndexEntry {
                path: path.to_string(),
                sha256: digest.to_ascii_lowercase(),
                size: u64::from_str(size)?,
            })
        }))
    }

    /// Find the digest entry for an exact relative path.
    pub fn entry_for_path(&self, path: &str) -> Result<Option<ReleaseIndexEntry>> {
        for entry in self.iter_index_entries()? {
            let entry = entry?;

            if entry.path == path {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Find the `Packages` index for a component and architecture.
    ///
    /// Compressed variants are preferred in the order xz, gz, plain. Returns
    /// an error when the release file lists no matching index at all.
    pub fn packages_index(
        &self,
        component: &str,
        architecture: &str,
    ) -> Result<PackagesIndexEntry> {
        for compression in IndexCompression::preferred_order() {
            let path = format!(
                "{}/binary-{}/Packages{}",
                component,
                architecture,
                compression.extension()
            );

            if let Some(entry) = self.entry_for_path(&path)? {
                return Ok(PackagesIndexEntry {
                    entry,
                    component: component.to_string(),
                    architecture: architecture.to_string(),
                    compression,
                });
            }
        }

        Err(BuildError::PackagesIndexNotFound {
            component: component.to_string(),
            architecture: architecture.to_string(),
        })
    }

    /// Find the `Packages` index of a flat repository (no `dists/` layout).
    ///
    /// Flat repositories list `Packages[.xz|.gz]` at the top level of the
    /// release file's directory.
    pub fn flat_packages_index(&self, architecture: &str) -> Result<PackagesIndexEntry> {
        for compression in IndexCompression::preferred_order() {
            let path = format!("Packages{}", compression.extension());

            if let Some(entry) = self.entry_for_path(&path)? {
                return Ok(PackagesIndexEntry {
                    entry,
                    component: String::new(),
                    architecture: architecture.to_string(),
                    compression,
                });
            }
        }

        Err(BuildError::PackagesIndexNotFound {
            component: String::new(),
            architecture: architecture.to_string(),
        })
    }
}
