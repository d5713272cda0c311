// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package version string handling. */

use {
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        num::ParseIntError,
        str::FromStr,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error)]
pub enum VersionError {
    #[error("error parsing string to integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("the epoch component has non-digit characters: {0}")]
    EpochNonNumeric(String),

    #[error("upstream_version component has illegal character: {0}")]
    UpstreamVersionIllegalChar(String),

    #[error("debian_revision component has illegal character: {0}")]
    DebianRevisionIllegalChar(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// A Debian package version.
///
/// The format is `[epoch:]upstream_version[-debian_revision]` and comparison
/// follows <https://www.debian.org/doc/debian-policy/ch-controlfields.html#version>:
/// epochs compare numerically, then the upstream and revision components
/// compare by alternating non-digit and digit runs, where `~` sorts before
/// everything (including the end of a component) and letters sort before
/// other non-digits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageVersion {
    epoch: Option<u32>,
    upstream_version: String,
    debian_revision: Option<String>,
}

impl PackageVersion {
    /// Construct an instance by parsing a version string.
    pub fn parse(s: &str) -> Result<Self> {
        // Epoch is the part before the first colon, if present. The revision
        // is everything after the last hyphen.
        let (epoch, remainder) = match s.split_once(':') {
            Some((epoch, rest)) => (Some(epoch), rest),
            None => (None, s),
        };

        let (upstream, debian) = match remainder.rsplit_once('-') {
            Some((upstream, debian)) => (upstream, Some(debian)),
            None => (remainder, None),
        };

        let epoch = if let Some(epoch) = epoch {
            if !epoch.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionError::EpochNonNumeric(s.to_string()));
            }

            Some(u32::from_str(epoch)?)
        } else {
            None
        };

        // upstream_version allows alphanumerics and . + ~, plus hyphens when
        // a revision is present.
        if !upstream.chars().all(|c| match c {
            c if c.is_ascii_alphanumeric() => true,
            '.' | '+' | '~' => true,
            '-' => debian.is_some(),
            _ => false,
        }) {
            return Err(VersionError::UpstreamVersionIllegalChar(s.to_string()));
        }

        let debian_revision = if let Some(debian) = debian {
            if !debian
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~'))
            {
                return Err(VersionError::DebianRevisionIllegalChar(s.to_string()));
            }

            Some(debian.to_string())
        } else {
            None
        };

        Ok(Self {
            epoch,
            upstream_version: upstream.to_string(),
            debian_revision,
        })
    }

    /// The `epoch` component, if explicitly present.
    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// The `epoch` component, defaulting to 0 when absent.
    pub fn epoch_assumed(&self) -> u32 {
        self.epoch.unwrap_or(0)
    }

    /// The `upstream_version` component.
    pub fn upstream_version(&self) -> &str {
        &self.upstream_version
    }

    /// The `debian_revision` component.
    pub fn debian_revision(&self) -> Option<&str> {
        self.debian_revision.as_deref()
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }

        write!(f, "{}", self.upstream_version)?;

        if let Some(revision) = &self.debian_revision {
            write!(f, "-{}", revision)?;
        }

        Ok(())
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a string at the first digit character.
fn split_leading_nondigits(s: &str) -> (&str, &str) {
    match s.find(|c: char| c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    }
}

/// Split a string at the first non-digit character.
fn split_leading_digits(s: &str) -> (&str, &str) {
    match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    }
}

/// Sort rank of a character in the modified lexical order.
///
/// Tilde sorts before everything including the end of a component, the end
/// of a component sorts before letters, letters before other non-digits.
fn char_rank(c: Option<char>) -> (u8, u32) {
    match c {
        Some('~') => (0, 0),
        None => (1, 0),
        Some(c) if c.is_ascii_alphabetic() => (2, c as u32),
        Some(c) => (3, c as u32),
    }
}

/// Compare two non-digit runs using the modified lexical order.
fn lexical_compare(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars();
    let mut b_chars = b.chars();

    loop {
        let (a_char, b_char) = (a_chars.next(), b_chars.next());

        if a_char.is_none() && b_char.is_none() {
            return Ordering::Equal;
        }

        match char_rank(a_char).cmp(&char_rank(b_char)) {
            Ordering::Equal => {}
            res => return res,
        }
    }
}

/// Compare a version component (upstream or revision) using Debian rules.
///
/// Alternates comparing a non-digit run lexically and a digit run numerically
/// until both inputs are exhausted.
fn compare_component(a: &str, b: &str) -> Ordering {
    let mut a_remaining = a;
    let mut b_remaining = b;

    loop {
        let (a_nondigit, a_rest) = split_leading_nondigits(a_remaining);
        let (b_nondigit, b_rest) = split_leading_nondigits(b_remaining);

        match lexical_compare(a_nondigit, b_nondigit) {
            Ordering::Equal => {}
            res => return res,
        }

        // An empty digit run counts as zero.
        let (a_digits, a_rest) = split_leading_digits(a_rest);
        let (b_digits, b_rest) = split_leading_digits(b_rest);

        let a_numeric = if a_digits.is_empty() {
            0
        } else {
            u64::from_str(a_digits).expect("digit run should parse")
        };
        let b_numeric = if b_digits.is_empty() {
            0
        } else {
            u64::from_str(b_digits).expect("digit run should parse")
        };

        match a_numeric.cmp(&b_numeric) {
            Ordering::Equal => {}
            res => return res,
        }

        if a_rest.is_empty() && b_rest.is_empty() {
            return Ordering::Equal;
        }

        a_remaining = a_rest;
        b_remaining = b_rest;
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Epoch numerically, then upstream, then revision. A missing revision
        // is equivalent to `0`.
        self.epoch_assumed()
            .cmp(&other.epoch_assumed())
            .then_with(|| compare_component(&self.upstream_version, &other.upstream_version))
            .then_with(|| {
                compare_component(
                    self.debian_revision.as_deref().unwrap_or("0"),
                    other.debian_revision.as_deref().unwrap_or("0"),
                )
            })
    }
}
