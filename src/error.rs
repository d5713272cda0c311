// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {crate::package_version::VersionError, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("date parsing error: {0:?}")]
    DateParse(#[from] mailparse::MailParseError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("version string error: {0}")]
    Version(#[from] VersionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0:?}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("invalid signature over release file of {0}")]
    SignatureInvalid(String),

    #[error("repository {0} is unsigned and the trust policy requires signatures")]
    UnsignedRepo(String),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("required control field missing: {0}")]
    ControlRequiredFieldMissing(String),

    #[error("failed to parse dependency expression: {0}")]
    DependencyParse(String),

    #[error("release file does not list a SHA256 digest block")]
    ReleaseNoSha256,

    #[error("malformed release index line: {0}")]
    ReleaseIndexLine(String),

    #[error("no Packages index for component {component}, architecture {architecture}")]
    PackagesIndexNotFound {
        component: String,
        architecture: String,
    },

    #[error("unsatisfiable dependency: {0}")]
    UnsatisfiableDependency(Box<crate::resolver::UnsatisfiedChain>),

    #[error("packages {0} and {1} pre-depend on each other; no unpack order exists")]
    PreDependsCycle(String, String),

    #[error("file conflict on {path}: provided by {first} and {second}")]
    FileConflict {
        path: String,
        first: String,
        second: String,
    },

    #[error("unknown entry in binary package archive: {0}")]
    DebUnknownEntry(String),

    #[error("unknown compression in deb archive member: {0}")]
    DebUnknownCompression(String),

    #[error("bad debian-binary member: expected 2.0, got {0:?}")]
    DebBadFormatVersion(String),

    #[error("package archive for {package} does not match index: {message}")]
    DebControlMismatch { package: String, message: String },

    #[error("extraction error in {package}: {message}")]
    Extraction { package: String, message: String },

    #[error("illegal path in archive: {0}")]
    IllegalPath(String),

    #[error("hardlink target {target} missing for {path}")]
    HardlinkTargetMissing { path: String, target: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Process exit code associated with this error.
    ///
    /// `2` configuration, `3` resolution, `4` fetch/verification, `5` extraction,
    /// `6` anything else, `130` cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Yaml(_) => 2,
            Self::UnsatisfiableDependency(_) | Self::PreDependsCycle(_, _) => 3,
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::Integrity { .. }
            | Self::NotFound(_)
            | Self::SignatureInvalid(_)
            | Self::UnsignedRepo(_) => 4,
            Self::Extraction { .. }
            | Self::FileConflict { .. }
            | Self::DebUnknownEntry(_)
            | Self::DebUnknownCompression(_)
            | Self::DebBadFormatVersion(_)
            | Self::DebControlMismatch { .. }
            | Self::IllegalPath(_)
            | Self::HardlinkTargetMissing { .. } => 5,
            Self::Cancelled => 130,
            _ => 6,
        }
    }

    /// Whether a fetch failure with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, BuildError>;
