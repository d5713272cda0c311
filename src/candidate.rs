// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Concrete package candidates from `Packages` indices. */

use {
    crate::{
        control::ControlParagraph,
        dependency::DependencyList,
        error::{BuildError, Result},
        package_version::PackageVersion,
    },
    std::{
        fmt::{Display, Formatter},
        ops::Deref,
    },
};

/// A concrete entry from a parsed `Packages` index.
///
/// This is a wrapper around the underlying control paragraph, annotated with
/// the identity and priority of the repository it came from. Mandatory fields
/// have accessors returning [Result]; optional fields return [Option].
///
/// `(name, version, architecture, repo)` uniquely identifies a candidate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageCandidate {
    paragraph: ControlParagraph<'static>,
    repo_id: String,
    repo_priority: usize,
}

impl Deref for PackageCandidate {
    type Target = ControlParagraph<'static>;

    fn deref(&self) -> &Self::Target {
        &self.paragraph
    }
}

impl Display for PackageCandidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={} [{}] ({})",
            self.field_str("Package").unwrap_or("?"),
            self.field_str("Version").unwrap_or("?"),
            self.field_str("Architecture").unwrap_or("?"),
            self.repo_id,
        )
    }
}

impl PackageCandidate {
    /// Construct an instance from a control paragraph and its source repo.
    pub fn new(
        paragraph: ControlParagraph<'static>,
        repo_id: impl ToString,
        repo_priority: usize,
    ) -> Self {
        Self {
            paragraph,
            repo_id: repo_id.to_string(),
            repo_priority,
        }
    }

    /// Identity of the repository this candidate came from.
    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Position of the source repository in the configuration, 0 first.
    pub fn repo_priority(&self) -> usize {
        self.repo_priority
    }

    /// The `Package` field value.
    pub fn package(&self) -> Result<&str> {
        self.required_field_str("Package")
    }

    /// The `Version` field as its original string.
    pub fn version_str(&self) -> Result<&str> {
        self.required_field_str("Version")
    }

    /// The `Version` field parsed into a [PackageVersion].
    pub fn version(&self) -> Result<PackageVersion> {
        Ok(PackageVersion::parse(self.version_str()?)?)
    }

    /// The `Architecture` field.
    pub fn architecture(&self) -> Result<&str> {
        self.required_field_str("Architecture")
    }

    /// The `Filename` field: path of the archive relative to the repo root.
    ///
    /// The value is validated to be a normalized relative path.
    pub fn filename(&self) -> Result<&str> {
        let filename = self.required_field_str("Filename")?;

        if filename.starts_with('/') || filename.split('/').any(|part| part == "..") {
            return Err(BuildError::IllegalPath(filename.to_string()));
        }

        Ok(filename)
    }

    /// The `Size` field, parsed to a [u64].
    pub fn size(&self) -> Result<u64> {
        self.field_u64("Size")
            .ok_or_else(|| BuildError::ControlRequiredFieldMissing("Size".to_string()))?
    }

    /// The `SHA256` field as validated lowercase hex.
    pub fn sha256_hex(&self) -> Result<String> {
        let digest = self.required_field_str("SHA256")?;

        let raw = hex::decode(digest)?;
        if raw.len() != 32 {
            return Err(BuildError::ControlParse(format!(
                "SHA256 field is {} bytes, expected 32: {}",
                raw.len(),
                digest
            )));
        }

        Ok(digest.to_ascii_lowercase())
    }

    /// The `Priority` field.
    pub fn priority(&self) -> Option<&str> {
        self.field_str("Priority")
    }

    /// Whether the package is flagged `Essential: yes`.
    pub fn essential(&self) -> bool {
        self.field_bool("Essential").unwrap_or(false)
    }

    fn field_dependency_list(&self, name: &str) -> Result<Option<DependencyList>> {
        match self.field_str(name) {
            Some(value) => Ok(Some(DependencyList::parse(value)?)),
            None => Ok(None),
        }
    }

    /// The `Depends` field, parsed.
    pub fn depends(&self) -> Result<Option<DependencyList>> {
        self.field_dependency_list("Depends")
    }

    /// The `Pre-Depends` field, parsed.
    pub fn pre_depends(&self) -> Result<Option<DependencyList>> {
        self.field_dependency_list("Pre-Depends")
    }

    /// The `Provides` field, parsed.
    pub fn provides(&self) -> Result<Option<DependencyList>> {
        self.field_dependency_list("Provides")
    }

    /// The `Conflicts` field, parsed.
    pub fn conflicts(&self) -> Result<Option<DependencyList>> {
        self.field_dependency_list("Conflicts")
    }

    /// The `Breaks` field, parsed.
    pub fn breaks(&self) -> Result<Option<DependencyList>> {
        self.field_dependency_list("Breaks")
    }

    /// The `Replaces` field, parsed.
    pub fn replaces(&self) -> Result<Option<DependencyList>> {
        self.field_dependency_list("Replaces")
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::control::parse_control_paragraphs};

    const BUSYBOX: &str = "Package: busybox-static\n\
Version: 1:1.30.1-7ubuntu3\n\
Architecture: arm64\n\
Essential: yes\n\
Priority: optional\n\
Provides: busybox\n\
Filename: pool/main/b/busybox/busybox-static_1.30.1-7ubuntu3_arm64.deb\n\
Size: 1018888\n\
SHA256: 02d96d34937dbd3b375854392ba9acf9fc01f0ee36d27a0807e2ae8014ca50dd\n";

    fn candidate(s: &str) -> PackageCandidate {
        let para = parse_control_paragraphs(s).unwrap().remove(0);
        PackageCandidate::new(para, "http://ports.ubuntu.com_jammy_main", 0)
    }

    #[test]
    fn accessors() -> Result<()> {
        let c = candidate(BUSYBOX);

        assert_eq!(c.package()?, "busybox-static");
        assert_eq!(c.version()?, PackageVersion::parse("1:1.30.1-7ubuntu3")?);
        assert_eq!(c.architecture()?, "arm64");
        assert!(c.essential());
        assert_eq!(c.size()?, 1018888);
        assert_eq!(
            c.filename()?,
            "pool/main/b/busybox/busybox-static_1.30.1-7ubuntu3_arm64.deb"
        );
        assert_eq!(c.sha256_hex()?.len(), 64);
        assert!(c.provides()?.is_some());
        assert!(c.depends()?.is_none());

        Ok(())
    }

    #[test]
    fn filename_normalization() {
        let c = candidate(
            "Package: evil\nVersion: 1\nArchitecture: all\nFilename: ../../etc/passwd\n",
        );
        assert!(matches!(c.filename(), Err(BuildError::IllegalPath(_))));

        let c = candidate("Package: evil\nVersion: 1\nArchitecture: all\nFilename: /abs/path\n");
        assert!(matches!(c.filename(), Err(BuildError::IllegalPath(_))));
    }

    #[test]
    fn sha256_validation() {
        let c = candidate("Package: short\nVersion: 1\nArchitecture: all\nSHA256: abcd\n");
        assert!(c.sha256_hex().is_err());

        let c = candidate("Package: nothex\nVersion: 1\nArchitecture: all\nSHA256: zz\n");
        assert!(c.sha256_hex().is_err());
    }
}
