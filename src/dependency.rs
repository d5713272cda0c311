// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package dependency syntax handling.

See <https://www.debian.org/doc/debian-policy/ch-relationships.html> for the
specification of the expression language.
*/

use {
    crate::{
        error::{BuildError, Result},
        package_version::PackageVersion,
    },
    once_cell::sync::Lazy,
    regex::Regex,
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        ops::{Deref, DerefMut},
    },
};

/// Regular expression to parse a single dependency expression.
static RE_DEPENDENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        # Package name terminates at whitespace, ( or [.
        ^(?P<package>[^\s\[(]+)
        \s*
        # Optional version relationship in parentheses.
        (?:\(
            \s*
            (?P<relop>(<<|<=|=|>=|>>))
            \s*
            (?P<version>[^\s)]+)
            \s*
        \))?
        \s*
        # Optional architecture restriction in brackets.
        (?:\[
            \s*
            (?P<arch_negate>!)?
            \s*
            (?P<arch>[^\]]+)
        \])?
        "#,
    )
    .expect("dependency regex should compile")
});

/// A version relationship operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionRelationship {
    StrictlyEarlier,
    EarlierOrEqual,
    ExactlyEqual,
    LaterOrEqual,
    StrictlyLater,
}

impl VersionRelationship {
    /// Whether `candidate` standing in this relationship to `wanted` holds.
    pub fn evaluate(&self, candidate: &PackageVersion, wanted: &PackageVersion) -> bool {
        matches!(
            (candidate.cmp(wanted), self),
            (
                Ordering::Equal,
                Self::ExactlyEqual | Self::LaterOrEqual | Self::EarlierOrEqual,
            ) | (
                Ordering::Less,
                Self::StrictlyEarlier | Self::EarlierOrEqual
            ) | (Ordering::Greater, Self::StrictlyLater | Self::LaterOrEqual)
        )
    }
}

impl Display for VersionRelationship {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::StrictlyEarlier => write!(f, "<<"),
            Self::EarlierOrEqual => write!(f, "<="),
            Self::ExactlyEqual => write!(f, "="),
            Self::LaterOrEqual => write!(f, ">="),
            Self::StrictlyLater => write!(f, ">>"),
        }
    }
}

/// A single parsed dependency expression.
#[derive(Clone, Debug, PartialEq)]
pub struct SingleDependency {
    /// Package the dependency is on.
    pub package: String,
    /// Optional version constraint.
    pub constraint: Option<(VersionRelationship, PackageVersion)>,
    /// Optional architecture restriction; the bool is the `!` negation.
    pub architecture: Option<(bool, String)>,
}

impl Display for SingleDependency {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.package)?;
        if let Some((rel, version)) = &self.constraint {
            write!(f, " ({} {})", rel, version)?;
        }
        if let Some((negate, arch)) = &self.architecture {
            write!(f, " [{}{}]", if *negate { "!" } else { "" }, arch)?;
        }

        Ok(())
    }
}

impl SingleDependency {
    /// Construct an unconstrained dependency on a package name.
    pub fn unconstrained(package: impl ToString) -> Self {
        Self {
            package: package.to_string(),
            constraint: None,
            architecture: None,
        }
    }

    /// Parse a single dependency expression.
    pub fn parse(s: &str) -> Result<Self> {
        let caps = RE_DEPENDENCY
            .captures(s)
            .ok_or_else(|| BuildError::DependencyParse(s.to_string()))?;

        let package = caps["package"].to_string();

        let constraint = match (caps.name("relop"), caps.name("version")) {
            (Some(relop), Some(version)) => {
                let relop = match relop.as_str() {
                    "<<" => VersionRelationship::StrictlyEarlier,
                    "<=" => VersionRelationship::EarlierOrEqual,
                    "=" => VersionRelationship::ExactlyEqual,
                    ">=" => VersionRelationship::LaterOrEqual,
                    ">>" => VersionRelationship::StrictlyLater,
                    v => {
                        return Err(BuildError::DependencyParse(format!(
                            "unexpected version relationship {} in {}",
                            v, s
                        )))
                    }
                };

                let version = PackageVersion::parse(version.as_str())?;

                Some((relop, version))
            }
            _ => None,
        };

        let architecture = match (caps.name("arch_negate"), caps.name("arch")) {
            (Some(_), Some(arch)) => Some((true, arch.as_str().trim().to_string())),
            (None, Some(arch)) => Some((false, arch.as_str().trim().to_string())),
            _ => None,
        };

        Ok(Self {
            package,
            constraint,
            architecture,
        })
    }

    /// Evaluate whether a concrete package satisfies this expression.
    pub fn package_satisfies(
        &self,
        package: &str,
        version: &PackageVersion,
        architecture: &str,
    ) -> bool {
        if self.package != package {
            return false;
        }

        if let Some((negate, arch)) = &self.architecture {
            if (*negate && arch == architecture) || (!*negate && arch != architecture) {
                return false;
            }
        }

        if let Some((relationship, wanted)) = &self.constraint {
            relationship.evaluate(version, wanted)
        } else {
            true
        }
    }

    /// Evaluate whether a virtual package provided under `provided_version`
    /// satisfies this expression.
    ///
    /// An unversioned `Provides` satisfies only unversioned constraints, per
    /// policy.
    pub fn virtual_satisfies(&self, provided_version: Option<&PackageVersion>) -> bool {
        match (&self.constraint, provided_version) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((relationship, wanted)), Some(provided)) => {
                relationship.evaluate(provided, wanted)
            }
        }
    }
}

/// A set of alternative expressions (`a | b`), satisfied by any member.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DependencyVariants(Vec<SingleDependency>);

impl Display for DependencyVariants {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.0
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(" | ")
        )
    }
}

impl Deref for DependencyVariants {
    type Target = Vec<SingleDependency>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DependencyVariants {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl DependencyVariants {
    /// Whether any variant is satisfied by the given package.
    pub fn package_satisfies(&self, package: &str, version: &PackageVersion, arch: &str) -> bool {
        self.0
            .iter()
            .any(|variant| variant.package_satisfies(package, version, arch))
    }
}

/// An ordered, comma-delimited list of dependency requirements.
///
/// Every entry must be satisfied; each entry is a [DependencyVariants].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DependencyList {
    dependencies: Vec<DependencyVariants>,
}

impl Display for DependencyList {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.dependencies
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl DependencyList {
    /// Parse a dependency list from a string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut dependencies = vec![];

        for el in s.split(',') {
            let el = el.trim();

            if el.is_empty() {
                continue;
            }

            let mut variants = DependencyVariants::default();

            for alt in el.split('|') {
                variants.push(SingleDependency::parse(alt.trim())?);
            }

            dependencies.push(variants);
        }

        Ok(Self { dependencies })
    }

    /// Iterate over the requirements constituting this list.
    pub fn requirements(&self) -> impl Iterator<Item = &DependencyVariants> {
        self.dependencies.iter()
    }

    /// Whether the list has no requirements.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Whether at least one requirement is satisfied by the given package.
    pub fn package_satisfies(&self, package: &str, version: &PackageVersion, arch: &str) -> bool {
        self.dependencies
            .iter()
            .any(|variants| variants.package_satisfies(package, version, arch))
    }
}
