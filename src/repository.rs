// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository configuration and package index loading.

A [Repository] is a named source of packages. Loading one walks the standard
layout:

```text
{base}/dists/{suite}/InRelease
{base}/dists/{suite}/Release            (+ Release.gpg)
{base}/dists/{suite}/{component}/binary-{arch}/Packages[.xz|.gz]
```

verifies signatures per the configured trust policy, fetches each `Packages`
index pinned to the digest the release file advertises, and indexes the
parsed candidates by name and by virtual name (`Provides`).

Flat repositories (no `dists/` hierarchy) expose `Packages[.xz|.gz]` directly
under the base URL; they are detected by the absence of both release files
and treated as one unsigned pseudo-component, subject to the trust policy.
*/

use {
    crate::{
        cache::IndexKey,
        candidate::PackageCandidate,
        control::ControlParagraphReader,
        dependency::{SingleDependency, VersionRelationship},
        error::{BuildError, Result},
        fetch::Fetcher,
        package_version::PackageVersion,
        release::{IndexCompression, PackagesIndexEntry, ReleaseFile},
        signature::{is_clearsigned, Keyring, VerifyOutcome},
    },
    serde::Deserialize,
    std::{collections::HashMap, io::Read, sync::Arc},
    url::Url,
};

/// Whether unsigned repository metadata is acceptable.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Metadata must carry a signature validating against the configured key.
    #[default]
    Signed,
    /// Unsigned metadata is accepted. Invalid signatures stay fatal.
    UnsignedAllowed,
}

/// Configuration of one package repository.
#[derive(Clone, Debug, Deserialize)]
pub struct RepoConfig {
    /// Base URL of the repository.
    #[serde(rename = "apt_repo")]
    pub url: String,

    /// Distribution suite under `dists/`. Absent for flat repositories.
    #[serde(rename = "distro", default)]
    pub suite: Option<String>,

    /// Directory of a flat repository, relative to the base URL.
    #[serde(default)]
    pub directory: Option<String>,

    /// Architecture override for this repository.
    #[serde(default)]
    pub arch: Option<String>,

    /// Components to index. Defaults to `main`.
    #[serde(default = "default_components")]
    pub components: Vec<String>,

    /// ASCII-armored public key material for signature verification.
    #[serde(default)]
    pub key: Option<String>,

    /// Trust policy for unsigned metadata.
    #[serde(default)]
    pub trust: TrustPolicy,
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

impl RepoConfig {
    /// Stable identity of this repository: URL plus suite (or directory).
    pub fn id(&self) -> String {
        match (&self.suite, &self.directory) {
            (Some(suite), _) => format!("{}_{}_{}", self.url, suite, self.components.join("_")),
            (None, Some(directory)) => format!("{}_{}", self.url, directory),
            (None, None) => self.url.clone(),
        }
    }
}

/// A candidate with its hot fields parsed out, ready for resolution.
#[derive(Clone, Debug)]
pub struct IndexedCandidate {
    pub candidate: Arc<PackageCandidate>,
    pub name: String,
    pub version: PackageVersion,
    pub architecture: String,
}

/// A package providing a virtual name.
#[derive(Clone, Debug)]
pub struct VirtualProvider {
    pub candidate: Arc<PackageCandidate>,
    /// Version the virtual name is provided at, when declared.
    pub provided_version: Option<PackageVersion>,
}

/// A loaded, queryable package index for one repository.
#[derive(Debug)]
pub struct Repository {
    id: String,
    priority: usize,
    base_url: Url,
    trust: TrustPolicy,
    by_name: HashMap<String, Vec<IndexedCandidate>>,
    by_virtual: HashMap<String, Vec<VirtualProvider>>,
}

fn decompress_index(data: &[u8], compression: IndexCompression) -> Result<Vec<u8>> {
    let mut out = vec![];

    match compression {
        IndexCompression::None => out = data.to_vec(),
        IndexCompression::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        IndexCompression::Xz => {
            xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
        }
    }

    Ok(out)
}

/// Ensure a URL ends with a trailing slash so `join` keeps the full path.
fn dir_url(url: &Url) -> Result<Url> {
    if url.path().ends_with('/') {
        Ok(url.clone())
    } else {
        let mut url = url.clone();
        url.set_path(&format!("{}/", url.path()));
        Ok(url)
    }
}

impl Repository {
    /// Load the package index of a configured repository.
    ///
    /// `priority` is the repository's position in the configuration; it
    /// breaks ties during resolution. `architecture` is the build target;
    /// `Architecture: all` candidates are indexed alongside it.
    pub async fn load(
        config: &RepoConfig,
        priority: usize,
        fetcher: &Fetcher,
        architecture: &str,
    ) -> Result<Self> {
        let architecture = config.arch.as_deref().unwrap_or(architecture);
        let base_url = dir_url(&Url::parse(&config.url)?)?;

        let mut keyring = Keyring::default();
        if let Some(key) = &config.key {
            keyring.add_armored_key(key)?;
        }

        let mut repo = Self {
            id: config.id(),
            priority,
            base_url: base_url.clone(),
            trust: config.trust,
            by_name: HashMap::new(),
            by_virtual: HashMap::new(),
        };

        match &config.suite {
            Some(suite) => {
                repo.load_structured(config, suite, fetcher, &keyring, architecture)
                    .await?
            }
            None => {
                let directory = config.directory.as_deref().unwrap_or("");
                repo.load_flat(config, directory, fetcher, &keyring, architecture)
                    .await?
            }
        }

        let packages: usize = repo.by_name.values().map(|v| v.len()).sum();
        tracing::info!(repo = %repo.id, packages, "repository index loaded");

        Ok(repo)
    }

    /// Fetch and verify release metadata at a distribution path.
    ///
    /// Tries `InRelease` first, then `Release` + `Release.gpg`. Returns the
    /// release body and the verification outcome, or `None` when neither
    /// release file exists (the flat-repository signal).
    async fn fetch_release(
        &self,
        meta_url: &Url,
        fetcher: &Fetcher,
        keyring: &Keyring,
    ) -> Result<Option<(Vec<u8>, VerifyOutcome)>> {
        match fetcher.fetch_bytes(&meta_url.join("InRelease")?, None).await {
            Ok(data) => {
                if is_clearsigned(&data) {
                    let (body, outcome) = keyring.verify_inline(&data)?;
                    return Ok(Some((body, outcome)));
                }

                // Some servers serve a plain Release under the InRelease
                // name. Content is present, signature is not.
                return Ok(Some((data, VerifyOutcome::Unsigned)));
            }
            Err(BuildError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let release = match fetcher.fetch_bytes(&meta_url.join("Release")?, None).await {
            Ok(data) => data,
            Err(BuildError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let outcome = match fetcher
            .fetch_bytes(&meta_url.join("Release.gpg")?, None)
            .await
        {
            Ok(signature) => keyring.verify_detached(&release, &signature)?,
            Err(BuildError::NotFound(_)) => VerifyOutcome::Unsigned,
            Err(e) => return Err(e),
        };

        Ok(Some((release, outcome)))
    }

    fn enforce_trust(&self, outcome: VerifyOutcome) -> Result<()> {
        match outcome {
            VerifyOutcome::Verified => Ok(()),
            VerifyOutcome::Invalid => Err(BuildError::SignatureInvalid(self.id.clone())),
            VerifyOutcome::Unsigned => match self.trust {
                TrustPolicy::UnsignedAllowed => Ok(()),
                TrustPolicy::Signed => Err(BuildError::UnsignedRepo(self.id.clone())),
            },
        }
    }

    async fn load_structured(
        &mut self,
        config: &RepoConfig,
        suite: &str,
        fetcher: &Fetcher,
        keyring: &Keyring,
        architecture: &str,
    ) -> Result<()> {
        let meta_url = dir_url(&self.base_url.join(&format!("dists/{}/", suite))?)?;

        let (body, outcome) = match self.fetch_release(&meta_url, fetcher, keyring).await? {
            Some(release) => release,
            None => {
                // No release files under dists/: the repository is flat.
                tracing::debug!(repo = %self.id, "no dists/ release files; treating repository as flat");
                let directory = config.directory.as_deref().unwrap_or("");
                return Box::pin(self.load_flat(config, directory, fetcher, keyring, architecture))
                    .await;
            }
        };

        self.enforce_trust(outcome)?;

        let release = ReleaseFile::parse(&body)?;

        for component in &config.components {
            let entry = release.packages_index(component, architecture)?;

            let index_key = IndexKey {
                repo_id: self.id.clone(),
                suite: suite.to_string(),
                component: component.clone(),
                architecture: architecture.to_string(),
            };

            let data = self
                .fetch_packages_index(&meta_url, &entry, &index_key, fetcher)
                .await?;

            self.index_packages(&data)?;
        }

        Ok(())
    }

    async fn load_flat(
        &mut self,
        _config: &RepoConfig,
        directory: &str,
        fetcher: &Fetcher,
        keyring: &Keyring,
        architecture: &str,
    ) -> Result<()> {
        let meta_url = if directory.is_empty() {
            self.base_url.clone()
        } else {
            dir_url(&self.base_url.join(&format!("{}/", directory.trim_matches('/')))?)?
        };

        match self.fetch_release(&meta_url, fetcher, keyring).await? {
            Some((body, outcome)) => {
                self.enforce_trust(outcome)?;

                let release = ReleaseFile::parse(&body)?;
                let entry = release.flat_packages_index(architecture)?;

                let index_key = IndexKey {
                    repo_id: self.id.clone(),
                    suite: directory.to_string(),
                    component: String::new(),
                    architecture: architecture.to_string(),
                };

                let data = self
                    .fetch_packages_index(&meta_url, &entry, &index_key, fetcher)
                    .await?;

                self.index_packages(&data)?;
            }
            None => {
                // No release metadata at all: a bare flat repository. There
                // is nothing to verify, so the trust policy decides up front.
                self.enforce_trust(VerifyOutcome::Unsigned)?;

                let mut found = false;

                for compression in IndexCompression::preferred_order() {
                    let url = meta_url.join(&format!("Packages{}", compression.extension()))?;

                    match fetcher.fetch_bytes(&url, None).await {
                        Ok(data) => {
                            let data = decompress_index(&data, compression)?;
                            self.index_packages(&data)?;
                            found = true;
                            break;
                        }
                        Err(BuildError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }

                if !found {
                    return Err(BuildError::NotFound(
                        meta_url.join("Packages")?.to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Fetch a `Packages` index, going through the decompressed-index cache.
    ///
    /// The cache key includes the digest from the release file, so divergent
    /// mirror content never aliases.
    async fn fetch_packages_index(
        &self,
        meta_url: &Url,
        entry: &PackagesIndexEntry,
        index_key: &IndexKey,
        fetcher: &Fetcher,
    ) -> Result<Vec<u8>> {
        if let Some(data) = fetcher.cache().lookup_index(index_key, &entry.entry.sha256) {
            tracing::debug!(repo = %self.id, path = %entry.entry.path, "index cache hit");
            return Ok(data);
        }

        let url = meta_url.join(&entry.entry.path)?;
        let raw = fetcher.fetch_bytes(&url, Some(&entry.entry.sha256)).await?;

        let data = decompress_index(&raw, entry.compression)?;

        fetcher
            .cache()
            .store_index(index_key, &data, &entry.entry.sha256)?;

        Ok(data)
    }

    /// Parse a decompressed `Packages` file and merge it into the tables.
    fn index_packages(&mut self, data: &[u8]) -> Result<()> {
        let reader = ControlParagraphReader::new(std::io::Cursor::new(data));

        for paragraph in reader {
            let paragraph = paragraph?;

            let candidate = Arc::new(PackageCandidate::new(
                paragraph,
                self.id.clone(),
                self.priority,
            ));

            let attach_paragraph = |e: BuildError| {
                BuildError::ControlParse(format!(
                    "{} in paragraph:\n{}",
                    e,
                    candidate.to_control_string()
                ))
            };

            let indexed = IndexedCandidate {
                name: candidate
                    .package()
                    .map_err(|e| attach_paragraph(e))?
                    .to_string(),
                version: candidate.version().map_err(|e| attach_paragraph(e))?,
                architecture: candidate
                    .architecture()
                    .map_err(|e| attach_paragraph(e))?
                    .to_string(),
                candidate: candidate.clone(),
            };

            if let Some(provides) = candidate.provides().map_err(|e| attach_paragraph(e))? {
                for variants in provides.requirements() {
                    for dep in variants.iter() {
                        self.by_virtual
                            .entry(dep.package.clone())
                            .or_default()
                            .push(VirtualProvider {
                                candidate: candidate.clone(),
                                provided_version: dep
                                    .constraint
                                    .as_ref()
                                    .map(|(_, version)| version.clone()),
                            });
                    }
                }
            }

            self.by_name
                .entry(indexed.name.clone())
                .or_default()
                .push(indexed);
        }

        // Highest version first; ties break on the smaller filename.
        for candidates in self.by_name.values_mut() {
            candidates.sort_by(|a, b| {
                b.version.cmp(&a.version).then_with(|| {
                    a.candidate
                        .field_str("Filename")
                        .cmp(&b.candidate.field_str("Filename"))
                })
            });
        }

        Ok(())
    }

    /// Identity of this repository.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Priority (configuration position) of this repository.
    pub fn priority(&self) -> usize {
        self.priority
    }

    /// Candidates for a package name matching architecture and constraint.
    ///
    /// `Architecture: all` candidates match any target. Results are sorted
    /// version-descending.
    pub fn get_package(
        &self,
        name: &str,
        architecture: &str,
        constraint: Option<&(VersionRelationship, PackageVersion)>,
    ) -> Vec<&IndexedCandidate> {
        self.by_name
            .get(name)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter(|c| c.architecture == architecture || c.architecture == "all")
                    .filter(|c| match constraint {
                        Some((relationship, wanted)) => {
                            relationship.evaluate(&c.version, wanted)
                        }
                        None => true,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Candidates matching a full dependency expression.
    pub fn get_matching(&self, dep: &SingleDependency, architecture: &str) -> Vec<&IndexedCandidate> {
        self.get_package(&dep.package, architecture, dep.constraint.as_ref())
    }

    /// Packages providing a virtual name.
    pub fn providers_of(&self, virtual_name: &str) -> &[VirtualProvider] {
        self.by_virtual
            .get(virtual_name)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    /// Iterate all indexed candidates.
    pub fn all_candidates(&self) -> impl Iterator<Item = &IndexedCandidate> {
        self.by_name.values().flatten()
    }

    /// Absolute URL of a candidate's package archive.
    pub fn package_url(&self, candidate: &PackageCandidate) -> Result<Url> {
        Ok(self.base_url.join(candidate.filename()?)?)
    }
}
