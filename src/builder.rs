// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Build orchestration.

One build runs through four phases: resolve (in-memory, single worker),
fetch (I/O-bound queue, default degree 8), extract (CPU-bound queue, default
degree = CPU count) and compose (serial, to keep the canonical output
order). Archive fetching and extraction pipeline against each other; the
install set's resolution order is unaffected by either.

Cancellation propagates through a shared [CancelToken]; a cancelled build
cleans its staging directory unless `keep_staging` is set.
*/

use {
    crate::{
        cache::Cache,
        cancel::CancelToken,
        compose::{ComposeOptions, Composer},
        config::{HostFile, ImageConfig},
        error::{BuildError, Result},
        extract::{ExtractedPackage, Extractor},
        fetch::{Fetcher, Transport},
        repository::Repository,
        resolver::{InstallSet, Resolver},
        staging::{
            normalize_entry_path, FileEntry, FileKind, Payload, StagingTree, OVERLAY_ORIGIN,
        },
    },
    futures::StreamExt,
    std::{path::Path, sync::Arc},
    tokio::sync::Semaphore,
};

/// Worker-pool degrees for the build queues.
#[derive(Clone, Copy, Debug)]
pub struct BuildLimits {
    /// Concurrent fetch operations.
    pub network: usize,
    /// Concurrent package extractions.
    pub decompress: usize,
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            network: 8,
            decompress: num_cpus::get().max(1),
        }
    }
}

/// Drives one image build from a declarative configuration.
pub struct ImageBuilder {
    config: ImageConfig,
    fetcher: Arc<Fetcher>,
    cancel: CancelToken,
    limits: BuildLimits,
    keep_staging: bool,
}

impl ImageBuilder {
    /// Construct a builder fetching over HTTP(S).
    pub fn new(config: ImageConfig, cache: Cache) -> Self {
        let cancel = CancelToken::new();

        Self {
            config,
            fetcher: Arc::new(Fetcher::over_http(cache, cancel.clone())),
            cancel,
            limits: BuildLimits::default(),
            keep_staging: false,
        }
    }

    /// Construct a builder over an explicit transport (tests, mirrors).
    pub fn with_transport(config: ImageConfig, cache: Cache, transport: Arc<dyn Transport>) -> Self {
        let cancel = CancelToken::new();

        Self {
            config,
            fetcher: Arc::new(Fetcher::new(transport, cache, cancel.clone())),
            cancel,
            limits: BuildLimits::default(),
            keep_staging: false,
        }
    }

    /// The configuration driving this build.
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Token that cancels this build when fired.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Override the worker-pool degrees.
    pub fn limits(&mut self, limits: BuildLimits) -> &mut Self {
        self.limits = limits;
        self
    }

    /// Keep the staging directory on cancellation or failure.
    pub fn keep_staging(&mut self, keep: bool) -> &mut Self {
        self.keep_staging = keep;
        self
    }

    /// The cache backing this build.
    pub fn cache(&self) -> &Cache {
        self.fetcher.cache()
    }

    /// A sibling builder over the same fetcher with a different package
    /// list. Generators use this for side sets (e.g. the kernel package
    /// whose modules feed an initrd).
    pub fn with_packages(&self, packages: Vec<String>) -> Self {
        let mut config = self.config.clone();
        config.packages = packages;
        config.essential = false;
        config.host_files = vec![];

        Self {
            config,
            fetcher: self.fetcher.clone(),
            cancel: self.cancel.clone(),
            limits: self.limits,
            keep_staging: self.keep_staging,
        }
    }

    /// Load all configured repositories and resolve the install set.
    ///
    /// Resolution itself is purely in-memory and runs to completion on one
    /// worker.
    pub async fn resolve(&self) -> Result<InstallSet> {
        let architecture = self.config.arch.as_str();

        let mut repos = Vec::with_capacity(self.config.apt_repos.len());

        for (priority, repo_config) in self.config.apt_repos.iter().enumerate() {
            self.cancel.check()?;

            repos.push(Repository::load(repo_config, priority, &self.fetcher, architecture).await?);
        }

        let roots = self.config.package_refs()?;

        let mut resolver = Resolver::new(repos.iter(), architecture);
        resolver.include_essential(self.config.essential);

        resolver.resolve(&roots)
    }

    /// Fetch and unpack an install set into a staging tree.
    ///
    /// Fetches and extractions pipeline: a package starts unpacking as soon
    /// as its archive is verified, while other downloads continue.
    pub async fn populate_staging(
        &self,
        install: &InstallSet,
        staging: &Arc<StagingTree>,
    ) -> Result<Vec<ExtractedPackage>> {
        let network = Arc::new(Semaphore::new(self.limits.network));
        let decompress = Arc::new(Semaphore::new(self.limits.decompress));

        let mut extracted = futures::stream::iter(install.packages().iter().cloned().map(|package| {
            let fetcher = self.fetcher.clone();
            let staging = staging.clone();
            let cancel = self.cancel.clone();
            let network = network.clone();
            let decompress = decompress.clone();

            async move {
                let archive_path = {
                    let _permit = network
                        .acquire_owned()
                        .await
                        .expect("network semaphore never closes");

                    fetcher.fetch(&package.url, Some(&package.sha256)).await?
                };

                let _permit = decompress
                    .acquire_owned()
                    .await
                    .expect("decompress semaphore never closes");

                tokio::task::spawn_blocking(move || {
                    Extractor::new(staging, cancel).unpack(&package, &archive_path)
                })
                .await
                .map_err(|e| BuildError::Internal(format!("extraction worker died: {}", e)))?
            }
        }))
        .buffer_unordered(self.limits.network + self.limits.decompress)
        .collect::<Vec<Result<ExtractedPackage>>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        extracted.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(extracted)
    }

    /// Apply configured host-file overlays onto the staging tree.
    pub fn apply_overlays(&self, staging: &StagingTree) -> Result<()> {
        for host_file in &self.config.host_files {
            self.cancel.check()?;
            apply_host_file(staging, host_file)?;
        }

        Ok(())
    }

    /// Compose the staging tree into the configured output format.
    pub fn compose(&self, staging: &StagingTree) -> Result<Vec<u8>> {
        self.cancel.check()?;

        let options = ComposeOptions {
            reproducible: self.config.reproducible,
            source_date_epoch: None,
        };

        Composer::new(staging).compose(self.config.output_format, &options)
    }

    /// Run a full build: resolve, fetch, extract, overlay, compose.
    pub async fn build(&self, build_id: &str) -> Result<Vec<u8>> {
        let staging = Arc::new(StagingTree::new(
            self.cache().staging_dir(build_id)?,
            self.cache().clone(),
        )?);

        let result = self.build_into(&staging).await;

        if matches!(result, Err(BuildError::Cancelled)) && !self.keep_staging {
            let _ = staging.clean_disk();
        }

        result
    }

    /// Run a full build against an existing staging tree.
    ///
    /// Generators use this to seed the tree (skeletons, device nodes)
    /// before package content lands.
    pub async fn build_into(&self, staging: &Arc<StagingTree>) -> Result<Vec<u8>> {
        tracing::info!(arch = %self.config.arch, "resolving packages");
        let install = self.resolve().await?;

        tracing::info!(packages = install.len(), "fetching and unpacking");
        self.populate_staging(&install, staging).await?;

        tracing::info!(overlays = self.config.host_files.len(), "applying overlays");
        self.apply_overlays(staging)?;

        self.compose(staging)
    }
}

/// Overlay one configured host file (or directory, recursively).
fn apply_host_file(staging: &StagingTree, host_file: &HostFile) -> Result<()> {
    let destination = match &host_file.destination {
        Some(destination) => destination.clone(),
        None => host_file
            .source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                BuildError::Config(format!(
                    "host file {} has no usable name",
                    host_file.source.display()
                ))
            })?
            .to_string(),
    };

    let destination = normalize_entry_path(&destination)?
        .ok_or_else(|| BuildError::IllegalPath(destination.clone()))?;

    overlay_path(
        staging,
        &host_file.source,
        &destination,
        host_file.mode_bits()?,
        host_file.uid.unwrap_or(0),
        host_file.gid.unwrap_or(0),
    )
}

fn overlay_path(
    staging: &StagingTree,
    source: &Path,
    destination: &str,
    mode_override: Option<u32>,
    uid: u32,
    gid: u32,
) -> Result<()> {
    let metadata = std::fs::symlink_metadata(source)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mode = mode_override.unwrap_or_else(|| source_mode(&metadata));

    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(source)?.display().to_string();

        staging.insert_and_materialize(
            FileEntry {
                path: destination.to_string(),
                kind: FileKind::Symlink,
                mode: 0o777,
                uid,
                gid,
                mtime,
                size: 0,
                payload: Payload::Symlink(target),
                origin: OVERLAY_ORIGIN.to_string(),
            },
            None,
        )
    } else if metadata.is_dir() {
        staging.insert_and_materialize(
            FileEntry {
                path: destination.to_string(),
                kind: FileKind::Directory,
                mode,
                uid,
                gid,
                mtime,
                size: 0,
                payload: Payload::None,
                origin: OVERLAY_ORIGIN.to_string(),
            },
            None,
        )?;

        // Deterministic recursion order.
        let mut children: Vec<_> = std::fs::read_dir(source)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        children.sort();

        for child in children {
            let name = child
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| BuildError::IllegalPath(child.display().to_string()))?
                .to_string();

            overlay_path(
                staging,
                &child,
                &format!("{}/{}", destination, name),
                mode_override,
                uid,
                gid,
            )?;
        }

        Ok(())
    } else {
        let content = std::fs::read(source)?;
        let blob = staging.store_payload(&content)?;

        staging.insert_and_materialize(
            FileEntry {
                path: destination.to_string(),
                kind: FileKind::Regular,
                mode,
                uid,
                gid,
                mtime,
                size: content.len() as u64,
                payload: Payload::Blob(blob),
                origin: OVERLAY_ORIGIN.to_string(),
            },
            Some(&content),
        )
    }
}

#[cfg(unix)]
fn source_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn source_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
pub(crate) mod test_support {
    use {
        super::*,
        crate::{
            cache::sha256_hex,
            deb::test_support::{build_deb, TestCompression, TestEntry},
            fetch::MemoryTransport,
            repository::test_support::TestRepo,
        },
    };

    /// A repository plus archive bodies served entirely from memory.
    pub struct TestArchiveRepo {
        pub repo: TestRepo,
    }

    impl TestArchiveRepo {
        pub fn new(base: &str, suite: &str, transport: Arc<MemoryTransport>) -> Self {
            Self {
                repo: TestRepo::new(base, suite, transport),
            }
        }

        /// Build a .deb, serve it from the pool, and index it.
        pub fn add_deb(
            &mut self,
            name: &str,
            version: &str,
            extra_fields: &[(&str, &str)],
            entries: &[TestEntry],
        ) {
            let control = format!(
                "Package: {}\nVersion: {}\nArchitecture: arm64\n",
                name, version
            );

            let deb = build_deb(&control, &[], entries, TestCompression::Gzip);

            let filename = format!("pool/main/{}_{}_arm64.deb", name, version);

            let mut paragraph = format!(
                "Package: {}\nVersion: {}\nArchitecture: arm64\n",
                name, version
            );
            for (field, value) in extra_fields {
                paragraph.push_str(&format!("{}: {}\n", field, value));
            }
            paragraph.push_str(&format!(
                "Filename: {}\nSize: {}\nSHA256: {}\n",
                filename,
                deb.len(),
                sha256_hex(&deb)
            ));

            self.repo
                .transport
                .insert(format!("{}/{}", self.repo.base, filename), deb);
            self.repo.add_package("main", &paragraph);
        }

        pub fn publish(&self) {
            self.repo.publish()
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::test_support::*,
        super::*,
        crate::{
            compose::OutputFormat,
            config::CpuArch,
            deb::test_support::TestEntry,
            fetch::MemoryTransport,
            repository::TrustPolicy,
        },
    };

    fn base_config() -> ImageConfig {
        ImageConfig::from_yaml("arch: arm64\nreproducible: true").unwrap()
    }

    fn fixture(
        configure: impl FnOnce(&mut TestArchiveRepo),
    ) -> (tempfile::TempDir, ImageBuilder, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());

        let mut repo = TestArchiveRepo::new("http://repo.test", "stable", transport.clone());
        configure(&mut repo);
        repo.publish();

        let mut config = base_config();
        config.apt_repos = vec![crate::repository::RepoConfig {
            url: "http://repo.test".to_string(),
            suite: Some("stable".to_string()),
            directory: None,
            arch: None,
            components: vec!["main".to_string()],
            key: None,
            trust: TrustPolicy::UnsignedAllowed,
        }];

        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();

        let builder = ImageBuilder::with_transport(config, cache, transport.clone());

        (dir, builder, transport)
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
                mode: 0o755,
                uid: 0,
                gid: 0,
                content: b"#!/bin/sh\necho hello\n",
            },
        ]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_build_produces_tar() -> Result<()> {
        let (_dir, mut builder, _transport) = fixture(|repo| {
            repo.add_deb("hello", "2.10-2", &[("Depends", "libgreet")], &hello_entries());
            repo.add_deb(
                "libgreet",
                "1.0-1",
                &[],
                &[
                    TestEntry::Dir {
                        path: "usr/",
                        mode: 0o755,
                    },
                    TestEntry::Dir {
                        path: "usr/lib/",
                        mode: 0o755,
                    },
                    TestEntry::File {
                        path: "usr/lib/libgreet.so.1",
                        mode: 0o644,
                        uid: 0,
                        gid: 0,
                        content: b"\x7fELF-ish\n",
                    },
                ],
            );
        });

        builder.config.packages = vec!["hello".to_string()];
        assert_eq!(builder.config().arch, CpuArch::Arm64);

        let artifact = builder.build("test-build").await?;

        let mut archive = tar::Archive::new(artifact.as_slice());
        let paths: Vec<String> = archive
            .entries()?
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();

        assert!(paths.contains(&"usr/bin/hello".to_string()));
        assert!(paths.contains(&"usr/lib/libgreet.so.1".to_string()));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_builds_are_byte_identical() -> Result<()> {
        let configure = |repo: &mut TestArchiveRepo| {
            repo.add_deb("hello", "2.10-2", &[], &hello_entries());
        };

        let (_dir_a, mut builder_a, _t) = fixture(configure);
        builder_a.config.packages = vec!["hello".to_string()];

        let (_dir_b, mut builder_b, _t) = fixture(configure);
        builder_b.config.packages = vec!["hello".to_string()];

        let first = builder_a.build("build-a").await?;
        let second = builder_b.build("build-b").await?;

        assert_eq!(first, second);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlays_land_on_top() -> Result<()> {
        let (dir, mut builder, _t) = fixture(|repo| {
            repo.add_deb("hello", "2.10-2", &[], &hello_entries());
        });

        let overlay = dir.path().join("hostname");
        std::fs::write(&overlay, b"target-device\n")?;

        builder.config.packages = vec!["hello".to_string()];
        builder.config.host_files = vec![HostFile {
            source: overlay,
            destination: Some("etc/hostname".to_string()),
            mode: Some("644".to_string()),
            uid: None,
            gid: None,
        }];

        let artifact = builder.build("overlay-build").await?;

        let mut archive = tar::Archive::new(artifact.as_slice());
        let mut found = false;

        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.display().to_string() == "etc/hostname" {
                let mut content = vec![];
                std::io::Read::read_to_end(&mut entry, &mut content)?;
                assert_eq!(content, b"target-device\n");
                assert_eq!(entry.header().mode()? & 0o7777, 0o644);
                found = true;
            }
        }
        assert!(found);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_build_cleans_staging() {
        let (_dir, mut builder, _t) = fixture(|repo| {
            repo.add_deb("hello", "2.10-2", &[], &hello_entries());
        });

        builder.config.packages = vec!["hello".to_string()];
        builder.cancel_token().cancel();

        let res = builder.build("cancelled-build").await;
        assert!(matches!(res, Err(BuildError::Cancelled)));

        let staging_root = builder.cache().root().join("staging/cancelled-build");
        assert!(!staging_root.join("usr").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cpio_output_format() -> Result<()> {
        let (_dir, mut builder, _t) = fixture(|repo| {
            repo.add_deb("hello", "2.10-2", &[], &hello_entries());
        });

        builder.config.packages = vec!["hello".to_string()];
        builder.config.output_format = OutputFormat::CPIO_GZIP;

        let artifact = builder.build("cpio-build").await?;

        // Gzip magic.
        assert_eq!(&artifact[0..2], &[0x1f, 0x8b]);

        Ok(())
    }
}
