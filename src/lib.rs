// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Embedded Linux image building from Debian repositories.

This crate builds embedded Linux image artifacts — boot payloads, initial
RAM filesystems and root filesystem tarballs — from declarative
configurations, reproducibly, and without requiring root privileges.

Packages come from Debian-style APT repositories. The crate implements the
whole pipeline in pure Rust: repository index discovery and caching,
dependency resolution, package download and verification, unpacking into a
staging tree, and deterministic archive emission.

# A Tour of Functionality

Debian metadata shares one *control file* syntax; the [control] module
parses it ([control::ControlParagraph], [control::ControlParagraphReader]).
Version strings and their total order per Debian policy live in
[package_version::PackageVersion]; the dependency expression language
(`libc6 (>= 2.4) | libc6.1 [arm64]`) in [dependency::DependencyList].

A repository ([repository::Repository]) is loaded from a
[repository::RepoConfig]: its `InRelease`/`Release` file is fetched and
verified ([signature::Keyring], [release::ReleaseFile]), the `Packages`
indices located and digest-checked, and every paragraph indexed as a
[candidate::PackageCandidate]. Flat repositories without a `dists/`
hierarchy are detected and served the same way.

The [resolver::Resolver] computes a closed, deterministically ordered
[resolver::InstallSet] over prioritized repositories, with backtracking over
alternatives, virtual packages (`Provides`), conflict handling and a
topological unpack order.

Archives are fetched through the caching [fetch::Fetcher] and unpacked by
[extract::Extractor] into a [staging::StagingTree]: an in-memory
file-metadata table (the fakeroot equivalent) plus a best-effort on-disk
mirror and a content-addressed blob store ([cache::Cache]). The
[compose::Composer] turns a staged tree into a byte-reproducible tar or
cpio archive.

[builder::ImageBuilder] wires the phases together under a worker-pool
concurrency model with cancellation ([cancel::CancelToken]), and the
[generators] (boot, initrd, root) add the per-artifact policy on top.

# Reproducibility

With `reproducible: true`, output bytes are a pure function of the inputs:
entries are emitted in sorted order, mtimes clamp to `SOURCE_DATE_EPOCH`
(else zero), ownership is numeric-only, and compression wrappers avoid
volatile header fields. Two builds from the same repository snapshots
produce byte-identical artifacts.
*/

pub mod builder;
pub mod cache;
pub mod cancel;
pub mod candidate;
pub mod compose;
pub mod config;
pub mod control;
pub mod deb;
pub mod dependency;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod generators;
pub mod package_version;
pub mod release;
pub mod repository;
pub mod resolver;
pub mod signature;
pub mod staging;

pub use error::{BuildError, Result};
