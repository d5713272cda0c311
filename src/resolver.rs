// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package dependency resolution.

The [Resolver] computes a closed install set from a list of root package
references, a target architecture and a prioritized list of repositories.
The search is best-first with backtracking: each dependency requirement
commits to its first satisfiable option but records a backtrack point, so a
later contradiction (an unsatisfiable branch or a `Conflicts`/`Breaks`
violation) unwinds to the most recent open choice.

Candidate ranking is fully deterministic: repository priority ascending,
then version descending, then the lexicographically smaller filename. Two
runs over the same repository snapshots produce identical install sets,
including order.
*/

use {
    crate::{
        candidate::PackageCandidate,
        dependency::{DependencyList, SingleDependency},
        error::{BuildError, Result},
        package_version::PackageVersion,
        repository::{IndexedCandidate, Repository},
    },
    std::{
        collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
        fmt::{Display, Formatter},
        sync::Arc,
    },
    url::Url,
};

/// Diagnostic context for an unsatisfiable dependency.
///
/// Carries the root-to-leaf requirement chain and, for every candidate that
/// was considered for the failing expression, why it was rejected.
#[derive(Debug)]
pub struct UnsatisfiedChain {
    /// Package names from a requested root down to the failing requirement.
    pub chain: Vec<String>,
    /// The dependency expression that could not be satisfied.
    pub expression: String,
    /// Candidate-by-candidate rejection reasons.
    pub rejections: Vec<String>,
}

impl Display for UnsatisfiedChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: '{}'", self.chain.join(" -> "), self.expression)?;

        if self.rejections.is_empty() {
            write!(f, " (no candidates)")
        } else {
            write!(f, "; considered: {}", self.rejections.join("; "))
        }
    }
}

/// One resolved member of an install set.
#[derive(Clone, Debug)]
pub struct ResolvedPackage {
    pub candidate: Arc<PackageCandidate>,
    pub name: String,
    pub version: PackageVersion,
    pub architecture: String,
    /// Absolute URL of the package archive.
    pub url: Url,
    /// Expected SHA-256 of the archive, lowercase hex.
    pub sha256: String,
    /// Expected size of the archive in bytes.
    pub size: u64,
}

/// Result of resolution: an ordered sequence of packages.
///
/// The order is a topological unpack order: dependencies come before their
/// dependents, ties broken by package name.
#[derive(Clone, Debug, Default)]
pub struct InstallSet {
    packages: Vec<ResolvedPackage>,
}

impl InstallSet {
    /// Members in unpack order.
    pub fn packages(&self) -> &[ResolvedPackage] {
        &self.packages
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Package names in unpack order.
    pub fn names(&self) -> Vec<&str> {
        self.packages.iter().map(|p| p.name.as_str()).collect()
    }
}

/// A pending dependency requirement on the search frontier.
#[derive(Clone, Debug)]
struct Requirement {
    /// Alternative expressions (`a | b`); the first satisfiable one wins.
    variants: Vec<SingleDependency>,
    /// Root-to-here chain of package names, for diagnostics.
    chain: Vec<String>,
}

/// A package chosen into the candidate install set.
#[derive(Clone, Debug)]
struct Selection {
    indexed: IndexedCandidate,
    provides: Vec<(String, Option<PackageVersion>)>,
    conflicts: DependencyList,
    breaks: DependencyList,
    replaces: DependencyList,
    pre_depends: DependencyList,
    depends: DependencyList,
}

impl Selection {
    fn name(&self) -> &str {
        &self.indexed.name
    }

    fn version(&self) -> &PackageVersion {
        &self.indexed.version
    }

    fn architecture(&self) -> &str {
        &self.indexed.architecture
    }

    /// Whether this selection satisfies a dependency expression, either by
    /// its concrete identity or through one of its `Provides`.
    fn satisfies(&self, dep: &SingleDependency) -> bool {
        if dep.package_satisfies(self.name(), self.version(), self.architecture()) {
            return true;
        }

        self.provides
            .iter()
            .any(|(name, version)| name == &dep.package && dep.virtual_satisfies(version.as_ref()))
    }

    /// Whether this selection declares `Replaces` on a package name.
    fn replaces_name(&self, name: &str) -> bool {
        self.replaces
            .requirements()
            .any(|variants| variants.iter().any(|dep| dep.package == name))
    }
}

/// Mutable search state, snapshotted at every backtrack point.
#[derive(Clone, Debug, Default)]
struct SearchState {
    selected: BTreeMap<String, Selection>,
    frontier: VecDeque<Requirement>,
}

/// A candidate option for satisfying one requirement.
#[derive(Clone, Debug)]
struct CandidateOption {
    indexed: IndexedCandidate,
    /// Rendered expression of the variant this option satisfies.
    via_expression: String,
}

/// A recorded decision that can be revisited.
#[derive(Debug)]
struct ChoicePoint {
    state: SearchState,
    requirement: Requirement,
    options: Vec<CandidateOption>,
    next_option: usize,
}

/// Computes install sets over prioritized repositories.
pub struct Resolver<'r> {
    repos: Vec<&'r Repository>,
    architecture: String,
    pins: HashMap<String, PackageVersion>,
    include_essential: bool,
}

impl<'r> Resolver<'r> {
    /// Construct a resolver over repositories in priority order.
    pub fn new(repos: impl IntoIterator<Item = &'r Repository>, architecture: &str) -> Self {
        Self {
            repos: repos.into_iter().collect(),
            architecture: architecture.to_string(),
            pins: HashMap::new(),
            include_essential: false,
        }
    }

    /// Pin a package name to an exact version.
    pub fn pin(&mut self, name: impl ToString, version: PackageVersion) -> &mut Self {
        self.pins.insert(name.to_string(), version);
        self
    }

    /// Also install every package flagged `Essential: yes` in any repo.
    pub fn include_essential(&mut self, include: bool) -> &mut Self {
        self.include_essential = include;
        self
    }

    /// Compute a closed install set satisfying the root references.
    pub fn resolve(&self, roots: &[SingleDependency]) -> Result<InstallSet> {
        let mut state = SearchState::default();

        for root in roots {
            state.frontier.push_back(Requirement {
                variants: vec![root.clone()],
                chain: vec![root.package.clone()],
            });
        }

        if self.include_essential {
            for name in self.essential_names() {
                state.frontier.push_back(Requirement {
                    variants: vec![SingleDependency::unconstrained(&name)],
                    chain: vec![name],
                });
            }
        }

        let mut trail: Vec<ChoicePoint> = vec![];

        'search: loop {
            let requirement = match state.frontier.pop_front() {
                Some(requirement) => requirement,
                None => break,
            };

            // Already satisfied by a chosen package (concrete or virtual)?
            if requirement
                .variants
                .iter()
                .any(|dep| state.selected.values().any(|sel| sel.satisfies(dep)))
            {
                continue;
            }

            let (options, rejections) = self.enumerate_options(&requirement, &state);

            // Try options in rank order; the first that applies cleanly wins
            // and the rest stay reachable through the trail.
            let mut next_option = 0;
            loop {
                if let Some((index, applied)) =
                    self.try_options(&options, next_option, &requirement, &mut state)
                {
                    trail.push(ChoicePoint {
                        state: applied,
                        requirement: requirement.clone(),
                        options,
                        next_option: index + 1,
                    });
                    continue 'search;
                }

                // Nothing applies. Backtrack to the most recent open choice.
                match trail.pop() {
                    Some(mut point) => {
                        tracing::debug!(
                            requirement = %point.requirement.variants[0],
                            "backtracking"
                        );

                        state = point.state.clone();

                        if let Some((index, _)) = self.try_options(
                            &point.options,
                            point.next_option,
                            &point.requirement,
                            &mut state,
                        ) {
                            point.next_option = index + 1;
                            trail.push(point);
                            // The failed requirement is not re-queued: if it
                            // predates the choice point it is back in the
                            // restored frontier, and if the abandoned branch
                            // spawned it, it is correctly gone.
                            continue 'search;
                        }

                        // That choice point is exhausted; keep unwinding.
                        next_option = usize::MAX;
                        continue;
                    }
                    None => {
                        return Err(BuildError::UnsatisfiableDependency(Box::new(
                            UnsatisfiedChain {
                                chain: requirement.chain.clone(),
                                expression: requirement
                                    .variants
                                    .iter()
                                    .map(|v| v.to_string())
                                    .collect::<Vec<_>>()
                                    .join(" | "),
                                rejections,
                            },
                        )));
                    }
                }
            }
        }

        self.order_for_unpack(state)
    }

    fn essential_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();

        for repo in &self.repos {
            for indexed in repo.all_candidates() {
                if indexed.candidate.essential()
                    && (indexed.architecture == self.architecture || indexed.architecture == "all")
                {
                    names.insert(indexed.name.clone());
                }
            }
        }

        names.into_iter().collect()
    }

    /// Enumerate applicable candidates for a requirement, rank ordered.
    ///
    /// Alternatives are kept in written order; within one alternative,
    /// concrete candidates rank by (repo priority asc, version desc,
    /// filename asc) and virtual providers follow in priority order,
    /// preferring an already-chosen provider.
    fn enumerate_options(
        &self,
        requirement: &Requirement,
        state: &SearchState,
    ) -> (Vec<CandidateOption>, Vec<String>) {
        let mut options: Vec<CandidateOption> = vec![];
        let mut rejections: Vec<String> = vec![];
        let mut seen: BTreeSet<(String, String, String)> = BTreeSet::new();

        let mut push = |indexed: &IndexedCandidate, via: &SingleDependency| {
            let key = (
                indexed.name.clone(),
                indexed.version.to_string(),
                indexed.candidate.repo_id().to_string(),
            );

            if seen.insert(key) {
                options.push(CandidateOption {
                    indexed: indexed.clone(),
                    via_expression: via.to_string(),
                });
            }
        };

        for dep in &requirement.variants {
            // Concrete candidates. Repositories are already in priority
            // order and each repo sorts version-descending internally.
            let mut concrete: Vec<&IndexedCandidate> = vec![];

            for repo in &self.repos {
                for indexed in repo.get_package(&dep.package, &self.architecture, None) {
                    if let Some(pinned) = self.pins.get(&indexed.name) {
                        if &indexed.version != pinned {
                            rejections.push(format!(
                                "{}={} (pinned to {})",
                                indexed.name, indexed.version, pinned
                            ));
                            continue;
                        }
                    }

                    if !dep.package_satisfies(
                        &indexed.name,
                        &indexed.version,
                        &indexed.architecture,
                    ) && !dep.package_satisfies(
                        &indexed.name,
                        &indexed.version,
                        &self.architecture,
                    ) {
                        rejections.push(format!(
                            "{}={} (does not satisfy '{}')",
                            indexed.name, indexed.version, dep
                        ));
                        continue;
                    }

                    concrete.push(indexed);
                }
            }

            concrete.sort_by(|a, b| {
                a.candidate
                    .repo_priority()
                    .cmp(&b.candidate.repo_priority())
                    .then_with(|| b.version.cmp(&a.version))
                    .then_with(|| {
                        a.candidate
                            .field_str("Filename")
                            .cmp(&b.candidate.field_str("Filename"))
                    })
            });

            for indexed in concrete {
                push(indexed, dep);
            }

            // Virtual providers. An already-chosen provider is preferred.
            let mut providers: Vec<&IndexedCandidate> = vec![];

            for repo in &self.repos {
                for provider in repo.providers_of(&dep.package) {
                    if !dep.virtual_satisfies(provider.provided_version.as_ref()) {
                        rejections.push(format!(
                            "{} (provides {} at unsuitable version)",
                            provider.candidate, dep.package
                        ));
                        continue;
                    }

                    let arch_ok = provider
                        .candidate
                        .architecture()
                        .map(|a| a == self.architecture || a == "all")
                        .unwrap_or(false);

                    if !arch_ok {
                        continue;
                    }

                    // Map back to the indexed entry of the providing package.
                    if let Ok(name) = provider.candidate.package() {
                        for indexed in repo.get_package(name, &self.architecture, None) {
                            if Arc::ptr_eq(&indexed.candidate, &provider.candidate) {
                                providers.push(indexed);
                            }
                        }
                    }
                }
            }

            providers.sort_by(|a, b| {
                let a_chosen = state.selected.contains_key(&a.name);
                let b_chosen = state.selected.contains_key(&b.name);

                b_chosen
                    .cmp(&a_chosen)
                    .then_with(|| {
                        a.candidate
                            .repo_priority()
                            .cmp(&b.candidate.repo_priority())
                    })
                    .then_with(|| b.version.cmp(&a.version))
                    .then_with(|| a.name.cmp(&b.name))
            });

            for indexed in providers {
                push(indexed, dep);
            }
        }

        (options, rejections)
    }

    /// Try options starting at an index; apply the first that fits.
    ///
    /// Returns the applied option's index and the state snapshot taken just
    /// before applying it.
    fn try_options(
        &self,
        options: &[CandidateOption],
        from: usize,
        requirement: &Requirement,
        state: &mut SearchState,
    ) -> Option<(usize, SearchState)> {
        if from == usize::MAX {
            return None;
        }

        for (index, option) in options.iter().enumerate().skip(from) {
            let snapshot = state.clone();

            match self.apply_option(option, requirement, state) {
                Ok(()) => return Some((index, snapshot)),
                Err(reason) => {
                    tracing::debug!(
                        candidate = %option.indexed.candidate,
                        %reason,
                        "candidate rejected"
                    );
                    *state = snapshot;
                }
            }
        }

        None
    }

    /// Apply one option to the state, or explain why it cannot apply.
    fn apply_option(
        &self,
        option: &CandidateOption,
        requirement: &Requirement,
        state: &mut SearchState,
    ) -> std::result::Result<(), String> {
        let indexed = &option.indexed;

        if let Some(existing) = state.selected.get(&indexed.name) {
            if existing.version() != &indexed.version {
                return Err(format!(
                    "{} already chosen at {}",
                    indexed.name,
                    existing.version()
                ));
            }

            // Identical selection; nothing to do.
            return Ok(());
        }

        let selection = self.build_selection(indexed).map_err(|e| e.to_string())?;

        // Conflict check in both directions, honoring Replaces overrides.
        for existing in state.selected.values() {
            if let Some(conflict) = conflict_between(&selection, existing) {
                return Err(conflict);
            }
        }

        // Enqueue the new package's requirements: Pre-Depends first.
        let mut chain = requirement.chain.clone();
        if chain.last().map(|s| s.as_str()) != Some(selection.name()) {
            chain.push(selection.name().to_string());
        }

        for list in [&selection.pre_depends, &selection.depends] {
            for variants in list.requirements() {
                let mut chain = chain.clone();
                if let Some(first) = variants.first() {
                    chain.push(first.package.clone());
                }

                state.frontier.push_back(Requirement {
                    variants: variants.to_vec(),
                    chain,
                });
            }
        }

        tracing::debug!(
            package = %selection.indexed.candidate,
            via = %option.via_expression,
            "selected"
        );

        state
            .selected
            .insert(selection.name().to_string(), selection);

        Ok(())
    }

    fn build_selection(&self, indexed: &IndexedCandidate) -> Result<Selection> {
        let candidate = &indexed.candidate;

        let provides = candidate
            .provides()?
            .map(|list| {
                list.requirements()
                    .flat_map(|variants| variants.iter().cloned())
                    .map(|dep| {
                        let version = dep.constraint.map(|(_, version)| version);
                        (dep.package, version)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Selection {
            indexed: indexed.clone(),
            provides,
            conflicts: candidate.conflicts()?.unwrap_or_default(),
            breaks: candidate.breaks()?.unwrap_or_default(),
            replaces: candidate.replaces()?.unwrap_or_default(),
            pre_depends: candidate.pre_depends()?.unwrap_or_default(),
            depends: candidate.depends()?.unwrap_or_default(),
        })
    }

    /// Compute the topological unpack order over the closed set.
    ///
    /// `Pre-Depends` edges are strict: a cycle through them is fatal.
    /// `Depends` edges are best-effort: cycles break by package name order.
    fn order_for_unpack(&self, state: SearchState) -> Result<InstallSet> {
        #[derive(Clone, Copy, PartialEq)]
        enum EdgeKind {
            Hard,
            Soft,
        }

        // Edges dependency -> dependent.
        let mut incoming: BTreeMap<&str, Vec<(&str, EdgeKind)>> = BTreeMap::new();

        for name in state.selected.keys() {
            incoming.insert(name.as_str(), vec![]);
        }

        for (name, selection) in &state.selected {
            for (list, kind) in [
                (&selection.pre_depends, EdgeKind::Hard),
                (&selection.depends, EdgeKind::Soft),
            ] {
                for variants in list.requirements() {
                    // The provider actually chosen for this requirement.
                    let provider = variants.iter().find_map(|dep| {
                        state
                            .selected
                            .values()
                            .find(|sel| sel.satisfies(dep))
                            .map(|sel| sel.name())
                    });

                    if let Some(provider) = provider {
                        if provider != name.as_str() {
                            incoming
                                .get_mut(name.as_str())
                                .expect("all selected names are present")
                                .push((provider, kind));
                        }
                    }
                }
            }
        }

        let mut emitted: Vec<String> = vec![];
        let mut done: BTreeSet<&str> = BTreeSet::new();

        while done.len() < state.selected.len() {
            // Ready nodes: all incoming edges already emitted. BTreeMap
            // iteration gives the name-ordered tie break for free.
            let ready = incoming
                .iter()
                .find(|(name, edges)| {
                    !done.contains(*name)
                        && edges.iter().all(|(provider, _)| done.contains(provider))
                })
                .map(|(name, _)| *name);

            let next = match ready {
                Some(name) => name,
                None => {
                    // Cycle. Break it at the smallest-named node whose
                    // unemitted incoming edges are all soft.
                    let soft_breakable = incoming
                        .iter()
                        .find(|(name, edges)| {
                            !done.contains(*name)
                                && edges
                                    .iter()
                                    .filter(|(provider, _)| !done.contains(provider))
                                    .all(|(_, kind)| *kind == EdgeKind::Soft)
                        })
                        .map(|(name, _)| *name);

                    match soft_breakable {
                        Some(name) => {
                            tracing::warn!(package = name, "breaking Depends cycle");
                            name
                        }
                        None => {
                            // Every remaining node is held by a hard edge:
                            // a Pre-Depends cycle.
                            let mut remaining = incoming
                                .keys()
                                .filter(|name| !done.contains(**name))
                                .copied();

                            let a = remaining.next().unwrap_or("?").to_string();
                            let b = remaining.next().unwrap_or_else(|| "itself").to_string();

                            return Err(BuildError::PreDependsCycle(a, b));
                        }
                    }
                }
            };

            done.insert(next);
            emitted.push(next.to_string());
        }

        let repos_by_id: HashMap<&str, &Repository> =
            self.repos.iter().map(|r| (r.id(), *r)).collect();

        let mut packages = vec![];

        for name in emitted {
            let selection = &state.selected[&name];
            let candidate = &selection.indexed.candidate;

            let repo = repos_by_id
                .get(candidate.repo_id())
                .ok_or_else(|| BuildError::NotFound(candidate.repo_id().to_string()))?;

            packages.push(ResolvedPackage {
                candidate: candidate.clone(),
                name: selection.name().to_string(),
                version: selection.version().clone(),
                architecture: selection.architecture().to_string(),
                url: repo.package_url(candidate)?,
                sha256: candidate.sha256_hex()?,
                size: candidate.size()?,
            });
        }

        tracing::info!(packages = packages.len(), "resolution complete");

        Ok(InstallSet { packages })
    }
}

/// Check two selections for `Conflicts`/`Breaks`, honoring `Replaces`.
///
/// Returns a description of the violation, or `None` when compatible.
fn conflict_between(a: &Selection, b: &Selection) -> Option<String> {
    for (from, to) in [(a, b), (b, a)] {
        for (field, list) in [("Conflicts", &from.conflicts), ("Breaks", &from.breaks)] {
            for variants in list.requirements() {
                for dep in variants.iter() {
                    // A package may name-conflict with itself; ignored.
                    if dep.package == from.name() {
                        continue;
                    }

                    if to.satisfies(dep) {
                        // Replaces paired with Conflicts on the same name
                        // overrides the conflict.
                        if field == "Conflicts" && from.replaces_name(&dep.package) {
                            continue;
                        }

                        return Some(format!(
                            "{} {} {} which is satisfied by {}",
                            from.name(),
                            field,
                            dep,
                            to.name()
                        ));
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            fetch::MemoryTransport,
            repository::{test_support::*, Repository},
        },
    };

    /// Render a Packages paragraph with plausible archive fields filled in.
    fn pkg(name: &str, version: &str, extra: &[(&str, &str)]) -> String {
        let mut s = format!(
            "Package: {name}\nVersion: {version}\nArchitecture: arm64\n",
            name = name,
            version = version
        );

        for (field, value) in extra {
            s.push_str(&format!("{}: {}\n", field, value));
        }

        s.push_str(&format!(
            "Filename: pool/main/{}/{}_{}_arm64.deb\nSize: 1024\nSHA256: {}\n",
            name,
            name,
            version,
            crate::cache::sha256_hex(format!("{}_{}", name, version).as_bytes()),
        ));

        s
    }

    async fn repo_with(packages: &[String]) -> (tempfile::TempDir, Repository) {
        let transport = Arc::new(MemoryTransport::new());

        let mut repo = TestRepo::new("http://repo.test", "stable", transport.clone());
        for p in packages {
            repo.add_package("main", p);
        }
        repo.publish();

        let (dir, fetcher) = fetcher(transport);
        let loaded = Repository::load(&repo.config(), 0, &fetcher, "arm64")
            .await
            .unwrap();

        (dir, loaded)
    }

    async fn two_repos(
        first: &[String],
        second: &[String],
    ) -> (tempfile::TempDir, Repository, Repository) {
        let transport = Arc::new(MemoryTransport::new());

        let mut repo_a = TestRepo::new("http://a.test", "stable", transport.clone());
        for p in first {
            repo_a.add_package("main", p);
        }
        repo_a.publish();

        let mut repo_b = TestRepo::new("http://b.test", "stable", transport.clone());
        for p in second {
            repo_b.add_package("main", p);
        }
        repo_b.publish();

        let (dir, fetcher) = fetcher(transport);
        let a = Repository::load(&repo_a.config(), 0, &fetcher, "arm64")
            .await
            .unwrap();
        let b = Repository::load(&repo_b.config(), 1, &fetcher, "arm64")
            .await
            .unwrap();

        (dir, a, b)
    }

    fn root(name: &str) -> Vec<SingleDependency> {
        vec![SingleDependency::unconstrained(name)]
    }

    #[tokio::test]
    async fn simple_resolution_orders_dependency_first() {
        let (_dir, repo) = repo_with(&[
            pkg("a", "1.0", &[("Depends", "b (>= 1)")]),
            pkg("b", "1.0", &[]),
            pkg("b", "2.0", &[]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64").resolve(&root("a")).unwrap();

        assert_eq!(set.names(), vec!["b", "a"]);
        assert_eq!(set.packages()[0].version.to_string(), "2.0");
    }

    #[tokio::test]
    async fn transitive_closure() {
        let (_dir, repo) = repo_with(&[
            pkg("app", "1.0", &[("Depends", "libfoo, libbar")]),
            pkg("libfoo", "1.0", &[("Depends", "libc")]),
            pkg("libbar", "1.0", &[("Depends", "libc")]),
            pkg("libc", "2.31", &[]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64")
            .resolve(&root("app"))
            .unwrap();

        assert_eq!(set.len(), 4);
        assert_eq!(set.names(), vec!["libc", "libbar", "libfoo", "app"]);
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let (_dir, repo) = repo_with(&[
            pkg("app", "1.0", &[("Depends", "liba, libb, libc")]),
            pkg("liba", "1.0", &[]),
            pkg("libb", "1.0", &[]),
            pkg("libc", "1.0", &[]),
        ])
        .await;

        let resolver = Resolver::new([&repo], "arm64");
        let first = resolver.resolve(&root("app")).unwrap();
        let second = resolver.resolve(&root("app")).unwrap();

        let render = |set: &InstallSet| {
            set.iter()
                .map(|p| format!("{} {} {} {}", p.name, p.version, p.url, p.sha256))
                .collect::<Vec<_>>()
        };

        assert_eq!(render(&first), render(&second));
    }

    #[tokio::test]
    async fn version_constraint_filters_candidates() {
        let (_dir, repo) = repo_with(&[
            pkg("a", "1.0", &[("Depends", "b (<< 2.0)")]),
            pkg("b", "1.5", &[]),
            pkg("b", "2.0", &[]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64").resolve(&root("a")).unwrap();

        assert_eq!(set.packages()[0].name, "b");
        assert_eq!(set.packages()[0].version.to_string(), "1.5");
    }

    #[tokio::test]
    async fn alternatives_commit_to_first_satisfiable() {
        let (_dir, repo) = repo_with(&[
            pkg("a", "1.0", &[("Depends", "missing | fallback")]),
            pkg("fallback", "1.0", &[]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64").resolve(&root("a")).unwrap();

        assert_eq!(set.names(), vec!["fallback", "a"]);
    }

    #[tokio::test]
    async fn virtual_dependency_repo_order_tie_break() {
        // postfix in the first repo, exim4 in the second; both provide
        // mail-transport-agent. Repo order decides.
        let (_dir, repo_a, repo_b) = two_repos(
            &[pkg("postfix", "3.5", &[("Provides", "mail-transport-agent")])],
            &[
                pkg("exim4", "4.94", &[("Provides", "mail-transport-agent")]),
                pkg("depends-on-mta", "1.0", &[("Depends", "mail-transport-agent")]),
            ],
        )
        .await;

        let set = Resolver::new([&repo_a, &repo_b], "arm64")
            .resolve(&root("depends-on-mta"))
            .unwrap();

        assert_eq!(set.names(), vec!["postfix", "depends-on-mta"]);
    }

    #[tokio::test]
    async fn already_chosen_provider_is_preferred() {
        let (_dir, repo) = repo_with(&[
            pkg("exim4", "4.94", &[("Provides", "mail-transport-agent")]),
            pkg("postfix", "3.5", &[("Provides", "mail-transport-agent")]),
            pkg("app", "1.0", &[("Depends", "exim4, mail-transport-agent")]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64")
            .resolve(&root("app"))
            .unwrap();

        // exim4 was already selected for the first requirement, so the
        // virtual dependency does not pull in postfix.
        assert_eq!(set.names(), vec!["exim4", "app"]);
    }

    #[tokio::test]
    async fn conflicts_trigger_backtracking_to_alternative() {
        let (_dir, repo) = repo_with(&[
            pkg("app", "1.0", &[("Depends", "impl-a | impl-b")]),
            pkg("impl-a", "1.0", &[("Conflicts", "base")]),
            pkg("impl-b", "1.0", &[]),
            pkg("base", "1.0", &[]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64")
            .resolve(&[
                SingleDependency::unconstrained("base"),
                SingleDependency::unconstrained("app"),
            ])
            .unwrap();

        assert!(set.names().contains(&"impl-b"));
        assert!(!set.names().contains(&"impl-a"));
    }

    #[tokio::test]
    async fn replaces_overrides_conflict() {
        let (_dir, repo) = repo_with(&[
            pkg("legacy", "1.0", &[]),
            pkg(
                "modern",
                "2.0",
                &[("Conflicts", "legacy"), ("Replaces", "legacy")],
            ),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64")
            .resolve(&[
                SingleDependency::unconstrained("legacy"),
                SingleDependency::unconstrained("modern"),
            ])
            .unwrap();

        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn unsatisfiable_reports_chain() {
        let (_dir, repo) = repo_with(&[
            pkg("a", "1.0", &[("Depends", "b")]),
            pkg("b", "1.0", &[("Depends", "c (>= 9)")]),
            pkg("c", "1.0", &[]),
        ])
        .await;

        let err = Resolver::new([&repo], "arm64")
            .resolve(&root("a"))
            .unwrap_err();

        match err {
            BuildError::UnsatisfiableDependency(chain) => {
                assert_eq!(chain.chain, vec!["a", "b", "c"]);
                assert!(chain.expression.contains("c (>= 9)"));
                assert!(chain
                    .rejections
                    .iter()
                    .any(|r| r.contains("c=1.0")));
            }
            other => panic!("expected UnsatisfiableDependency, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn depends_cycle_breaks_by_name() {
        let (_dir, repo) = repo_with(&[
            pkg("x", "1.0", &[("Depends", "y")]),
            pkg("y", "1.0", &[("Depends", "x")]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64").resolve(&root("x")).unwrap();

        // Cycle broken at the lexicographically smaller name.
        assert_eq!(set.names(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn pre_depends_cycle_is_fatal() {
        let (_dir, repo) = repo_with(&[
            pkg("x", "1.0", &[("Pre-Depends", "y")]),
            pkg("y", "1.0", &[("Pre-Depends", "x")]),
        ])
        .await;

        let err = Resolver::new([&repo], "arm64")
            .resolve(&root("x"))
            .unwrap_err();

        assert!(matches!(err, BuildError::PreDependsCycle(_, _)));
    }

    #[tokio::test]
    async fn pre_depends_orders_strictly() {
        let (_dir, repo) = repo_with(&[
            pkg("zz-setup", "1.0", &[]),
            pkg("aa-app", "1.0", &[("Pre-Depends", "zz-setup")]),
        ])
        .await;

        let set = Resolver::new([&repo], "arm64")
            .resolve(&root("aa-app"))
            .unwrap();

        // Despite the name tie-break favoring aa-app, the Pre-Depends edge
        // forces zz-setup first.
        assert_eq!(set.names(), vec!["zz-setup", "aa-app"]);
    }

    #[tokio::test]
    async fn version_pin_is_honored() {
        let (_dir, repo) = repo_with(&[
            pkg("b", "1.0", &[]),
            pkg("b", "2.0", &[]),
            pkg("a", "1.0", &[("Depends", "b")]),
        ])
        .await;

        let mut resolver = Resolver::new([&repo], "arm64");
        resolver.pin("b", PackageVersion::parse("1.0").unwrap());

        let set = resolver.resolve(&root("a")).unwrap();

        assert_eq!(set.packages()[0].version.to_string(), "1.0");
    }

    #[tokio::test]
    async fn essential_packages_are_seeded() {
        let (_dir, repo) = repo_with(&[
            pkg("dash", "0.5", &[("Essential", "yes")]),
            pkg("app", "1.0", &[]),
        ])
        .await;

        let mut resolver = Resolver::new([&repo], "arm64");
        resolver.include_essential(true);

        let set = resolver.resolve(&root("app")).unwrap();

        assert!(set.names().contains(&"dash"));
    }

    #[tokio::test]
    async fn repo_priority_beats_version() {
        // Same package in both repos; the earlier repo wins even at a lower
        // version, per the deterministic tie-break rules.
        let (_dir, repo_a, repo_b) = two_repos(
            &[pkg("tool", "1.0", &[])],
            &[pkg("tool", "2.0", &[])],
        )
        .await;

        let set = Resolver::new([&repo_a, &repo_b], "arm64")
            .resolve(&root("tool"))
            .unwrap();

        assert_eq!(set.packages()[0].version.to_string(), "1.0");
        assert_eq!(
            set.packages()[0].candidate.repo_id(),
            "http://a.test_stable_main"
        );
    }

    #[tokio::test]
    async fn backtracking_discards_requirements_of_abandoned_branch() {
        let (_dir, repo) = repo_with(&[
            pkg("a", "1.0", &[("Depends", "withghost | clean")]),
            pkg("withghost", "1.0", &[("Depends", "ghost")]),
            pkg("clean", "1.0", &[]),
        ])
        .await;

        // withghost is tried first, its "ghost" dependency fails, and the
        // search must unwind to the clean alternative without dragging the
        // ghost requirement along.
        let set = Resolver::new([&repo], "arm64").resolve(&root("a")).unwrap();

        assert_eq!(set.names(), vec!["clean", "a"]);
    }

    #[tokio::test]
    async fn not_found_on_alternative_branch_is_absorbed() {
        let (_dir, repo) = repo_with(&[
            pkg("a", "1.0", &[("Depends", "ghost | real")]),
            pkg("real", "1.0", &[]),
        ])
        .await;

        // "ghost" exists nowhere; the resolver absorbs it and takes "real".
        let set = Resolver::new([&repo], "arm64").resolve(&root("a")).unwrap();
        assert!(set.names().contains(&"real"));
    }
}
