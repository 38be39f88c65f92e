//! The workspace orchestrator.
//!
//! Composes the canonicalizer, the pin and state stores, the precompute
//! engine, the lifecycle machine, and the artifact manager with the
//! external manifest loader and solver, and exposes the operational
//! commands other layers call: resolve, update, edit, unedit, reset,
//! clean, and pin.

use crate::artifact::{ArtifactFailure, ArtifactManager, ArtifactRequest, ArtifactTransport};
use crate::delegate::{NullDelegate, WorkspaceDelegate};
use crate::diagnostics::{Diagnostic, DiagnosticBag};
use crate::fsutil::remove_dir_if_exists;
use crate::identity::{CanonicalLocation, IdentityError, PackageIdentity, PackageLocation};
use crate::lifecycle::{Lifecycle, LifecycleDirs, MaterializeTarget, TransitionError};
use crate::manifest::{DependencyDeclaration, ManifestError, ManifestLoader, RootManifest};
use crate::pins::{Pin, PinError, PinStore, PIN_FILE};
use crate::precompute::{precompute, Decision, Reason};
use crate::requirement::{Requirement, RequirementKind};
use crate::solve::{Binding, BoundState, Constraint, DependencySolver, SolveError};
use crate::state::{DependencyState, StateError, WorkspaceState, STATE_FILE};
use crate::vcs::{CheckoutTarget, RegistryDownloader, SourceControlProvider, VcsError};
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use thiserror::Error;

/// Whether the engine may run the solver on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    /// Resolve whenever precompute says it is needed.
    #[default]
    Automatic,

    /// Never resolve automatically; report a stale or missing pin file
    /// instead.
    Disallowed,
}

/// How to treat two locations that share an identity without being
/// canonically equal.
///
/// The transitive-warning behavior is a backward-compatibility carve-out;
/// escalating it everywhere is the intended future default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateLocationPolicy {
    /// Error for root declarations, warning for transitive ones.
    #[default]
    WarnTransitive,

    /// Error everywhere.
    Error,
}

/// Workspace configuration.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// The workspace root directory (pin file lives here).
    pub root_dir: PathBuf,

    /// Root manifest locations, in declaration order.
    pub roots: Vec<PackageLocation>,

    /// Scratch directory holding checkouts, artifacts, and the state
    /// file.
    pub scratch_dir: PathBuf,

    /// Bound on concurrent downloads, extractions, and fetches.
    pub concurrency: usize,

    pub duplicate_policy: DuplicateLocationPolicy,

    pub resolution: ResolutionMode,
}

impl WorkspaceConfig {
    /// Conventional configuration for a workspace rooted at `root_dir`:
    /// one root manifest at the root, scratch under `.anchorage/`.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        Self {
            roots: vec![PackageLocation::path(&root_dir)],
            scratch_dir: root_dir.join(".anchorage"),
            root_dir,
            concurrency: 8,
            duplicate_policy: DuplicateLocationPolicy::default(),
            resolution: ResolutionMode::default(),
        }
    }

    /// Path of the pin file.
    #[must_use]
    pub fn pin_path(&self) -> PathBuf {
        self.root_dir.join(PIN_FILE)
    }

    /// Path of the workspace state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.scratch_dir.join(STATE_FILE)
    }

    /// Directory holding committed binary artifacts.
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.scratch_dir.join("artifacts")
    }

    /// Build scratch, wiped by `clean`.
    #[must_use]
    pub fn build_dir(&self) -> PathBuf {
        self.scratch_dir.join("build")
    }
}

/// Errors surfaced by workspace operations.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Pins(#[from] PinError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "conflicting explicit name for package '{identity}': declared as '{first}' and '{second}'"
    )]
    ConflictingName {
        identity: PackageIdentity,
        first: String,
        second: String,
    },

    #[error(
        "packages '{first}' and '{second}' resolve to the same identity '{identity}' from \
         different locations"
    )]
    DuplicateIdentity {
        identity: PackageIdentity,
        first: String,
        second: String,
    },

    #[error(
        "automatic resolution is disallowed and the pin file {}; resolution required: {reason}",
        pin_file_state(.pin_file_missing)
    )]
    ResolutionRequired {
        pin_file_missing: bool,
        reason: Reason,
    },

    #[error("{}", describe_artifact_failures(.0))]
    ArtifactFailures(Vec<ArtifactFailure>),

    #[error("no package named '{0}' in the dependency graph")]
    UnknownPackage(PackageIdentity),

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

fn pin_file_state(missing: &bool) -> &'static str {
    if *missing {
        "is missing"
    } else {
        "is out of date"
    }
}

fn describe_artifact_failures(failures: &[ArtifactFailure]) -> String {
    let details = failures
        .iter()
        .map(|f| format!("  {}/{}: {}", f.identity, f.target_name, f.error))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{} artifact target(s) failed:\n{details}", failures.len())
}

/// One package in the resolved graph.
#[derive(Debug, Clone)]
pub struct GraphPackage {
    pub identity: PackageIdentity,
    pub location: PackageLocation,
    pub state: DependencyState,
}

/// The result of a reconciliation pass.
#[derive(Debug)]
pub struct ResolveOutcome {
    /// What precompute decided.
    pub decision: Decision,

    /// Managed packages in the graph, ordered by identity.
    pub packages: Vec<GraphPackage>,

    /// Diagnostics in deterministic (declaration) order.
    pub diagnostics: Vec<Diagnostic>,
}

/// Everything collected from the declared dependency graph.
struct CollectedGraph {
    constraints: Vec<Constraint>,
    artifact_requests: Vec<ArtifactRequest>,
    tools_versions: Vec<crate::manifest::ToolsVersion>,
    diagnostics: DiagnosticBag,
}

/// The workspace: configuration plus the external collaborators.
pub struct Workspace<'a> {
    config: WorkspaceConfig,
    loader: &'a dyn ManifestLoader,
    provider: &'a dyn SourceControlProvider,
    registry: Option<&'a dyn RegistryDownloader>,
    transport: &'a dyn ArtifactTransport,
    solver: &'a dyn DependencySolver,
    delegate: &'a dyn WorkspaceDelegate,
    pool: rayon::ThreadPool,
    dirs: LifecycleDirs,
}

impl<'a> Workspace<'a> {
    /// Create a workspace over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool cannot be built.
    pub fn new(
        config: WorkspaceConfig,
        loader: &'a dyn ManifestLoader,
        provider: &'a dyn SourceControlProvider,
        transport: &'a dyn ArtifactTransport,
        solver: &'a dyn DependencySolver,
    ) -> Result<Self, WorkspaceError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.concurrency.max(1))
            .build()
            .map_err(|e| WorkspaceError::Pool(e.to_string()))?;
        let dirs = LifecycleDirs::new(&config.scratch_dir, &config.root_dir);
        Ok(Self {
            config,
            loader,
            provider,
            registry: None,
            transport,
            solver,
            delegate: &NullDelegate,
            pool,
            dirs,
        })
    }

    /// Attach a delegate for progress events.
    #[must_use]
    pub fn with_delegate(mut self, delegate: &'a dyn WorkspaceDelegate) -> Self {
        self.delegate = delegate;
        self
    }

    /// Attach a registry downloader.
    #[must_use]
    pub fn with_registry(mut self, registry: &'a dyn RegistryDownloader) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Reconcile the declared graph against pins and on-disk state,
    /// resolving first if precompute says it is needed.
    ///
    /// # Errors
    ///
    /// Returns an error on declaration conflicts, solver failures, side
    /// effect failures, or (in disallowed-resolution mode) a stale or
    /// missing pin file.
    pub fn resolve_graph(&self) -> Result<ResolveOutcome, WorkspaceError> {
        let pins = PinStore::load(&self.config.pin_path())?;
        let pin_file_missing = pins.is_none();
        self.run_pass(pins.unwrap_or_default(), pin_file_missing, false, None)
    }

    /// Re-resolve, dropping the pins for `packages` (or all pins when
    /// `packages` is empty) so the solver is free to move them.
    ///
    /// # Errors
    ///
    /// Returns an error if a named package is not pinned, or the pass
    /// fails.
    pub fn update(&self, packages: &[&str]) -> Result<ResolveOutcome, WorkspaceError> {
        let mut pins = PinStore::load(&self.config.pin_path())?.unwrap_or_default();
        if packages.is_empty() {
            pins = PinStore::new();
        } else {
            for package in packages {
                let identity = PackageIdentity::from_location(package)?;
                if pins.remove(&identity).is_none() {
                    return Err(WorkspaceError::UnknownPackage(identity));
                }
            }
        }
        self.run_pass(pins, false, true, None)
    }

    /// Resolve one package to an exact version, keeping everything else
    /// as close to the current pins as the solver allows.
    ///
    /// # Errors
    ///
    /// Fails for unknown packages and for local dependencies, which can
    /// never be resolved to a version.
    pub fn resolve_to_pin(
        &self,
        package: &str,
        version: &Version,
    ) -> Result<ResolveOutcome, WorkspaceError> {
        let identity = PackageIdentity::from_location(package)?;
        let pins = PinStore::load(&self.config.pin_path())?.unwrap_or_default();
        self.run_pass(
            pins,
            false,
            true,
            Some((identity, version.clone())),
        )
    }

    /// Put a dependency into edit mode and persist the transition.
    ///
    /// # Errors
    ///
    /// Propagates state-transition errors (`AlreadyEdited`,
    /// `RevisionNotFound`, `CannotEditLocal`, unknown package).
    pub fn edit(
        &self,
        package: &str,
        path: Option<PathBuf>,
        target: Option<CheckoutTarget>,
    ) -> Result<PathBuf, WorkspaceError> {
        let identity = PackageIdentity::from_location(package)?;
        let mut state = WorkspaceState::load(&self.config.state_path())?;
        let mut lifecycle = Lifecycle::new(
            &mut state,
            self.provider,
            self.registry,
            &self.dirs,
            self.delegate,
        );
        let edit_path = lifecycle.edit(&identity, path, target)?;
        state.save(&self.config.state_path())?;
        Ok(edit_path)
    }

    /// Take a dependency out of edit mode, restoring its previous state,
    /// and persist the transition.
    ///
    /// # Errors
    ///
    /// Propagates state-transition errors (`NotEdited`, unknown package).
    pub fn unedit(&self, package: &str) -> Result<Vec<Diagnostic>, WorkspaceError> {
        let identity = PackageIdentity::from_location(package)?;
        let mut state = WorkspaceState::load(&self.config.state_path())?;
        let mut diagnostics = DiagnosticBag::new();
        let mut lifecycle = Lifecycle::new(
            &mut state,
            self.provider,
            self.registry,
            &self.dirs,
            self.delegate,
        );
        lifecycle.unedit(&identity, &mut diagnostics)?;
        state.save(&self.config.state_path())?;
        Ok(diagnostics.into_vec())
    }

    /// Wipe managed state and artifacts: checkouts, registry downloads,
    /// committed artifacts, and the state file. The pin file and edited
    /// working copies are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be removed.
    pub fn reset(&self) -> Result<(), WorkspaceError> {
        remove_dir_if_exists(&self.dirs.checkouts)?;
        remove_dir_if_exists(&self.dirs.registry)?;
        remove_dir_if_exists(&self.config.artifacts_dir())?;
        match std::fs::remove_file(self.config.state_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Wipe the build scratch only.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn clean(&self) -> Result<(), WorkspaceError> {
        remove_dir_if_exists(&self.config.build_dir())?;
        Ok(())
    }

    fn run_pass(
        &self,
        mut pins: PinStore,
        pin_file_missing: bool,
        force_resolution_allowed: bool,
        pin_override: Option<(PackageIdentity, Version)>,
    ) -> Result<ResolveOutcome, WorkspaceError> {
        let CollectedGraph {
            mut constraints,
            artifact_requests,
            tools_versions,
            diagnostics: graph_diagnostics,
        } = self.collect_graph()?;
        let mut diagnostics = DiagnosticBag::new();
        diagnostics.absorb(graph_diagnostics);

        if let Some((identity, version)) = &pin_override {
            let constraint = constraints
                .iter_mut()
                .find(|c| &c.identity == identity)
                .ok_or_else(|| WorkspaceError::UnknownPackage(identity.clone()))?;
            if constraint.requirement.kind() == RequirementKind::Local {
                return Err(TransitionError::CannotResolveLocal(identity.clone()).into());
            }
            constraint.requirement = Requirement::Exact {
                version: version.clone(),
            };
            pins.remove(identity);
        }

        let mut state = WorkspaceState::load(&self.config.state_path())?;

        // Heal records whose on-disk side vanished before diffing
        // against them.
        self.lifecycle(&mut state).heal(&mut diagnostics)?;

        let decision = precompute(&constraints, &pins, &state);

        let targets: Vec<(PackageIdentity, PackageLocation, MaterializeTarget)> =
            match &decision {
                Decision::Required(reason) => {
                    if self.config.resolution == ResolutionMode::Disallowed
                        && !force_resolution_allowed
                    {
                        return Err(WorkspaceError::ResolutionRequired {
                            pin_file_missing,
                            reason: reason.clone(),
                        });
                    }
                    self.delegate.will_resolve(reason);
                    let bindings = self.solver.solve(&constraints, &pins)?;
                    bindings
                        .into_iter()
                        .map(|b| {
                            let target = bound_target(&b);
                            (b.identity, b.location, target)
                        })
                        .collect()
                }
                // NotRequired means every constraint is pinned; the pins
                // are the targets.
                Decision::NotRequired => constraints
                    .iter()
                    .filter_map(|c| {
                        pins.get(&c.identity).map(|pin| {
                            (
                                c.identity.clone(),
                                c.location.clone(),
                                MaterializeTarget::from(&pin.state),
                            )
                        })
                    })
                    .collect(),
            };

        self.prefetch(&targets, &state)?;

        for (identity, location, target) in &targets {
            match target {
                MaterializeTarget::Version { version, .. }
                    if matches!(location, PackageLocation::Registry { .. }) =>
                {
                    self.lifecycle(&mut state)
                        .materialize_registry(identity, location, version)?;
                }
                _ => {
                    self.lifecycle(&mut state).materialize(
                        identity,
                        location,
                        target,
                        &mut diagnostics,
                    )?;
                }
            }
        }

        // Dependencies that fell out of the graph.
        let live: BTreeSet<PackageIdentity> =
            targets.iter().map(|(id, _, _)| id.clone()).collect();
        self.lifecycle(&mut state).prune(&live, &mut diagnostics)?;

        // Binary artifacts, bounded by the same pool.
        let artifacts_dir = self.config.artifacts_dir();
        let manager =
            ArtifactManager::new(&artifacts_dir, self.transport, self.delegate, &self.pool);
        let failures = manager.reconcile(&artifact_requests, &mut state);

        // The state file is committed even on partial failure (the write
        // is atomic and completed artifacts stay durable); the pin file
        // only records fully successful passes.
        state.save(&self.config.state_path())?;

        if !failures.is_empty() {
            return Err(WorkspaceError::ArtifactFailures(failures));
        }

        let new_pins = self.pins_from_state(&constraints, &state, &tools_versions);
        new_pins.save(&self.config.pin_path())?;

        let packages = state
            .dependencies()
            .map(|m| GraphPackage {
                identity: m.identity.clone(),
                location: m.location.clone(),
                state: m.state.clone(),
            })
            .collect();

        Ok(ResolveOutcome {
            decision,
            packages,
            diagnostics: diagnostics.into_vec(),
        })
    }

    fn lifecycle<'s>(&'s self, state: &'s mut WorkspaceState) -> Lifecycle<'s> {
        Lifecycle::new(
            state,
            self.provider,
            self.registry,
            &self.dirs,
            self.delegate,
        )
    }

    /// Clone absent working copies in parallel, bounded by the pool.
    /// Transitions themselves stay serial; only the network-bound fetch
    /// is parallelized.
    fn prefetch(
        &self,
        targets: &[(PackageIdentity, PackageLocation, MaterializeTarget)],
        state: &WorkspaceState,
    ) -> Result<(), WorkspaceError> {
        use rayon::prelude::*;

        let to_fetch: Vec<(&PackageIdentity, &PackageLocation)> = targets
            .iter()
            .filter(|(identity, location, target)| {
                !matches!(target, MaterializeTarget::Local)
                    && !matches!(location, PackageLocation::Registry { .. })
                    && !state
                        .dependency(identity)
                        .map_or(false, |m| m.state.is_edited())
                    && !self
                        .provider
                        .is_working_copy(&self.dirs.checkouts.join(identity.as_str()))
            })
            .map(|(identity, location, _)| (identity, location))
            .collect();

        let results: Vec<Result<(), VcsError>> = self.pool.install(|| {
            to_fetch
                .par_iter()
                .map(|(identity, location)| {
                    self.delegate.fetching(identity, location);
                    let destination = self.dirs.checkouts.join(identity.as_str());
                    remove_dir_if_exists(&destination)?;
                    self.provider.fetch(location, &destination)
                })
                .collect()
        });

        // Joined in declaration order; the first failure wins.
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Walk the declared graph breadth-first, collecting constraints in
    /// declaration order, artifact requests, and conflict diagnostics.
    fn collect_graph(&self) -> Result<CollectedGraph, WorkspaceError> {
        let mut diagnostics = DiagnosticBag::new();
        let mut constraints = Vec::new();
        let mut artifact_requests = Vec::new();
        let mut tools_versions = Vec::new();

        // identity -> (explicit name, location, canonical, declared at root)
        let mut seen: BTreeMap<PackageIdentity, SeenDeclaration> = BTreeMap::new();

        let mut roots = Vec::new();
        let mut root_identities = BTreeSet::new();
        for location in &self.config.roots {
            let manifest = self.loader.load(location, None)?;
            root_identities.insert(manifest.identity()?);
            tools_versions.push(manifest.tools_version);
            roots.push(manifest);
        }

        let mut queue: VecDeque<(RootManifest, bool)> =
            roots.into_iter().map(|m| (m, true)).collect();

        while let Some((manifest, at_root)) = queue.pop_front() {
            let owner = manifest.identity()?;
            for target in &manifest.targets {
                if let Some(spec) = &target.artifact {
                    artifact_requests.push(ArtifactRequest {
                        identity: owner.clone(),
                        target_name: target.name.clone(),
                        spec: spec.clone(),
                    });
                }
            }

            for declaration in &manifest.dependencies {
                let identity = declaration.identity()?;

                // Root packages shadow dependencies that share their
                // identity: the edge is elided entirely.
                if root_identities.contains(&identity) {
                    continue;
                }

                if let Some(previous) = seen.get(&identity) {
                    self.check_duplicate(
                        &identity,
                        previous,
                        declaration,
                        at_root,
                        &mut diagnostics,
                    )?;
                    continue;
                }
                seen.insert(
                    identity.clone(),
                    SeenDeclaration {
                        explicit_name: declaration.explicit_name.clone(),
                        original: declaration.location.original(),
                        canonical: declaration.location.canonical(),
                        at_root,
                    },
                );

                constraints.push(Constraint {
                    identity: identity.clone(),
                    location: declaration.location.clone(),
                    requirement: declaration.requirement.clone(),
                });

                // Descend into the dependency's own manifest when the
                // loader knows it; a leaf without one contributes no
                // transitive edges.
                match self
                    .loader
                    .load(&declaration.location, Some(&declaration.requirement))
                {
                    Ok(sub) => queue.push_back((sub, false)),
                    Err(ManifestError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(CollectedGraph {
            constraints,
            artifact_requests,
            tools_versions,
            diagnostics,
        })
    }

    fn check_duplicate(
        &self,
        identity: &PackageIdentity,
        previous: &SeenDeclaration,
        declaration: &DependencyDeclaration,
        at_root: bool,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<(), WorkspaceError> {
        // Same identity under two different explicit names is always a
        // hard error: the user named the same package twice.
        if let (Some(first), Some(second)) =
            (&previous.explicit_name, &declaration.explicit_name)
        {
            if first != second {
                return Err(WorkspaceError::ConflictingName {
                    identity: identity.clone(),
                    first: first.clone(),
                    second: second.clone(),
                });
            }
        }

        let original = declaration.location.original();
        if previous.canonical == declaration.location.canonical() {
            if previous.original != original {
                // Spelling variants of one location collapse to a single
                // entry; worth telling the user, not failing them.
                diagnostics.emit(
                    Diagnostic::info(format!(
                        "'{}' and '{}' are canonically identical and are treated as the same \
                         package",
                        previous.original, original
                    ))
                    .with_identity(identity.clone())
                    .with_location(original),
                );
            }
            return Ok(());
        }

        // Same identity from genuinely different locations.
        let escalate = self.config.duplicate_policy == DuplicateLocationPolicy::Error
            || at_root
            || previous.at_root;
        if escalate {
            return Err(WorkspaceError::DuplicateIdentity {
                identity: identity.clone(),
                first: previous.original.clone(),
                second: original,
            });
        }
        diagnostics.emit(
            Diagnostic::warning(format!(
                "transitive dependencies '{}' and '{}' share the identity '{identity}'; this \
                 will become an error in a future release",
                previous.original, original
            ))
            .with_identity(identity.clone())
            .with_location(original),
        );
        Ok(())
    }

    /// Build the pin set from the managed state after a successful pass.
    /// Edited dependencies pin their based-on snapshot; the schema
    /// version follows the minimum root tools-version.
    fn pins_from_state(
        &self,
        constraints: &[Constraint],
        state: &WorkspaceState,
        tools_versions: &[crate::manifest::ToolsVersion],
    ) -> PinStore {
        let mut pins = PinStore::new();
        pins.set_schema_version(PinStore::schema_for_tools(tools_versions.iter()));
        for constraint in constraints {
            let Some(managed) = state.dependency(&constraint.identity) else {
                continue;
            };
            let Some(pin_state) = managed.state.pin_state() else {
                continue;
            };
            pins.insert(Pin {
                identity: constraint.identity.clone(),
                location: constraint.location.original(),
                state: pin_state,
            });
        }
        pins
    }
}

struct SeenDeclaration {
    explicit_name: Option<String>,
    original: String,
    canonical: CanonicalLocation,
    at_root: bool,
}

/// The materialization target for a solver binding. Revisions are
/// unknown until checkout.
fn bound_target(binding: &Binding) -> MaterializeTarget {
    match &binding.bound {
        BoundState::Version(version) => MaterializeTarget::Version {
            version: version.clone(),
            revision: None,
        },
        BoundState::Branch { name } => MaterializeTarget::Branch {
            name: name.clone(),
            revision: None,
        },
        BoundState::Revision { revision } => MaterializeTarget::Revision {
            revision: revision.clone(),
        },
        BoundState::Local => MaterializeTarget::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::checksum_of;
    use crate::manifest::{ArtifactSpec, ProductFilter, TargetDeclaration, ToolsVersion};
    use crate::pins::PinState;
    use crate::testutil::{
        zip_archive, FakeLoader, FakeProvider, FakeTransport, RecordingDelegate, StubSolver,
    };
    use tempfile::TempDir;

    fn identity(s: &str) -> PackageIdentity {
        PackageIdentity::from_location(s).unwrap()
    }

    fn dep(url: &str, requirement: Requirement) -> DependencyDeclaration {
        DependencyDeclaration {
            explicit_name: None,
            location: if url.contains("://") {
                PackageLocation::remote(url)
            } else {
                PackageLocation::path(url)
            },
            requirement,
            product_filter: ProductFilter::Everything,
        }
    }

    fn manifest(
        location: PackageLocation,
        name: &str,
        dependencies: Vec<DependencyDeclaration>,
    ) -> RootManifest {
        RootManifest {
            name: name.to_string(),
            location,
            tools_version: ToolsVersion::V2,
            dependencies,
            targets: Vec::new(),
            products: Vec::new(),
        }
    }

    struct Fixture {
        tmp: TempDir,
        config: WorkspaceConfig,
        loader: FakeLoader,
        provider: FakeProvider,
        transport: FakeTransport,
        solver: StubSolver,
        delegate: RecordingDelegate,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let mut config = WorkspaceConfig::new(tmp.path());
            config.concurrency = 2;
            Self {
                tmp,
                config,
                loader: FakeLoader::new(),
                provider: FakeProvider::new(),
                transport: FakeTransport::new(),
                solver: StubSolver::new(),
                delegate: RecordingDelegate::default(),
            }
        }

        fn root_location(&self) -> PackageLocation {
            self.config.roots[0].clone()
        }

        fn root_identity(&self) -> PackageIdentity {
            self.root_location().identity().unwrap()
        }

        fn set_root_dependencies(&self, dependencies: Vec<DependencyDeclaration>) {
            self.loader
                .add(manifest(self.root_location(), "root", dependencies));
        }

        fn workspace(&self) -> Workspace<'_> {
            Workspace::new(
                self.config.clone(),
                &self.loader,
                &self.provider,
                &self.transport,
                &self.solver,
            )
            .unwrap()
            .with_delegate(&self.delegate)
        }

        fn managed_version(&self, name: &str) -> Option<Version> {
            let state = WorkspaceState::load(&self.config.state_path()).unwrap();
            state
                .dependency(&identity(name))
                .and_then(|m| m.state.version().cloned())
        }
    }

    fn widget_fixture(requirement: &str) -> Fixture {
        let fx = Fixture::new();
        fx.provider.add_tag("widget", "1.0.0", "rev-10");
        fx.provider.add_tag("widget", "1.5.0", "rev-15");
        fx.solver.add_versions("widget", &["1.0.0", "1.5.0"]);
        fx.set_root_dependencies(vec![dep(
            "https://github.com/acme/widget.git",
            Requirement::range(requirement).unwrap(),
        )]);
        fx
    }

    #[test]
    fn resolve_materializes_and_pins() {
        let fx = widget_fixture("~1.0.0");
        let outcome = fx.workspace().resolve_graph().unwrap();

        assert!(matches!(outcome.decision, Decision::Required(_)));
        assert_eq!(
            fx.managed_version("widget"),
            Some(Version::parse("1.0.0").unwrap())
        );

        let pins = PinStore::load(&fx.config.pin_path()).unwrap().unwrap();
        let pin = pins.get(&identity("widget")).unwrap();
        assert_eq!(pin.location, "https://github.com/acme/widget.git");
        assert_eq!(
            pin.state,
            PinState::Version {
                version: Version::parse("1.0.0").unwrap(),
                revision: Some("rev-10".into()),
            }
        );
    }

    #[test]
    fn second_resolve_is_idempotent() {
        let fx = widget_fixture("~1.0.0");
        fx.workspace().resolve_graph().unwrap();
        let state_before = std::fs::read_to_string(fx.config.state_path()).unwrap();

        let outcome = fx.workspace().resolve_graph().unwrap();

        assert_eq!(outcome.decision, Decision::NotRequired);
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(fx.solver.calls(), 1);
        assert_eq!(fx.delegate.fetches(), vec!["widget"]);
        let state_after = std::fs::read_to_string(fx.config.state_path()).unwrap();
        assert_eq!(state_before, state_after);
    }

    #[test]
    fn pinned_resolution_survives_state_file_removal() {
        let fx = widget_fixture("1.0.0");
        // An explicit pin request holds widget at 1.0.0 even though
        // 1.5.0 satisfies the declared range.
        fx.workspace()
            .resolve_to_pin("widget", &Version::parse("1.0.0").unwrap())
            .unwrap();
        assert_eq!(
            fx.managed_version("widget"),
            Some(Version::parse("1.0.0").unwrap())
        );
        let solver_calls = fx.solver.calls();

        std::fs::remove_file(fx.config.state_path()).unwrap();
        let outcome = fx.workspace().resolve_graph().unwrap();

        assert_eq!(outcome.decision, Decision::NotRequired);
        assert_eq!(fx.solver.calls(), solver_calls);
        assert_eq!(
            fx.managed_version("widget"),
            Some(Version::parse("1.0.0").unwrap())
        );
    }

    #[test]
    fn near_duplicate_locations_collapse_with_info() {
        let fx = Fixture::new();
        fx.provider.add_tag("widget", "1.0.0", "rev-10");
        fx.solver.add_versions("widget", &["1.0.0"]);
        fx.set_root_dependencies(vec![
            dep(
                "https://github.com/Acme/Widget.git",
                Requirement::range("1.0.0").unwrap(),
            ),
            dep(
                "https://github.com/acme/widget",
                Requirement::range("1.0.0").unwrap(),
            ),
        ]);

        let outcome = fx.workspace().resolve_graph().unwrap();

        let infos: Vec<_> = outcome
            .diagnostics
            .iter()
            .filter(|d| d.severity == crate::diagnostics::Severity::Info)
            .collect();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].message.contains("https://github.com/Acme/Widget.git"));
        assert!(infos[0].message.contains("https://github.com/acme/widget"));

        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        assert_eq!(state.dependencies().count(), 1);
    }

    #[test]
    fn conflicting_explicit_names_are_an_error() {
        let fx = Fixture::new();
        let mut first = dep(
            "https://github.com/acme/widget.git",
            Requirement::range("1.0.0").unwrap(),
        );
        first.explicit_name = Some("Widget".into());
        let mut second = dep(
            "https://github.com/acme/Widget",
            Requirement::range("1.0.0").unwrap(),
        );
        second.explicit_name = Some("NotWidget".into());
        fx.set_root_dependencies(vec![first, second]);

        assert!(matches!(
            fx.workspace().resolve_graph(),
            Err(WorkspaceError::ConflictingName { .. })
        ));
    }

    #[test]
    fn same_identity_different_location_errors_at_root() {
        let fx = Fixture::new();
        fx.set_root_dependencies(vec![
            dep(
                "https://github.com/acme/widget.git",
                Requirement::range("1.0.0").unwrap(),
            ),
            dep(
                "https://github.com/other-org/widget.git",
                Requirement::range("1.0.0").unwrap(),
            ),
        ]);

        assert!(matches!(
            fx.workspace().resolve_graph(),
            Err(WorkspaceError::DuplicateIdentity { .. })
        ));
    }

    #[test]
    fn root_package_shadows_dependency_edge() {
        let fx = Fixture::new();
        let gadget_root = fx.tmp.path().join("gadget");
        std::fs::create_dir_all(&gadget_root).unwrap();

        let mut config = fx.config.clone();
        config.roots.push(PackageLocation::path(&gadget_root));

        fx.loader.add(manifest(
            fx.root_location(),
            "root",
            vec![dep(
                "https://github.com/acme/gadget.git",
                Requirement::range("1.0.0").unwrap(),
            )],
        ));
        fx.loader.add(manifest(
            PackageLocation::path(&gadget_root),
            "gadget",
            Vec::new(),
        ));

        let workspace = Workspace::new(
            config,
            &fx.loader,
            &fx.provider,
            &fx.transport,
            &fx.solver,
        )
        .unwrap()
        .with_delegate(&fx.delegate);
        let outcome = workspace.resolve_graph().unwrap();

        // The dependency edge is elided: nothing fetched, nothing
        // solved, nothing pinned.
        assert!(fx.delegate.fetches().is_empty());
        assert_eq!(fx.solver.calls(), 0);
        assert!(outcome.packages.is_empty());
    }

    #[test]
    fn disallowed_mode_distinguishes_missing_from_stale() {
        let fx = widget_fixture("~1.0.0");

        let mut disallowed = fx.config.clone();
        disallowed.resolution = ResolutionMode::Disallowed;
        let workspace = Workspace::new(
            disallowed.clone(),
            &fx.loader,
            &fx.provider,
            &fx.transport,
            &fx.solver,
        )
        .unwrap();

        match workspace.resolve_graph() {
            Err(WorkspaceError::ResolutionRequired {
                pin_file_missing, ..
            }) => assert!(pin_file_missing),
            other => panic!("expected resolution-required error, got {other:?}"),
        }

        // Pin through an automatic pass, then narrow the declared range.
        fx.workspace().resolve_graph().unwrap();
        fx.set_root_dependencies(vec![dep(
            "https://github.com/acme/widget.git",
            Requirement::range("~1.5.0").unwrap(),
        )]);

        let workspace = Workspace::new(
            disallowed,
            &fx.loader,
            &fx.provider,
            &fx.transport,
            &fx.solver,
        )
        .unwrap();
        match workspace.resolve_graph() {
            Err(err @ WorkspaceError::ResolutionRequired {
                pin_file_missing, ..
            }) => {
                assert!(!pin_file_missing);
                let message = err.to_string();
                assert!(message.contains("out of date"));
                assert!(message.contains("widget"));
            }
            other => panic!("expected resolution-required error, got {other:?}"),
        }
    }

    #[test]
    fn update_drops_pins_and_moves_forward() {
        let fx = widget_fixture("~1.0.0");
        fx.workspace().resolve_graph().unwrap();
        assert_eq!(
            fx.managed_version("widget"),
            Some(Version::parse("1.0.0").unwrap())
        );

        // Widen the range: the existing pin still satisfies it, so plain
        // resolution stays put and update is what moves.
        fx.set_root_dependencies(vec![dep(
            "https://github.com/acme/widget.git",
            Requirement::range("1.0.0").unwrap(),
        )]);
        fx.workspace().resolve_graph().unwrap();
        assert_eq!(
            fx.managed_version("widget"),
            Some(Version::parse("1.0.0").unwrap())
        );

        fx.workspace().update(&[]).unwrap();
        assert_eq!(
            fx.managed_version("widget"),
            Some(Version::parse("1.5.0").unwrap())
        );
    }

    #[test]
    fn update_unknown_package_is_an_error() {
        let fx = widget_fixture("~1.0.0");
        fx.workspace().resolve_graph().unwrap();
        assert!(matches!(
            fx.workspace().update(&["gizmo"]),
            Err(WorkspaceError::UnknownPackage(_))
        ));
    }

    #[test]
    fn resolve_to_pin_rejects_local_dependencies() {
        let fx = Fixture::new();
        let local_dir = fx.tmp.path().join("libs/widget");
        std::fs::create_dir_all(&local_dir).unwrap();
        fx.set_root_dependencies(vec![dep(
            local_dir.to_str().unwrap(),
            Requirement::Local,
        )]);
        fx.workspace().resolve_graph().unwrap();

        assert!(matches!(
            fx.workspace()
                .resolve_to_pin("widget", &Version::parse("1.0.0").unwrap()),
            Err(WorkspaceError::Transition(
                TransitionError::CannotResolveLocal(_)
            ))
        ));
    }

    #[test]
    fn local_dependency_round_trip() {
        let fx = Fixture::new();
        let local_dir = fx.tmp.path().join("libs/widget");
        std::fs::create_dir_all(&local_dir).unwrap();
        fx.set_root_dependencies(vec![dep(
            local_dir.to_str().unwrap(),
            Requirement::Local,
        )]);

        fx.workspace().resolve_graph().unwrap();
        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        assert!(state.dependency(&identity("widget")).unwrap().state.is_local());

        let outcome = fx.workspace().resolve_graph().unwrap();
        assert_eq!(outcome.decision, Decision::NotRequired);
    }

    #[test]
    fn branch_dependency_pins_tip_revision() {
        let fx = Fixture::new();
        fx.provider.add_branch("widget", "main", "rev-tip");
        fx.set_root_dependencies(vec![dep(
            "https://github.com/acme/widget.git",
            Requirement::Branch {
                name: "main".into(),
            },
        )]);

        fx.workspace().resolve_graph().unwrap();
        let pins = PinStore::load(&fx.config.pin_path()).unwrap().unwrap();
        assert_eq!(
            pins.get(&identity("widget")).unwrap().state,
            PinState::Branch {
                name: "main".into(),
                revision: "rev-tip".into(),
            }
        );

        let outcome = fx.workspace().resolve_graph().unwrap();
        assert_eq!(outcome.decision, Decision::NotRequired);
        assert_eq!(fx.solver.calls(), 1);
    }

    #[test]
    fn edit_and_unedit_persist_through_the_store() {
        let fx = widget_fixture("~1.0.0");
        fx.workspace().resolve_graph().unwrap();

        let edit_path = fx.workspace().edit("widget", None, None).unwrap();
        assert!(edit_path.exists());
        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        assert!(state.dependency(&identity("widget")).unwrap().state.is_edited());

        // Editing alone never forces re-resolution.
        let outcome = fx.workspace().resolve_graph().unwrap();
        assert_eq!(outcome.decision, Decision::NotRequired);

        fx.workspace().unedit("widget").unwrap();
        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        assert!(matches!(
            state.dependency(&identity("widget")).unwrap().state,
            DependencyState::Checkout { .. }
        ));
    }

    #[test]
    fn artifacts_flow_through_resolution() {
        let fx = Fixture::new();
        let data = zip_archive(&[
            ("WidgetKit.bundle/", None),
            ("WidgetKit.bundle/lib.a", Some(b"obj".as_ref())),
        ]);
        let checksum = checksum_of(&data);
        fx.transport.add("https://cdn.example/widgetkit.zip", data);

        let mut root = manifest(fx.root_location(), "root", Vec::new());
        root.targets.push(TargetDeclaration {
            name: "WidgetKit".into(),
            artifact: Some(ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum,
            }),
        });
        fx.loader.add(root);

        fx.workspace().resolve_graph().unwrap();
        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        let record = state.artifact(&fx.root_identity(), "WidgetKit").unwrap();
        assert!(record.path.exists());

        // Unchanged source: the second pass never touches the network.
        fx.workspace().resolve_graph().unwrap();
        assert_eq!(fx.transport.hits(), 1);
    }

    #[test]
    fn artifact_failure_fails_the_pass_but_commits_state() {
        let fx = Fixture::new();
        let good = zip_archive(&[
            ("Good.bundle/", None),
            ("Good.bundle/lib.a", Some(b"obj".as_ref())),
        ]);
        let good_checksum = checksum_of(&good);
        fx.transport.add("https://cdn.example/good.zip", good);

        let mut root = manifest(fx.root_location(), "root", Vec::new());
        root.targets.push(TargetDeclaration {
            name: "Good".into(),
            artifact: Some(ArtifactSpec::Remote {
                url: "https://cdn.example/good.zip".into(),
                checksum: good_checksum,
            }),
        });
        root.targets.push(TargetDeclaration {
            name: "Bad".into(),
            artifact: Some(ArtifactSpec::Remote {
                url: "https://cdn.example/missing.zip".into(),
                checksum: "0".repeat(64),
            }),
        });
        fx.loader.add(root);

        assert!(matches!(
            fx.workspace().resolve_graph(),
            Err(WorkspaceError::ArtifactFailures(failures)) if failures.len() == 1
        ));

        // Completed work stays durable; the pin file does not record a
        // failed pass.
        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        assert!(state.artifact(&fx.root_identity(), "Good").is_some());
        assert!(!fx.config.pin_path().exists());
    }

    #[test]
    fn registry_dependency_downloads_instead_of_cloning() {
        let fx = Fixture::new();
        fx.solver.add_versions("widget", &["1.0.0"]);
        fx.set_root_dependencies(vec![DependencyDeclaration {
            explicit_name: None,
            location: PackageLocation::registry("acme.widget"),
            requirement: Requirement::range("1.0.0").unwrap(),
            product_filter: ProductFilter::Everything,
        }]);

        let registry = crate::testutil::FakeRegistry;
        let workspace = fx.workspace().with_registry(&registry);
        workspace.resolve_graph().unwrap();

        let state = WorkspaceState::load(&fx.config.state_path()).unwrap();
        assert!(matches!(
            state.dependency(&identity("widget")).unwrap().state,
            DependencyState::RegistryDownload { .. }
        ));
        assert!(fx
            .config
            .scratch_dir
            .join("registry/widget/1.0.0/.fake-registry")
            .exists());

        let outcome = fx
            .workspace()
            .with_registry(&registry)
            .resolve_graph()
            .unwrap();
        assert_eq!(outcome.decision, Decision::NotRequired);
    }

    #[test]
    fn solver_failure_propagates_verbatim() {
        let fx = Fixture::new();
        fx.provider.add_tag("widget", "1.0.0", "rev-10");
        fx.solver.add_versions("widget", &["1.0.0"]);
        fx.set_root_dependencies(vec![dep(
            "https://github.com/acme/widget.git",
            Requirement::range("2.0.0").unwrap(),
        )]);

        match fx.workspace().resolve_graph() {
            Err(WorkspaceError::Solve(SolveError::Unsatisfiable { explanation })) => {
                assert!(explanation.contains("widget"));
            }
            other => panic!("expected unsatisfiable error, got {other:?}"),
        }
    }

    #[test]
    fn reset_keeps_pins_and_clean_keeps_artifacts() {
        let fx = widget_fixture("~1.0.0");
        fx.workspace().resolve_graph().unwrap();
        std::fs::create_dir_all(fx.config.build_dir()).unwrap();

        fx.workspace().clean().unwrap();
        assert!(!fx.config.build_dir().exists());
        assert!(fx.config.state_path().exists());

        fx.workspace().reset().unwrap();
        assert!(!fx.config.state_path().exists());
        assert!(fx.config.pin_path().exists());
    }
}
