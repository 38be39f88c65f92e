//! The managed-dependency state machine.
//!
//! Owns every transition between checkout, edited, local, and
//! registry-download states, including the side effects: cloning,
//! checking out, removing, and restoring working copies. Transitions are
//! synchronous and single-threaded per identity; the orchestrator
//! parallelizes only the network-bound fetches that feed them.

use crate::delegate::WorkspaceDelegate;
use crate::diagnostics::{Diagnostic, DiagnosticBag};
use crate::fsutil::remove_dir_if_exists;
use crate::identity::{PackageIdentity, PackageLocation};
use crate::pins::PinState;
use crate::state::{DependencyState, ManagedDependency, WorkspaceState};
use crate::vcs::{CheckoutState, CheckoutTarget, RegistryDownloader, SourceControlProvider, VcsError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by state transitions. These are user errors and are
/// never retried.
#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("dependency '{0}' is already in edit mode")]
    AlreadyEdited(PackageIdentity),

    #[error("dependency '{0}' is not in edit mode")]
    NotEdited(PackageIdentity),

    #[error("revision '{revision}' does not exist in '{identity}'")]
    RevisionNotFound {
        identity: PackageIdentity,
        revision: String,
    },

    #[error("local dependency '{0}' cannot be edited")]
    CannotEditLocal(PackageIdentity),

    #[error("local dependency '{0}' cannot be resolved to a version")]
    CannotResolveLocal(PackageIdentity),

    #[error("no managed dependency named '{0}'")]
    UnknownDependency(PackageIdentity),

    #[error("'{0}' requires a registry downloader, but none is configured")]
    RegistryUnavailable(PackageIdentity),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to bring a dependency to.
///
/// Revisions are optional: a target coming from the pin store knows the
/// revision and re-materializes without consulting the network, while a
/// target coming from a fresh solver binding resolves its revision at
/// checkout time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeTarget {
    Version {
        version: semver::Version,
        revision: Option<String>,
    },
    Branch {
        name: String,
        revision: Option<String>,
    },
    Revision {
        revision: String,
    },
    Local,
}

impl From<&PinState> for MaterializeTarget {
    fn from(pin: &PinState) -> Self {
        match pin {
            PinState::Version { version, revision } => Self::Version {
                version: version.clone(),
                revision: revision.clone(),
            },
            PinState::Branch { name, revision } => Self::Branch {
                name: name.clone(),
                revision: Some(revision.clone()),
            },
            PinState::Revision { revision } => Self::Revision {
                revision: revision.clone(),
            },
            PinState::Local => Self::Local,
        }
    }
}

/// Filesystem layout the lifecycle machine materializes into.
#[derive(Debug, Clone)]
pub struct LifecycleDirs {
    /// Resolved source-control checkouts, one per identity.
    pub checkouts: PathBuf,

    /// Default location for edited working copies.
    pub edits: PathBuf,

    /// Extracted registry downloads, one per identity.
    pub registry: PathBuf,
}

impl LifecycleDirs {
    /// Conventional layout under a scratch directory, with edits beside
    /// the workspace root where users expect to find them.
    #[must_use]
    pub fn new(scratch: &Path, root: &Path) -> Self {
        Self {
            checkouts: scratch.join("checkouts"),
            edits: root.join("edits"),
            registry: scratch.join("registry"),
        }
    }
}

/// Drives managed-dependency transitions against a state store.
pub struct Lifecycle<'a> {
    state: &'a mut WorkspaceState,
    provider: &'a dyn SourceControlProvider,
    registry: Option<&'a dyn RegistryDownloader>,
    dirs: &'a LifecycleDirs,
    delegate: &'a dyn WorkspaceDelegate,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        state: &'a mut WorkspaceState,
        provider: &'a dyn SourceControlProvider,
        registry: Option<&'a dyn RegistryDownloader>,
        dirs: &'a LifecycleDirs,
        delegate: &'a dyn WorkspaceDelegate,
    ) -> Self {
        Self {
            state,
            provider,
            registry,
            dirs,
            delegate,
        }
    }

    /// The checkout directory for an identity.
    #[must_use]
    pub fn checkout_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.dirs.checkouts.join(identity.as_str())
    }

    /// The default edited-working-copy directory for an identity.
    #[must_use]
    pub fn default_edit_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.dirs.edits.join(identity.as_str())
    }

    fn edit_path_of(&self, identity: &PackageIdentity, state: &DependencyState) -> PathBuf {
        match state {
            DependencyState::Edited {
                path: Some(path), ..
            } => path.clone(),
            _ => self.default_edit_path(identity),
        }
    }

    /// Bring the managed state for `identity` in line with a resolved
    /// binding. Handles first materialization, in-place pin updates, and
    /// requirement-kind switches in both directions.
    ///
    /// An edited dependency is left untouched: the live edit substitutes
    /// for the resolved source until un-edited.
    ///
    /// # Errors
    ///
    /// Returns an error if a side effect (clone, checkout, download)
    /// fails.
    pub fn materialize(
        &mut self,
        identity: &PackageIdentity,
        location: &PackageLocation,
        target: &MaterializeTarget,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<(), TransitionError> {
        if let Some(managed) = self.state.dependency(identity) {
            if managed.state.is_edited() {
                return Ok(());
            }
        }

        match target {
            MaterializeTarget::Local => self.switch_to_local(identity, location),
            MaterializeTarget::Version { .. }
            | MaterializeTarget::Branch { .. }
            | MaterializeTarget::Revision { .. } => {
                self.materialize_checkout(identity, location, target, diagnostics)
            }
        }
    }

    /// Materialize a registry download for `identity` at `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if no registry downloader is configured or the
    /// download fails.
    pub fn materialize_registry(
        &mut self,
        identity: &PackageIdentity,
        location: &PackageLocation,
        version: &semver::Version,
    ) -> Result<(), TransitionError> {
        let registry = self
            .registry
            .ok_or_else(|| TransitionError::RegistryUnavailable(identity.clone()))?;

        let destination = self
            .dirs
            .registry
            .join(identity.as_str())
            .join(version.to_string());

        let already_current = matches!(
            self.state.dependency(identity),
            Some(ManagedDependency {
                state: DependencyState::RegistryDownload { version: current },
                ..
            }) if current == version
        );
        if already_current && destination.is_dir() {
            return Ok(());
        }

        let registry_id = location.original();
        self.delegate.fetching(identity, location);
        remove_dir_if_exists(&destination)?;
        registry.download(&registry_id, version, &destination)?;

        // A registry download replaces any previous checkout.
        let previous_checkout = self.checkout_path(identity);
        if self.provider.is_working_copy(&previous_checkout) {
            self.delegate.removing(identity);
            self.provider.remove(&previous_checkout)?;
        }

        self.state.set_dependency(ManagedDependency {
            identity: identity.clone(),
            location: location.clone(),
            state: DependencyState::RegistryDownload {
                version: version.clone(),
            },
        });
        Ok(())
    }

    fn switch_to_local(
        &mut self,
        identity: &PackageIdentity,
        location: &PackageLocation,
    ) -> Result<(), TransitionError> {
        let path = location
            .as_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(location.original()));

        // Dropping a checkout in favor of a local path removes the
        // working copy; the local directory itself is the user's.
        if let Some(managed) = self.state.dependency(identity) {
            if matches!(managed.state, DependencyState::Checkout { .. }) {
                let checkout = self.checkout_path(identity);
                if self.provider.is_working_copy(&checkout) {
                    self.delegate.removing(identity);
                    self.provider.remove(&checkout)?;
                }
            }
        }

        // Last-writer-wins: a second local path claiming the same
        // identity replaces the slot outright.
        self.state.set_dependency(ManagedDependency {
            identity: identity.clone(),
            location: location.clone(),
            state: DependencyState::Local { path },
        });
        Ok(())
    }

    fn materialize_checkout(
        &mut self,
        identity: &PackageIdentity,
        location: &PackageLocation,
        target: &MaterializeTarget,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<(), TransitionError> {
        let path = self.checkout_path(identity);

        let current = self.state.dependency(identity).map(|m| m.state.clone());

        let needs_fetch = !self.provider.is_working_copy(&path);
        if needs_fetch {
            if matches!(current, Some(DependencyState::Checkout { .. })) {
                // The store says we have a checkout but the directory is
                // gone; heal it rather than failing the pass.
                diagnostics.emit(
                    Diagnostic::warning(format!(
                        "checkout for '{identity}' is missing on disk, cloning again"
                    ))
                    .with_identity(identity.clone()),
                );
            }
            self.delegate.fetching(identity, location);
            remove_dir_if_exists(&path)?;
            self.provider.fetch(location, &path)?;
        } else if let Some(DependencyState::Checkout { checkout }) = &current {
            if checkout_matches(checkout, target) {
                // Already at the requested state; nothing to do.
                return Ok(());
            }
        }

        let desired = checkout_target(target);
        self.delegate.checking_out(identity, &desired);
        let revision = self.provider.checkout(&path, &desired)?;

        let checkout = match target {
            MaterializeTarget::Version { version, .. } => CheckoutState::Version {
                version: version.clone(),
                revision,
            },
            MaterializeTarget::Branch { name, .. } => CheckoutState::Branch {
                name: name.clone(),
                revision,
            },
            MaterializeTarget::Revision { .. } => CheckoutState::Revision { revision },
            MaterializeTarget::Local => unreachable!("local handled by switch_to_local"),
        };

        self.state.set_dependency(ManagedDependency {
            identity: identity.clone(),
            location: location.clone(),
            state: DependencyState::Checkout { checkout },
        });
        Ok(())
    }

    /// Put `identity` into edit mode.
    ///
    /// # Errors
    ///
    /// Fails with [`TransitionError::AlreadyEdited`] if already edited,
    /// [`TransitionError::CannotEditLocal`] for local dependencies, and
    /// [`TransitionError::RevisionNotFound`] if a requested revision does
    /// not exist.
    pub fn edit(
        &mut self,
        identity: &PackageIdentity,
        custom_path: Option<PathBuf>,
        target: Option<CheckoutTarget>,
    ) -> Result<PathBuf, TransitionError> {
        let managed = self
            .state
            .dependency(identity)
            .ok_or_else(|| TransitionError::UnknownDependency(identity.clone()))?
            .clone();

        match &managed.state {
            DependencyState::Edited { .. } => {
                return Err(TransitionError::AlreadyEdited(identity.clone()))
            }
            DependencyState::Local { .. } => {
                return Err(TransitionError::CannotEditLocal(identity.clone()))
            }
            DependencyState::Checkout { .. } | DependencyState::RegistryDownload { .. } => {}
        }

        let destination = custom_path
            .clone()
            .unwrap_or_else(|| self.default_edit_path(identity));

        if !self.provider.is_working_copy(&destination) {
            self.delegate.fetching(identity, &managed.location);
            remove_dir_if_exists(&destination)?;
            self.provider.fetch(&managed.location, &destination)?;
        }

        if let Some(target) = &target {
            if let CheckoutTarget::Revision(revision) = target {
                if !self.provider.revision_exists(&destination, revision)? {
                    if custom_path.is_none() {
                        // We created the default copy; do not leave it
                        // behind on failure.
                        let _ = self.provider.remove(&destination);
                    }
                    return Err(TransitionError::RevisionNotFound {
                        identity: identity.clone(),
                        revision: revision.clone(),
                    });
                }
            }
            self.delegate.checking_out(identity, target);
            self.provider.checkout(&destination, target)?;
        }

        self.state.set_dependency(ManagedDependency {
            identity: identity.clone(),
            location: managed.location,
            state: DependencyState::Edited {
                path: custom_path,
                based_on: Some(Box::new(managed.state)),
            },
        });
        Ok(destination)
    }

    /// Take `identity` out of edit mode, restoring the state it was
    /// edited from.
    ///
    /// A working copy at a caller-supplied path is preserved; the default
    /// edit copy is removed. A missing working copy is a warning, not an
    /// error.
    ///
    /// # Errors
    ///
    /// Fails with [`TransitionError::NotEdited`] if the dependency is not
    /// edited.
    pub fn unedit(
        &mut self,
        identity: &PackageIdentity,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<(), TransitionError> {
        let managed = self
            .state
            .dependency(identity)
            .ok_or_else(|| TransitionError::UnknownDependency(identity.clone()))?
            .clone();

        let DependencyState::Edited { path, based_on } = &managed.state else {
            return Err(TransitionError::NotEdited(identity.clone()));
        };

        let working_copy = self.edit_path_of(identity, &managed.state);
        if !working_copy.exists() {
            diagnostics.emit(
                Diagnostic::warning(format!(
                    "edited working copy for '{identity}' is missing at {}, restoring the \
                     previous state",
                    working_copy.display()
                ))
                .with_identity(identity.clone()),
            );
        } else if path.is_none() {
            remove_dir_if_exists(&working_copy)?;
        }

        match based_on.as_deref() {
            Some(previous) => {
                let previous = previous.clone();
                self.state.set_dependency(ManagedDependency {
                    identity: identity.clone(),
                    location: managed.location.clone(),
                    state: previous.clone(),
                });
                // Make sure the restored state is actually on disk.
                if let Some(pin) = previous.pin_state() {
                    let target = MaterializeTarget::from(&pin);
                    self.materialize(identity, &managed.location, &target, diagnostics)?;
                }
            }
            None => {
                self.state.remove_dependency(identity);
            }
        }
        Ok(())
    }

    /// Remove every managed dependency whose identity is not in `live`.
    pub fn prune(
        &mut self,
        live: &BTreeSet<PackageIdentity>,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<(), TransitionError> {
        let dead: Vec<ManagedDependency> = self
            .state
            .dependencies()
            .filter(|m| !live.contains(&m.identity))
            .cloned()
            .collect();

        for managed in dead {
            match &managed.state {
                DependencyState::Checkout { .. } => {
                    self.delegate.removing(&managed.identity);
                    let path = self.checkout_path(&managed.identity);
                    if self.provider.is_working_copy(&path) {
                        self.provider.remove(&path)?;
                    } else {
                        remove_dir_if_exists(&path)?;
                    }
                }
                DependencyState::RegistryDownload { .. } => {
                    self.delegate.removing(&managed.identity);
                    remove_dir_if_exists(&self.dirs.registry.join(managed.identity.as_str()))?;
                }
                DependencyState::Edited { .. } => {
                    // The user's in-flight work is never deleted by a
                    // graph prune.
                    diagnostics.emit(
                        Diagnostic::warning(format!(
                            "dependency '{}' was removed from the graph while edited; its \
                             working copy was left in place",
                            managed.identity
                        ))
                        .with_identity(managed.identity.clone()),
                    );
                }
                DependencyState::Local { .. } => {}
            }
            self.state.remove_dependency(&managed.identity);
        }
        Ok(())
    }

    /// Repair managed records whose on-disk side is gone: missing
    /// checkouts are re-cloned with a warning, and missing edited copies
    /// fall back to their based-on state.
    pub fn heal(&mut self, diagnostics: &mut DiagnosticBag) -> Result<(), TransitionError> {
        let snapshot: Vec<ManagedDependency> = self.state.dependencies().cloned().collect();

        for managed in snapshot {
            match &managed.state {
                DependencyState::Checkout { checkout } => {
                    let path = self.checkout_path(&managed.identity);
                    if !self.provider.is_working_copy(&path) {
                        let target = MaterializeTarget::from(&PinState::from(checkout));
                        self.materialize_checkout(
                            &managed.identity,
                            &managed.location,
                            &target,
                            diagnostics,
                        )?;
                    }
                }
                DependencyState::Edited { .. } => {
                    let working_copy = self.edit_path_of(&managed.identity, &managed.state);
                    if !working_copy.exists() {
                        self.unedit(&managed.identity, diagnostics)?;
                    }
                }
                DependencyState::Local { .. } | DependencyState::RegistryDownload { .. } => {}
            }
        }
        Ok(())
    }
}

/// Whether an existing checkout already satisfies a target. Version tags
/// are immutable, so version equality is enough; a branch target without
/// an expected revision must always refresh the tip.
fn checkout_matches(current: &CheckoutState, target: &MaterializeTarget) -> bool {
    match (current, target) {
        (
            CheckoutState::Version {
                version: cv,
                revision: cr,
            },
            MaterializeTarget::Version { version, revision },
        ) => cv == version && revision.as_ref().map_or(true, |r| r == cr),
        (
            CheckoutState::Branch {
                name: cn,
                revision: cr,
            },
            MaterializeTarget::Branch { name, revision },
        ) => cn == name && revision.as_ref().is_some_and(|r| r == cr),
        (
            CheckoutState::Revision { revision: cr },
            MaterializeTarget::Revision { revision },
        ) => cr == revision,
        _ => false,
    }
}

/// The checkout target that realizes a materialization target. A known
/// revision wins over a symbolic name so re-materialization is
/// reproducible without consulting the network.
fn checkout_target(target: &MaterializeTarget) -> CheckoutTarget {
    match target {
        MaterializeTarget::Version {
            revision: Some(revision),
            ..
        }
        | MaterializeTarget::Branch {
            revision: Some(revision),
            ..
        }
        | MaterializeTarget::Revision { revision } => CheckoutTarget::Revision(revision.clone()),
        MaterializeTarget::Version { version, .. } => CheckoutTarget::Version(version.clone()),
        MaterializeTarget::Branch { name, .. } => CheckoutTarget::Branch(name.clone()),
        MaterializeTarget::Local => unreachable!("local has no checkout target"),
    }
}
