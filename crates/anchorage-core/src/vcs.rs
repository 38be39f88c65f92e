//! The source-control seam.
//!
//! Clone/checkout/tag plumbing is external to this engine. The lifecycle
//! state machine drives a [`SourceControlProvider`] and records the
//! resulting [`CheckoutState`]; the `git`-backed implementation lives in
//! the CLI crate, and tests substitute an in-memory fake.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::identity::PackageLocation;

/// Errors surfaced by source-control operations.
#[derive(Error, Debug)]
pub enum VcsError {
    #[error("failed to fetch '{location}': {reason}")]
    FetchFailed { location: String, reason: String },

    #[error("failed to check out '{target}' in {path}: {reason}")]
    CheckoutFailed {
        path: String,
        target: String,
        reason: String,
    },

    #[error("revision '{revision}' does not exist")]
    RevisionNotFound { revision: String },

    #[error("'{0}' is not a valid working copy")]
    NotAWorkingCopy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to check a working copy out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutTarget {
    Version(Version),
    Branch(String),
    Revision(String),
}

impl std::fmt::Display for CheckoutTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version(v) => write!(f, "{v}"),
            Self::Branch(b) => write!(f, "branch:{b}"),
            Self::Revision(r) => write!(f, "rev:{r}"),
        }
    }
}

/// The point a working copy is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "bound-to", rename_all = "kebab-case")]
pub enum CheckoutState {
    /// A tagged version, with the revision the tag resolved to.
    Version { version: Version, revision: String },

    /// A branch, with the revision its tip resolved to.
    Branch { name: String, revision: String },

    /// A bare revision.
    Revision { revision: String },
}

impl CheckoutState {
    /// The resolved revision, whatever the checkout is bound to.
    #[must_use]
    pub fn revision(&self) -> &str {
        match self {
            Self::Version { revision, .. }
            | Self::Branch { revision, .. }
            | Self::Revision { revision } => revision,
        }
    }

    /// The checkout target that reproduces this state.
    #[must_use]
    pub fn target(&self) -> CheckoutTarget {
        match self {
            Self::Version { version, .. } => CheckoutTarget::Version(version.clone()),
            Self::Branch { name, .. } => CheckoutTarget::Branch(name.clone()),
            Self::Revision { revision } => CheckoutTarget::Revision(revision.clone()),
        }
    }
}

impl std::fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version { version, .. } => write!(f, "{version}"),
            Self::Branch { name, revision } => write!(f, "{name} ({revision})"),
            Self::Revision { revision } => write!(f, "{revision}"),
        }
    }
}

/// External source-control plumbing consumed by the lifecycle machine.
/// Implementations must be shareable across the worker pool.
pub trait SourceControlProvider: Send + Sync {
    /// Clone `location` into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone fails.
    fn fetch(&self, location: &PackageLocation, destination: &Path) -> Result<(), VcsError>;

    /// Check `working_copy` out to `target`, returning the resolved
    /// revision.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError::RevisionNotFound`] if the target does not exist
    /// in the repository.
    fn checkout(&self, working_copy: &Path, target: &CheckoutTarget) -> Result<String, VcsError>;

    /// Whether `revision` exists in the repository at `working_copy`.
    ///
    /// # Errors
    ///
    /// Returns an error if the working copy cannot be inspected.
    fn revision_exists(&self, working_copy: &Path, revision: &str) -> Result<bool, VcsError>;

    /// Whether `path` is a valid working copy.
    fn is_working_copy(&self, path: &Path) -> bool;

    /// Remove the working copy at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    fn remove(&self, path: &Path) -> Result<(), VcsError>;
}

/// External registry download plumbing.
///
/// The registry wire protocol is out of scope here; the lifecycle machine
/// only needs "put the contents of `identity` at `version` into
/// `destination`".
pub trait RegistryDownloader: Send + Sync {
    /// Download and extract a registry release into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the download or extraction fails.
    fn download(
        &self,
        registry_id: &str,
        version: &Version,
        destination: &Path,
    ) -> Result<(), VcsError>;
}
