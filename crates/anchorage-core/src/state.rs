//! The workspace state store: the durable record of what is actually
//! materialized on disk right now.
//!
//! This is a lower-level document than the pin file and may be deleted
//! independently of it; a missing file is rebuilt clean-slate on the next
//! load without forcing re-resolution.

use crate::fsutil::atomic_write;
use crate::identity::{PackageIdentity, PackageLocation};
use crate::pins::PinState;
use crate::requirement::RequirementKind;
use crate::vcs::CheckoutState;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The state file name under the workspace scratch directory.
pub const STATE_FILE: &str = "workspace-state.toml";

/// Current state file format version.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Errors that can occur when working with the state store.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse state file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize state file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// The live materialization state of one managed dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DependencyState {
    /// Bound to a source-control working copy at a specific point.
    Checkout { checkout: CheckoutState },

    /// Substituted by a mutable working copy. `based_on` preserves the
    /// state it was edited from so un-editing can restore it; `path` is
    /// recorded only when the caller supplied a custom location.
    Edited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        based_on: Option<Box<DependencyState>>,
    },

    /// A filesystem path outside version control.
    Local { path: PathBuf },

    /// Content extracted from a registry archive.
    RegistryDownload { version: Version },
}

impl DependencyState {
    /// The requirement kind this state corresponds to, for precompute
    /// comparison. Edited states answer through their `based_on`
    /// snapshot; an edit with no snapshot has no kind and never triggers
    /// re-resolution by itself.
    #[must_use]
    pub fn requirement_kind(&self) -> Option<RequirementKind> {
        match self {
            Self::Checkout { checkout } => Some(match checkout {
                CheckoutState::Version { .. } => RequirementKind::Version,
                CheckoutState::Branch { .. } => RequirementKind::Branch,
                CheckoutState::Revision { .. } => RequirementKind::Revision,
            }),
            Self::Edited { based_on, .. } => {
                based_on.as_deref().and_then(Self::requirement_kind)
            }
            Self::Local { .. } => Some(RequirementKind::Local),
            Self::RegistryDownload { .. } => Some(RequirementKind::Version),
        }
    }

    /// The version this state is bound to, resolving edits through their
    /// `based_on` snapshot.
    #[must_use]
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Checkout {
                checkout: CheckoutState::Version { version, .. },
            }
            | Self::RegistryDownload { version } => Some(version),
            Self::Edited { based_on, .. } => based_on.as_deref().and_then(Self::version),
            _ => None,
        }
    }

    /// The pin snapshot for this state. Edited dependencies pin their
    /// `based_on` snapshot, never the live edit.
    #[must_use]
    pub fn pin_state(&self) -> Option<PinState> {
        match self {
            Self::Checkout { checkout } => Some(PinState::from(checkout)),
            Self::Edited { based_on, .. } => based_on.as_deref().and_then(Self::pin_state),
            Self::Local { .. } => Some(PinState::Local),
            Self::RegistryDownload { version } => Some(PinState::Version {
                version: version.clone(),
                revision: None,
            }),
        }
    }

    #[must_use]
    pub fn is_edited(&self) -> bool {
        matches!(self, Self::Edited { .. })
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

impl std::fmt::Display for DependencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checkout { checkout } => write!(f, "checkout ({checkout})"),
            Self::Edited { .. } => write!(f, "edited"),
            Self::Local { path } => write!(f, "local ({})", path.display()),
            Self::RegistryDownload { version } => write!(f, "registry download ({version})"),
        }
    }
}

/// One managed dependency. At most one exists per identity; local
/// packages hold no other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDependency {
    pub identity: PackageIdentity,
    pub location: PackageLocation,
    pub state: DependencyState,
}

/// Where a managed artifact's bytes came from.
///
/// A plain local directory carries no checksum; a local archive carries
/// the checksum of the archive it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArtifactSource {
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    Remote {
        url: String,
        checksum: String,
    },
}

impl ArtifactSource {
    /// Coarse source kind, used to detect local ↔ local-archive ↔ remote
    /// transitions that require cleaning the previous artifact.
    #[must_use]
    pub fn transition_kind(&self) -> &'static str {
        match self {
            Self::Local { checksum: None } => "local",
            Self::Local { checksum: Some(_) } => "local-archive",
            Self::Remote { .. } => "remote",
        }
    }

    /// The recorded checksum, if any.
    #[must_use]
    pub fn checksum(&self) -> Option<&str> {
        match self {
            Self::Local { checksum } => checksum.as_deref(),
            Self::Remote { checksum, .. } => Some(checksum),
        }
    }
}

/// The live, on-disk materialization record for one binary-artifact
/// target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedArtifact {
    pub identity: PackageIdentity,

    /// The target this artifact backs. The artifact's own name need not
    /// match it.
    pub target_name: String,

    /// Final on-disk path of the artifact directory.
    pub path: PathBuf,

    /// Artifact kind, inferred from the extracted top-level entry's
    /// extension.
    pub kind: String,

    /// When this record was last written (RFC 3339).
    pub updated_at: String,

    pub source: ArtifactSource,
}

/// On-disk shape of the state file.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,

    #[serde(default, rename = "dependency")]
    dependencies: Vec<ManagedDependency>,

    #[serde(default, rename = "artifact")]
    artifacts: Vec<ManagedArtifact>,
}

/// The in-memory workspace state: one slot per dependency identity, one
/// slot per (identity, target) artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceState {
    dependencies: BTreeMap<PackageIdentity, ManagedDependency>,
    artifacts: BTreeMap<(PackageIdentity, String), ManagedArtifact>,
}

impl WorkspaceState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the state from `path`. A missing file yields an empty state:
    /// the store is rebuilt clean-slate without forcing re-resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let file: StateFile = toml::from_str(&content)?;
        let mut state = Self::new();
        for dep in file.dependencies {
            state.dependencies.insert(dep.identity.clone(), dep);
        }
        for artifact in file.artifacts {
            state.artifacts.insert(
                (artifact.identity.clone(), artifact.target_name.clone()),
                artifact,
            );
        }
        Ok(state)
    }

    /// Save the state to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let file = StateFile {
            version: STATE_FORMAT_VERSION,
            dependencies: self.dependencies.values().cloned().collect(),
            artifacts: self.artifacts.values().cloned().collect(),
        };
        let content = toml::to_string_pretty(&file)?;
        atomic_write(path, &content)?;
        Ok(())
    }

    /// Get the managed dependency for an identity.
    #[must_use]
    pub fn dependency(&self, identity: &PackageIdentity) -> Option<&ManagedDependency> {
        self.dependencies.get(identity)
    }

    /// Add or replace the managed dependency for its identity
    /// (last-writer-wins, single slot).
    pub fn set_dependency(&mut self, dependency: ManagedDependency) {
        self.dependencies
            .insert(dependency.identity.clone(), dependency);
    }

    /// Remove the managed dependency for an identity.
    pub fn remove_dependency(&mut self, identity: &PackageIdentity) -> Option<ManagedDependency> {
        self.dependencies.remove(identity)
    }

    /// All managed dependencies, ordered by identity.
    pub fn dependencies(&self) -> impl Iterator<Item = &ManagedDependency> {
        self.dependencies.values()
    }

    /// Get the managed artifact for (identity, target).
    #[must_use]
    pub fn artifact(&self, identity: &PackageIdentity, target: &str) -> Option<&ManagedArtifact> {
        self.artifacts
            .get(&(identity.clone(), target.to_string()))
    }

    /// Add or replace the managed artifact for its (identity, target).
    pub fn set_artifact(&mut self, artifact: ManagedArtifact) {
        self.artifacts.insert(
            (artifact.identity.clone(), artifact.target_name.clone()),
            artifact,
        );
    }

    /// Remove the managed artifact for (identity, target).
    pub fn remove_artifact(
        &mut self,
        identity: &PackageIdentity,
        target: &str,
    ) -> Option<ManagedArtifact> {
        self.artifacts
            .remove(&(identity.clone(), target.to_string()))
    }

    /// All managed artifacts, ordered by (identity, target).
    pub fn artifacts(&self) -> impl Iterator<Item = &ManagedArtifact> {
        self.artifacts.values()
    }

    /// Drop artifact records not accepted by `keep`, returning the
    /// removed records so their directories can be cleaned up.
    pub fn retain_artifacts(
        &mut self,
        mut keep: impl FnMut(&ManagedArtifact) -> bool,
    ) -> Vec<ManagedArtifact> {
        let mut removed = Vec::new();
        self.artifacts.retain(|_, artifact| {
            if keep(artifact) {
                true
            } else {
                removed.push(artifact.clone());
                false
            }
        });
        removed
    }
}
