//! Dependency requirements and their kinds.
//!
//! A requirement pins a dependency to an exact version, a semver range, a
//! branch, a fixed revision, or (for local packages) nothing at all.
//! Requirements are orderable only within the same kind; a kind switch
//! across two reconciliation passes is a state transition, not a
//! comparison.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when parsing requirements.
#[derive(Error, Debug)]
pub enum RequirementError {
    #[error("invalid version requirement '{requirement}': {reason}")]
    InvalidVersionReq { requirement: String, reason: String },

    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },
}

/// What a dependency is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Requirement {
    /// Exactly one version.
    Exact { version: Version },

    /// Any version in a semver range.
    Range { range: VersionReq },

    /// The tip of a branch.
    Branch { name: String },

    /// A fixed source-control revision.
    Revision { revision: String },

    /// Unversioned: the dependency is a local filesystem path.
    Local,
}

/// The kind of a requirement, used when deciding whether a managed state
/// still matches what the manifests declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequirementKind {
    Version,
    Branch,
    Revision,
    Local,
}

impl Requirement {
    /// Parse a version-requirement string into a range requirement.
    ///
    /// Bare versions (`"1.2.0"`) are treated as caret requirements, the
    /// common manifest shorthand.
    ///
    /// # Errors
    ///
    /// Returns an error if the requirement string is not valid semver.
    pub fn range(requirement: &str) -> Result<Self, RequirementError> {
        let normalized = if requirement
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
        {
            format!("^{requirement}")
        } else {
            requirement.to_string()
        };

        let range =
            VersionReq::parse(&normalized).map_err(|e| RequirementError::InvalidVersionReq {
                requirement: requirement.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::Range { range })
    }

    /// Parse an exact-version requirement.
    ///
    /// # Errors
    ///
    /// Returns an error if the version string is not valid semver.
    pub fn exact(version: &str) -> Result<Self, RequirementError> {
        let version = Version::parse(version).map_err(|e| RequirementError::InvalidVersion {
            version: version.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::Exact { version })
    }

    /// The kind of this requirement.
    #[must_use]
    pub fn kind(&self) -> RequirementKind {
        match self {
            Self::Exact { .. } | Self::Range { .. } => RequirementKind::Version,
            Self::Branch { .. } => RequirementKind::Branch,
            Self::Revision { .. } => RequirementKind::Revision,
            Self::Local => RequirementKind::Local,
        }
    }

    /// Check whether a concrete version satisfies this requirement.
    ///
    /// Branch, revision, and local requirements are never satisfied by a
    /// version; they bind different kinds of state.
    #[must_use]
    pub fn satisfied_by(&self, version: &Version) -> bool {
        match self {
            Self::Exact { version: exact } => exact == version,
            Self::Range { range } => range.matches(version),
            Self::Branch { .. } | Self::Revision { .. } | Self::Local => false,
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact { version } => write!(f, "== {version}"),
            Self::Range { range } => write!(f, "{range}"),
            Self::Branch { name } => write!(f, "branch:{name}"),
            Self::Revision { revision } => write!(f, "rev:{revision}"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version => write!(f, "version"),
            Self::Branch => write!(f, "branch"),
            Self::Revision => write!(f, "revision"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_version_is_caret() {
        let req = Requirement::range("1.2.0").unwrap();
        assert!(req.satisfied_by(&Version::parse("1.5.0").unwrap()));
        assert!(!req.satisfied_by(&Version::parse("2.0.0").unwrap()));
    }

    #[test]
    fn tilde_range() {
        let req = Requirement::range("~1.0.0").unwrap();
        assert!(req.satisfied_by(&Version::parse("1.0.3").unwrap()));
        assert!(!req.satisfied_by(&Version::parse("1.1.0").unwrap()));
    }

    #[test]
    fn exact_version() {
        let req = Requirement::exact("1.0.0").unwrap();
        assert!(req.satisfied_by(&Version::parse("1.0.0").unwrap()));
        assert!(!req.satisfied_by(&Version::parse("1.0.1").unwrap()));
        assert_eq!(req.kind(), RequirementKind::Version);
    }

    #[test]
    fn invalid_range_is_error() {
        assert!(matches!(
            Requirement::range("not-a-version"),
            Err(RequirementError::InvalidVersionReq { .. })
        ));
    }

    #[test]
    fn kinds() {
        assert_eq!(
            Requirement::Branch {
                name: "main".into()
            }
            .kind(),
            RequirementKind::Branch
        );
        assert_eq!(
            Requirement::Revision {
                revision: "abc123".into()
            }
            .kind(),
            RequirementKind::Revision
        );
        assert_eq!(Requirement::Local.kind(), RequirementKind::Local);
    }

    #[test]
    fn non_version_kinds_never_satisfied_by_versions() {
        let v = Version::parse("1.0.0").unwrap();
        assert!(!Requirement::Local.satisfied_by(&v));
        assert!(!Requirement::Branch { name: "dev".into() }.satisfied_by(&v));
    }
}
