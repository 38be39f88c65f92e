//! Package identity and location canonicalization.
//!
//! Two declared locations may spell the same logical package differently:
//! `https://github.com/Acme/Widget.git`, `git@github.com:acme/widget`, and
//! `https://github.com/acme/widget/` all name one repository. This module
//! derives a stable [`PackageIdentity`] from any location and a
//! [`CanonicalLocation`] used *only* for equality and conflict checks. The
//! original spelling is always kept for display and for the pin file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when deriving identities from locations.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("cannot derive a package identity from empty location")]
    EmptyLocation,

    #[error("location '{0}' has no usable path component")]
    NoPathComponent(String),
}

/// Hosts whose URL shapes are recognized well enough to treat scheme and
/// user-info variants (`https://`, `ssh://git@`, scp-like `git@host:`) as
/// equivalent. Unfamiliar hosts are compared literally.
const FAMILIAR_HOSTS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "codeberg.org",
    "sr.ht",
];

/// A normalized, display-independent key naming a logical package.
///
/// Derived from the last path component of a location: case-folded and
/// stripped of a trailing `.git` (or other extension). Two locations with
/// equal identities refer to the same logical package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIdentity(String);

impl PackageIdentity {
    /// Derive an identity from a location string (URL or path).
    ///
    /// # Errors
    ///
    /// Returns an error if the location is empty or has no path component.
    pub fn from_location(location: &str) -> Result<Self, IdentityError> {
        let trimmed = location.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(IdentityError::EmptyLocation);
        }

        // Last component of either a URL path or a filesystem path.
        let last = trimmed
            .rsplit(['/', ':'])
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IdentityError::NoPathComponent(location.to_string()))?;

        let stripped = strip_extension(last);
        if stripped.is_empty() {
            return Err(IdentityError::NoPathComponent(location.to_string()));
        }

        Ok(Self(stripped.to_lowercase()))
    }

    /// The identity as a lowercase string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strip a trailing `.git` or other single extension from a name.
fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// The case/scheme/suffix-normalized form of a location.
///
/// Used only for equality and conflict detection, never for display. For
/// URLs on familiar hosts the scheme and user-info are dropped so that
/// `https://`, `ssh://git@`, and scp-like spellings compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalLocation(String);

impl CanonicalLocation {
    /// Canonicalize a location string.
    #[must_use]
    pub fn new(location: &str) -> Self {
        let lowered = location.trim().to_lowercase();
        let lowered = lowered.trim_end_matches('/');
        let stripped = lowered.strip_suffix(".git").unwrap_or(lowered);

        // scp-like: git@host:owner/repo
        if let Some(rest) = stripped.strip_prefix("git@") {
            if let Some((host, path)) = rest.split_once(':') {
                if is_familiar(host) {
                    return Self(format!("{host}/{}", path.trim_start_matches('/')));
                }
            }
        }

        // URL with scheme: scheme://[user@]host/path
        if let Some((scheme, rest)) = stripped.split_once("://") {
            if matches!(scheme, "https" | "http" | "ssh" | "git") {
                let rest = rest.rsplit_once('@').map_or(rest, |(_, r)| r);
                let host = rest.split('/').next().unwrap_or(rest);
                if is_familiar(host) {
                    return Self(rest.trim_end_matches('/').to_string());
                }
            }
        }

        Self(stripped.to_string())
    }

    /// The canonical form as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_familiar(host: &str) -> bool {
    FAMILIAR_HOSTS.contains(&host)
}

/// Where a package lives.
///
/// Carries the original string for display and pin-file fidelity; equality
/// of two locations is decided through [`CanonicalLocation`], never through
/// the raw spelling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PackageLocation {
    /// A local filesystem path outside any source control checkout.
    Path { path: PathBuf },

    /// A remote source-control URL.
    Remote { url: String },

    /// A registry identity such as `acme.widget`.
    Registry { id: String },
}

impl PackageLocation {
    /// A path location.
    #[must_use]
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    /// A remote URL location.
    #[must_use]
    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote { url: url.into() }
    }

    /// A registry location.
    #[must_use]
    pub fn registry(id: impl Into<String>) -> Self {
        Self::Registry { id: id.into() }
    }

    /// The original spelling, used for display and persisted in pins.
    #[must_use]
    pub fn original(&self) -> String {
        match self {
            Self::Path { path } => path.display().to_string(),
            Self::Remote { url } => url.clone(),
            Self::Registry { id } => id.clone(),
        }
    }

    /// The filesystem path, if this is a path location.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path { path } => Some(path),
            _ => None,
        }
    }

    /// Derive the package identity for this location.
    ///
    /// # Errors
    ///
    /// Returns an error if the location string is empty or degenerate.
    pub fn identity(&self) -> Result<PackageIdentity, IdentityError> {
        match self {
            Self::Registry { id } => {
                // Registry identities are dotted (`scope.name`); the final
                // label is the package name.
                let last = id.rsplit('.').next().unwrap_or(id);
                if last.is_empty() {
                    return Err(IdentityError::NoPathComponent(id.clone()));
                }
                Ok(PackageIdentity(last.to_lowercase()))
            }
            _ => PackageIdentity::from_location(&self.original()),
        }
    }

    /// The canonical form used for equality and conflict checks.
    #[must_use]
    pub fn canonical(&self) -> CanonicalLocation {
        CanonicalLocation::new(&self.original())
    }

    /// True if two locations canonicalize to the same form.
    #[must_use]
    pub fn same_canonical(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl std::fmt::Display for PackageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.original())
    }
}
