//! The manifest model and the loader contract.
//!
//! Manifest parsing and evaluation are external to this engine: a
//! [`ManifestLoader`] is handed in and returns either a [`RootManifest`] or
//! a structured error with a source position. This module defines the data
//! the engine consumes, not the manifest syntax.

use crate::identity::{IdentityError, PackageIdentity, PackageLocation};
use crate::requirement::Requirement;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A position in a manifest source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Errors produced by manifest loading.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest{}: {message}", .position.map(|p| format!(" at {p}")).unwrap_or_default())]
    Parse {
        message: String,
        position: Option<SourcePosition>,
    },

    #[error("failed to evaluate manifest: {0}")]
    Evaluation(String),

    #[error("manifest not found for '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// The declared tools version of a manifest.
///
/// The pin-file schema version is chosen as the minimum tools-version
/// major across all root manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolsVersion {
    pub major: u32,
    pub minor: u32,
}

impl ToolsVersion {
    pub const V1: Self = Self { major: 1, minor: 0 };
    pub const V2: Self = Self { major: 2, minor: 0 };

    /// Parse a `major.minor` string.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the string is not `major.minor`.
    pub fn parse(s: &str) -> Result<Self, ManifestError> {
        let invalid = || ManifestError::Parse {
            message: format!("invalid tools version '{s}', expected 'major.minor'"),
            position: None,
        };
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl std::fmt::Display for ToolsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Which products of a dependency are consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductFilter {
    /// All products.
    Everything,
    /// Only the named products.
    Specific(Vec<String>),
}

impl Default for ProductFilter {
    fn default() -> Self {
        Self::Everything
    }
}

/// A dependency edge declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDeclaration {
    /// Explicit name, when the manifest names the dependency itself.
    /// Conflicting explicit names for one identity are a hard error.
    pub explicit_name: Option<String>,

    /// Where the dependency lives.
    pub location: PackageLocation,

    /// What it is pinned to.
    pub requirement: Requirement,

    /// Which of its products are consumed.
    pub product_filter: ProductFilter,
}

impl DependencyDeclaration {
    /// The identity of the declared dependency.
    ///
    /// # Errors
    ///
    /// Returns an error if the location cannot yield an identity.
    pub fn identity(&self) -> Result<PackageIdentity, IdentityError> {
        self.location.identity()
    }
}

/// How a target sources its binary artifact, when it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArtifactSpec {
    /// An already-extracted artifact directory on disk.
    Local { path: PathBuf },

    /// A local archive file to extract.
    LocalArchive { path: PathBuf },

    /// A remote archive with a declared SHA-256 checksum.
    Remote { url: String, checksum: String },

    /// A remote index document enumerating per-platform archives.
    RemoteIndex { url: String, checksum: String },
}

/// A target declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDeclaration {
    pub name: String,

    /// Present when the target is backed by a binary artifact.
    pub artifact: Option<ArtifactSpec>,
}

/// A loaded and evaluated manifest.
#[derive(Debug, Clone)]
pub struct RootManifest {
    /// The declared package name.
    pub name: String,

    /// Where this manifest was loaded from.
    pub location: PackageLocation,

    /// Declared tools version.
    pub tools_version: ToolsVersion,

    /// Dependency edges, in declaration order. Order is load-bearing:
    /// precompute reports the first mismatch in this order.
    pub dependencies: Vec<DependencyDeclaration>,

    /// Declared targets.
    pub targets: Vec<TargetDeclaration>,

    /// Declared products.
    pub products: Vec<String>,
}

impl RootManifest {
    /// The identity of the package this manifest describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the location cannot yield an identity.
    pub fn identity(&self) -> Result<PackageIdentity, IdentityError> {
        self.location.identity()
    }
}

/// The external manifest loader contract.
///
/// Given a location and (for remote packages) the requirement being
/// resolved, returns the manifest or a structured error.
pub trait ManifestLoader: Send + Sync {
    /// Load the manifest at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read, parsed, or
    /// evaluated.
    fn load(
        &self,
        location: &PackageLocation,
        requirement: Option<&Requirement>,
    ) -> Result<RootManifest, ManifestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_version_parse_and_order() {
        let v1 = ToolsVersion::parse("1.4").unwrap();
        let v2 = ToolsVersion::parse("2.0").unwrap();
        assert!(v1 < v2);
        assert_eq!(v1.to_string(), "1.4");
    }

    #[test]
    fn tools_version_rejects_garbage() {
        assert!(ToolsVersion::parse("two").is_err());
        assert!(ToolsVersion::parse("2").is_err());
    }

    #[test]
    fn declaration_identity_comes_from_location() {
        let decl = DependencyDeclaration {
            explicit_name: Some("Widget".into()),
            location: PackageLocation::remote("https://github.com/acme/widget.git"),
            requirement: Requirement::range("1.0.0").unwrap(),
            product_filter: ProductFilter::Everything,
        };
        assert_eq!(decl.identity().unwrap().as_str(), "widget");
    }

    #[test]
    fn parse_error_displays_position() {
        let err = ManifestError::Parse {
            message: "unexpected token".into(),
            position: Some(SourcePosition { line: 3, column: 7 }),
        };
        assert_eq!(
            err.to_string(),
            "failed to parse manifest at 3:7: unexpected token"
        );
    }
}
