//! The `anchorage.toml` manifest loader.
//!
//! Implements the engine's [`ManifestLoader`] contract for local
//! manifests. Dependencies and targets are arrays of tables so that
//! declaration order survives parsing; the engine's precompute reporting
//! depends on it.
//!
//! ```toml
//! [package]
//! name = "my-app"
//! tools-version = "2.0"
//! products = ["my-app"]
//!
//! [[dependency]]
//! git = "https://github.com/acme/widget.git"
//! version = "1.2.0"
//!
//! [[dependency]]
//! path = "../gadget"
//!
//! [[target]]
//! name = "WidgetKit"
//! artifact = { url = "https://cdn.example/widgetkit.zip", checksum = "..." }
//! ```

use anchorage_core::{
    ArtifactSpec, DependencyDeclaration, ManifestError, ManifestLoader, PackageLocation,
    ProductFilter, Requirement, RootManifest, SourcePosition, TargetDeclaration, ToolsVersion,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The manifest filename.
pub const MANIFEST_FILE: &str = "anchorage.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    package: PackageSection,

    #[serde(default, rename = "dependency")]
    dependencies: Vec<DependencySection>,

    #[serde(default, rename = "target")]
    targets: Vec<TargetSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageSection {
    name: String,

    #[serde(rename = "tools-version")]
    tools_version: String,

    #[serde(default)]
    products: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencySection {
    /// Explicit name; conflicts across declarations are a hard error.
    #[serde(default)]
    name: Option<String>,

    #[serde(default)]
    git: Option<String>,

    #[serde(default)]
    path: Option<String>,

    #[serde(default)]
    registry: Option<String>,

    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    exact: Option<String>,

    #[serde(default)]
    branch: Option<String>,

    #[serde(default)]
    rev: Option<String>,

    /// Restrict which products of the dependency are consumed.
    #[serde(default)]
    products: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetSection {
    name: String,

    #[serde(default)]
    artifact: Option<ArtifactSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactSection {
    #[serde(default)]
    url: Option<String>,

    #[serde(default, rename = "index-url")]
    index_url: Option<String>,

    #[serde(default)]
    checksum: Option<String>,

    #[serde(default)]
    path: Option<String>,
}

/// Loads `anchorage.toml` manifests from the filesystem.
///
/// Remote locations are reported as not found: their manifests live in
/// their checkouts and are out of reach until fetched, so the engine
/// treats them as leaves.
#[derive(Debug, Default)]
pub struct TomlLoader;

impl TomlLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn parse(content: &str, directory: &Path) -> Result<RootManifest, ManifestError> {
        let file: ManifestFile = toml::from_str(content).map_err(|e| ManifestError::Parse {
            message: e.message().to_string(),
            position: e.span().map(|span| position_at(content, span.start)),
        })?;

        let tools_version = ToolsVersion::parse(&file.package.tools_version)?;

        let mut dependencies = Vec::with_capacity(file.dependencies.len());
        for section in &file.dependencies {
            dependencies.push(parse_dependency(section, directory)?);
        }

        let mut targets = Vec::with_capacity(file.targets.len());
        for section in &file.targets {
            targets.push(TargetDeclaration {
                name: section.name.clone(),
                artifact: section
                    .artifact
                    .as_ref()
                    .map(|a| parse_artifact(a, directory))
                    .transpose()?,
            });
        }

        Ok(RootManifest {
            name: file.package.name,
            location: PackageLocation::path(directory),
            tools_version,
            dependencies,
            targets,
            products: file.package.products,
        })
    }
}

impl ManifestLoader for TomlLoader {
    fn load(
        &self,
        location: &PackageLocation,
        _requirement: Option<&Requirement>,
    ) -> Result<RootManifest, ManifestError> {
        let Some(directory) = location.as_path() else {
            return Err(ManifestError::NotFound(location.original()));
        };
        let manifest_path = directory.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(ManifestError::NotFound(manifest_path.display().to_string()));
        }
        let content = std::fs::read_to_string(&manifest_path)?;
        let mut manifest = Self::parse(&content, directory)?;
        manifest.location = location.clone();
        Ok(manifest)
    }
}

fn parse_dependency(
    section: &DependencySection,
    directory: &Path,
) -> Result<DependencyDeclaration, ManifestError> {
    let invalid = |message: String| ManifestError::Parse {
        message,
        position: None,
    };

    let location = match (&section.git, &section.path, &section.registry) {
        (Some(git), None, None) => PackageLocation::remote(git.clone()),
        (None, Some(path), None) => PackageLocation::path(resolve_path(directory, path)),
        (None, None, Some(registry)) => PackageLocation::registry(registry.clone()),
        _ => {
            return Err(invalid(
                "dependency must declare exactly one of 'git', 'path', or 'registry'".into(),
            ))
        }
    };

    let requirement = if section.path.is_some() {
        if section.version.is_some()
            || section.exact.is_some()
            || section.branch.is_some()
            || section.rev.is_some()
        {
            return Err(invalid(
                "path dependencies take no version, branch, or revision".into(),
            ));
        }
        Requirement::Local
    } else {
        match (&section.version, &section.exact, &section.branch, &section.rev) {
            (Some(version), None, None, None) => Requirement::range(version)
                .map_err(|e| invalid(e.to_string()))?,
            (None, Some(exact), None, None) => {
                Requirement::exact(exact).map_err(|e| invalid(e.to_string()))?
            }
            (None, None, Some(branch), None) => Requirement::Branch {
                name: branch.clone(),
            },
            (None, None, None, Some(rev)) => Requirement::Revision {
                revision: rev.clone(),
            },
            _ => {
                return Err(invalid(
                    "dependency must declare exactly one of 'version', 'exact', 'branch', or \
                     'rev'"
                        .into(),
                ))
            }
        }
    };

    Ok(DependencyDeclaration {
        explicit_name: section.name.clone(),
        location,
        requirement,
        product_filter: section
            .products
            .clone()
            .map_or(ProductFilter::Everything, ProductFilter::Specific),
    })
}

fn parse_artifact(
    section: &ArtifactSection,
    directory: &Path,
) -> Result<ArtifactSpec, ManifestError> {
    let invalid = |message: &str| ManifestError::Parse {
        message: message.to_string(),
        position: None,
    };

    match (&section.url, &section.index_url, &section.path) {
        (Some(url), None, None) => {
            let checksum = section
                .checksum
                .clone()
                .ok_or_else(|| invalid("remote artifacts require a 'checksum'"))?;
            Ok(ArtifactSpec::Remote {
                url: url.clone(),
                checksum,
            })
        }
        (None, Some(index_url), None) => {
            let checksum = section
                .checksum
                .clone()
                .ok_or_else(|| invalid("remote artifact indexes require a 'checksum'"))?;
            Ok(ArtifactSpec::RemoteIndex {
                url: index_url.clone(),
                checksum,
            })
        }
        (None, None, Some(path)) => {
            let resolved = resolve_path(directory, path);
            let lower = path.to_lowercase();
            if lower.ends_with(".zip") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
                Ok(ArtifactSpec::LocalArchive { path: resolved })
            } else {
                Ok(ArtifactSpec::Local { path: resolved })
            }
        }
        _ => Err(invalid(
            "artifact must declare exactly one of 'url', 'index-url', or 'path'",
        )),
    }
}

fn resolve_path(directory: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        directory.join(path)
    }
}

/// Line/column of a byte offset, for parse diagnostics.
fn position_at(content: &str, offset: usize) -> SourcePosition {
    let clamped = offset.min(content.len());
    let mut line = 1;
    let mut column = 1;
    for c in content[..clamped].chars() {
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    SourcePosition { line, column }
}
