//! `git`-backed source control.
//!
//! Implements the engine's [`SourceControlProvider`] and
//! [`VersionCatalog`] seams by shelling out to the `git` binary, which is
//! how users already authenticate to their hosts.

use anchorage_core::{
    CheckoutTarget, PackageLocation, SolveError, SourceControlProvider, VcsError, VersionCatalog,
};
use semver::Version;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Default)]
pub struct GitCli;

impl GitCli {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn run(args: &[&str], cwd: Option<&Path>) -> Result<String, VcsError> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(VcsError::CheckoutFailed {
                path: cwd.map_or_else(String::new, |p| p.display().to_string()),
                target: args.join(" "),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Resolve a version to a tag present in the repository, accepting
    /// both `1.2.3` and `v1.2.3` spellings.
    fn tag_for_version(working_copy: &Path, version: &Version) -> Result<String, VcsError> {
        for candidate in [version.to_string(), format!("v{version}")] {
            if Self::run(
                &["rev-parse", "--verify", &format!("refs/tags/{candidate}")],
                Some(working_copy),
            )
            .is_ok()
            {
                return Ok(candidate);
            }
        }
        Err(VcsError::RevisionNotFound {
            revision: version.to_string(),
        })
    }
}

impl SourceControlProvider for GitCli {
    fn fetch(&self, location: &PackageLocation, destination: &Path) -> Result<(), VcsError> {
        let url = location.original();
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::run(
            &["clone", "--quiet", &url, &destination.display().to_string()],
            None,
        )
        .map_err(|e| VcsError::FetchFailed {
            location: url,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn checkout(&self, working_copy: &Path, target: &CheckoutTarget) -> Result<String, VcsError> {
        let reference = match target {
            CheckoutTarget::Version(version) => Self::tag_for_version(working_copy, version)?,
            CheckoutTarget::Branch(branch) => branch.clone(),
            CheckoutTarget::Revision(revision) => {
                if !self.revision_exists(working_copy, revision)? {
                    return Err(VcsError::RevisionNotFound {
                        revision: revision.clone(),
                    });
                }
                revision.clone()
            }
        };
        Self::run(
            &["checkout", "--quiet", "--detach", &reference],
            Some(working_copy),
        )?;
        Self::run(&["rev-parse", "HEAD"], Some(working_copy))
    }

    fn revision_exists(&self, working_copy: &Path, revision: &str) -> Result<bool, VcsError> {
        Ok(Self::run(
            &["rev-parse", "--verify", &format!("{revision}^{{commit}}")],
            Some(working_copy),
        )
        .is_ok())
    }

    fn is_working_copy(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    fn remove(&self, path: &Path) -> Result<(), VcsError> {
        if !self.is_working_copy(path) {
            return Err(VcsError::NotAWorkingCopy(path.display().to_string()));
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}

impl VersionCatalog for GitCli {
    /// Versions are the repository's semver-shaped tags, read with
    /// `ls-remote` so no checkout is needed.
    fn versions(&self, location: &PackageLocation) -> Result<Vec<Version>, SolveError> {
        let url = location.original();
        let output = Self::run(&["ls-remote", "--tags", &url], None)
            .map_err(|e| SolveError::Catalog(e.to_string()))?;

        let mut versions = Vec::new();
        for line in output.lines() {
            let Some(reference) = line.split_whitespace().nth(1) else {
                continue;
            };
            let Some(tag) = reference.strip_prefix("refs/tags/") else {
                continue;
            };
            // Peeled entries (`^{}`) duplicate the tag itself.
            let tag = tag.strip_suffix("^{}").unwrap_or(tag);
            let tag = tag.strip_prefix('v').unwrap_or(tag);
            if let Ok(version) = Version::parse(tag) {
                if !versions.contains(&version) {
                    versions.push(version);
                }
            }
        }
        Ok(versions)
    }
}
