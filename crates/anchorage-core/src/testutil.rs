//! Test utilities for Anchorage.
//!
//! In-memory stand-ins for the external collaborators (source control,
//! byte transport, manifest loading, solving) plus archive builders, so
//! engine behavior can be tested without a network or a `git` binary.

use crate::artifact::{ArtifactError, ArtifactTransport};
use crate::delegate::WorkspaceDelegate;
use crate::identity::{PackageIdentity, PackageLocation};
use crate::manifest::{ManifestError, ManifestLoader, RootManifest};
use crate::pins::PinStore;
use crate::precompute::Reason;
use crate::requirement::Requirement;
use crate::solve::{Binding, BoundState, Constraint, DependencySolver, SolveError, VersionCatalog};
use crate::vcs::{
    CheckoutTarget, RegistryDownloader, SourceControlProvider, VcsError,
};
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Marker file a [`FakeProvider`] working copy carries.
const SCM_MARKER: &str = ".fake-scm";

/// Marker file recording the current checkout of a fake working copy.
const HEAD_MARKER: &str = ".fake-head";

#[derive(Debug, Default, Clone)]
struct FakeRepo {
    tags: BTreeMap<Version, String>,
    branches: HashMap<String, String>,
    revisions: BTreeSet<String>,
}

/// An in-memory source-control provider. Working copies are plain
/// directories with a marker file naming their repository.
#[derive(Debug, Default)]
pub struct FakeProvider {
    repos: Mutex<HashMap<String, FakeRepo>>,
}

impl FakeProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag (and its revision) for a package.
    pub fn add_tag(&self, package: &str, version: &str, revision: &str) {
        let mut repos = self.repos.lock().unwrap();
        let repo = repos.entry(package.to_string()).or_default();
        repo.tags
            .insert(Version::parse(version).unwrap(), revision.to_string());
        repo.revisions.insert(revision.to_string());
    }

    /// Register a branch tip for a package.
    pub fn add_branch(&self, package: &str, branch: &str, revision: &str) {
        let mut repos = self.repos.lock().unwrap();
        let repo = repos.entry(package.to_string()).or_default();
        repo.branches
            .insert(branch.to_string(), revision.to_string());
        repo.revisions.insert(revision.to_string());
    }

    fn repo_name(location: &PackageLocation) -> String {
        location
            .identity()
            .map(|i| i.as_str().to_string())
            .unwrap_or_default()
    }

    fn repo_of(&self, working_copy: &Path) -> Result<FakeRepo, VcsError> {
        let name = fs::read_to_string(working_copy.join(SCM_MARKER))
            .map_err(|_| VcsError::NotAWorkingCopy(working_copy.display().to_string()))?;
        let repos = self.repos.lock().unwrap();
        Ok(repos.get(name.trim()).cloned().unwrap_or_default())
    }
}

impl SourceControlProvider for FakeProvider {
    fn fetch(&self, location: &PackageLocation, destination: &Path) -> Result<(), VcsError> {
        let name = Self::repo_name(location);
        if !self.repos.lock().unwrap().contains_key(&name) {
            return Err(VcsError::FetchFailed {
                location: location.original(),
                reason: "unknown repository".into(),
            });
        }
        fs::create_dir_all(destination)?;
        fs::write(destination.join(SCM_MARKER), &name)?;
        Ok(())
    }

    fn checkout(&self, working_copy: &Path, target: &CheckoutTarget) -> Result<String, VcsError> {
        let repo = self.repo_of(working_copy)?;
        let revision = match target {
            CheckoutTarget::Version(version) => {
                repo.tags
                    .get(version)
                    .cloned()
                    .ok_or_else(|| VcsError::CheckoutFailed {
                        path: working_copy.display().to_string(),
                        target: target.to_string(),
                        reason: "unknown tag".into(),
                    })?
            }
            CheckoutTarget::Branch(branch) => {
                repo.branches
                    .get(branch)
                    .cloned()
                    .ok_or_else(|| VcsError::CheckoutFailed {
                        path: working_copy.display().to_string(),
                        target: target.to_string(),
                        reason: "unknown branch".into(),
                    })?
            }
            CheckoutTarget::Revision(revision) => {
                if !repo.revisions.contains(revision) {
                    return Err(VcsError::RevisionNotFound {
                        revision: revision.clone(),
                    });
                }
                revision.clone()
            }
        };
        fs::write(working_copy.join(HEAD_MARKER), &revision)?;
        Ok(revision)
    }

    fn revision_exists(&self, working_copy: &Path, revision: &str) -> Result<bool, VcsError> {
        Ok(self.repo_of(working_copy)?.revisions.contains(revision))
    }

    fn is_working_copy(&self, path: &Path) -> bool {
        path.join(SCM_MARKER).exists()
    }

    fn remove(&self, path: &Path) -> Result<(), VcsError> {
        if !self.is_working_copy(path) {
            return Err(VcsError::NotAWorkingCopy(path.display().to_string()));
        }
        fs::remove_dir_all(path)?;
        Ok(())
    }
}

impl VersionCatalog for FakeProvider {
    fn versions(&self, location: &PackageLocation) -> Result<Vec<Version>, SolveError> {
        let name = Self::repo_name(location);
        let repos = self.repos.lock().unwrap();
        Ok(repos
            .get(&name)
            .map(|r| r.tags.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// A registry downloader that materializes a marker file.
#[derive(Debug, Default)]
pub struct FakeRegistry;

impl RegistryDownloader for FakeRegistry {
    fn download(
        &self,
        registry_id: &str,
        version: &Version,
        destination: &Path,
    ) -> Result<(), VcsError> {
        fs::create_dir_all(destination)?;
        fs::write(
            destination.join(".fake-registry"),
            format!("{registry_id} {version}"),
        )?;
        Ok(())
    }
}

/// Workspace events recorded by [`RecordingDelegate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Resolve(String),
    Fetch(String),
    Checkout(String),
    Remove(String),
    Download(String),
    Ready(String, bool),
}

/// A delegate that records every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<Event>>,
}

impl RecordingDelegate {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Identities fetched, in order.
    #[must_use]
    pub fn fetches(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Fetch(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Identities checked out, in order.
    #[must_use]
    pub fn checkouts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Checkout(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Identities whose working copies were removed, in order.
    #[must_use]
    pub fn removals(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Artifact URLs downloaded, in order.
    #[must_use]
    pub fn downloads(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Download(url) => Some(url),
                _ => None,
            })
            .collect()
    }
}

impl WorkspaceDelegate for RecordingDelegate {
    fn will_resolve(&self, reason: &Reason) {
        self.push(Event::Resolve(reason.to_string()));
    }

    fn fetching(&self, identity: &PackageIdentity, _location: &PackageLocation) {
        self.push(Event::Fetch(identity.as_str().to_string()));
    }

    fn checking_out(&self, identity: &PackageIdentity, _target: &CheckoutTarget) {
        self.push(Event::Checkout(identity.as_str().to_string()));
    }

    fn removing(&self, identity: &PackageIdentity) {
        self.push(Event::Remove(identity.as_str().to_string()));
    }

    fn downloading_artifact(&self, url: &str) {
        self.push(Event::Download(url.to_string()));
    }

    fn artifact_ready(&self, url: &str, from_cache: bool) {
        self.push(Event::Ready(url.to_string(), from_cache));
    }
}

/// An in-memory byte transport keyed by URL.
#[derive(Debug, Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    hits: AtomicUsize,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` at `url`.
    pub fn add(&self, url: &str, data: Vec<u8>) {
        self.responses.lock().unwrap().insert(url.to_string(), data);
    }

    /// Total fetch calls made.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl ArtifactTransport for FakeTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ArtifactError::Download {
                url: url.to_string(),
                reason: "not found".into(),
            })
    }
}

/// A manifest loader serving canned manifests keyed by canonical
/// location.
#[derive(Debug, Default)]
pub struct FakeLoader {
    manifests: Mutex<HashMap<String, RootManifest>>,
}

impl FakeLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `manifest` for its own location.
    pub fn add(&self, manifest: RootManifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(manifest.location.canonical().as_str().to_string(), manifest);
    }
}

impl ManifestLoader for FakeLoader {
    fn load(
        &self,
        location: &PackageLocation,
        _requirement: Option<&Requirement>,
    ) -> Result<RootManifest, ManifestError> {
        self.manifests
            .lock()
            .unwrap()
            .get(location.canonical().as_str())
            .cloned()
            .ok_or_else(|| ManifestError::NotFound(location.original()))
    }
}

/// A solver that binds each constraint independently: the pinned version
/// when it still satisfies the requirement, the highest catalog version
/// otherwise. Counts its invocations so tests can assert the solver was
/// (not) consulted.
#[derive(Debug, Default)]
pub struct StubSolver {
    versions: Mutex<HashMap<String, Vec<Version>>>,
    calls: AtomicUsize,
}

impl StubSolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the known versions for a package.
    pub fn add_versions(&self, package: &str, versions: &[&str]) {
        self.versions.lock().unwrap().insert(
            package.to_string(),
            versions
                .iter()
                .map(|v| Version::parse(v).unwrap())
                .collect(),
        );
    }

    /// How many times `solve` ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bind(
        &self,
        constraint: &Constraint,
        pins: &PinStore,
    ) -> Result<BoundState, SolveError> {
        match &constraint.requirement {
            Requirement::Local => Ok(BoundState::Local),
            Requirement::Branch { name } => Ok(BoundState::Branch { name: name.clone() }),
            Requirement::Revision { revision } => Ok(BoundState::Revision {
                revision: revision.clone(),
            }),
            requirement => {
                if let Some(pinned) = pins
                    .get(&constraint.identity)
                    .and_then(|p| p.state.version())
                {
                    if requirement.satisfied_by(pinned) {
                        return Ok(BoundState::Version(pinned.clone()));
                    }
                }
                let versions = self.versions.lock().unwrap();
                let known = versions
                    .get(constraint.identity.as_str())
                    .ok_or_else(|| SolveError::UnknownPackage(constraint.identity.clone()))?;
                known
                    .iter()
                    .filter(|v| requirement.satisfied_by(v))
                    .max()
                    .cloned()
                    .map(BoundState::Version)
                    .ok_or_else(|| SolveError::Unsatisfiable {
                        explanation: format!(
                            "no version of '{}' satisfies {}",
                            constraint.identity, requirement
                        ),
                    })
            }
        }
    }
}

impl DependencySolver for StubSolver {
    fn solve(
        &self,
        constraints: &[Constraint],
        pins: &PinStore,
    ) -> Result<Vec<Binding>, SolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut seen = BTreeSet::new();
        let mut bindings = Vec::new();
        for constraint in constraints {
            if !seen.insert(constraint.identity.clone()) {
                continue;
            }
            bindings.push(Binding {
                identity: constraint.identity.clone(),
                location: constraint.location.clone(),
                bound: self.bind(constraint, pins)?,
            });
        }
        Ok(bindings)
    }
}

/// Build a zip archive in memory. Entries ending in `/` (or with no
/// contents) become directories.
#[must_use]
pub fn zip_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        match contents {
            None => writer
                .add_directory(name.trim_end_matches('/'), options)
                .unwrap(),
            Some(data) => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Build a gzip-compressed tarball in memory.
#[must_use]
pub fn tar_gz_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
