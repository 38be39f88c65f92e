//! The binary artifact manager.
//!
//! Targets can be backed by binary artifacts instead of sources: a local
//! artifact directory, a local archive, a remote archive with a declared
//! checksum, or a remote index document enumerating per-platform
//! archives. This module downloads, verifies, extracts, and commits them
//! into `artifacts/<identity>/<target>/`, bounded by a shared worker
//! pool, with per-target failure collection: one bad artifact never
//! aborts its siblings.

use crate::delegate::WorkspaceDelegate;
use crate::fsutil::remove_dir_if_exists;
use crate::identity::PackageIdentity;
use crate::manifest::ArtifactSpec;
use crate::state::{ArtifactSource, ManagedArtifact, WorkspaceState};
use rayon::prelude::*;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory extensions recognized as binary artifacts.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["bundle", "framework"];

/// Name of the private extraction staging area under the artifacts
/// directory.
const EXTRACT_DIR: &str = "extract";

/// Errors raised per artifact target. Integrity errors are fatal for
/// their target only.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("'{path}' is not a binary artifact directory")]
    NotABinaryArtifact { path: PathBuf },

    #[error("checksum mismatch for '{origin}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        origin: String,
        expected: String,
        actual: String,
    },

    #[error(
        "artifact for target '{target}' has changed checksum; update the URL together with the \
         checksum, or revert the manifest change"
    )]
    ChangedChecksum { target: String },

    #[error("no archive in '{url}' supports platform '{triple}'")]
    NoSupportedArchive { url: String, triple: String },

    #[error("invalid archive '{origin}': {reason}")]
    InvalidArchive { origin: String, reason: String },

    #[error("unsupported archive format for '{0}', expected .zip or .tar.gz")]
    UnsupportedFormat(String),

    #[error("failed to download '{url}': {reason}")]
    Download { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// External byte transport for remote artifacts. Implementations must be
/// shareable across the worker pool.
pub trait ArtifactTransport: Send + Sync {
    /// Fetch the bytes at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Download`] if the fetch fails. This layer
    /// does not retry; retry policy belongs to the transport.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ArtifactError>;
}

/// One target needing a binary artifact.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub identity: PackageIdentity,
    pub target_name: String,
    pub spec: ArtifactSpec,
}

/// A per-target failure, reported together with its siblings' results.
#[derive(Debug)]
pub struct ArtifactFailure {
    pub identity: PackageIdentity,
    pub target_name: String,
    pub error: ArtifactError,
}

/// The current platform triple, used to select archives from a remote
/// index.
#[must_use]
pub fn host_triple() -> String {
    let os = match std::env::consts::OS {
        "macos" => "apple-darwin",
        "linux" => "unknown-linux-gnu",
        "windows" => "pc-windows-msvc",
        other => other,
    };
    format!("{}-{os}", std::env::consts::ARCH)
}

/// A remote index document: per-platform archives for one artifact.
#[derive(Debug, Deserialize)]
struct ArtifactIndex {
    #[serde(default, rename = "schemaVersion")]
    _schema_version: Option<String>,
    archives: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    url: String,
    checksum: String,
    #[serde(rename = "supportedTriples")]
    supported_triples: Vec<String>,
}

/// SHA-256 of a byte buffer, lowercase hex.
#[must_use]
pub fn checksum_of(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Downloads, verifies, extracts, and commits binary artifacts.
pub struct ArtifactManager<'a> {
    artifacts_dir: &'a Path,
    transport: &'a dyn ArtifactTransport,
    delegate: &'a dyn WorkspaceDelegate,
    pool: &'a rayon::ThreadPool,
}

struct Committed {
    record: ManagedArtifact,
    from_cache: bool,
}

impl<'a> ArtifactManager<'a> {
    pub fn new(
        artifacts_dir: &'a Path,
        transport: &'a dyn ArtifactTransport,
        delegate: &'a dyn WorkspaceDelegate,
        pool: &'a rayon::ThreadPool,
    ) -> Self {
        Self {
            artifacts_dir,
            transport,
            delegate,
            pool,
        }
    }

    /// Reconcile every requested artifact against the managed records.
    ///
    /// Pipelines run independently on the shared pool (the pool size is
    /// the concurrency gate); results are joined in request order, and
    /// failures are collected per target instead of aborting siblings.
    /// Records whose backing target is no longer requested are pruned and
    /// their directories removed.
    pub fn reconcile(
        &self,
        requests: &[ArtifactRequest],
        state: &mut WorkspaceState,
    ) -> Vec<ArtifactFailure> {
        let previous: BTreeMap<(PackageIdentity, String), ManagedArtifact> = requests
            .iter()
            .filter_map(|r| {
                state
                    .artifact(&r.identity, &r.target_name)
                    .cloned()
                    .map(|a| ((r.identity.clone(), r.target_name.clone()), a))
            })
            .collect();

        let outcomes: Vec<Result<Committed, ArtifactError>> = self.pool.install(|| {
            requests
                .par_iter()
                .map(|request| {
                    let key = (request.identity.clone(), request.target_name.clone());
                    self.process(request, previous.get(&key))
                })
                .collect()
        });

        let mut failures = Vec::new();
        for (request, outcome) in requests.iter().zip(outcomes) {
            match outcome {
                Ok(committed) => state.set_artifact(committed.record),
                Err(error) => failures.push(ArtifactFailure {
                    identity: request.identity.clone(),
                    target_name: request.target_name.clone(),
                    error,
                }),
            }
        }

        // Records whose backing target fell out of the graph.
        let live: BTreeSet<(PackageIdentity, String)> = requests
            .iter()
            .map(|r| (r.identity.clone(), r.target_name.clone()))
            .collect();
        let removed = state
            .retain_artifacts(|a| live.contains(&(a.identity.clone(), a.target_name.clone())));
        for record in removed {
            let _ = remove_dir_if_exists(
                &self
                    .artifacts_dir
                    .join(record.identity.as_str())
                    .join(&record.target_name),
            );
        }

        failures
    }

    fn final_dir(&self, identity: &PackageIdentity, target: &str) -> PathBuf {
        self.artifacts_dir.join(identity.as_str()).join(target)
    }

    fn staging_dir(&self, identity: &PackageIdentity, target: &str) -> PathBuf {
        self.artifacts_dir
            .join(EXTRACT_DIR)
            .join(identity.as_str())
            .join(target)
    }

    fn process(
        &self,
        request: &ArtifactRequest,
        previous: Option<&ManagedArtifact>,
    ) -> Result<Committed, ArtifactError> {
        match &request.spec {
            ArtifactSpec::Local { path } => self.process_local(request, previous, path),
            ArtifactSpec::LocalArchive { path } => {
                self.process_local_archive(request, previous, path)
            }
            ArtifactSpec::Remote { url, checksum } => {
                self.process_remote(request, previous, url, checksum)
            }
            ArtifactSpec::RemoteIndex { url, checksum } => {
                self.process_remote_index(request, previous, url, checksum)
            }
        }
    }

    fn process_local(
        &self,
        request: &ArtifactRequest,
        previous: Option<&ManagedArtifact>,
        path: &Path,
    ) -> Result<Committed, ArtifactError> {
        let artifact_dir = find_artifact_dir(path)?;
        let source = ArtifactSource::Local { checksum: None };

        if let Some(prev) = previous {
            if prev.source == source && prev.path == artifact_dir {
                return Ok(Committed {
                    record: prev.clone(),
                    from_cache: true,
                });
            }
            self.clean_previous(request, prev, &source);
        }

        Ok(Committed {
            record: ManagedArtifact {
                identity: request.identity.clone(),
                target_name: request.target_name.clone(),
                path: artifact_dir.clone(),
                kind: extension_of(&artifact_dir),
                updated_at: chrono::Utc::now().to_rfc3339(),
                source,
            },
            from_cache: false,
        })
    }

    fn process_local_archive(
        &self,
        request: &ArtifactRequest,
        previous: Option<&ManagedArtifact>,
        path: &Path,
    ) -> Result<Committed, ArtifactError> {
        let data = fs::read(path)?;
        let checksum = checksum_of(&data);
        let source = ArtifactSource::Local {
            checksum: Some(checksum),
        };

        if let Some(prev) = previous {
            if prev.source == source && prev.path.exists() {
                return Ok(Committed {
                    record: prev.clone(),
                    from_cache: true,
                });
            }
            self.clean_previous(request, prev, &source);
        }

        let (artifact_path, kind) =
            self.extract_and_commit(request, &path.display().to_string(), &data)?;
        Ok(Committed {
            record: ManagedArtifact {
                identity: request.identity.clone(),
                target_name: request.target_name.clone(),
                path: artifact_path,
                kind,
                updated_at: chrono::Utc::now().to_rfc3339(),
                source,
            },
            from_cache: false,
        })
    }

    fn process_remote(
        &self,
        request: &ArtifactRequest,
        previous: Option<&ManagedArtifact>,
        url: &str,
        checksum: &str,
    ) -> Result<Committed, ArtifactError> {
        let source = ArtifactSource::Remote {
            url: url.to_string(),
            checksum: checksum.to_string(),
        };

        if let Some(prev) = previous {
            if prev.source == source && prev.path.exists() {
                self.delegate.artifact_ready(url, true);
                return Ok(Committed {
                    record: prev.clone(),
                    from_cache: true,
                });
            }
            // Same content address, different expected bytes: the
            // manifest changed only the checksum. That is an integrity
            // error, not a re-download.
            if let ArtifactSource::Remote {
                url: prev_url,
                checksum: prev_checksum,
            } = &prev.source
            {
                if prev_url == url && prev_checksum != checksum && prev.path.exists() {
                    return Err(ArtifactError::ChangedChecksum {
                        target: request.target_name.clone(),
                    });
                }
            }
            self.clean_previous(request, prev, &source);
        }

        self.delegate.downloading_artifact(url);
        let data = self.transport.fetch(url)?;
        let actual = checksum_of(&data);
        if actual != checksum {
            return Err(ArtifactError::ChecksumMismatch {
                origin: url.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }

        let (artifact_path, kind) = self.extract_and_commit(request, url, &data)?;
        self.delegate.artifact_ready(url, false);
        Ok(Committed {
            record: ManagedArtifact {
                identity: request.identity.clone(),
                target_name: request.target_name.clone(),
                path: artifact_path,
                kind,
                updated_at: chrono::Utc::now().to_rfc3339(),
                source,
            },
            from_cache: false,
        })
    }

    fn process_remote_index(
        &self,
        request: &ArtifactRequest,
        previous: Option<&ManagedArtifact>,
        url: &str,
        checksum: &str,
    ) -> Result<Committed, ArtifactError> {
        // The record stores the index's own address, so an unchanged
        // index skips without consulting the network.
        let source = ArtifactSource::Remote {
            url: url.to_string(),
            checksum: checksum.to_string(),
        };

        if let Some(prev) = previous {
            if prev.source == source && prev.path.exists() {
                self.delegate.artifact_ready(url, true);
                return Ok(Committed {
                    record: prev.clone(),
                    from_cache: true,
                });
            }
            if let ArtifactSource::Remote {
                url: prev_url,
                checksum: prev_checksum,
            } = &prev.source
            {
                if prev_url == url && prev_checksum != checksum && prev.path.exists() {
                    return Err(ArtifactError::ChangedChecksum {
                        target: request.target_name.clone(),
                    });
                }
            }
            self.clean_previous(request, prev, &source);
        }

        // The index document is itself checksummed before being parsed.
        let index_data = self.transport.fetch(url)?;
        let actual = checksum_of(&index_data);
        if actual != checksum {
            return Err(ArtifactError::ChecksumMismatch {
                origin: url.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }
        let index: ArtifactIndex =
            serde_json::from_slice(&index_data).map_err(|e| ArtifactError::InvalidArchive {
                origin: url.to_string(),
                reason: format!("malformed index: {e}"),
            })?;

        let triple = host_triple();
        let entry = index
            .archives
            .iter()
            .find(|a| a.supported_triples.iter().any(|t| t == &triple))
            .ok_or_else(|| ArtifactError::NoSupportedArchive {
                url: url.to_string(),
                triple: triple.clone(),
            })?;

        let archive_url = resolve_relative(url, &entry.url);
        self.delegate.downloading_artifact(&archive_url);
        let data = self.transport.fetch(&archive_url)?;
        let actual = checksum_of(&data);
        if actual != entry.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                origin: archive_url.clone(),
                expected: entry.checksum.clone(),
                actual,
            });
        }

        let (artifact_path, kind) = self.extract_and_commit(request, &archive_url, &data)?;
        self.delegate.artifact_ready(&archive_url, false);
        Ok(Committed {
            record: ManagedArtifact {
                identity: request.identity.clone(),
                target_name: request.target_name.clone(),
                path: artifact_path,
                kind,
                updated_at: chrono::Utc::now().to_rfc3339(),
                source,
            },
            from_cache: false,
        })
    }

    /// A source-kind change (local ↔ local-archive ↔ remote) removes the
    /// previous final artifact before the new one is committed. Local
    /// in-place artifacts are the user's; only our committed directory is
    /// cleaned.
    fn clean_previous(
        &self,
        request: &ArtifactRequest,
        previous: &ManagedArtifact,
        next: &ArtifactSource,
    ) {
        if previous.source.transition_kind() != next.transition_kind() {
            let _ =
                remove_dir_if_exists(&self.final_dir(&request.identity, &request.target_name));
        }
    }

    /// Extract an archive into the private staging area, locate the
    /// artifact inside it, and move it into the final directory.
    fn extract_and_commit(
        &self,
        request: &ArtifactRequest,
        source_desc: &str,
        data: &[u8],
    ) -> Result<(PathBuf, String), ArtifactError> {
        let staging = self.staging_dir(&request.identity, &request.target_name);
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)?;

        let result = (|| {
            extract_archive(source_desc, data, &staging)?;
            let artifact = locate_artifact(&staging, source_desc)?;
            let kind = extension_of(&artifact);

            let final_dir = self.final_dir(&request.identity, &request.target_name);
            remove_dir_if_exists(&final_dir)?;
            fs::create_dir_all(&final_dir)?;
            let file_name = artifact
                .file_name()
                .map(std::ffi::OsStr::to_os_string)
                .unwrap_or_default();
            let final_path = final_dir.join(file_name);
            fs::rename(&artifact, &final_path)?;
            Ok((final_path, kind))
        })();

        // The staging area is cleaned after each commit, success or not.
        let _ = remove_dir_if_exists(&staging);
        result
    }
}

/// Extract a `.zip` or `.tar.gz` archive into `destination`.
fn extract_archive(
    source_desc: &str,
    data: &[u8],
    destination: &Path,
) -> Result<(), ArtifactError> {
    let lower = source_desc.to_lowercase();
    if lower.ends_with(".zip") {
        extract_zip(source_desc, data, destination)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        extract_tar_gz(source_desc, data, destination)
    } else {
        Err(ArtifactError::UnsupportedFormat(source_desc.to_string()))
    }
}

fn extract_zip(source_desc: &str, data: &[u8], destination: &Path) -> Result<(), ArtifactError> {
    let reader = io::Cursor::new(data);
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| ArtifactError::InvalidArchive {
            origin: source_desc.to_string(),
            reason: e.to_string(),
        })?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ArtifactError::InvalidArchive {
                origin: source_desc.to_string(),
                reason: e.to_string(),
            })?;
        let Some(relative) = entry.enclosed_name() else {
            // Entries escaping the destination are dropped.
            continue;
        };
        let out = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&out)?;
            io::copy(&mut entry, &mut file)?;
        }
    }
    Ok(())
}

fn extract_tar_gz(
    source_desc: &str,
    data: &[u8],
    destination: &Path,
) -> Result<(), ArtifactError> {
    let decoder = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(destination)
        .map_err(|e| ArtifactError::InvalidArchive {
            origin: source_desc.to_string(),
            reason: e.to_string(),
        })
}

/// Incidental OS metadata tolerated alongside the real artifact.
fn is_os_metadata(name: &str) -> bool {
    name == ".DS_Store" || name == "__MACOSX" || name.starts_with("._")
}

/// Locate the artifact inside an extraction directory.
///
/// A single top-level directory that is not itself an artifact is treated
/// as a wrapper and stripped (with only OS metadata tolerated alongside
/// it). The artifact's name need not match the target; an empty archive
/// or one whose content is not a directory is invalid.
fn locate_artifact(extracted: &Path, source_desc: &str) -> Result<PathBuf, ArtifactError> {
    let mut current = extracted.to_path_buf();

    // One wrapper layer per nesting level, bounded so a pathological
    // archive cannot loop.
    for depth in 0..4 {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_os_metadata(&name) {
                continue;
            }
            if entry.path().is_dir() {
                dirs.push(entry.path());
            } else {
                files.push(name);
            }
        }

        if let Some(artifact) = dirs.iter().find(|d| has_artifact_extension(d)) {
            return Ok(artifact.clone());
        }

        if dirs.len() == 1 && files.is_empty() {
            // A plain wrapper directory around the real content.
            current = dirs.remove(0);
            continue;
        }

        if depth == 0 {
            // The top level is loose files, empty, or ambiguous.
            return Err(ArtifactError::InvalidArchive {
                origin: source_desc.to_string(),
                reason: if dirs.is_empty() && files.is_empty() {
                    "archive is empty".to_string()
                } else if dirs.is_empty() {
                    "archive content is not a directory".to_string()
                } else {
                    "no recognizable artifact in archive".to_string()
                },
            });
        }

        // We descended through a wrapper and hit real content with no
        // recognized extension: the directory itself is the artifact.
        // The target name need not match the artifact's own name.
        return Ok(current);
    }

    Ok(current)
}

fn has_artifact_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |ext| {
            ARTIFACT_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        })
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

/// Validate that a local path is, or directly contains, a recognizable
/// binary-artifact directory.
fn find_artifact_dir(path: &Path) -> Result<PathBuf, ArtifactError> {
    if path.is_dir() && has_artifact_extension(path) {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_dir() && has_artifact_extension(&entry.path()) {
                return Ok(entry.path());
            }
        }
    }
    Err(ArtifactError::NotABinaryArtifact {
        path: path.to_path_buf(),
    })
}

/// Resolve an index entry's URL against the index document's URL.
fn resolve_relative(index_url: &str, entry_url: &str) -> String {
    if entry_url.contains("://") {
        return entry_url.to_string();
    }
    match index_url.rsplit_once('/') {
        Some((base, _)) => format!("{base}/{entry_url}"),
        None => entry_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NullDelegate;
    use crate::testutil::{zip_archive, FakeTransport, RecordingDelegate};
    use tempfile::TempDir;

    fn identity(s: &str) -> PackageIdentity {
        PackageIdentity::from_location(s).unwrap()
    }

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap()
    }

    fn request(name: &str, target: &str, spec: ArtifactSpec) -> ArtifactRequest {
        ArtifactRequest {
            identity: identity(name),
            target_name: target.to_string(),
            spec,
        }
    }

    /// A zip holding `WidgetKit.bundle/lib.a`, wrapped one level deep
    /// with macOS metadata alongside.
    fn wrapped_bundle_zip() -> Vec<u8> {
        zip_archive(&[
            ("wrapper/", None),
            ("wrapper/.DS_Store", Some(b"junk".as_ref())),
            ("wrapper/WidgetKit.bundle/", None),
            ("wrapper/WidgetKit.bundle/lib.a", Some(b"obj".as_ref())),
        ])
    }

    #[test]
    fn remote_download_extracts_and_records() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = wrapped_bundle_zip();
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/widgetkit.zip", data);

        let delegate = RecordingDelegate::default();
        let manager = ArtifactManager::new(tmp.path(), &transport, &delegate, &pool);

        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum: checksum.clone(),
            },
        )];
        let mut state = WorkspaceState::new();
        let failures = manager.reconcile(&requests, &mut state);
        assert!(failures.is_empty());

        let record = state.artifact(&identity("widget"), "WidgetKit").unwrap();
        assert_eq!(record.kind, "bundle");
        assert_eq!(
            record.path,
            tmp.path().join("widget/WidgetKit/WidgetKit.bundle")
        );
        assert!(record.path.join("lib.a").exists());
        assert_eq!(
            record.source,
            ArtifactSource::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum,
            }
        );
        // Staging area is cleaned after commit.
        assert!(!tmp.path().join(EXTRACT_DIR).join("widget/WidgetKit").exists());
        assert_eq!(delegate.downloads().len(), 1);
    }

    #[test]
    fn unchanged_artifact_skips_download() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = wrapped_bundle_zip();
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/widgetkit.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum,
            },
        )];

        let mut state = WorkspaceState::new();
        assert!(manager.reconcile(&requests, &mut state).is_empty());
        assert!(manager.reconcile(&requests, &mut state).is_empty());

        // Exactly one download across both passes.
        assert_eq!(transport.hits(), 1);
    }

    #[test]
    fn checksum_only_change_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = wrapped_bundle_zip();
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/widgetkit.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let mut state = WorkspaceState::new();

        let good = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum,
            },
        )];
        assert!(manager.reconcile(&good, &mut state).is_empty());

        let tampered = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum: "0".repeat(64),
            },
        )];
        let failures = manager.reconcile(&tampered, &mut state);
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].error,
            ArtifactError::ChangedChecksum { .. }
        ));
    }

    #[test]
    fn url_change_with_new_checksum_redownloads() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = wrapped_bundle_zip();
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/v1/widgetkit.zip", data.clone());
        transport.add("https://cdn.example/v2/widgetkit.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let mut state = WorkspaceState::new();

        let v1 = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/v1/widgetkit.zip".into(),
                checksum: checksum.clone(),
            },
        )];
        assert!(manager.reconcile(&v1, &mut state).is_empty());

        let v2 = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/v2/widgetkit.zip".into(),
                checksum,
            },
        )];
        assert!(manager.reconcile(&v2, &mut state).is_empty());
        assert_eq!(transport.hits(), 2);
    }

    #[test]
    fn corrupt_download_is_a_checksum_mismatch() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        transport.add("https://cdn.example/widgetkit.zip", wrapped_bundle_zip());

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum: "f".repeat(64),
            },
        )];
        let mut state = WorkspaceState::new();
        let failures = manager.reconcile(&requests, &mut state);
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].error,
            ArtifactError::ChecksumMismatch { .. }
        ));
        assert!(state.artifact(&identity("widget"), "WidgetKit").is_none());
    }

    #[test]
    fn one_bad_target_does_not_abort_siblings() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = wrapped_bundle_zip();
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/good.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [
            request(
                "widget",
                "Good",
                ArtifactSpec::Remote {
                    url: "https://cdn.example/good.zip".into(),
                    checksum,
                },
            ),
            request(
                "widget",
                "Bad",
                ArtifactSpec::Remote {
                    url: "https://cdn.example/missing.zip".into(),
                    checksum: "0".repeat(64),
                },
            ),
        ];
        let mut state = WorkspaceState::new();
        let failures = manager.reconcile(&requests, &mut state);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].target_name, "Bad");
        assert!(state.artifact(&identity("widget"), "Good").is_some());
    }

    #[test]
    fn archive_with_only_files_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = zip_archive(&[("loose.a", Some(b"obj".as_ref()))]);
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/flat.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "Flat",
            ArtifactSpec::Remote {
                url: "https://cdn.example/flat.zip".into(),
                checksum,
            },
        )];
        let mut state = WorkspaceState::new();
        let failures = manager.reconcile(&requests, &mut state);
        assert!(matches!(
            failures[0].error,
            ArtifactError::InvalidArchive { .. }
        ));
    }

    #[test]
    fn unwrapped_unrecognized_directory_is_the_artifact() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        // No recognized extension anywhere; the sole directory wins.
        let data = zip_archive(&[
            ("tools/", None),
            ("tools/bin/", None),
            ("tools/bin/widgetc", Some(b"elf".as_ref())),
        ]);
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/tools.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "Tools",
            ArtifactSpec::Remote {
                url: "https://cdn.example/tools.zip".into(),
                checksum,
            },
        )];
        let mut state = WorkspaceState::new();
        assert!(manager.reconcile(&requests, &mut state).is_empty());

        let record = state.artifact(&identity("widget"), "Tools").unwrap();
        // The target name need not match the artifact's own name.
        assert!(record.path.ends_with("widget/Tools/bin"));
    }

    #[test]
    fn local_artifact_used_in_place() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();

        let local = tmp.path().join("prebuilt");
        fs::create_dir_all(local.join("WidgetKit.bundle")).unwrap();
        fs::write(local.join("WidgetKit.bundle/lib.a"), b"obj").unwrap();

        let artifacts = tmp.path().join("artifacts");
        let manager = ArtifactManager::new(&artifacts, &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Local {
                path: local.clone(),
            },
        )];
        let mut state = WorkspaceState::new();
        assert!(manager.reconcile(&requests, &mut state).is_empty());

        let record = state.artifact(&identity("widget"), "WidgetKit").unwrap();
        assert_eq!(record.path, local.join("WidgetKit.bundle"));
        assert_eq!(record.source, ArtifactSource::Local { checksum: None });
    }

    #[test]
    fn local_path_without_artifact_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();

        let local = tmp.path().join("prebuilt");
        fs::create_dir_all(&local).unwrap();

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Local { path: local },
        )];
        let mut state = WorkspaceState::new();
        let failures = manager.reconcile(&requests, &mut state);
        assert!(matches!(
            failures[0].error,
            ArtifactError::NotABinaryArtifact { .. }
        ));
    }

    #[test]
    fn index_selects_matching_platform() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();

        let data = wrapped_bundle_zip();
        let archive_checksum = checksum_of(&data);
        transport.add("https://cdn.example/widgetkit-host.zip", data);

        let index = serde_json::json!({
            "schemaVersion": "1.0",
            "archives": [
                {
                    "url": "widgetkit-other.zip",
                    "checksum": "0".repeat(64),
                    "supportedTriples": ["wasm32-unknown-unknown"],
                },
                {
                    "url": "widgetkit-host.zip",
                    "checksum": archive_checksum,
                    "supportedTriples": [host_triple()],
                },
            ],
        })
        .to_string()
        .into_bytes();
        let index_checksum = checksum_of(&index);
        transport.add("https://cdn.example/widgetkit.json", index);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::RemoteIndex {
                url: "https://cdn.example/widgetkit.json".into(),
                checksum: index_checksum.clone(),
            },
        )];
        let mut state = WorkspaceState::new();
        assert!(manager.reconcile(&requests, &mut state).is_empty());

        let record = state.artifact(&identity("widget"), "WidgetKit").unwrap();
        assert_eq!(record.kind, "bundle");
        // The record stores the index address, so unchanged indexes skip.
        assert_eq!(
            record.source,
            ArtifactSource::Remote {
                url: "https://cdn.example/widgetkit.json".into(),
                checksum: index_checksum,
            }
        );
    }

    #[test]
    fn index_without_matching_platform_fails() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();

        let index = serde_json::json!({
            "archives": [{
                "url": "widgetkit.zip",
                "checksum": "0".repeat(64),
                "supportedTriples": ["wasm32-unknown-unknown"],
            }],
        })
        .to_string()
        .into_bytes();
        let index_checksum = checksum_of(&index);
        transport.add("https://cdn.example/widgetkit.json", index);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::RemoteIndex {
                url: "https://cdn.example/widgetkit.json".into(),
                checksum: index_checksum,
            },
        )];
        let mut state = WorkspaceState::new();
        let failures = manager.reconcile(&requests, &mut state);
        assert!(matches!(
            failures[0].error,
            ArtifactError::NoSupportedArchive { .. }
        ));
    }

    #[test]
    fn stale_records_are_pruned_with_their_directories() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();
        let data = wrapped_bundle_zip();
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/widgetkit.zip", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.zip".into(),
                checksum,
            },
        )];
        let mut state = WorkspaceState::new();
        assert!(manager.reconcile(&requests, &mut state).is_empty());
        let final_dir = tmp.path().join("widget/WidgetKit");
        assert!(final_dir.exists());

        // The target disappeared from the graph.
        assert!(manager.reconcile(&[], &mut state).is_empty());
        assert!(state.artifact(&identity("widget"), "WidgetKit").is_none());
        assert!(!final_dir.exists());
    }

    #[test]
    fn tar_gz_archives_extract() {
        let tmp = TempDir::new().unwrap();
        let pool = pool();
        let transport = FakeTransport::new();

        let data = crate::testutil::tar_gz_archive(&[(
            "WidgetKit.bundle/lib.a",
            b"obj".as_ref(),
        )]);
        let checksum = checksum_of(&data);
        transport.add("https://cdn.example/widgetkit.tar.gz", data);

        let manager = ArtifactManager::new(tmp.path(), &transport, &NullDelegate, &pool);
        let requests = [request(
            "widget",
            "WidgetKit",
            ArtifactSpec::Remote {
                url: "https://cdn.example/widgetkit.tar.gz".into(),
                checksum,
            },
        )];
        let mut state = WorkspaceState::new();
        assert!(manager.reconcile(&requests, &mut state).is_empty());
        assert_eq!(
            state.artifact(&identity("widget"), "WidgetKit").unwrap().kind,
            "bundle"
        );
    }
}
