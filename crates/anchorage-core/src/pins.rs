//! The pin store: the durable, versioned record of resolved dependency
//! state (the lock file).
//!
//! Pins persist the *original* location spelling, never the canonical
//! form. The file's schema version is chosen as the minimum tools-version
//! major across all root manifests; schema 1 cannot encode branch pins and
//! degrades them to their resolved revision on write.

use crate::fsutil::atomic_write;
use crate::identity::PackageIdentity;
use crate::manifest::ToolsVersion;
use crate::requirement::RequirementKind;
use crate::vcs::CheckoutState;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// The pin file name at the workspace root.
pub const PIN_FILE: &str = "anchorage.lock";

/// The newest schema this engine writes and reads.
pub const CURRENT_SCHEMA: u32 = 2;

/// Errors that can occur when working with the pin store.
#[derive(Error, Debug)]
pub enum PinError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse pin file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize pin file: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unsupported pin file schema version {0} (supported: 1..={CURRENT_SCHEMA})")]
    UnsupportedSchema(u32),
}

/// The resolved state snapshot recorded for one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PinState {
    /// A tagged version and the revision it resolved to.
    Version {
        version: Version,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
    },

    /// A branch and the revision its tip resolved to.
    Branch { name: String, revision: String },

    /// A bare revision.
    Revision { revision: String },

    /// A local path dependency; nothing to pin beyond its presence.
    Local,
}

impl PinState {
    /// The requirement kind this pin corresponds to.
    #[must_use]
    pub fn kind(&self) -> RequirementKind {
        match self {
            Self::Version { .. } => RequirementKind::Version,
            Self::Branch { .. } => RequirementKind::Branch,
            Self::Revision { .. } => RequirementKind::Revision,
            Self::Local => RequirementKind::Local,
        }
    }

    /// The pinned version, when version-bound.
    #[must_use]
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Version { version, .. } => Some(version),
            _ => None,
        }
    }
}

impl From<&CheckoutState> for PinState {
    fn from(state: &CheckoutState) -> Self {
        match state {
            CheckoutState::Version { version, revision } => Self::Version {
                version: version.clone(),
                revision: Some(revision.clone()),
            },
            CheckoutState::Branch { name, revision } => Self::Branch {
                name: name.clone(),
                revision: revision.clone(),
            },
            CheckoutState::Revision { revision } => Self::Revision {
                revision: revision.clone(),
            },
        }
    }
}

impl std::fmt::Display for PinState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version { version, .. } => write!(f, "{version}"),
            Self::Branch { name, revision } => write!(f, "{name} ({revision})"),
            Self::Revision { revision } => write!(f, "{revision}"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// One pinned package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    /// The package identity.
    pub identity: PackageIdentity,

    /// The original location spelling, kept verbatim for display.
    pub location: String,

    /// The resolved state snapshot.
    pub state: PinState,
}

/// On-disk shape of the pin file.
#[derive(Debug, Serialize, Deserialize)]
struct PinFile {
    #[serde(rename = "schema-version")]
    schema_version: u32,

    #[serde(default, rename = "pin")]
    pins: Vec<Pin>,
}

/// The set of pins plus the schema version policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinStore {
    schema_version: u32,
    pins: BTreeMap<PackageIdentity, Pin>,
}

impl Default for PinStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PinStore {
    /// An empty store at the newest schema.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA,
            pins: BTreeMap::new(),
        }
    }

    /// The schema version implied by a set of root tools versions: the
    /// minimum major, clamped to the supported range.
    #[must_use]
    pub fn schema_for_tools<'a>(tools: impl Iterator<Item = &'a ToolsVersion>) -> u32 {
        tools
            .map(|t| t.major)
            .min()
            .unwrap_or(CURRENT_SCHEMA)
            .clamp(1, CURRENT_SCHEMA)
    }

    /// Load the store from `path`, returning `None` if the file does not
    /// exist (distinct from a present-but-unreadable file).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or carries an unsupported schema.
    pub fn load(path: &Path) -> Result<Option<Self>, PinError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: PinFile = toml::from_str(&content)?;
        if file.schema_version == 0 || file.schema_version > CURRENT_SCHEMA {
            return Err(PinError::UnsupportedSchema(file.schema_version));
        }
        let pins = file
            .pins
            .into_iter()
            .map(|p| (p.identity.clone(), p))
            .collect();
        Ok(Some(Self {
            schema_version: file.schema_version,
            pins,
        }))
    }

    /// Save the store to `path` atomically.
    ///
    /// Schema 1 cannot encode branch pins; they are degraded to their
    /// resolved revision on write.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), PinError> {
        let pins = self
            .pins
            .values()
            .map(|pin| {
                let state = match (&pin.state, self.schema_version) {
                    (PinState::Branch { revision, .. }, 1) => PinState::Revision {
                        revision: revision.clone(),
                    },
                    (state, _) => state.clone(),
                };
                Pin {
                    state,
                    ..pin.clone()
                }
            })
            .collect();
        let file = PinFile {
            schema_version: self.schema_version,
            pins,
        };
        let content = toml::to_string_pretty(&file)?;
        atomic_write(path, &content)?;
        Ok(())
    }

    /// The schema version this store writes at.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Pin the store to a schema version.
    pub fn set_schema_version(&mut self, version: u32) {
        self.schema_version = version.clamp(1, CURRENT_SCHEMA);
    }

    /// Get a pin by identity.
    #[must_use]
    pub fn get(&self, identity: &PackageIdentity) -> Option<&Pin> {
        self.pins.get(identity)
    }

    /// Add or replace a pin.
    pub fn insert(&mut self, pin: Pin) {
        self.pins.insert(pin.identity.clone(), pin);
    }

    /// Remove a pin.
    pub fn remove(&mut self, identity: &PackageIdentity) -> Option<Pin> {
        self.pins.remove(identity)
    }

    /// All pinned identities.
    pub fn identities(&self) -> impl Iterator<Item = &PackageIdentity> {
        self.pins.keys()
    }

    /// All pins, ordered by identity.
    pub fn iter(&self) -> impl Iterator<Item = &Pin> {
        self.pins.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}
