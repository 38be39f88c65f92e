//! The precompute-resolution decision: should the constraint solver run
//! at all?
//!
//! This is a pure diff of the required constraint set against the current
//! pins and managed state. It reads its two input snapshots and nothing
//! else: no disk, no network. Pins are the authority for what was
//! resolved; managed state is consulted first because it reflects
//! transitions (edits, local switches) the pin file deliberately does not.

use crate::identity::PackageIdentity;
use crate::pins::PinStore;
use crate::requirement::{Requirement, RequirementKind};
use crate::solve::Constraint;
use crate::state::WorkspaceState;
use std::collections::BTreeSet;

/// Whether resolution must run, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NotRequired,
    Required(Reason),
}

/// Why resolution must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Reachable identities with no corresponding pin.
    NewPackages(Vec<PackageIdentity>),

    /// Pinned identities no longer reachable from the required
    /// constraints.
    RemovedPackages(Vec<PackageIdentity>),

    /// The requirement kind changed for a package. Reported against the
    /// first mismatching identity in manifest declaration order.
    PackageRequirementChange {
        identity: PackageIdentity,
        from_state: String,
        to_requirement: Requirement,
    },

    /// Some other drift, described for humans.
    Other(String),
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewPackages(ids) => {
                write!(f, "new packages: {}", join_identities(ids))
            }
            Self::RemovedPackages(ids) => {
                write!(f, "removed packages: {}", join_identities(ids))
            }
            Self::PackageRequirementChange {
                identity,
                from_state,
                to_requirement,
            } => write!(
                f,
                "'{identity}' changed from {from_state} to {to_requirement}"
            ),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

fn join_identities(ids: &[PackageIdentity]) -> String {
    ids.iter()
        .map(PackageIdentity::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decide whether resolution must run for `required` given the current
/// `pins` and managed `state`.
#[must_use]
pub fn precompute(required: &[Constraint], pins: &PinStore, state: &WorkspaceState) -> Decision {
    // First occurrence wins; declaration order is the tie-break for
    // mismatch reporting.
    let mut seen = BTreeSet::new();
    let ordered: Vec<&Constraint> = required
        .iter()
        .filter(|c| seen.insert(c.identity.clone()))
        .collect();
    let reachable: BTreeSet<&PackageIdentity> = ordered.iter().map(|c| &c.identity).collect();

    // Reachable identities with no pin force resolution.
    let new_packages: Vec<PackageIdentity> = ordered
        .iter()
        .filter(|c| pins.get(&c.identity).is_none())
        .map(|c| c.identity.clone())
        .collect();
    if !new_packages.is_empty() {
        return Decision::Required(Reason::NewPackages(new_packages));
    }

    // Kind drift, first mismatch in declaration order. Edited
    // dependencies answer through their based-on snapshot; an edit with
    // no snapshot never triggers re-resolution by itself.
    for constraint in &ordered {
        let (current_kind, description) = match state.dependency(&constraint.identity) {
            Some(managed) => match managed.state.requirement_kind() {
                Some(kind) => (kind, managed.state.to_string()),
                None => continue,
            },
            None => match pins.get(&constraint.identity) {
                Some(pin) => (pin.state.kind(), pin.state.to_string()),
                None => continue,
            },
        };

        if current_kind != constraint.requirement.kind() {
            return Decision::Required(Reason::PackageRequirementChange {
                identity: constraint.identity.clone(),
                from_state: description,
                to_requirement: constraint.requirement.clone(),
            });
        }
    }

    // A pinned version that no longer satisfies the declared range (for
    // example a manifest edit narrowed it) forces resolution.
    for constraint in &ordered {
        if constraint.requirement.kind() != RequirementKind::Version {
            continue;
        }
        let Some(pin) = pins.get(&constraint.identity) else {
            continue;
        };
        if let Some(version) = pin.state.version() {
            if !constraint.requirement.satisfied_by(version) {
                return Decision::Required(Reason::Other(format!(
                    "pinned version {version} of '{}' no longer satisfies the declared \
                     requirement {}",
                    constraint.identity, constraint.requirement
                )));
            }
        }
    }

    // Pins for identities that fell out of the graph: resolution is
    // required whenever the reachable set differs from the pinned set,
    // but removals are only reported when they are the sole change.
    let removed: Vec<PackageIdentity> = pins
        .identities()
        .filter(|id| !reachable.contains(id))
        .cloned()
        .collect();
    if !removed.is_empty() {
        return Decision::Required(Reason::RemovedPackages(removed));
    }

    Decision::NotRequired
}
