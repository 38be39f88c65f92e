//! The constraint-solver contract.
//!
//! The solving algorithm itself is an external collaborator: given the
//! full constraint set (and the current pins, when resolution should stay
//! close to them) it returns bound versions per identity or a structured
//! unsatisfiable-constraints explanation, which this engine propagates
//! verbatim.

use crate::identity::{PackageIdentity, PackageLocation};
use crate::pins::PinStore;
use crate::requirement::Requirement;
use semver::Version;
use thiserror::Error;

/// Errors surfaced by solving.
#[derive(Error, Debug)]
pub enum SolveError {
    /// The constraint set has no solution. The explanation chain comes
    /// from the solver and is reported verbatim.
    #[error("dependencies could not be resolved:\n{explanation}")]
    Unsatisfiable { explanation: String },

    #[error("no known versions for package '{0}'")]
    UnknownPackage(PackageIdentity),

    #[error("version catalog error: {0}")]
    Catalog(String),
}

/// One required constraint, in manifest declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub identity: PackageIdentity,
    pub location: PackageLocation,
    pub requirement: Requirement,
}

/// What a solver bound one identity to. Revisions are resolved later, at
/// materialization time; the solver works at the requirement level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundState {
    Version(Version),
    Branch { name: String },
    Revision { revision: String },
    Local,
}

/// A bound resolution for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub identity: PackageIdentity,
    pub location: PackageLocation,
    pub bound: BoundState,
}

/// Available-version lookup consumed by solver implementations.
pub trait VersionCatalog: Send + Sync {
    /// Known versions for a package, in any order.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be consulted.
    fn versions(&self, location: &PackageLocation) -> Result<Vec<Version>, SolveError>;
}

/// The external solver contract.
pub trait DependencySolver: Send + Sync {
    /// Solve `constraints` into one binding per identity.
    ///
    /// `pins` carries the current pin set when resolution is expected to
    /// stay close to it; solvers are free to ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`SolveError::Unsatisfiable`] with the solver's
    /// explanation chain when no assignment exists.
    fn solve(&self, constraints: &[Constraint], pins: &PinStore)
        -> Result<Vec<Binding>, SolveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsatisfiable_propagates_explanation_verbatim() {
        let err = SolveError::Unsatisfiable {
            explanation: "widget 1.0.0 requires gadget ^2, but gadget is pinned to 1.4.0".into(),
        };
        assert!(err
            .to_string()
            .contains("widget 1.0.0 requires gadget ^2, but gadget is pinned to 1.4.0"));
    }
}
