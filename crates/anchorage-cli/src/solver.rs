//! A pin-respecting, highest-satisfying-version solver.
//!
//! The engine consumes solvers as black boxes; this one binds each
//! constraint independently, preferring the already-pinned version when
//! it still satisfies the declared requirement so unrelated packages do
//! not move on every resolution.

use anchorage_core::{
    Binding, BoundState, Constraint, DependencySolver, PinStore, Requirement, SolveError,
    VersionCatalog,
};
use std::collections::BTreeSet;

pub struct CatalogSolver<'a> {
    catalog: &'a dyn VersionCatalog,
}

impl<'a> CatalogSolver<'a> {
    #[must_use]
    pub fn new(catalog: &'a dyn VersionCatalog) -> Self {
        Self { catalog }
    }

    fn bind(&self, constraint: &Constraint, pins: &PinStore) -> Result<BoundState, SolveError> {
        match &constraint.requirement {
            Requirement::Local => Ok(BoundState::Local),
            Requirement::Branch { name } => Ok(BoundState::Branch { name: name.clone() }),
            Requirement::Revision { revision } => Ok(BoundState::Revision {
                revision: revision.clone(),
            }),
            requirement => {
                if let Some(pinned) = pins
                    .get(&constraint.identity)
                    .and_then(|pin| pin.state.version())
                {
                    if requirement.satisfied_by(pinned) {
                        return Ok(BoundState::Version(pinned.clone()));
                    }
                }

                let known = self.catalog.versions(&constraint.location)?;
                if known.is_empty() {
                    return Err(SolveError::UnknownPackage(constraint.identity.clone()));
                }
                known
                    .iter()
                    .filter(|v| requirement.satisfied_by(v))
                    .max()
                    .cloned()
                    .map(BoundState::Version)
                    .ok_or_else(|| SolveError::Unsatisfiable {
                        explanation: format!(
                            "no version of '{}' satisfies {} (known: {})",
                            constraint.identity,
                            requirement,
                            known
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    })
            }
        }
    }
}

impl DependencySolver for CatalogSolver<'_> {
    fn solve(
        &self,
        constraints: &[Constraint],
        pins: &PinStore,
    ) -> Result<Vec<Binding>, SolveError> {
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
