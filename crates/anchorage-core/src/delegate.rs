//! Workspace observability.
//!
//! Long-running operations report progress through a [`WorkspaceDelegate`]
//! rather than a logger, so callers decide how (and whether) to surface
//! them. Every method has a no-op default.

use crate::identity::{PackageIdentity, PackageLocation};
use crate::precompute::Reason;
use crate::vcs::CheckoutTarget;

/// Receives workspace events. Implementations must be shareable across
/// the worker pool.
pub trait WorkspaceDelegate: Send + Sync {
    /// Resolution is about to run.
    fn will_resolve(&self, reason: &Reason) {
        let _ = reason;
    }

    /// A repository is about to be fetched.
    fn fetching(&self, identity: &PackageIdentity, location: &PackageLocation) {
        let _ = (identity, location);
    }

    /// A working copy is being checked out.
    fn checking_out(&self, identity: &PackageIdentity, target: &CheckoutTarget) {
        let _ = (identity, target);
    }

    /// A working copy is being removed.
    fn removing(&self, identity: &PackageIdentity) {
        let _ = identity;
    }

    /// A binary artifact is about to be downloaded.
    fn downloading_artifact(&self, url: &str) {
        let _ = url;
    }

    /// A binary artifact finished, either downloaded or satisfied by the
    /// existing managed record.
    fn artifact_ready(&self, url: &str, from_cache: bool) {
        let _ = (url, from_cache);
    }
}

/// A delegate that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDelegate;

impl WorkspaceDelegate for NullDelegate {}
