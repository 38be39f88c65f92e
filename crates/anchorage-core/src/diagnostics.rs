//! Diagnostics collected during a reconciliation pass.
//!
//! Parallel units report into a [`DiagnosticBag`] that preserves emission
//! order, so callers see diagnostics in manifest-declaration order rather
//! than completion order.

use crate::identity::PackageIdentity;

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single diagnostic, optionally tied to a package for traceability.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// The offending package, when one is identifiable.
    pub identity: Option<PackageIdentity>,
    /// The offending location spelling, when one is identifiable.
    pub location: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            identity: None,
            location: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    /// Attach the offending package identity.
    #[must_use]
    pub fn with_identity(mut self, identity: PackageIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Attach the offending location spelling.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(identity) = &self.identity {
            write!(f, " [{identity}]")?;
        }
        Ok(())
    }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Default)]
pub struct DiagnosticBag {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Append all diagnostics from another bag, preserving order.
    pub fn absorb(&mut self, other: DiagnosticBag) {
        self.diagnostics.extend(other.diagnostics);
    }

    /// All diagnostics, in emission order.
    #[must_use]
    pub fn all(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// True if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Take ownership of the collected diagnostics.
    #[must_use]
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bag_preserves_order() {
        let mut bag = DiagnosticBag::new();
        bag.emit(Diagnostic::info("first"));
        bag.emit(Diagnostic::warning("second"));
        bag.emit(Diagnostic::error("third"));

        let messages: Vec<_> = bag.all().iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert!(bag.has_errors());
    }

    #[test]
    fn no_errors_without_error_severity() {
        let mut bag = DiagnosticBag::new();
        bag.emit(Diagnostic::warning("careful"));
        assert!(!bag.has_errors());
    }

    #[test]
    fn display_includes_identity() {
        let diag = Diagnostic::error("duplicate")
            .with_identity(crate::identity::PackageIdentity::from_location("a/widget").unwrap());
        assert_eq!(diag.to_string(), "error: duplicate [widget]");
    }
}
