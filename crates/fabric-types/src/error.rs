//! The shared, crate-spanning error taxonomy.
//!
//! Every component keeps its own `thiserror`-derived error enum for precise,
//! component-local matching — that is the idiomatic way to report "what went
//! wrong here". But callers that sit above several components (the resolver
//! calling the mount-table client calling the transport) need a *stable id*
//! that survives being wrapped several times over, so that e.g. the transport
//! can tell a `ConnectionFailed` apart from an `AuthFailed` without string
//! matching. [`ErrorKind`] is that stable id; [`Error`] is the chain-of-custody
//! wrapper that every component-local error converts into at its boundary.

use std::fmt;

/// A stable identifier for a class of failure, shared across every component.
///
/// Each variant corresponds to one row of the error taxonomy table. Matching
/// on `ErrorKind` is the supported way for upstream code (e.g. the RPC
/// transport's retry policy) to make decisions without depending on a
/// specific component's error enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad endpoint syntax.
    MalformedEndpoint,
    /// Bad name syntax.
    MalformedName,
    /// Resolution walked off the tree.
    NoSuchName,
    /// Resolution failed at the root (empty path).
    NoSuchNameRoot,
    /// The resolver revisited a node it had already visited in this call.
    NamingLoop,
    /// A mount conflicted with an existing mount's `MT` flag.
    MtFlagMismatch,
    /// An ACL update's optimistic-concurrency version did not match.
    BadVersion,
    /// An ancestor or the node itself denied the operation.
    NoAccess,
    /// The authentication handshake failed.
    AuthFailed,
    /// `Bless` was called with a target key the blessing is not bound to.
    PublicKeyMismatch,
    /// A blessing root is not recognized for the given name.
    UnrecognizedRoot,
    /// A caveat could not be attached or evaluated because it is malformed.
    InvalidCaveat,
    /// A mutating operation was attempted on an immutable blessing store.
    ImmutableStore,
    /// The call's context was canceled.
    Canceled,
    /// The call's deadline passed.
    Timeout,
    /// A dial or I/O operation failed; retryable within budget.
    ConnectionFailed,
    /// An invariant was violated; this is a bug.
    Internal,
}

impl ErrorKind {
    /// The stable string id used in error messages and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedEndpoint => "malformed-endpoint",
            ErrorKind::MalformedName => "malformed-name",
            ErrorKind::NoSuchName => "no-such-name",
            ErrorKind::NoSuchNameRoot => "no-such-name-root",
            ErrorKind::NamingLoop => "naming-loop",
            ErrorKind::MtFlagMismatch => "mt-flag-mismatch",
            ErrorKind::BadVersion => "bad-version",
            ErrorKind::NoAccess => "no-access",
            ErrorKind::AuthFailed => "auth-failed",
            ErrorKind::PublicKeyMismatch => "public-key-mismatch",
            ErrorKind::UnrecognizedRoot => "unrecognized-root",
            ErrorKind::InvalidCaveat => "invalid-caveat",
            ErrorKind::ImmutableStore => "immutable-store",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionFailed => "connection-failed",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the transport's dial/retry loop is permitted to retry an error
    /// of this kind. Only connection-level failures are retryable, and only
    /// before any application data has been delivered (enforced by the
    /// caller, not by this predicate).
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ConnectionFailed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shared error that crosses component boundaries.
///
/// Carries the original [`ErrorKind`] plus a chain of human-readable
/// annotations recording where the error was wrapped, innermost first when
/// read via [`Error::annotations`]. The kind itself never changes as the
/// error is wrapped further up the stack.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    annotations: Vec<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Construct a new error with the given kind and a leaf message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            annotations: vec![message.into()],
            source: None,
        }
    }

    /// Construct an error from a kind and an underlying source error,
    /// preserving the source's `Display` output as the leaf annotation.
    pub fn from_source(
        kind: ErrorKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            annotations: vec![source.to_string()],
            kind,
            source: Some(Box::new(source)),
        }
    }

    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Add an annotation describing where this error was re-wrapped,
    /// without losing the original kind. Returns `self` for chaining.
    #[must_use]
    pub fn context(mut self, message: impl Into<String>) -> Self {
        self.annotations.push(message.into());
        self
    }

    /// The annotation chain, innermost (original) first.
    pub fn annotations(&self) -> impl Iterator<Item = &str> {
        self.annotations.iter().map(String::as_str)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for annotation in self.annotations.iter().rev() {
            write!(f, ": {annotation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Implemented by every component-local error enum so it can be converted
/// into the shared [`Error`] at a crate boundary without losing its kind.
pub trait IntoFabricError: std::error::Error + Send + Sync + Sized + 'static {
    /// The stable kind this error maps onto.
    fn kind(&self) -> ErrorKind;

    /// Convert into the shared error, preserving kind and message.
    fn into_fabric_error(self) -> Error {
        let kind = self.kind();
        Error::from_source(kind, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_annotations() {
        let err = Error::new(ErrorKind::NoSuchName, "a/b/c").context("resolving x/y");
        let rendered = err.to_string();
        assert!(rendered.starts_with("no-such-name"));
        assert!(rendered.contains("resolving x/y"));
        assert!(rendered.contains("a/b/c"));
    }

    #[test]
    fn kind_survives_context() {
        let err = Error::new(ErrorKind::AuthFailed, "bad signature")
            .context("handshake")
            .context("dial");
        assert_eq!(err.kind(), ErrorKind::AuthFailed);
    }

    #[test]
    fn only_connection_failed_is_retryable() {
        assert!(ErrorKind::ConnectionFailed.is_retryable());
        assert!(!ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::AuthFailed.is_retryable());
    }
}
