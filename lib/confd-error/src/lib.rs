//! Error primitives shared across the daemon.
//!
//! Library crates define their own `snafu` error enums. Application glue code, and anything that only needs to carry
//! an error up to a log line, uses [`GenericError`]. Engine errors additionally report a [`FailureScope`] so callers
//! can decide how far a failure should travel without matching on concrete variants.

use std::fmt::{self, Display};

pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (as with `std::format!`), or any value implementing
/// `Debug` and `Display`. When given a value implementing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// `anyhow::Context` is wrapped so its extension methods don't collide with `snafu::ResultExt`.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context, evaluated only if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// How far a failure reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureScope {
    /// Only the current service entry is affected. It is left out of the pass.
    Entry,

    /// The current reconciliation pass is abandoned. The next snapshot starts a fresh pass.
    Pass,

    /// The process cannot continue safely and should shut down with a non-zero status.
    Process,
}

impl FailureScope {
    /// Returns `true` if this failure should terminate the process.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Process)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Pass => "pass",
            Self::Process => "process",
        }
    }
}

impl Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that knows its own [`FailureScope`].
pub trait ScopedFailure {
    fn scope(&self) -> FailureScope;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk on fire"));
        let err = result.error_context("failed to write file").unwrap_err();

        assert_eq!(err.to_string(), "failed to write file");
        assert_eq!(err.root_cause().to_string(), "disk on fire");
    }

    #[test]
    fn lazy_context_only_on_error() {
        let result: Result<u32, std::io::Error> = Ok(7);
        let value = result
            .with_error_context(|| -> String { panic!("context evaluated for Ok value") })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn macro_formats() {
        let err = generic_error!("bad port {}", 70000);
        assert_eq!(err.to_string(), "bad port 70000");
    }

    #[test]
    fn scope_ordering() {
        assert!(FailureScope::Entry < FailureScope::Pass);
        assert!(FailureScope::Pass < FailureScope::Process);
        assert!(FailureScope::Process.is_fatal());
        assert!(!FailureScope::Pass.is_fatal());
        assert_eq!(FailureScope::Entry.to_string(), "entry");
    }
}
