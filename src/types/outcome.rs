//! Four-valued outcome type with severity lattice.
//!
//! The outcome type represents the terminal state of a promise:
//!
//! - `Resolved(T)`: the task returned a value
//! - `Failed(Error)`: the task's closure returned an error
//! - `Cancelled(CancelReason)`: the task was cancelled
//! - `Panicked(PanicPayload)`: the task's closure panicked
//!
//! These form a severity lattice: `Resolved < Failed < Cancelled < Panicked`.

use super::cancel::CancelReason;
use crate::error::{Error, ErrorKind};
use core::fmt;

/// Payload from a caught panic.
///
/// This wraps the panic value for safe transport across task boundaries.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from a payload caught by `catch_unwind`.
    #[must_use]
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map_or_else(
                || {
                    payload
                        .downcast_ref::<String>()
                        .cloned()
                        .unwrap_or_else(|| "opaque panic payload".to_string())
                },
                |s| (*s).to_string(),
            );
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// The four-valued outcome of a promise.
///
/// Forms a severity lattice where worse outcomes dominate:
/// `Resolved < Failed < Cancelled < Panicked`
#[derive(Debug)]
pub enum Outcome<T> {
    /// The task returned a value.
    Resolved(T),
    /// The task's closure returned an error.
    Failed(Error),
    /// The task was cancelled.
    Cancelled(CancelReason),
    /// The task's closure panicked.
    Panicked(PanicPayload),
}

impl<T> Outcome<T> {
    /// Returns the severity level of this outcome (0 = Resolved, 3 = Panicked).
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::Resolved(_) => 0,
            Self::Failed(_) => 1,
            Self::Cancelled(_) => 2,
            Self::Panicked(_) => 3,
        }
    }

    /// Returns true if this outcome is `Resolved`.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns true if this outcome is `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if this outcome is `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns true if this outcome is `Panicked`.
    #[must_use]
    pub const fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Converts this outcome to a standard Result, with cancellation and
    /// panic folded into [`Error`].
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Self::Resolved(v) => Ok(v),
            Self::Failed(e) => Err(e),
            Self::Cancelled(r) => Err(Error::cancelled(&r)),
            Self::Panicked(p) => Err(Error::new(ErrorKind::Panic).with_context(p.message)),
        }
    }

    /// Maps the resolved value using the provided function.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Resolved(v) => Outcome::Resolved(f(v)),
            Self::Failed(e) => Outcome::Failed(e),
            Self::Cancelled(r) => Outcome::Cancelled(r),
            Self::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Returns the resolved value or panics.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is not `Resolved`.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Self::Resolved(v) => v,
            Self::Failed(e) => panic!("called `Outcome::unwrap()` on a `Failed` value: {e}"),
            Self::Cancelled(r) => {
                panic!("called `Outcome::unwrap()` on a `Cancelled` value: {r}")
            }
            Self::Panicked(p) => panic!("called `Outcome::unwrap()` on a `Panicked` value: {p}"),
        }
    }

    /// Returns the resolved value or a default.
    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Resolved(v) => v,
            _ => default,
        }
    }
}

impl<T> From<Result<T, Error>> for Outcome<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(v) => Self::Resolved(v),
            Err(e) => Self::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_lattice() {
        let resolved: Outcome<i32> = Outcome::Resolved(1);
        let failed: Outcome<i32> = Outcome::Failed(Error::user("boom"));
        let cancelled: Outcome<i32> = Outcome::Cancelled(CancelReason::default());
        let panicked: Outcome<i32> = Outcome::Panicked(PanicPayload::new("p"));

        assert!(resolved.severity() < failed.severity());
        assert!(failed.severity() < cancelled.severity());
        assert!(cancelled.severity() < panicked.severity());
    }

    #[test]
    fn into_result_maps_each_variant() {
        let ok: Outcome<i32> = Outcome::Resolved(7);
        assert_eq!(ok.into_result().unwrap(), 7);

        let failed: Outcome<i32> = Outcome::Failed(Error::user("boom"));
        assert_eq!(failed.into_result().unwrap_err().kind(), ErrorKind::User);

        let cancelled: Outcome<i32> = Outcome::Cancelled(CancelReason::default());
        assert!(cancelled.into_result().unwrap_err().is_cancelled());

        let panicked: Outcome<i32> = Outcome::Panicked(PanicPayload::new("p"));
        assert_eq!(panicked.into_result().unwrap_err().kind(), ErrorKind::Panic);
    }

    #[test]
    fn map_preserves_non_resolved_variants() {
        let failed: Outcome<i32> = Outcome::Failed(Error::user("boom"));
        assert!(failed.map(|v| v * 2).is_failed());

        let resolved: Outcome<i32> = Outcome::Resolved(3);
        assert_eq!(resolved.map(|v| v * 2).unwrap(), 6);
    }

    #[test]
    fn panic_payload_extracts_str_and_string() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(PanicPayload::from_panic(boxed.as_ref()).message(), "static str");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(PanicPayload::from_panic(boxed.as_ref()).message(), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(
            PanicPayload::from_panic(boxed.as_ref()).message(),
            "opaque panic payload"
        );
    }
}
