//! Cancellation reason and kind types.
//!
//! Cancellation in Tandem is request-based: a reason is recorded on the
//! target and observed by the running task at its next suspension point.
//! Once requested, cancellation is never retracted.

use core::fmt;

/// The kind of cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit cancellation requested by user code.
    User,
    /// Cancellation because another branch of a `wait_first` completed.
    RaceLost,
    /// Cancellation because the parent task finished or was cancelled.
    ParentCancelled,
    /// Cancellation due to runtime shutdown.
    Shutdown,
}

impl CancelKind {
    /// Returns the severity of this cancellation kind.
    ///
    /// Higher severity cancellations take precedence when strengthening.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::User => 0,
            Self::RaceLost => 1,
            Self::ParentCancelled => 2,
            Self::Shutdown => 3,
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::RaceLost => write!(f, "race lost"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The reason for a cancellation, including kind and optional context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// The kind of cancellation.
    pub kind: CancelKind,
    /// Optional human-readable message (static for determinism).
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// Creates a new cancellation reason with the given kind.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a user cancellation reason with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
        }
    }

    /// Creates a race-loser cancellation reason.
    #[must_use]
    pub const fn race_lost() -> Self {
        Self::new(CancelKind::RaceLost)
    }

    /// Creates a parent-cancelled cancellation reason.
    #[must_use]
    pub const fn parent_cancelled() -> Self {
        Self::new(CancelKind::ParentCancelled)
    }

    /// Creates a shutdown cancellation reason.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Strengthens this reason with another, keeping the more severe one.
    ///
    /// Returns `true` if the reason was changed.
    pub fn strengthen(&mut self, other: &Self) -> bool {
        if other.kind > self.kind {
            self.kind = other.kind;
            self.message = other.message;
            return true;
        }

        if other.kind < self.kind {
            return false;
        }

        match (self.message, other.message) {
            (None, Some(msg)) => {
                self.message = Some(msg);
                true
            }
            (Some(current), Some(candidate)) if candidate < current => {
                self.message = Some(candidate);
                true
            }
            _ => false,
        }
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(CancelKind::User.severity() < CancelKind::RaceLost.severity());
        assert!(CancelKind::RaceLost.severity() < CancelKind::ParentCancelled.severity());
        assert!(CancelKind::ParentCancelled.severity() < CancelKind::Shutdown.severity());
    }

    #[test]
    fn strengthen_takes_more_severe() {
        let mut reason = CancelReason::user("stop");
        assert!(reason.strengthen(&CancelReason::parent_cancelled()));
        assert_eq!(reason.kind, CancelKind::ParentCancelled);

        // Less severe should not change.
        assert!(!reason.strengthen(&CancelReason::race_lost()));
        assert_eq!(reason.kind, CancelKind::ParentCancelled);
    }

    #[test]
    fn strengthen_is_idempotent() {
        let mut reason = CancelReason::shutdown();
        assert!(!reason.strengthen(&CancelReason::shutdown()));
        assert_eq!(reason.kind, CancelKind::Shutdown);
    }

    #[test]
    fn strengthen_same_kind_picks_deterministic_message() {
        let mut reason = CancelReason::user("b");
        assert!(reason.strengthen(&CancelReason::user("a")));
        assert_eq!(reason.message, Some("a"));
    }
}
