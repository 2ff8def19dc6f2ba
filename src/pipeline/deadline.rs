//! Single wall-clock cutoff shared by every stage of a run.
//!
//! The deadline is established once at run start and threaded explicitly;
//! stages check it before starting blocking work, never recompute their own.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    cutoff: Option<Instant>,
}

impl Deadline {
    /// Deadline `secs` seconds from now; `None` means unbounded.
    pub fn after_secs(secs: Option<u64>) -> Self {
        Self {
            cutoff: secs.map(|s| Instant::now() + Duration::from_secs(s)),
        }
    }

    pub fn unbounded() -> Self {
        Self { cutoff: None }
    }

    pub fn expired(&self) -> bool {
        match self.cutoff {
            Some(cutoff) => Instant::now() >= cutoff,
            None => false,
        }
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.cutoff
            .map(|cutoff| cutoff.saturating_duration_since(Instant::now()))
    }

    /// Clamp a per-operation timeout to the remaining run budget, so a
    /// single slow operation cannot blow through the deadline by itself.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => timeout.min(left),
            None => timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_deadline_is_expired() {
        let deadline = Deadline::after_secs(Some(0));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_unbounded_never_expires() {
        let deadline = Deadline::unbounded();
        assert!(!deadline.expired());
        assert!(deadline.remaining().is_none());
        assert_eq!(
            deadline.clamp(Duration::from_secs(7)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_clamp_shrinks_to_remaining_budget() {
        let deadline = Deadline::after_secs(Some(1));
        assert!(deadline.clamp(Duration::from_secs(30)) <= Duration::from_secs(1));
    }
}
