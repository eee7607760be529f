//! Retention policies driving cleanup sweeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which timestamp a retention decision is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeBasis {
    /// Age from creation time (the common case for pipeline artifacts).
    #[default]
    Created,
    /// Age from last modification (mtime).
    Modified,
}

/// Configuration for retention-driven file removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPolicy {
    /// How long files are kept before they become removal candidates.
    pub retention: Duration,
    /// Which timestamp the age is measured against.
    pub basis: AgeBasis,
    /// Whether sweeps remove anything at all.
    pub enabled: bool,
}

impl CleanupPolicy {
    /// New policy with the default 24 hour retention on creation time.
    pub fn new() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            basis: AgeBasis::Created,
            enabled: true,
        }
    }

    /// Set the retention duration.
    pub fn remove_after(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the timestamp the age is measured against.
    pub fn basis(mut self, basis: AgeBasis) -> Self {
        self.basis = basis;
        self
    }

    /// Policy that never removes anything.
    pub fn disabled() -> Self {
        Self {
            retention: Duration::ZERO,
            basis: AgeBasis::Created,
            enabled: false,
        }
    }

    /// Same policy with retention cut in half. Used for pressure passes where
    /// a tier is drained more aggressively than its steady-state retention.
    pub fn halved(&self) -> Self {
        Self {
            retention: self.retention / 2,
            basis: self.basis,
            enabled: self.enabled,
        }
    }

    /// Whether a file with the given timestamps is past retention.
    pub fn should_remove(&self, created: DateTime<Utc>, modified: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        let timestamp = match self.basis {
            AgeBasis::Created => created,
            AgeBasis::Modified => modified,
        };
        timestamp < cutoff
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn removes_only_past_retention() {
        let policy = CleanupPolicy::new().remove_after(Duration::from_secs(3600));
        let now = Utc::now();
        let old = now - ChronoDuration::hours(2);
        let recent = now - ChronoDuration::minutes(10);

        assert!(policy.should_remove(old, now));
        assert!(!policy.should_remove(recent, now));
    }

    #[test]
    fn disabled_policy_never_removes() {
        let policy = CleanupPolicy::disabled();
        let ancient = Utc::now() - ChronoDuration::days(365);
        assert!(!policy.should_remove(ancient, ancient));
    }

    #[test]
    fn modified_basis_ignores_creation_time() {
        let policy = CleanupPolicy::new()
            .remove_after(Duration::from_secs(3600))
            .basis(AgeBasis::Modified);
        let now = Utc::now();
        let old = now - ChronoDuration::hours(2);

        assert!(policy.should_remove(now, old));
        assert!(!policy.should_remove(old, now));
    }

    #[test]
    fn halved_policy_keeps_basis() {
        let policy = CleanupPolicy::new()
            .remove_after(Duration::from_secs(7200))
            .basis(AgeBasis::Modified)
            .halved();
        assert_eq!(policy.retention, Duration::from_secs(3600));
        assert_eq!(policy.basis, AgeBasis::Modified);
    }
}
