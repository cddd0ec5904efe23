//! Orchestration policy.

use std::time::Duration;

use crate::executor::DEFAULT_COMMAND_TIMEOUT;
use crate::verify::{DEFAULT_DOMAIN_TIMEOUT, DEFAULT_SUCCESS_THRESHOLD, DEFAULT_TEST_DOMAINS};

/// Delay before an unverified change is reverted.
pub const DEFAULT_ROLLBACK_DELAY: Duration = Duration::from_secs(30);

/// What happens to snapshots once a change is verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotRetention {
    /// Keep them so the change can still be undone manually.
    #[default]
    Retain,
    /// Drop them as soon as verification succeeds.
    ClearOnCommit,
}

/// Policy knobs for an [`Orchestrator`](crate::Orchestrator).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use dns_guard::{GuardConfig, SnapshotRetention};
///
/// let config = GuardConfig::default()
///     .with_test_domains(["example.com", "example.org"])
///     .with_rollback_delay(Duration::from_secs(10))
///     .with_snapshot_retention(SnapshotRetention::ClearOnCommit);
///
/// assert_eq!(config.test_domains.len(), 2);
/// assert_eq!(config.rollback_delay, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    /// Domains resolved after each change.
    pub test_domains: Vec<String>,

    /// Time limit for resolving one test domain.
    pub domain_timeout: Duration,

    /// Minimum success rate for
    /// [`Orchestrator::verify_and_rollback`](crate::Orchestrator::verify_and_rollback),
    /// in `[0, 1]`. [`Orchestrator::apply`](crate::Orchestrator::apply)
    /// schedules a rollback on anything short of full success.
    pub success_threshold: f64,

    /// How long an unverified change stays in place before it is reverted.
    /// Zero reverts it before the apply outcome is returned.
    pub rollback_delay: Duration,

    /// Default time limit for platform commands.
    pub command_timeout: Duration,

    pub snapshot_retention: SnapshotRetention,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            test_domains: DEFAULT_TEST_DOMAINS.iter().map(ToString::to_string).collect(),
            domain_timeout: DEFAULT_DOMAIN_TIMEOUT,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            rollback_delay: DEFAULT_ROLLBACK_DELAY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            snapshot_retention: SnapshotRetention::default(),
        }
    }
}

impl GuardConfig {
    #[must_use]
    pub fn with_test_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_domain_timeout(mut self, timeout: Duration) -> Self {
        self.domain_timeout = timeout;
        self
    }

    /// Sets the success threshold, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: f64) -> Self {
        self.success_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub const fn with_rollback_delay(mut self, delay: Duration) -> Self {
        self.rollback_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_snapshot_retention(mut self, retention: SnapshotRetention) -> Self {
        self.snapshot_retention = retention;
        self
    }
}
