//! Post-change resolution checks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::command::Command;
use crate::error::Result;
use crate::executor::{CommandRunner, Executor};
use crate::interface::InterfaceId;
use crate::snapshot::SnapshotStore;

/// Domains resolved when no list is given.
pub const DEFAULT_TEST_DOMAINS: &[&str] = &["example.com", "google.com", "cloudflare.com"];

/// Per-domain resolution limit when none is given.
pub const DEFAULT_DOMAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum success rate for [`Verifier::verify_and_rollback_on_failure`].
pub const DEFAULT_SUCCESS_THRESHOLD: f64 = 0.5;

/// Overall health of name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Success,
    Partial,
    Failed,
    Timeout,
}

impl VerificationStatus {
    /// Derives the status from a run's counts.
    ///
    /// `budget` is the sum of the per-domain limits; a run with no
    /// successes that used up the whole budget counts as timed out.
    #[must_use]
    pub fn derive(resolved: usize, total: usize, elapsed: Duration, budget: Duration) -> Self {
        if resolved == total {
            Self::Success
        } else if resolved > 0 {
            Self::Partial
        } else if elapsed >= budget {
            Self::Timeout
        } else {
            Self::Failed
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one verification run.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    /// Domains that resolved, in input order.
    pub resolved: Vec<String>,
    /// Domains that did not, in input order.
    pub failed: Vec<String>,
    /// `"<domain>: <error>"` for each failed domain.
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl VerificationResult {
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status == VerificationStatus::Success
    }

    /// `resolved / (resolved + failed)`, or 0 for an empty run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.resolved.len() + self.failed.len();
        if total == 0 {
            0.0
        } else {
            self.resolved.len() as f64 / total as f64
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status: {}, Success: {}/{}, Time: {:.1}ms",
            self.status,
            self.resolved.len(),
            self.resolved.len() + self.failed.len(),
            self.elapsed.as_secs_f64() * 1000.0
        )
    }
}

/// Outcome of [`Verifier::verify_and_rollback_on_failure`].
#[derive(Debug)]
pub struct VerifyRollback {
    pub passed: bool,
    pub result: VerificationResult,
    /// `None` when verification passed and no rollback was attempted.
    pub rollback: Option<Result<String>>,
}

/// Resolves test domains through the system resolver.
pub struct Verifier<R> {
    exec: Executor<R>,
    snapshots: Arc<SnapshotStore<R>>,
}

impl<R: CommandRunner> Verifier<R> {
    pub const fn new(exec: Executor<R>, snapshots: Arc<SnapshotStore<R>>) -> Self {
        Self { exec, snapshots }
    }

    /// Resolves every domain in order, each under `per_domain`.
    ///
    /// All domains are attempted even after a failure.
    pub async fn verify<S: AsRef<str>>(&self, domains: &[S], per_domain: Duration) -> VerificationResult {
        let start = Instant::now();
        let mut resolved = Vec::new();
        let mut failed = Vec::new();
        let mut errors = Vec::new();

        for domain in domains {
            let domain = domain.as_ref();
            let command = Command::Resolve {
                domain: domain.to_string(),
            };
            match self.exec.execute_within(&command, per_domain).await {
                Ok(_) => {
                    tracing::debug!(domain, "Resolved test domain");
                    resolved.push(domain.to_string());
                }
                Err(e) => {
                    tracing::warn!(domain, error = %e, "Failed to resolve test domain");
                    errors.push(format!("{domain}: {e}"));
                    failed.push(domain.to_string());
                }
            }
        }

        let elapsed = start.elapsed();
        let budget = per_domain.saturating_mul(u32::try_from(domains.len()).unwrap_or(u32::MAX));
        let status = VerificationStatus::derive(resolved.len(), domains.len(), elapsed, budget);

        let result = VerificationResult {
            status,
            resolved,
            failed,
            errors,
            elapsed,
        };
        tracing::info!(
            status = %result.status,
            resolved = result.resolved.len(),
            total = domains.len(),
            "DNS verification completed"
        );
        result
    }

    /// Verifies and, if the success rate is below `threshold`, immediately
    /// restores the interface's snapshot.
    pub async fn verify_and_rollback_on_failure<S: AsRef<str>>(
        &self,
        interface: InterfaceId,
        domains: &[S],
        per_domain: Duration,
        threshold: f64,
    ) -> VerifyRollback {
        let result = self.verify(domains, per_domain).await;
        let rate = result.success_rate();

        if rate >= threshold {
            tracing::info!(rate, "DNS verification passed");
            return VerifyRollback {
                passed: true,
                result,
                rollback: None,
            };
        }

        tracing::warn!(rate, threshold, interface = %interface, "DNS verification failed, rolling back");
        let rollback = self.snapshots.restore(interface).await;
        VerifyRollback {
            passed: false,
            result,
            rollback: Some(rollback),
        }
    }
}
