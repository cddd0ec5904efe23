//! Snapshot, apply, verify, then commit or roll back.
//!
//! [`Orchestrator::apply`] runs the whole sequence on a background task.
//! When verification does not fully succeed, a rollback is scheduled after
//! [`GuardConfig::rollback_delay`]; it can be cancelled explicitly and is
//! cancelled implicitly by any later apply, reset, or restore. At most one
//! rollback is pending per orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{GuardConfig, SnapshotRetention};
use crate::doh::{Capabilities, DohStatus, EncryptedResolution};
use crate::error::DnsError;
use crate::executor::{CommandRunner, Executor};
use crate::interface::{InterfaceId, Inventory, NetworkInterface};
use crate::provider::DnsProvider;
use crate::resolver::Resolver;
use crate::snapshot::SnapshotStore;
use crate::verify::{VerificationResult, Verifier, VerifyRollback};

const EVENT_CHANNEL_SIZE: usize = 32;

// ── Requests ─────────────────────────────────────────────────────

/// An interface selected for a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRef {
    pub id: InterfaceId,
    pub name: String,
}

impl InterfaceRef {
    pub fn new(id: InterfaceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl From<&NetworkInterface> for InterfaceRef {
    fn from(iface: &NetworkInterface) -> Self {
        Self::new(iface.id, iface.name.clone())
    }
}

/// A provider to apply to a set of interfaces.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub interfaces: Vec<InterfaceRef>,
    pub provider: DnsProvider,
    /// Register the provider's DoH template when the platform allows it.
    pub use_encrypted_resolution: bool,
    pub flush_cache_after_apply: bool,
}

impl ApplyRequest {
    /// A request with no interfaces, DoH and cache flush enabled.
    pub const fn new(provider: DnsProvider) -> Self {
        Self {
            interfaces: Vec::new(),
            provider,
            use_encrypted_resolution: true,
            flush_cache_after_apply: true,
        }
    }

    #[must_use]
    pub fn with_interface(mut self, id: InterfaceId, name: impl Into<String>) -> Self {
        self.interfaces.push(InterfaceRef::new(id, name));
        self
    }

    #[must_use]
    pub fn with_interfaces<'a>(mut self, interfaces: impl IntoIterator<Item = &'a NetworkInterface>) -> Self {
        self.interfaces.extend(interfaces.into_iter().map(InterfaceRef::from));
        self
    }

    #[must_use]
    pub const fn use_encrypted_resolution(mut self, yes: bool) -> Self {
        self.use_encrypted_resolution = yes;
        self
    }

    #[must_use]
    pub const fn flush_cache_after_apply(mut self, yes: bool) -> Self {
        self.flush_cache_after_apply = yes;
        self
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

/// Where the orchestrator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Snapshotting,
    Applying,
    Verifying,
    Committed,
    PendingRollback,
    RolledBack,
}

/// Per-interface result of an apply or reset.
#[derive(Debug)]
pub struct InterfaceOutcome {
    pub interface: InterfaceRef,
    /// Whether a snapshot was captured; without one the interface cannot
    /// be rolled back.
    pub snapshot_taken: bool,
    /// Encrypted-resolution result, `None` when DoH was not requested.
    pub doh: Option<DohStatus>,
    pub messages: Vec<String>,
    pub error: Option<DnsError>,
}

impl InterfaceOutcome {
    fn new(interface: InterfaceRef, snapshot_taken: bool) -> Self {
        Self {
            interface,
            snapshot_taken,
            doh: None,
            messages: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened when restoring one interface.
#[derive(Debug)]
pub enum RollbackResult {
    Restored(String),
    Failed(DnsError),
    /// No snapshot was held, so nothing was attempted.
    NotAttempted,
}

#[derive(Debug)]
pub struct RollbackEntry {
    pub interface: InterfaceRef,
    pub result: RollbackResult,
}

/// Result of restoring a set of interfaces.
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub entries: Vec<RollbackEntry>,
}

impl RollbackReport {
    /// Returns `true` if every interface was restored.
    #[must_use]
    pub fn all_restored(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.result, RollbackResult::Restored(_)))
    }

    /// Interfaces whose restore was attempted and failed.
    pub fn failures(&self) -> impl Iterator<Item = (&InterfaceRef, &DnsError)> {
        self.entries.iter().filter_map(|e| match &e.result {
            RollbackResult::Failed(err) => Some((&e.interface, err)),
            _ => None,
        })
    }
}

/// Overall classification of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Every interface applied and resolution works.
    Committed,
    /// Resolution works but some interfaces failed to apply.
    CommittedWithFailures,
    /// Resolution is unhealthy; a rollback is scheduled.
    PendingRollback,
    /// Resolution was unhealthy and the change has been reverted.
    RolledBack,
    /// No interface could be changed, so nothing was verified.
    NothingApplied,
}

/// Everything an apply produced.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub status: OutcomeStatus,
    pub interfaces: Vec<InterfaceOutcome>,
    /// `None` when nothing was applied.
    pub verification: Option<VerificationResult>,
    /// `None` if the cache flush was not requested.
    pub cache_flushed: Option<bool>,
    /// Set when the rollback ran before this outcome was returned.
    pub rollback: Option<Arc<RollbackReport>>,
    /// Set when a delayed rollback was scheduled.
    pub rollback_delay: Option<Duration>,
}

impl ApplyOutcome {
    pub fn applied(&self) -> impl Iterator<Item = &InterfaceOutcome> {
        self.interfaces.iter().filter(|o| o.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &InterfaceOutcome> {
        self.interfaces.iter().filter(|o| !o.succeeded())
    }
}

/// Notifications published by the orchestrator.
#[derive(Debug, Clone)]
pub enum Event {
    RollbackScheduled {
        delay: Duration,
        interfaces: Vec<InterfaceRef>,
    },
    RollbackCancelled,
    RolledBack(Arc<RollbackReport>),
}

// ── Orchestrator ─────────────────────────────────────────────────

struct PendingRollback {
    ticket: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner<R> {
    config: GuardConfig,
    inventory: Inventory<R>,
    resolver: Resolver<R>,
    doh: EncryptedResolution<R>,
    snapshots: Arc<SnapshotStore<R>>,
    verifier: Verifier<R>,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<Event>,
    pending: Mutex<Option<PendingRollback>>,
    /// Serialises every workflow that mutates system DNS state.
    workflow: tokio::sync::Mutex<()>,
    next_ticket: AtomicU64,
}

/// Coordinates DNS changes with verification and rollback.
///
/// Cheaply cloneable. Methods that start work spawn onto the current tokio
/// runtime and must be called from within one.
pub struct Orchestrator<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: CommandRunner> Orchestrator<R> {
    /// Builds an orchestrator, probing the platform for DoH support.
    pub async fn new(runner: R, config: GuardConfig) -> Self {
        let exec = Executor::new(runner).with_timeout(config.command_timeout);
        let resolver = Resolver::new(exec.clone());
        let doh = EncryptedResolution::detect(exec.clone(), resolver.clone()).await;
        Self::assemble(exec, resolver, doh, config)
    }

    /// Builds an orchestrator with known platform capabilities.
    pub fn with_capabilities(runner: R, config: GuardConfig, caps: Capabilities) -> Self {
        let exec = Executor::new(runner).with_timeout(config.command_timeout);
        let resolver = Resolver::new(exec.clone());
        let doh = EncryptedResolution::with_capabilities(exec.clone(), resolver.clone(), caps);
        Self::assemble(exec, resolver, doh, config)
    }

    fn assemble(
        exec: Executor<R>,
        resolver: Resolver<R>,
        doh: EncryptedResolution<R>,
        config: GuardConfig,
    ) -> Self {
        let snapshots = Arc::new(SnapshotStore::new(resolver.clone()));
        let verifier = Verifier::new(exec.clone(), Arc::clone(&snapshots));
        let (phase, _) = watch::channel(Phase::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            inner: Arc::new(Inner {
                config,
                inventory: Inventory::new(exec),
                resolver,
                doh,
                snapshots,
                verifier,
                phase,
                events,
                pending: Mutex::new(None),
                workflow: tokio::sync::Mutex::new(()),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    pub fn inventory(&self) -> &Inventory<R> {
        &self.inner.inventory
    }

    /// Direct access to the per-interface configurator.
    ///
    /// Changes made through it bypass the workflow lock and leave a pending
    /// rollback armed, so a change made during the rollback window is
    /// reverted when the timer fires. Call
    /// [`cancel_pending_rollback`](Self::cancel_pending_rollback) first, or
    /// use [`apply`](Self::apply) and [`reset_to_automatic`](Self::reset_to_automatic).
    pub fn resolver(&self) -> &Resolver<R> {
        &self.inner.resolver
    }

    /// Direct access to DoH management. Mutations carry the same caveat as
    /// [`resolver`](Self::resolver).
    pub fn encrypted_resolution(&self) -> &EncryptedResolution<R> {
        &self.inner.doh
    }

    /// The snapshots a rollback restores from. Capturing or clearing here
    /// changes what a pending rollback will restore.
    pub fn snapshots(&self) -> &SnapshotStore<R> {
        &self.inner.snapshots
    }

    pub fn verifier(&self) -> &Verifier<R> {
        &self.inner.verifier
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Watches phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    /// Receives rollback lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Returns `true` while a scheduled rollback has neither run nor been
    /// cancelled.
    pub fn has_pending_rollback(&self) -> bool {
        self.lock_pending()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Applies `request` on a background task.
    ///
    /// Any pending rollback is cancelled before this returns.
    pub fn apply(&self, request: ApplyRequest) -> JoinHandle<ApplyOutcome> {
        self.cancel_pending_rollback();
        let this = self.clone();
        tokio::spawn(async move { this.run_apply(request).await })
    }

    /// Resets interfaces to automatic DNS on a background task.
    ///
    /// Any pending rollback is cancelled before this returns.
    pub fn reset_to_automatic(&self, interfaces: Vec<InterfaceRef>) -> JoinHandle<Vec<InterfaceOutcome>> {
        self.cancel_pending_rollback();
        let this = self.clone();
        tokio::spawn(async move { this.run_reset(interfaces).await })
    }

    /// Restores the held snapshots of `interfaces` on a background task.
    ///
    /// Any pending rollback is cancelled before this returns.
    pub fn restore_snapshots(&self, interfaces: Vec<InterfaceRef>) -> JoinHandle<Arc<RollbackReport>> {
        self.cancel_pending_rollback();
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = this.inner.workflow.lock().await;
            this.cancel_pending_rollback();
            this.finish_rollback(&interfaces).await
        })
    }

    /// Verifies resolution with the configured domains and, if the success
    /// rate is below [`GuardConfig::success_threshold`], restores the
    /// interface's snapshot immediately.
    ///
    /// Any pending rollback is cancelled before this returns.
    pub fn verify_and_rollback(&self, interface: InterfaceId) -> JoinHandle<VerifyRollback> {
        self.cancel_pending_rollback();
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = this.inner.workflow.lock().await;
            this.cancel_pending_rollback();

            this.set_phase(Phase::Verifying);
            let config = &this.inner.config;
            let outcome = this
                .inner
                .verifier
                .verify_and_rollback_on_failure(
                    interface,
                    &config.test_domains,
                    config.domain_timeout,
                    config.success_threshold,
                )
                .await;
            this.set_phase(if outcome.passed {
                Phase::Committed
            } else {
                Phase::RolledBack
            });
            outcome
        })
    }

    /// Cancels the pending rollback, keeping the applied configuration.
    ///
    /// Returns `true` if a rollback was pending.
    pub fn cancel_pending_rollback(&self) -> bool {
        let Some(pending) = self.lock_pending().take() else {
            return false;
        };
        pending.cancel.cancel();
        if pending.handle.is_finished() {
            return false;
        }

        tracing::info!(ticket = pending.ticket, "Cancelled pending DNS rollback");
        self.inner.phase.send_if_modified(|phase| {
            let waiting = *phase == Phase::PendingRollback;
            if waiting {
                *phase = Phase::Idle;
            }
            waiting
        });
        let _ = self.inner.events.send(Event::RollbackCancelled);
        true
    }

    // ── Workflows ────────────────────────────────────────────────

    async fn run_apply(&self, request: ApplyRequest) -> ApplyOutcome {
        let _guard = self.inner.workflow.lock().await;
        // A rollback scheduled by an apply that was still running when
        // this one was requested must not fire after this one.
        self.cancel_pending_rollback();

        let provider = &request.provider;
        tracing::info!(
            provider = %provider.name,
            interfaces = request.interfaces.len(),
            "Applying DNS provider"
        );

        self.set_phase(Phase::Snapshotting);
        let mut outcomes = Vec::with_capacity(request.interfaces.len());
        for iface in &request.interfaces {
            let snapshot_taken = match self.inner.snapshots.capture(iface.id, &iface.name).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        interface = %iface.id,
                        name = %iface.name,
                        error = %e,
                        "Snapshot failed, interface cannot be rolled back"
                    );
                    // An older snapshot would restore the wrong state.
                    self.inner.snapshots.clear(iface.id);
                    false
                }
            };
            outcomes.push(InterfaceOutcome::new(iface.clone(), snapshot_taken));
        }

        self.set_phase(Phase::Applying);
        for outcome in &mut outcomes {
            self.apply_one(outcome, &request).await;
        }

        let cache_flushed = if request.flush_cache_after_apply {
            Some(self.inner.resolver.flush_cache().await.is_ok())
        } else {
            None
        };

        let applied = outcomes.iter().filter(|o| o.succeeded()).count();
        if applied == 0 {
            tracing::warn!(provider = %provider.name, "No interface accepted the DNS change");
            self.set_phase(Phase::Idle);
            return ApplyOutcome {
                status: OutcomeStatus::NothingApplied,
                interfaces: outcomes,
                verification: None,
                cache_flushed,
                rollback: None,
                rollback_delay: None,
            };
        }

        self.set_phase(Phase::Verifying);
        let config = &self.inner.config;
        let verification = self
            .inner
            .verifier
            .verify(&config.test_domains, config.domain_timeout)
            .await;

        let mut outcome = ApplyOutcome {
            status: OutcomeStatus::Committed,
            interfaces: outcomes,
            verification: None,
            cache_flushed,
            rollback: None,
            rollback_delay: None,
        };

        if verification.is_successful() {
            if config.snapshot_retention == SnapshotRetention::ClearOnCommit {
                for iface in &request.interfaces {
                    self.inner.snapshots.clear(iface.id);
                }
            }
            outcome.status = if applied == outcome.interfaces.len() {
                OutcomeStatus::Committed
            } else {
                OutcomeStatus::CommittedWithFailures
            };
            tracing::info!(provider = %provider.name, applied, "DNS change committed");
            self.set_phase(Phase::Committed);
        } else if config.rollback_delay.is_zero() {
            tracing::warn!(status = %verification.status, "DNS verification failed, rolling back now");
            outcome.rollback = Some(self.finish_rollback(&request.interfaces).await);
            outcome.status = OutcomeStatus::RolledBack;
        } else {
            tracing::warn!(
                status = %verification.status,
                delay_secs = config.rollback_delay.as_secs(),
                "DNS verification failed, rollback scheduled"
            );
            self.schedule_rollback(request.interfaces.clone(), config.rollback_delay);
            outcome.status = OutcomeStatus::PendingRollback;
            outcome.rollback_delay = Some(config.rollback_delay);
        }

        outcome.verification = Some(verification);
        outcome
    }

    async fn apply_one(&self, outcome: &mut InterfaceOutcome, request: &ApplyRequest) {
        let id = outcome.interface.id;
        let provider = &request.provider;

        if request.use_encrypted_resolution {
            match self
                .inner
                .doh
                .apply_provider_configuration(
                    id,
                    &provider.ipv4,
                    provider.doh_template.as_deref(),
                    &provider.policy,
                )
                .await
            {
                Ok(report) => {
                    outcome.doh = Some(report.doh);
                    outcome.messages = report.messages;
                }
                Err(e) => outcome.error = Some(e),
            }
        } else {
            match self.inner.resolver.set_addresses(id, &provider.ipv4, true).await {
                Ok(()) => outcome
                    .messages
                    .push("DNS servers applied successfully".to_string()),
                Err(e) => outcome.error = Some(e),
            }
        }
    }

    async fn run_reset(&self, interfaces: Vec<InterfaceRef>) -> Vec<InterfaceOutcome> {
        let _guard = self.inner.workflow.lock().await;
        self.cancel_pending_rollback();

        let mut outcomes = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            let id = iface.id;
            let mut outcome = InterfaceOutcome::new(iface, false);
            match self.inner.resolver.reset_to_automatic(id).await {
                Ok(()) => outcome
                    .messages
                    .push("DNS reset to automatic (DHCP)".to_string()),
                Err(e) => outcome.error = Some(e),
            }
            outcomes.push(outcome);
        }
        self.set_phase(Phase::Idle);
        outcomes
    }

    /// Replaces any pending rollback with a new one. Caller holds the
    /// workflow lock.
    fn schedule_rollback(&self, interfaces: Vec<InterfaceRef>, delay: Duration) {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let previous = {
            let mut slot = self.lock_pending();
            let this = self.clone();
            let token = cancel.clone();
            let targets = interfaces.clone();
            let handle = tokio::spawn(async move {
                this.delayed_rollback(ticket, targets, delay, token).await;
            });
            slot.replace(PendingRollback {
                ticket,
                cancel,
                handle,
            })
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        self.set_phase(Phase::PendingRollback);
        let _ = self
            .inner
            .events
            .send(Event::RollbackScheduled { delay, interfaces });
    }

    async fn delayed_rollback(
        &self,
        ticket: u64,
        interfaces: Vec<InterfaceRef>,
        delay: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(ticket, "Pending rollback cancelled before its deadline");
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }

        let _guard = self.inner.workflow.lock().await;
        // Same lock as `cancel_pending_rollback`, so a cancel that reports
        // success always stops the restore.
        let claimed = {
            let mut slot = self.lock_pending();
            let ours = !cancel.is_cancelled() && slot.as_ref().is_some_and(|p| p.ticket == ticket);
            if ours {
                *slot = None;
            }
            ours
        };
        if !claimed {
            tracing::debug!(ticket, "Pending rollback superseded");
            return;
        }

        tracing::warn!(ticket, "Rolling back unverified DNS change");
        self.finish_rollback(&interfaces).await;
    }

    /// Restores every interface, then publishes the report. Caller holds
    /// the workflow lock.
    async fn finish_rollback(&self, interfaces: &[InterfaceRef]) -> Arc<RollbackReport> {
        let mut report = RollbackReport::default();
        for iface in interfaces {
            let result = match self.inner.snapshots.restore(iface.id).await {
                Ok(message) => RollbackResult::Restored(message),
                Err(DnsError::NoSnapshot(_)) => {
                    tracing::warn!(interface = %iface.id, name = %iface.name, "No snapshot, skipping rollback");
                    RollbackResult::NotAttempted
                }
                Err(e) => RollbackResult::Failed(e),
            };
            report.entries.push(RollbackEntry {
                interface: iface.clone(),
                result,
            });
        }

        let report = Arc::new(report);
        self.set_phase(Phase::RolledBack);
        let _ = self.inner.events.send(Event::RolledBack(Arc::clone(&report)));
        report
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.send_replace(phase);
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRollback>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u32, result: RollbackResult) -> RollbackEntry {
        RollbackEntry {
            interface: InterfaceRef::new(InterfaceId(index), format!("if{index}")),
            result,
        }
    }

    #[test]
    fn request_defaults() {
        let provider = DnsProvider::new("Quad9", ["9.9.9.9"]).unwrap();
        let request = ApplyRequest::new(provider).with_interface(InterfaceId(3), "Ethernet");
        assert!(request.use_encrypted_resolution);
        assert!(request.flush_cache_after_apply);
        assert_eq!(request.interfaces, vec![InterfaceRef::new(InterfaceId(3), "Ethernet")]);
    }

    #[test]
    fn rollback_report_summary() {
        let empty = RollbackReport::default();
        assert!(empty.all_restored());

        let report = RollbackReport {
            entries: vec![
                entry(1, RollbackResult::Restored("ok".to_string())),
                entry(2, RollbackResult::NotAttempted),
                entry(3, RollbackResult::Failed(DnsError::ExecutionFailed("boom".to_string()))),
            ],
        };
        assert!(!report.all_restored());
        let failures: Vec<_> = report.failures().map(|(i, _)| i.id).collect();
        assert_eq!(failures, vec![InterfaceId(3)]);
    }
}
