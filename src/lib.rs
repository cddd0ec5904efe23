//! # dns-guard
//!
//! Apply DNS providers to Windows network interfaces with automatic
//! verification and rollback.
//!
//! Every change follows the same cycle: snapshot the current servers of
//! each selected interface, apply the new servers (and, where the platform
//! allows it, a DNS-over-HTTPS template), resolve a few test domains, and
//! either commit or revert to the snapshot. Reverting is deferred by a
//! configurable delay so an operator can keep a change that verification
//! flagged, and any later change cancels it.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use dns_guard::{ApplyRequest, DnsProvider, GuardConfig, InterfaceFilter, Orchestrator, PowerShell};
//!
//! let guard = Orchestrator::new(PowerShell::new(), GuardConfig::default()).await;
//!
//! let interfaces = guard.inventory().list(InterfaceFilter::default()).await?;
//! let cloudflare = DnsProvider::new("Cloudflare", ["1.1.1.1", "1.0.0.1"])?
//!     .with_doh_template("https://cloudflare-dns.com/dns-query");
//!
//! let outcome = guard
//!     .apply(ApplyRequest::new(cloudflare).with_interfaces(&interfaces))
//!     .await?;
//! println!("{:?}", outcome.status);
//! ```
//!
//! ## Rollback
//!
//! When verification does not fully succeed the outcome status is
//! [`OutcomeStatus::PendingRollback`] and the previous servers are restored
//! after [`GuardConfig::rollback_delay`]. Keep the change with
//! [`Orchestrator::cancel_pending_rollback`], or watch
//! [`Orchestrator::subscribe_events`] for [`Event::RolledBack`].
//!
//! ## Platform access
//!
//! All OS interaction goes through a [`CommandRunner`]. [`PowerShell`] is
//! the production runner; tests supply their own implementation that
//! interprets [`Command`] values directly.
//!
//! ## Permissions
//!
//! Changing DNS servers, DoH templates and the encrypted-only flag requires
//! an elevated process. Denials surface as
//! [`DnsError::PermissionDenied`]; the caller is responsible for elevation.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod decode;
pub mod doh;
pub mod error;
pub mod executor;
pub mod interface;
pub mod orchestrator;
pub mod provider;
pub mod resolver;
pub mod snapshot;
pub mod verify;

pub use command::Command;
pub use config::{GuardConfig, SnapshotRetention};
pub use doh::{
    Availability, Capabilities, DohEntry, DohStatus, EncryptedResolution, EncryptionModeChange,
    InterfaceDohState, OsVersion, ProviderApplyReport,
};
pub use error::{DnsError, ErrorKind, Result};
pub use executor::{CommandRunner, Executor, PowerShell};
pub use interface::{InterfaceFilter, InterfaceId, InterfaceKind, Inventory, NetworkInterface};
pub use orchestrator::{
    ApplyOutcome, ApplyRequest, Event, InterfaceOutcome, InterfaceRef, Orchestrator, OutcomeStatus,
    Phase, RollbackEntry, RollbackReport, RollbackResult,
};
pub use provider::{DnsPolicy, DnsProvider};
pub use resolver::Resolver;
pub use snapshot::{DnsSnapshot, SnapshotStore};
pub use verify::{VerificationResult, VerificationStatus, Verifier, VerifyRollback};
