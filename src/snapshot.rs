//! Pre-change DNS snapshots used for rollback.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{DnsError, Result};
use crate::executor::CommandRunner;
use crate::interface::InterfaceId;
use crate::resolver::Resolver;

/// DNS configuration of one interface captured before a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSnapshot {
    pub interface: InterfaceId,
    pub name: String,
    /// Empty when the interface was automatic.
    pub addresses: Vec<IpAddr>,
    pub is_automatic: bool,
    pub captured_at: DateTime<Utc>,
}

/// Holds at most one snapshot per interface.
///
/// Capturing again for the same interface replaces the previous snapshot.
/// The store is safe to share between the apply flow and a pending
/// rollback task.
pub struct SnapshotStore<R> {
    resolver: Resolver<R>,
    snapshots: Mutex<HashMap<InterfaceId, DnsSnapshot>>,
}

impl<R: CommandRunner> SnapshotStore<R> {
    pub fn new(resolver: Resolver<R>) -> Self {
        Self {
            resolver,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Records the interface's current servers.
    ///
    /// # Errors
    ///
    /// Returns the error from reading the servers; no snapshot is stored
    /// and any older snapshot for the interface is left untouched.
    pub async fn capture(&self, interface: InterfaceId, name: &str) -> Result<()> {
        let addresses = self.resolver.addresses(interface).await?;
        let snapshot = DnsSnapshot {
            interface,
            name: name.to_string(),
            is_automatic: addresses.is_empty(),
            addresses,
            captured_at: Utc::now(),
        };

        tracing::info!(
            interface = %interface,
            name,
            automatic = snapshot.is_automatic,
            addresses = ?snapshot.addresses,
            "Captured DNS snapshot"
        );
        self.lock().insert(interface, snapshot);
        Ok(())
    }

    /// Puts the interface back into its captured state.
    ///
    /// Automatic snapshots are restored by resetting to automatic; explicit
    /// ones by re-applying the servers without validation. The snapshot is
    /// kept, so restoring twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NoSnapshot`] if nothing was captured for the
    /// interface, or the error from the restoring command.
    pub async fn restore(&self, interface: InterfaceId) -> Result<String> {
        let snapshot = self.get(interface).ok_or(DnsError::NoSnapshot(interface))?;

        let outcome = if snapshot.is_automatic {
            self.resolver
                .reset_to_automatic(interface)
                .await
                .map(|()| format!("Rolled back {} to automatic (DHCP)", snapshot.name))
        } else {
            self.resolver
                .set_addresses(interface, &snapshot.addresses, false)
                .await
                .map(|()| format!("Rolled back {} to previous DNS servers", snapshot.name))
        };

        match &outcome {
            Ok(message) => tracing::info!(interface = %interface, "{message}"),
            Err(e) => tracing::error!(
                interface = %interface,
                name = %snapshot.name,
                error = %e,
                "Rollback failed"
            ),
        }
        outcome
    }

    /// Returns a copy of the interface's snapshot.
    pub fn get(&self, interface: InterfaceId) -> Option<DnsSnapshot> {
        self.lock().get(&interface).cloned()
    }

    pub fn has(&self, interface: InterfaceId) -> bool {
        self.lock().contains_key(&interface)
    }

    pub fn clear(&self, interface: InterfaceId) {
        if self.lock().remove(&interface).is_some() {
            tracing::debug!(interface = %interface, "Cleared DNS snapshot");
        }
    }

    pub fn clear_all(&self) {
        self.lock().clear();
        tracing::debug!("Cleared all DNS snapshots");
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InterfaceId, DnsSnapshot>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
