//! Per-interface DNS server configuration.

use std::net::IpAddr;

use serde::Deserialize;

use crate::command::Command;
use crate::decode;
use crate::error::{DnsError, Result};
use crate::executor::{CommandRunner, Executor};
use crate::interface::InterfaceId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServerAddressRecord {
    #[serde(default)]
    server_addresses: Option<Vec<IpAddr>>,
}

/// Reads and writes the DNS server list of individual interfaces.
///
/// An empty server list means the interface obtains its servers
/// automatically (DHCP).
pub struct Resolver<R> {
    exec: Executor<R>,
}

impl<R> Clone for Resolver<R> {
    fn clone(&self) -> Self {
        Self {
            exec: self.exec.clone(),
        }
    }
}

impl<R: CommandRunner> Resolver<R> {
    pub const fn new(exec: Executor<R>) -> Self {
        Self { exec }
    }

    /// Returns the interface's configured servers, in priority order.
    ///
    /// # Errors
    ///
    /// Returns the classified executor error, or
    /// [`DnsError::Decode`] if the platform reports an unparseable address.
    pub async fn addresses(&self, interface: InterfaceId) -> Result<Vec<IpAddr>> {
        let output = self
            .exec
            .execute(&Command::GetServerAddresses { interface })
            .await?;
        let records: Vec<ServerAddressRecord> = decode::records(&output, "server address list")?;
        Ok(records
            .into_iter()
            .next()
            .and_then(|r| r.server_addresses)
            .unwrap_or_default())
    }

    /// Replaces the interface's servers with `addresses`.
    ///
    /// With `validate`, the platform probes the servers first and the call
    /// fails if they are unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::InvalidParameter`] for an empty list (no command is
    /// run), otherwise the classified executor error.
    pub async fn set_addresses(
        &self,
        interface: InterfaceId,
        addresses: &[IpAddr],
        validate: bool,
    ) -> Result<()> {
        if addresses.is_empty() {
            return Err(DnsError::InvalidParameter {
                detail: "no DNS servers provided".to_string(),
            });
        }

        let command = Command::SetServerAddresses {
            interface,
            addresses: addresses.to_vec(),
            validate,
        };
        match self.exec.execute(&command).await {
            Ok(_) => {
                tracing::info!(interface = %interface, ?addresses, validate, "Applied DNS servers");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(interface = %interface, error = %e, "Failed to apply DNS servers");
                Err(e)
            }
        }
    }

    /// Reverts the interface to automatically assigned servers.
    ///
    /// # Errors
    ///
    /// Returns the classified executor error.
    pub async fn reset_to_automatic(&self, interface: InterfaceId) -> Result<()> {
        match self
            .exec
            .execute(&Command::ResetServerAddresses { interface })
            .await
        {
            Ok(_) => {
                tracing::info!(interface = %interface, "Reset DNS servers to automatic");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(interface = %interface, error = %e, "Failed to reset DNS servers");
                Err(e)
            }
        }
    }

    /// Clears the system-wide resolver cache.
    ///
    /// Callers treat failure as advisory.
    ///
    /// # Errors
    ///
    /// Returns the classified executor error.
    pub async fn flush_cache(&self) -> Result<()> {
        match self.exec.execute(&Command::FlushCache).await {
            Ok(_) => {
                tracing::info!("Flushed DNS resolver cache");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to flush DNS resolver cache");
                Err(e)
            }
        }
    }
}
