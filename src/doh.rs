//! DNS-over-HTTPS template registration and the encrypted-only mode.
//!
//! DoH templates are registered per server address, system-wide. An
//! interface is considered to resolve over DoH for a given server when
//! that server is both in the interface's server list and registered with
//! a template. The platform is the source of truth: nothing here caches
//! registrations between calls.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::Deserialize;

use crate::command::Command;
use crate::decode;
use crate::error::{DnsError, ErrorKind, Result};
use crate::executor::{CommandRunner, Executor};
use crate::interface::InterfaceId;
use crate::provider::DnsPolicy;
use crate::resolver::Resolver;

/// First build with DoH template support (Windows Server 2022 / Windows 11).
pub const MIN_DOH_VERSION: OsVersion = OsVersion::new(10, 0, 20348);

/// First build with the encrypted-only mode (Windows 11).
pub const MIN_ENCRYPTION_MODE_VERSION: OsVersion = OsVersion::new(10, 0, 22000);

const LABEL_ENCRYPTED_ONLY: &str = "Encrypted only (DoH)";
const LABEL_AUTOMATIC: &str = "Automatic (encryption disabled)";

/// `major.minor.build` of the running OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

impl FromStr for OsVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.trim().split('.').map(str::parse::<u32>);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(build))) => Ok(Self::new(major, minor, build)),
            _ => Err(format!("unrecognised OS version: {s:?}")),
        }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Platform features, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// DoH templates can be registered.
    pub doh: bool,
    /// The system-wide encrypted-only mode exists.
    pub encryption_mode: bool,
}

impl Capabilities {
    /// Capabilities of a given OS version; `None` means unknown and
    /// therefore unsupported.
    #[must_use]
    pub fn for_version(version: Option<OsVersion>) -> Self {
        version.map_or_else(Self::default, |v| Self {
            doh: v >= MIN_DOH_VERSION,
            encryption_mode: v >= MIN_ENCRYPTION_MODE_VERSION,
        })
    }
}

/// Whether DoH can be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Disabled by administrative policy.
    BlockedByPolicy,
    /// The platform version lacks DoH.
    Unsupported,
}

impl Availability {
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }

    /// Human-readable explanation.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Available => "DNS over HTTPS is supported and available",
            Self::BlockedByPolicy => {
                "DNS over HTTPS is blocked by administrative policy \
                 (HKLM\\SOFTWARE\\Policies\\Microsoft\\Windows NT\\DNSClient\\EnableAutoDoh)"
            }
            Self::Unsupported => {
                "DNS over HTTPS requires Windows 11 or Windows Server 2022 or newer"
            }
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// One registered DoH template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DohEntry {
    #[serde(rename = "ServerAddress")]
    pub address: IpAddr,
    #[serde(rename = "DohTemplate")]
    pub template: String,
    #[serde(default = "default_true")]
    pub auto_upgrade: bool,
    #[serde(rename = "AllowFallbackToUdp", default)]
    pub allow_fallback: bool,
}

const fn default_true() -> bool {
    true
}

/// Encrypted-resolution view of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDohState {
    pub interface: InterfaceId,
    pub name: String,
    /// The interface's configured servers.
    pub addresses: Vec<IpAddr>,
    /// Registered templates whose address the interface uses.
    pub entries: Vec<DohEntry>,
    pub encryption_enabled: bool,
    /// `None` when the mode is unsupported or has never been set.
    pub encryption_label: Option<&'static str>,
}

impl InterfaceDohState {
    /// Returns `true` if queries to `address` from this interface use DoH.
    #[must_use]
    pub fn is_encrypted(&self, address: IpAddr) -> bool {
        self.entries.iter().any(|e| e.address == address)
    }
}

/// Result of toggling the encrypted-only mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionModeChange {
    pub enabled: bool,
    /// `false` if the flag was written but the DNS service restart failed.
    pub service_restarted: bool,
}

/// What happened to the encrypted part of a provider configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohStatus {
    /// The provider has no template.
    NotRequested,
    /// The platform lacks DoH; only addresses were applied.
    Skipped,
    Configured,
    /// Some encrypted steps failed; addresses were still applied.
    PartiallyConfigured,
}

/// Outcome of [`EncryptedResolution::apply_provider_configuration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderApplyReport {
    pub doh: DohStatus,
    pub messages: Vec<String>,
}

impl ProviderApplyReport {
    /// Messages joined with newlines.
    #[must_use]
    pub fn summary(&self) -> String {
        self.messages.join("\n")
    }
}

/// Manages DoH templates and the encrypted-only mode.
pub struct EncryptedResolution<R> {
    exec: Executor<R>,
    resolver: Resolver<R>,
    caps: Capabilities,
}

impl<R: CommandRunner> EncryptedResolution<R> {
    /// Detects platform capabilities by querying the OS version.
    ///
    /// An unreadable version is treated as unsupported.
    pub async fn detect(exec: Executor<R>, resolver: Resolver<R>) -> Self {
        let version = match exec.execute(&Command::OsVersion).await {
            Ok(out) => match out.parse::<OsVersion>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot parse OS version");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Cannot determine OS version");
                None
            }
        };
        let caps = Capabilities::for_version(version);

        if caps.doh {
            tracing::info!(version = ?version, "DNS over HTTPS is supported");
        } else {
            tracing::warn!(version = ?version, "DNS over HTTPS is not supported on this platform");
        }
        if !caps.encryption_mode {
            tracing::info!("Encrypted-only DNS mode requires Windows 11 or newer");
        }

        Self::with_capabilities(exec, resolver, caps)
    }

    /// Uses known capabilities without probing.
    pub const fn with_capabilities(exec: Executor<R>, resolver: Resolver<R>, caps: Capabilities) -> Self {
        Self {
            exec,
            resolver,
            caps,
        }
    }

    pub const fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Checks platform support and administrative policy.
    ///
    /// A policy that cannot be read is treated as allowing DoH.
    pub async fn availability(&self) -> Availability {
        if !self.caps.doh {
            return Availability::Unsupported;
        }
        match self.exec.execute(&Command::ReadDohPolicy).await {
            Ok(out) if out.trim() == "BLOCKED" => Availability::BlockedByPolicy,
            Ok(_) => Availability::Available,
            Err(e) => {
                tracing::debug!(error = %e, "Cannot read DoH policy, assuming allowed");
                Availability::Available
            }
        }
    }

    /// Registers `template` for `address`, replacing any existing template.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Unsupported`] without touching the platform if
    /// DoH is unavailable, otherwise the classified executor error.
    pub async fn register_template(
        &self,
        address: IpAddr,
        template: &str,
        auto_upgrade: bool,
        allow_fallback: bool,
    ) -> Result<()> {
        self.require_doh()?;
        self.unregister_template(address).await?;

        self.exec
            .execute(&Command::AddDohServer {
                address,
                template: template.to_string(),
                auto_upgrade,
                allow_fallback,
            })
            .await
            .inspect_err(|e| tracing::warn!(%address, error = %e, "Failed to register DoH template"))?;

        tracing::info!(%address, template, "Registered DoH template");
        Ok(())
    }

    /// Removes the template registered for `address`.
    ///
    /// Removing an address that has no template succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Unsupported`] if DoH is unavailable, otherwise the
    /// classified executor error.
    pub async fn unregister_template(&self, address: IpAddr) -> Result<()> {
        self.require_doh()?;
        match self
            .exec
            .execute(&Command::RemoveDohServer { address })
            .await
        {
            Ok(_) => {
                tracing::debug!(%address, "Removed DoH template");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::TargetNotFound => {
                tracing::debug!(%address, "DoH template was not registered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Lists every registered template, fresh from the platform.
    ///
    /// Returns an empty vec if DoH is unsupported.
    ///
    /// # Errors
    ///
    /// Returns the classified executor error or a decode error.
    pub async fn registered(&self) -> Result<Vec<DohEntry>> {
        if !self.caps.doh {
            return Ok(Vec::new());
        }
        let output = self.exec.execute(&Command::ListDohServers).await?;
        decode::records(&output, "DoH server list")
    }

    /// Enables or disables the system-wide encrypted-only mode.
    ///
    /// The flag is persisted first; the DNS service restart that activates
    /// it is best-effort and reported through
    /// [`EncryptionModeChange::service_restarted`].
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Unsupported`] if the mode does not exist on this
    /// platform, or the executor error if the flag cannot be written.
    pub async fn set_encrypted_only_mode(&self, enabled: bool) -> Result<EncryptionModeChange> {
        if !self.caps.encryption_mode {
            return Err(DnsError::Unsupported {
                detail: "encrypted-only DNS mode requires Windows 11 or newer".to_string(),
            });
        }

        self.exec
            .execute(&Command::WriteEncryptionFlag { enabled })
            .await
            .inspect_err(|e| tracing::warn!(enabled, error = %e, "Failed to write encrypted-only flag"))?;

        let service_restarted = match self.exec.execute(&Command::RestartDnsService).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "DNS client service restart failed; change applies after reboot");
                false
            }
        };

        tracing::info!(enabled, service_restarted, "Set encrypted-only DNS mode");
        Ok(EncryptionModeChange {
            enabled,
            service_restarted,
        })
    }

    /// Reads the encrypted-only flag; `None` if unsupported or never set.
    ///
    /// # Errors
    ///
    /// Returns the classified executor error.
    pub async fn encrypted_only_mode(&self) -> Result<Option<bool>> {
        if !self.caps.encryption_mode {
            return Ok(None);
        }
        let output = self.exec.execute(&Command::ReadEncryptionFlag).await?;
        Ok(match output.trim() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        })
    }

    /// Correlates an interface's servers with the registered templates.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface's servers or the template list
    /// cannot be read. A failure to read the encrypted-only flag is not an
    /// error; the mode is then reported as unknown.
    pub async fn interface_state(&self, interface: InterfaceId, name: &str) -> Result<InterfaceDohState> {
        let addresses = self.resolver.addresses(interface).await?;
        let entries = self
            .registered()
            .await?
            .into_iter()
            .filter(|e| addresses.contains(&e.address))
            .collect();

        let mode = self.encrypted_only_mode().await.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Cannot read encrypted-only flag");
            None
        });
        let (encryption_enabled, encryption_label) = match mode {
            Some(true) => (true, Some(LABEL_ENCRYPTED_ONLY)),
            Some(false) => (false, Some(LABEL_AUTOMATIC)),
            None => (false, None),
        };

        Ok(InterfaceDohState {
            interface,
            name: name.to_string(),
            addresses,
            entries,
            encryption_enabled,
            encryption_label,
        })
    }

    /// Applies a provider's servers and, where possible, its DoH template.
    ///
    /// The servers are always applied (with validation). Every encrypted
    /// step after that is best-effort: unsupported or failed steps are
    /// recorded in the report instead of failing the call.
    ///
    /// # Errors
    ///
    /// Returns an error only if the servers themselves cannot be applied.
    pub async fn apply_provider_configuration(
        &self,
        interface: InterfaceId,
        addresses: &[IpAddr],
        template: Option<&str>,
        policy: &DnsPolicy,
    ) -> Result<ProviderApplyReport> {
        self.resolver.set_addresses(interface, addresses, true).await?;

        let mut report = ProviderApplyReport {
            doh: DohStatus::NotRequested,
            messages: vec!["DNS servers applied successfully".to_string()],
        };

        let Some(template) = template else {
            return Ok(report);
        };

        if !self.caps.doh {
            tracing::info!(interface = %interface, "Skipping DoH: not supported on this platform");
            report.doh = DohStatus::Skipped;
            report
                .messages
                .push("Encrypted resolution skipped: DoH is not supported on this platform version".to_string());
            return Ok(report);
        }

        let mut failures = 0_usize;
        for &address in addresses {
            match self
                .register_template(address, template, policy.auto_upgrade, policy.allow_unencrypted_fallback)
                .await
            {
                Ok(()) => report.messages.push(format!("DoH configured for {address}")),
                Err(e) => {
                    failures += 1;
                    report
                        .messages
                        .push(format!("DoH registration failed for {address}: {e}"));
                }
            }
        }

        if policy.encrypted_only {
            if self.caps.encryption_mode {
                match self.set_encrypted_only_mode(true).await {
                    Ok(change) if change.service_restarted => {
                        report.messages.push("Encryption: encrypted only".to_string());
                    }
                    Ok(_) => report.messages.push(
                        "Encryption: encrypted only (takes effect after the DNS client service restarts)"
                            .to_string(),
                    ),
                    Err(e) => {
                        failures += 1;
                        report
                            .messages
                            .push(format!("Encrypted-only mode could not be enabled: {e}"));
                    }
                }
            } else {
                report.messages.push(
                    "Encrypted-only mode skipped: requires Windows 11 or newer".to_string(),
                );
            }
        }

        report.doh = if failures == 0 {
            DohStatus::Configured
        } else {
            DohStatus::PartiallyConfigured
        };
        Ok(report)
    }

    fn require_doh(&self) -> Result<()> {
        if self.caps.doh {
            Ok(())
        } else {
            Err(DnsError::Unsupported {
                detail: Availability::Unsupported.reason().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_os_version() {
        assert_eq!(
            "10.0.22631.0".parse::<OsVersion>().unwrap(),
            OsVersion::new(10, 0, 22631)
        );
        assert_eq!("10.0.19045".parse::<OsVersion>().unwrap().build, 19045);
        assert!("garbage".parse::<OsVersion>().is_err());
        assert!("10.0".parse::<OsVersion>().is_err());
    }

    #[test]
    fn capabilities_by_version() {
        let win10 = Capabilities::for_version(Some(OsVersion::new(10, 0, 19045)));
        assert_eq!(win10, Capabilities::default());

        let server2022 = Capabilities::for_version(Some(OsVersion::new(10, 0, 20348)));
        assert!(server2022.doh);
        assert!(!server2022.encryption_mode);

        let win11 = Capabilities::for_version(Some(OsVersion::new(10, 0, 22631)));
        assert!(win11.doh && win11.encryption_mode);

        assert_eq!(Capabilities::for_version(None), Capabilities::default());
    }

    #[test]
    fn availability_reasons_are_distinct() {
        let all = [
            Availability::Available,
            Availability::BlockedByPolicy,
            Availability::Unsupported,
        ];
        assert!(Availability::Available.is_available());
        assert!(!Availability::BlockedByPolicy.is_available());
        assert!(Availability::BlockedByPolicy.reason().contains("policy"));
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.reason(), b.reason());
            }
        }
    }

    #[test]
    fn decodes_doh_entries() {
        let entries: Vec<DohEntry> = decode::records(
            r#"[{"ServerAddress":"1.1.1.1","DohTemplate":"https://cloudflare-dns.com/dns-query",
                 "AutoUpgrade":true,"AllowFallbackToUdp":false},
                {"ServerAddress":"8.8.8.8","DohTemplate":"https://dns.google/dns-query"}]"#,
            "DoH server list",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].address, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert!(entries[1].auto_upgrade);
        assert!(!entries[1].allow_fallback);
    }
}
