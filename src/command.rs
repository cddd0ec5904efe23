//! Typed platform commands.
//!
//! Every interaction with the operating system is expressed as a
//! [`Command`] value. The production runner renders it into a PowerShell
//! script with [`Command::script`]; test runners can interpret the enum
//! directly.

use std::fmt::Write as _;
use std::net::IpAddr;

use crate::interface::InterfaceId;

/// Registry key read for the administrative DoH policy.
pub const POLICY_KEY: &str = r"HKLM:\SOFTWARE\Policies\Microsoft\Windows NT\DNSClient";

/// Registry key holding the system-wide encrypted-only flag.
pub const DNSCACHE_PARAMETERS_KEY: &str =
    r"HKLM:\SYSTEM\CurrentControlSet\Services\Dnscache\Parameters";

/// Value name of the encrypted-only flag under [`DNSCACHE_PARAMETERS_KEY`].
pub const ENCRYPTION_FLAG_VALUE: &str = "EnableDohEbpf";

/// A single platform operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report the OS version as `major.minor.build[.revision]`.
    OsVersion,
    /// List all network adapters as JSON.
    ListAdapters,
    /// Read the IPv4 DNS server list of one interface as JSON.
    GetServerAddresses { interface: InterfaceId },
    /// Replace the DNS server list of one interface.
    SetServerAddresses {
        interface: InterfaceId,
        addresses: Vec<IpAddr>,
        /// Ask the platform to probe the servers before accepting them.
        validate: bool,
    },
    /// Revert one interface to DHCP-assigned DNS servers.
    ResetServerAddresses { interface: InterfaceId },
    /// Clear the system resolver cache.
    FlushCache,
    /// Resolve a name through the system resolver, discarding the answer.
    Resolve { domain: String },
    /// Print `BLOCKED` or `ALLOWED` according to the DoH policy.
    ReadDohPolicy,
    /// List registered DoH templates as JSON.
    ListDohServers,
    /// Register a DoH template for a server address.
    AddDohServer {
        address: IpAddr,
        template: String,
        auto_upgrade: bool,
        allow_fallback: bool,
    },
    /// Remove the DoH template of a server address, succeeding if none exists.
    RemoveDohServer { address: IpAddr },
    /// Print `1`, `0` or `NOT_SET` for the encrypted-only flag.
    ReadEncryptionFlag,
    /// Persist the encrypted-only flag.
    WriteEncryptionFlag { enabled: bool },
    /// Restart the DNS client service so flag changes take effect.
    RestartDnsService,
}

impl Command {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OsVersion => "os-version",
            Self::ListAdapters => "list-adapters",
            Self::GetServerAddresses { .. } => "get-server-addresses",
            Self::SetServerAddresses { .. } => "set-server-addresses",
            Self::ResetServerAddresses { .. } => "reset-server-addresses",
            Self::FlushCache => "flush-cache",
            Self::Resolve { .. } => "resolve",
            Self::ReadDohPolicy => "read-doh-policy",
            Self::ListDohServers => "list-doh-servers",
            Self::AddDohServer { .. } => "add-doh-server",
            Self::RemoveDohServer { .. } => "remove-doh-server",
            Self::ReadEncryptionFlag => "read-encryption-flag",
            Self::WriteEncryptionFlag { .. } => "write-encryption-flag",
            Self::RestartDnsService => "restart-dns-service",
        }
    }

    /// Renders the command as a PowerShell script.
    #[must_use]
    pub fn script(&self) -> String {
        match self {
            Self::OsVersion => "[System.Environment]::OSVersion.Version.ToString()".to_string(),
            Self::ListAdapters => "@(Get-NetAdapter | Select-Object Name, InterfaceIndex, \
                 InterfaceDescription, Status, LinkSpeed, MacAddress, Virtual) | ConvertTo-Json"
                .to_string(),
            Self::GetServerAddresses { interface } => format!(
                "@(Get-DnsClientServerAddress -InterfaceIndex {interface} -AddressFamily IPv4 \
                 -ErrorAction Stop | Select-Object ServerAddresses) | ConvertTo-Json"
            ),
            Self::SetServerAddresses {
                interface,
                addresses,
                validate,
            } => {
                let mut script = format!(
                    "Set-DnsClientServerAddress -InterfaceIndex {interface} -ServerAddresses ({}) \
                     -ErrorAction Stop",
                    address_list(addresses)
                );
                if *validate {
                    script.push_str(" -Validate");
                }
                script
            }
            Self::ResetServerAddresses { interface } => format!(
                "Set-DnsClientServerAddress -InterfaceIndex {interface} -ResetServerAddresses \
                 -ErrorAction Stop"
            ),
            Self::FlushCache => "Clear-DnsClientCache -ErrorAction Stop".to_string(),
            Self::Resolve { domain } => format!(
                "Resolve-DnsName -Name {} -DnsOnly -QuickTimeout -ErrorAction Stop | Out-Null",
                quote(domain)
            ),
            Self::ReadDohPolicy => format!(
                "$p = Get-ItemProperty -Path {} -Name EnableAutoDoh -ErrorAction SilentlyContinue; \
                 if ($p -and $p.EnableAutoDoh -eq 0) {{ 'BLOCKED' }} else {{ 'ALLOWED' }}",
                quote(POLICY_KEY)
            ),
            Self::ListDohServers => "@(Get-DnsClientDohServerAddress | Select-Object \
                 ServerAddress, DohTemplate, AutoUpgrade, AllowFallbackToUdp) | ConvertTo-Json"
                .to_string(),
            Self::AddDohServer {
                address,
                template,
                auto_upgrade,
                allow_fallback,
            } => format!(
                "Add-DnsClientDohServerAddress -ServerAddress {} -DohTemplate {} \
                 -AutoUpgrade:${auto_upgrade} -AllowFallbackToUdp:${allow_fallback} \
                 -ErrorAction Stop | Out-Null",
                quote(&address.to_string()),
                quote(template)
            ),
            Self::RemoveDohServer { address } => format!(
                "Remove-DnsClientDohServerAddress -ServerAddress {} -ErrorAction SilentlyContinue",
                quote(&address.to_string())
            ),
            Self::ReadEncryptionFlag => format!(
                "try {{ (Get-ItemPropertyValue -Path {} -Name {} -ErrorAction Stop).ToString() }} \
                 catch {{ 'NOT_SET' }}",
                quote(DNSCACHE_PARAMETERS_KEY),
                quote(ENCRYPTION_FLAG_VALUE)
            ),
            Self::WriteEncryptionFlag { enabled } => format!(
                "$path = {}; if (-not (Test-Path $path)) {{ New-Item -Path $path -Force | Out-Null }}; \
                 Set-ItemProperty -Path $path -Name {} -Value {} -Type DWord -ErrorAction Stop",
                quote(DNSCACHE_PARAMETERS_KEY),
                quote(ENCRYPTION_FLAG_VALUE),
                u8::from(*enabled)
            ),
            Self::RestartDnsService => "Restart-Service -Name Dnscache -Force -ErrorAction Stop".to_string(),
        }
    }
}

/// Wraps `value` in single quotes, doubling embedded quotes.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn address_list(addresses: &[IpAddr]) -> String {
    let mut out = String::new();
    for (i, addr) in addresses.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "'{addr}'");
    }
    out
}
