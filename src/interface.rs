//! Network interfaces eligible for DNS management.

use std::fmt;

use serde::Deserialize;

use crate::command::Command;
use crate::decode;
use crate::error::Result;
use crate::executor::{CommandRunner, Executor};

/// Name/description fragments that mark an adapter as non-physical.
pub const VIRTUAL_PATTERNS: &[&str] = &[
    "Loopback",
    "Virtual",
    "VMware",
    "VirtualBox",
    "Hyper-V",
    "TAP",
    "VPN",
    "Wi-Fi Direct",
    "Bluetooth",
    "vEthernet",
];

const VPN_PATTERNS: &[&str] = &["vpn", "ras", "pptp", "l2tp"];

/// Platform index of a network interface, stable for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for InterfaceId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Adapter classification derived from its name and description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Physical,
    Virtual,
    Loopback,
    Vpn,
    Tunnel,
}

impl InterfaceKind {
    /// Classifies an adapter.
    ///
    /// Loopback wins over VPN, which wins over TAP/TUN, which wins over the
    /// generic virtual patterns.
    #[must_use]
    pub fn classify(name: &str, description: &str) -> Self {
        let combined = format!("{name} {description}").to_lowercase();

        if combined.contains("loopback") {
            Self::Loopback
        } else if VPN_PATTERNS.iter().any(|p| contains_word(&combined, p)) {
            Self::Vpn
        } else if contains_word(&combined, "tap") || contains_word(&combined, "tun") {
            Self::Tunnel
        } else if VIRTUAL_PATTERNS
            .iter()
            .any(|p| combined.contains(&p.to_lowercase()))
        {
            Self::Virtual
        } else {
            Self::Physical
        }
    }

    #[must_use]
    pub const fn is_physical(self) -> bool {
        matches!(self, Self::Physical)
    }
}

/// Matches `needle` as a whole alphanumeric token so that e.g. "ras" does
/// not match "Realtek PCIe GbE Family Controller ... Ultras".
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == needle)
}

/// A network adapter as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub id: InterfaceId,
    pub name: String,
    pub description: String,
    /// Link status as reported (e.g. `"Up"`, `"Disconnected"`).
    pub status: String,
    pub link_speed: Option<String>,
    pub mac_address: Option<String>,
    pub kind: InterfaceKind,
}

impl NetworkInterface {
    /// Returns `true` if the adapter has an active link.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.status.eq_ignore_ascii_case("up")
    }

    #[must_use]
    pub const fn is_physical(&self) -> bool {
        self.kind.is_physical()
    }

    /// `"Ethernet [1 Gbps]"`, or just the name when the speed is unknown.
    #[must_use]
    pub fn display_label(&self) -> String {
        match &self.link_speed {
            Some(speed) => format!("{} [{speed}]", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AdapterRecord {
    name: String,
    interface_index: InterfaceId,
    #[serde(default)]
    interface_description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    link_speed: Option<String>,
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    r#virtual: Option<bool>,
}

impl From<AdapterRecord> for NetworkInterface {
    fn from(rec: AdapterRecord) -> Self {
        let description = rec.interface_description.unwrap_or_default();
        let mut kind = InterfaceKind::classify(&rec.name, &description);
        if kind.is_physical() && rec.r#virtual == Some(true) {
            kind = InterfaceKind::Virtual;
        }
        Self {
            id: rec.interface_index,
            name: rec.name,
            description,
            status: rec.status.unwrap_or_else(|| "Unknown".to_string()),
            link_speed: rec.link_speed,
            mac_address: rec.mac_address,
            kind,
        }
    }
}

/// Filter applied by [`Inventory::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFilter {
    pub include_virtual: bool,
    pub include_down: bool,
}

impl InterfaceFilter {
    #[must_use]
    pub const fn include_virtual(mut self, yes: bool) -> Self {
        self.include_virtual = yes;
        self
    }

    #[must_use]
    pub const fn include_down(mut self, yes: bool) -> Self {
        self.include_down = yes;
        self
    }

    fn accepts(self, iface: &NetworkInterface) -> bool {
        (self.include_virtual || iface.is_physical()) && (self.include_down || iface.is_up())
    }
}

/// Enumerates adapters through the platform.
pub struct Inventory<R> {
    exec: Executor<R>,
}

impl<R: CommandRunner> Inventory<R> {
    pub const fn new(exec: Executor<R>) -> Self {
        Self { exec }
    }

    /// Lists adapters accepted by `filter`, sorted case-insensitively by name.
    ///
    /// Returns an empty vec when nothing qualifies.
    ///
    /// # Errors
    ///
    /// Returns the executor error if the adapter query fails, or
    /// [`DnsError::Decode`](crate::DnsError::Decode) on a malformed payload.
    pub async fn list(&self, filter: InterfaceFilter) -> Result<Vec<NetworkInterface>> {
        let output = self.exec.execute(&Command::ListAdapters).await?;
        let records: Vec<AdapterRecord> = decode::records(&output, "adapter list")?;
        let interfaces = select(records.into_iter().map(NetworkInterface::from), filter);
        tracing::debug!(count = interfaces.len(), "Enumerated network interfaces");
        Ok(interfaces)
    }
}

fn select(
    all: impl IntoIterator<Item = NetworkInterface>,
    filter: InterfaceFilter,
) -> Vec<NetworkInterface> {
    let mut out: Vec<_> = all.into_iter().filter(|i| filter.accepts(i)).collect();
    out.sort_by_cached_key(|i| i.name.to_lowercase());
    out
}
