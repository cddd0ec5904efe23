//! DNS provider descriptions.
//!
//! Providers are loaded and validated elsewhere; this crate only reads
//! them.

use std::net::IpAddr;

use serde::Deserialize;

/// How a provider's encrypted endpoint should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DnsPolicy {
    /// Enable the system-wide encrypted-only mode when applying.
    pub encrypted_only: bool,
    /// Let the platform upgrade plain queries to DoH automatically.
    #[serde(alias = "autoupgrade")]
    pub auto_upgrade: bool,
    /// Allow falling back to unencrypted UDP when DoH fails.
    #[serde(alias = "allow_udp_fallback")]
    pub allow_unencrypted_fallback: bool,
}

impl Default for DnsPolicy {
    fn default() -> Self {
        Self {
            encrypted_only: false,
            auto_upgrade: true,
            allow_unencrypted_fallback: false,
        }
    }
}

/// A named set of resolver addresses with an optional DoH template.
///
/// # Example
///
/// ```
/// use dns_guard::DnsProvider;
///
/// let cloudflare = DnsProvider::new("Cloudflare", ["1.1.1.1", "1.0.0.1"])
///     .unwrap()
///     .with_doh_template("https://cloudflare-dns.com/dns-query");
///
/// assert_eq!(cloudflare.ipv4.len(), 2);
/// assert!(cloudflare.doh_template.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsProvider {
    pub name: String,
    pub ipv4: Vec<IpAddr>,
    #[serde(default)]
    pub ipv6: Option<Vec<IpAddr>>,
    #[serde(default)]
    pub doh_template: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub policy: DnsPolicy,
}

impl DnsProvider {
    /// Creates a provider with the default policy and no DoH template.
    ///
    /// # Errors
    ///
    /// Returns the parse error of the first malformed address.
    pub fn new<I, S>(name: impl Into<String>, ipv4: I) -> Result<Self, std::net::AddrParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ipv4 = ipv4
            .into_iter()
            .map(|a| a.as_ref().parse())
            .collect::<Result<Vec<IpAddr>, _>>()?;
        Ok(Self {
            name: name.into(),
            ipv4,
            ipv6: None,
            doh_template: None,
            tags: Vec::new(),
            policy: DnsPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_doh_template(mut self, template: impl Into<String>) -> Self {
        self.doh_template = Some(template.into());
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: DnsPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_ipv6(mut self, ipv6: Vec<IpAddr>) -> Self {
        self.ipv6 = Some(ipv6);
        self
    }

    #[must_use]
    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if the provider publishes a DoH endpoint.
    #[must_use]
    pub const fn supports_doh(&self) -> bool {
        self.doh_template.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let p = DnsPolicy::default();
        assert!(!p.encrypted_only);
        assert!(p.auto_upgrade);
        assert!(!p.allow_unencrypted_fallback);
    }

    #[test]
    fn new_rejects_bad_address() {
        assert!(DnsProvider::new("bad", ["1.1.1"]).is_err());
    }

    #[test]
    fn deserializes_loader_shape() {
        let provider: DnsProvider = serde_json::from_str(
            r#"{
                "name": "Quad9",
                "ipv4": ["9.9.9.9", "149.112.112.112"],
                "ipv6": ["2620:fe::fe"],
                "doh_template": "https://dns.quad9.net/dns-query",
                "tags": ["privacy"],
                "policy": {"encrypted_only": true, "autoupgrade": false, "allow_udp_fallback": true}
            }"#,
        )
        .unwrap();

        assert_eq!(provider.ipv4[0], "9.9.9.9".parse::<IpAddr>().unwrap());
        assert_eq!(provider.ipv6.as_ref().map(Vec::len), Some(1));
        assert!(provider.supports_doh());
        assert!(provider.policy.encrypted_only);
        assert!(!provider.policy.auto_upgrade);
        assert!(provider.policy.allow_unencrypted_fallback);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let provider: DnsProvider =
            serde_json::from_str(r#"{"name": "Google", "ipv4": ["8.8.8.8"]}"#).unwrap();
        assert!(provider.tags.is_empty());
        assert_eq!(provider.policy, DnsPolicy::default());
        assert!(!provider.supports_doh());
    }
}
