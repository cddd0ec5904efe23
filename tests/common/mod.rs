//! In-memory platform used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dns_guard::{Command, CommandRunner, DnsError, Executor, Resolver};
use serde_json::{Value, json};

pub const WIN11: &str = "10.0.22631.0";
pub const WIN10: &str = "10.0.19045.0";
pub const SERVER_2022: &str = "10.0.20348.0";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn ips(list: &[&str]) -> Vec<IpAddr> {
    list.iter().map(|s| ip(s)).collect()
}

#[derive(Debug, Clone)]
struct DohRow {
    address: IpAddr,
    template: String,
    auto_upgrade: bool,
    allow_fallback: bool,
}

#[derive(Debug, Default)]
struct State {
    os_version: String,
    adapters: Vec<Value>,
    servers: HashMap<u32, Vec<IpAddr>>,
    doh: Vec<DohRow>,
    policy_blocked: bool,
    encryption_flag: Option<bool>,
    /// Resolution fails while any interface uses one of these.
    broken_servers: HashSet<IpAddr>,
    unresolvable: HashSet<String>,
    resolve_delay: Option<Duration>,
    /// Diagnostics keyed by command name and, optionally, interface.
    failures: HashMap<(&'static str, Option<u32>), String>,
    log: Vec<Command>,
}

/// Fake Windows host. Clones share state, so a test keeps one handle for
/// inspection and hands another to the code under test.
#[derive(Debug, Clone)]
pub struct FakeSystem {
    state: Arc<Mutex<State>>,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSystem {
    pub fn new() -> Self {
        let state = State {
            os_version: WIN11.to_string(),
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // ── Setup ────────────────────────────────────────────────────

    pub fn with_os_version(self, version: &str) -> Self {
        self.lock().os_version = version.to_string();
        self
    }

    /// Adds an adapter that starts with automatic DNS.
    pub fn with_adapter(self, index: u32, name: &str, description: &str, status: &str) -> Self {
        {
            let mut s = self.lock();
            s.adapters.push(json!({
                "Name": name,
                "InterfaceIndex": index,
                "InterfaceDescription": description,
                "Status": status,
                "LinkSpeed": "1 Gbps",
                "MacAddress": "00-11-22-33-44-55",
                "Virtual": false,
            }));
            s.servers.insert(index, Vec::new());
        }
        self
    }

    pub fn with_ethernet(self, index: u32, name: &str) -> Self {
        self.with_adapter(index, name, "Intel(R) Ethernet Connection I219-V", "Up")
    }

    pub fn with_servers(self, index: u32, servers: &[&str]) -> Self {
        self.lock().servers.insert(index, ips(servers));
        self
    }

    pub fn with_doh(self, address: &str, template: &str) -> Self {
        self.lock().doh.push(DohRow {
            address: ip(address),
            template: template.to_string(),
            auto_upgrade: true,
            allow_fallback: false,
        });
        self
    }

    pub fn with_policy_blocked(self) -> Self {
        self.lock().policy_blocked = true;
        self
    }

    pub fn with_encryption_flag(self, enabled: bool) -> Self {
        self.lock().encryption_flag = Some(enabled);
        self
    }

    /// Servers that are reachable but do not answer queries.
    pub fn with_broken_servers(self, servers: &[&str]) -> Self {
        self.lock().broken_servers.extend(ips(servers));
        self
    }

    pub fn with_unresolvable(self, domain: &str) -> Self {
        self.lock().unresolvable.insert(domain.to_string());
        self
    }

    pub fn with_resolve_delay(self, delay: Duration) -> Self {
        self.lock().resolve_delay = Some(delay);
        self
    }

    /// Makes every `command` fail with `diagnostic`.
    pub fn fail(&self, command: &'static str, diagnostic: &str) {
        self.lock()
            .failures
            .insert((command, None), diagnostic.to_string());
    }

    /// Makes `command` fail with `diagnostic` for one interface only.
    pub fn fail_on(&self, command: &'static str, interface: u32, diagnostic: &str) {
        self.lock()
            .failures
            .insert((command, Some(interface)), diagnostic.to_string());
    }

    pub fn heal(&self, command: &'static str) {
        self.lock().failures.retain(|(name, _), _| *name != command);
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn servers(&self, index: u32) -> Vec<IpAddr> {
        self.lock().servers.get(&index).cloned().unwrap_or_default()
    }

    /// Registered DoH addresses.
    pub fn doh_addresses(&self) -> Vec<IpAddr> {
        self.lock().doh.iter().map(|r| r.address).collect()
    }

    pub fn encryption_flag(&self) -> Option<bool> {
        self.lock().encryption_flag
    }

    pub fn log(&self) -> Vec<Command> {
        self.lock().log.clone()
    }

    /// Number of logged commands named `name`.
    pub fn count(&self, name: &str) -> usize {
        self.lock().log.iter().filter(|c| c.name() == name).count()
    }

    pub fn executor(&self) -> Executor<Self> {
        Executor::new(self.clone())
    }

    pub fn resolver(&self) -> Resolver<Self> {
        Resolver::new(self.executor())
    }

    // ── Interpretation ───────────────────────────────────────────

    fn handle(&self, command: &Command) -> (Option<Duration>, Result<String, DnsError>) {
        let mut s = self.lock();
        s.log.push(command.clone());

        let target = match command {
            Command::GetServerAddresses { interface }
            | Command::SetServerAddresses { interface, .. }
            | Command::ResetServerAddresses { interface } => Some(interface.0),
            _ => None,
        };
        let injected = target
            .and_then(|t| s.failures.get(&(command.name(), Some(t))))
            .or_else(|| s.failures.get(&(command.name(), None)));
        if let Some(diagnostic) = injected {
            return (None, Err(DnsError::from_diagnostic(diagnostic)));
        }

        if let Some(index) = target {
            if !s.servers.contains_key(&index) {
                return (
                    None,
                    Err(DnsError::from_diagnostic(&format!(
                        "No MSFT_DNSClientServerAddress objects found with property \
                         'InterfaceIndex' equal to '{index}'"
                    ))),
                );
            }
        }

        let reply = match command {
            Command::OsVersion => Ok(s.os_version.clone()),
            Command::ListAdapters => Ok(Value::Array(s.adapters.clone()).to_string()),
            Command::GetServerAddresses { interface } => {
                let addrs: Vec<String> = s.servers[&interface.0].iter().map(ToString::to_string).collect();
                Ok(json!([{ "ServerAddresses": addrs }]).to_string())
            }
            Command::SetServerAddresses {
                interface, addresses, ..
            } => {
                s.servers.insert(interface.0, addresses.clone());
                Ok(String::new())
            }
            Command::ResetServerAddresses { interface } => {
                s.servers.insert(interface.0, Vec::new());
                Ok(String::new())
            }
            Command::FlushCache | Command::RestartDnsService => Ok(String::new()),
            Command::Resolve { domain } => {
                let broken = s
                    .servers
                    .values()
                    .flatten()
                    .any(|a| s.broken_servers.contains(a));
                let delay = s.resolve_delay;
                let result = if broken || s.unresolvable.contains(domain) {
                    Err(DnsError::from_diagnostic(&format!(
                        "{domain} : DNS name does not exist"
                    )))
                } else {
                    Ok(String::new())
                };
                return (delay, result);
            }
            Command::ReadDohPolicy => Ok(if s.policy_blocked { "BLOCKED" } else { "ALLOWED" }.to_string()),
            Command::ListDohServers => {
                let rows: Vec<Value> = s
                    .doh
                    .iter()
                    .map(|r| {
                        json!({
                            "ServerAddress": r.address.to_string(),
                            "DohTemplate": r.template,
                            "AutoUpgrade": r.auto_upgrade,
                            "AllowFallbackToUdp": r.allow_fallback,
                        })
                    })
                    .collect();
                Ok(Value::Array(rows).to_string())
            }
            Command::AddDohServer {
                address,
                template,
                auto_upgrade,
                allow_fallback,
            } => {
                s.doh.retain(|r| r.address != *address);
                s.doh.push(DohRow {
                    address: *address,
                    template: template.clone(),
                    auto_upgrade: *auto_upgrade,
                    allow_fallback: *allow_fallback,
                });
                Ok(String::new())
            }
            Command::RemoveDohServer { address } => {
                s.doh.retain(|r| r.address != *address);
                Ok(String::new())
            }
            Command::ReadEncryptionFlag => Ok(match s.encryption_flag {
                Some(true) => "1",
                Some(false) => "0",
                None => "NOT_SET",
            }
            .to_string()),
            Command::WriteEncryptionFlag { enabled } => {
                s.encryption_flag = Some(*enabled);
                Ok(String::new())
            }
        };
        (None, reply)
    }
}

impl CommandRunner for FakeSystem {
    async fn run(&self, command: &Command) -> Result<String, DnsError> {
        let (delay, reply) = self.handle(command);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}
