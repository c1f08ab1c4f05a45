//! Host routing, firewall and NAT configuration
//!
//! Every change the portal makes to the host network stack is modelled as a
//! [`NetResource`] with an acquire command and (where one exists) a release
//! command. [`RouteConfigurator`] records each resource it successfully
//! acquires, and [`RouteConfigurator::clean_up`] walks that ledger in reverse,
//! so teardown undoes exactly what a (possibly partial) start put in place.
//!
//! None of these operations are transactional: the kernel routing table,
//! iptables chains and sysctl flags are shared global state. Activation runs
//! its steps in a fixed order and stops at the first failure; teardown keeps
//! going past failures.

use crate::command::{run_checked, CommandRunner};
use crate::error::{PortalError, Result};
use crate::gateway::HostNetworkContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Bootstrap hosts that must stay reachable outside the tunnel
pub const DEFAULT_BYPASS_HOSTS: &[&str] = &[
    "stun.cloudflare.com",
    "turn.cloudflare.com",
    "guardian.veilnet.org",
];

/// Address assigned to the virtual interface by the anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedAddress {
    ip: String,
    prefix_length: String,
}

impl AssignedAddress {
    /// Split an anchor CIDR (`"10.128.0.7/16"`) into address and prefix.
    ///
    /// Anything other than exactly two `/`-separated components is rejected.
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let parts: Vec<&str> = cidr.split('/').collect();
        if parts.len() != 2 {
            return Err(PortalError::Configuration(format!(
                "invalid CIDR format: {}",
                cidr
            )));
        }

        Ok(Self {
            ip: parts[0].to_string(),
            prefix_length: parts[1].to_string(),
        })
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn prefix_length(&self) -> &str {
        &self.prefix_length
    }
}

impl fmt::Display for AssignedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_length)
    }
}

/// Resolves bootstrap hostnames to IPv4 addresses
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the system resolver (`getaddrinfo`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
        let mut addrs = Vec::new();
        for addr in tokio::net::lookup_host((host, 0)).await? {
            if let IpAddr::V4(v4) = addr.ip() {
                if !addrs.contains(&v4) {
                    addrs.push(v4);
                }
            }
        }
        Ok(addrs)
    }
}

/// Resolver answering from a fixed table; unknown hosts fail with `NotFound`
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<Ipv4Addr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[Ipv4Addr]) -> Self {
        self.entries.insert(host.to_string(), addrs.to_vec());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
        self.entries.get(host).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such host: {}", host),
            )
        })
    }
}

/// Direction of a FORWARD accept rule relative to the virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDirection {
    /// Traffic entering from the virtual interface (`-i`)
    Inbound,
    /// Traffic leaving through the virtual interface (`-o`)
    Outbound,
}

impl ForwardDirection {
    fn flag(self) -> &'static str {
        match self {
            ForwardDirection::Inbound => "-i",
            ForwardDirection::Outbound => "-o",
        }
    }
}

/// A single piece of host network state owned by the portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetResource {
    /// Host route to a bootstrap address via the original gateway
    BypassRoute(Ipv4Addr),
    /// Address assigned to the virtual interface
    InterfaceAddress(AssignedAddress),
    /// FORWARD chain accept rule scoped to the virtual interface
    ForwardRule(ForwardDirection),
    /// POSTROUTING masquerade on the egress interface
    NatMasquerade,
    /// Virtual interface administratively up
    LinkUp,
    /// `net.ipv4.ip_forward=1`
    IpForwarding,
}

/// A command line: program plus arguments
type CommandLine = (&'static str, Vec<String>);

impl NetResource {
    fn acquire_command(&self, tun: &str, host: &HostNetworkContext) -> CommandLine {
        match self {
            NetResource::BypassRoute(dest) => (
                "ip",
                strings(&[
                    "route",
                    "add",
                    &dest.to_string(),
                    "via",
                    host.gateway(),
                    "dev",
                    host.egress_interface(),
                ]),
            ),
            NetResource::InterfaceAddress(addr) => (
                "ip",
                strings(&["addr", "add", &addr.to_string(), "dev", tun]),
            ),
            NetResource::ForwardRule(dir) => (
                "iptables",
                strings(&["-A", "FORWARD", dir.flag(), tun, "-j", "ACCEPT"]),
            ),
            NetResource::NatMasquerade => (
                "iptables",
                strings(&[
                    "-t",
                    "nat",
                    "-A",
                    "POSTROUTING",
                    "-o",
                    host.egress_interface(),
                    "-j",
                    "MASQUERADE",
                ]),
            ),
            NetResource::LinkUp => ("ip", strings(&["link", "set", "up", tun])),
            NetResource::IpForwarding => ("sysctl", strings(&["-w", "net.ipv4.ip_forward=1"])),
        }
    }

    /// Command undoing this resource, `None` when closing the device is enough
    fn release_command(&self, tun: &str, host: &HostNetworkContext) -> Option<CommandLine> {
        match self {
            NetResource::BypassRoute(dest) => Some((
                "ip",
                strings(&[
                    "route",
                    "del",
                    &dest.to_string(),
                    "via",
                    host.gateway(),
                    "dev",
                    host.egress_interface(),
                ]),
            )),
            NetResource::InterfaceAddress(_) | NetResource::LinkUp => None,
            NetResource::ForwardRule(dir) => Some((
                "iptables",
                strings(&["-D", "FORWARD", dir.flag(), tun, "-j", "ACCEPT"]),
            )),
            NetResource::NatMasquerade => Some((
                "iptables",
                strings(&[
                    "-t",
                    "nat",
                    "-D",
                    "POSTROUTING",
                    "-o",
                    host.egress_interface(),
                    "-j",
                    "MASQUERADE",
                ]),
            )),
            NetResource::IpForwarding => {
                Some(("sysctl", strings(&["-w", "net.ipv4.ip_forward=0"])))
            }
        }
    }
}

impl fmt::Display for NetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetResource::BypassRoute(dest) => write!(f, "bypass route to {}", dest),
            NetResource::InterfaceAddress(addr) => write!(f, "interface address {}", addr),
            NetResource::ForwardRule(ForwardDirection::Inbound) => {
                write!(f, "inbound iptables FORWARD rule")
            }
            NetResource::ForwardRule(ForwardDirection::Outbound) => {
                write!(f, "outbound iptables FORWARD rule")
            }
            NetResource::NatMasquerade => write!(f, "NAT rule"),
            NetResource::LinkUp => write!(f, "interface link state"),
            NetResource::IpForwarding => write!(f, "IP forwarding"),
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Installs and removes the host network state for one virtual interface
pub struct RouteConfigurator {
    runner: Arc<dyn CommandRunner>,
    host: HostNetworkContext,
    interface: String,
    acquired: Mutex<Vec<NetResource>>,
}

impl RouteConfigurator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        host: HostNetworkContext,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            host,
            interface: interface.into(),
            acquired: Mutex::new(Vec::new()),
        }
    }

    /// Host gateway context this configurator routes around
    pub fn host(&self) -> &HostNetworkContext {
        &self.host
    }

    /// Name of the virtual interface being configured
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Resources currently held, oldest first
    pub fn acquired(&self) -> Vec<NetResource> {
        self.acquired.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Route every IPv4 address of each bootstrap host via the original gateway.
    ///
    /// Resolution or route failures for one host are logged and skipped.
    /// Returns the number of routes installed.
    pub async fn install_bypass_routes(
        &self,
        hosts: &[String],
        resolver: &dyn HostResolver,
    ) -> usize {
        let mut installed = 0;

        for host in hosts {
            let addrs = match resolver.lookup_ipv4(host).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    error!(host = %host, error = %e, "Failed to resolve bootstrap host");
                    continue;
                }
            };

            for addr in addrs {
                let resource = NetResource::BypassRoute(addr);
                let (program, args) = resource.acquire_command(&self.interface, &self.host);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();

                match run_checked(self.runner.as_ref(), program, &args).await {
                    Ok(_) => {
                        debug!(host = %host, destination = %addr, "Installed bypass route");
                        self.record(resource);
                        installed += 1;
                    }
                    Err(e) if e.contains("File exists") => {
                        debug!(destination = %addr, "Bypass route already present");
                    }
                    Err(e) => {
                        warn!(host = %host, destination = %addr, error = %e, "Failed to add bypass route");
                    }
                }
            }
        }

        info!(
            routes = installed,
            gateway = %self.host.gateway(),
            interface = %self.host.egress_interface(),
            "Bypass routes installed"
        );
        installed
    }

    /// Bring the virtual interface into service with the assigned address.
    ///
    /// Steps run in order: flush addresses, assign address, FORWARD rules in
    /// both directions, NAT masquerade on the egress interface, link up, IPv4
    /// forwarding. The first failure aborts the remaining steps; whatever was
    /// already acquired stays recorded for [`clean_up`](Self::clean_up).
    pub async fn activate(&self, address: &AssignedAddress) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            "ip",
            &["addr", "flush", "dev", &self.interface],
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to clear existing IPs");
            PortalError::Configuration(e)
        })?;

        self.acquire(NetResource::InterfaceAddress(address.clone()))
            .await?;
        info!(interface = %self.interface, address = %address, "Virtual interface address set");

        self.acquire(NetResource::ForwardRule(ForwardDirection::Inbound))
            .await?;
        self.acquire(NetResource::ForwardRule(ForwardDirection::Outbound))
            .await?;
        info!(interface = %self.interface, "Updated iptables FORWARD rules");

        self.acquire(NetResource::NatMasquerade).await?;
        info!(egress = %self.host.egress_interface(), "NAT masquerade enabled");

        self.acquire(NetResource::LinkUp).await?;
        info!(interface = %self.interface, "Virtual interface set to up");

        self.acquire(NetResource::IpForwarding).await?;
        info!("IP forwarding enabled");

        Ok(())
    }

    /// Release every recorded resource, newest first.
    ///
    /// Failures are logged as warnings and never stop the remaining releases.
    /// Calling this again after it has run issues no commands.
    pub async fn clean_up(&self) {
        let resources = match self.acquired.lock() {
            Ok(mut acquired) => std::mem::take(&mut *acquired),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for resource in resources.iter().rev() {
            let Some((program, args)) = resource.release_command(&self.interface, &self.host)
            else {
                continue;
            };
            let args: Vec<&str> = args.iter().map(String::as_str).collect();

            match run_checked(self.runner.as_ref(), program, &args).await {
                Ok(_) => debug!(resource = %resource, "Released"),
                Err(e) => warn!(resource = %resource, error = %e, "Failed to remove"),
            }
        }
    }

    async fn acquire(&self, resource: NetResource) -> Result<()> {
        let (program, args) = resource.acquire_command(&self.interface, &self.host);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        run_checked(self.runner.as_ref(), program, &args)
            .await
            .map_err(|e| {
                error!(resource = %resource, error = %e, "Failed to set");
                PortalError::Configuration(format!("failed to set {}: {}", resource, e))
            })?;

        self.record(resource);
        Ok(())
    }

    fn record(&self, resource: NetResource) {
        match self.acquired.lock() {
            Ok(mut acquired) => acquired.push(resource),
            Err(poisoned) => poisoned.into_inner().push(resource),
        }
    }
}
