//! Host default gateway discovery
//!
//! Reads the kernel routing table through `ip route show default` and picks
//! the gateway and egress device of the first default route. The result is
//! what keeps bootstrap traffic and NAT pointed at the "outside" of the tunnel.

use crate::command::{run_checked, CommandRunner};
use crate::error::{PortalError, Result};
use std::fmt;
use tracing::{error, info};

/// Default gateway and egress interface of the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetworkContext {
    gateway: String,
    egress_interface: String,
}

impl HostNetworkContext {
    /// Build a context; both fields must be non-empty
    pub fn new(gateway: impl Into<String>, egress_interface: impl Into<String>) -> Result<Self> {
        let gateway = gateway.into();
        let egress_interface = egress_interface.into();

        if gateway.is_empty() || egress_interface.is_empty() {
            return Err(PortalError::Discovery(
                "default gateway or interface not found".to_string(),
            ));
        }

        Ok(Self {
            gateway,
            egress_interface,
        })
    }

    /// Gateway IPv4 address
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Interface carrying the default route
    pub fn egress_interface(&self) -> &str {
        &self.egress_interface
    }
}

impl fmt::Display for HostNetworkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.gateway, self.egress_interface)
    }
}

/// Discovers the host default route
pub struct GatewayResolver<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> GatewayResolver<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Query the routing table for the default gateway and interface
    pub async fn resolve(&self) -> Result<HostNetworkContext> {
        let output = run_checked(self.runner, "ip", &["route", "show", "default"])
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to get default route");
                PortalError::Discovery(e)
            })?;

        let context = parse_default_route(&output.stdout).inspect_err(|_| {
            error!("Host default gateway or interface not found");
        })?;

        info!(
            gateway = %context.gateway(),
            interface = %context.egress_interface(),
            "Found host default gateway"
        );
        Ok(context)
    }
}

/// Parse `ip route show default` output.
///
/// Only the first line starting with `default` is considered; the tokens
/// following `via` and `dev` become the gateway and interface.
pub fn parse_default_route(output: &str) -> Result<HostNetworkContext> {
    let mut gateway = "";
    let mut iface = "";

    if let Some(line) = output.lines().find(|l| l.starts_with("default")) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        for pair in fields.windows(2) {
            match pair[0] {
                "via" => gateway = pair[1],
                "dev" => iface = pair[1],
                _ => {}
            }
        }
    }

    HostNetworkContext::new(gateway, iface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingRunner};

    #[test]
    fn test_parse_typical_default_route() {
        let out = "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.20 metric 100\n";
        let ctx = parse_default_route(out).unwrap();

        assert_eq!(ctx.gateway(), "192.168.1.1");
        assert_eq!(ctx.egress_interface(), "eth0");
        assert_eq!(ctx.to_string(), "192.168.1.1 via eth0");
    }

    #[test]
    fn test_parse_uses_first_default_line_only() {
        let out = "default via 10.0.0.1 dev wlan0 metric 600\n\
                   default via 172.16.0.1 dev eth1 metric 50\n";
        let ctx = parse_default_route(out).unwrap();

        assert_eq!(ctx.gateway(), "10.0.0.1");
        assert_eq!(ctx.egress_interface(), "wlan0");
    }

    #[test]
    fn test_parse_missing_gateway_is_discovery_error() {
        // Point-to-point default routes carry no "via"
        let out = "default dev ppp0 scope link\n";
        let err = parse_default_route(out).unwrap_err();
        assert!(matches!(err, PortalError::Discovery(_)));
    }

    #[test]
    fn test_parse_empty_table() {
        assert!(matches!(
            parse_default_route(""),
            Err(PortalError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_surfaces_command_failure() {
        let runner = RecordingRunner::new();
        runner.respond("ip route show", CommandOutput::failed("RTNETLINK error"));

        let err = GatewayResolver::new(&runner).resolve().await.unwrap_err();
        assert!(matches!(err, PortalError::Discovery(_)));
        assert_eq!(runner.calls(), vec!["ip route show default".to_string()]);
    }
}
