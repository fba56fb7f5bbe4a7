//! Container address resolution and uplink detection.
//!
//! The container runtime is an external collaborator; hafen only needs to
//! know whether a container exists and which addresses it currently holds.
//! The concrete implementation shells out to `machinectl`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use hafen_common::{ContainerName, HafenError, HafenResult};

use crate::runner::ToolRunner;

/// Boundary to the container runtime collaborator.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Addresses currently bound inside the container.
    ///
    /// # Errors
    ///
    /// Returns [`HafenError::ContainerNotFound`] when the runtime does not
    /// know the container.
    async fn list_addresses(&self, name: &ContainerName) -> HafenResult<Vec<IpAddr>>;

    /// Whether the runtime knows a container by this name.
    async fn exists(&self, name: &ContainerName) -> HafenResult<bool>;
}

/// [`ContainerRuntime`] backed by machinectl (systemd-nspawn).
pub struct MachinectlRuntime {
    runner: Arc<dyn ToolRunner>,
}

impl MachinectlRuntime {
    /// Create a runtime boundary using the given tool runner.
    #[must_use]
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ContainerRuntime for MachinectlRuntime {
    async fn list_addresses(&self, name: &ContainerName) -> HafenResult<Vec<IpAddr>> {
        let out = self
            .runner
            .run("machinectl", &["status", "--no-pager", name.as_str()])
            .await?;
        if !out.success {
            return Err(HafenError::ContainerNotFound {
                name: name.to_string(),
            });
        }
        Ok(parse_status_addresses(&out.stdout))
    }

    async fn exists(&self, name: &ContainerName) -> HafenResult<bool> {
        let out = self
            .runner
            .run("machinectl", &["show", name.as_str()])
            .await?;
        Ok(out.success)
    }
}

/// Parse the `Addresses:` block of `machinectl status` output.
///
/// The first address follows the field label; further addresses sit on
/// their own indented continuation lines. The block ends at the first
/// line that does not parse as an address.
fn parse_status_addresses(stdout: &str) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    let mut in_block = false;

    for line in stdout.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("Addresses:") {
            in_block = true;
            if let Ok(addr) = rest.trim().parse::<IpAddr>() {
                addresses.push(addr);
            }
            continue;
        }
        if in_block {
            match line.trim().parse::<IpAddr>() {
                Ok(addr) => addresses.push(addr),
                Err(_) => break,
            }
        }
    }

    addresses
}

/// Whether an IPv6 address is link-local (fe80::/10).
fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// First IPv4 address in the list, if any.
#[must_use]
pub fn first_ipv4(addresses: &[IpAddr]) -> Option<Ipv4Addr> {
    addresses.iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })
}

/// First globally usable IPv6 address in the list, if any.
///
/// Link-local addresses are skipped; they are always present on a veth
/// and never what a port map or ACL should target.
#[must_use]
pub fn first_ipv6(addresses: &[IpAddr]) -> Option<Ipv6Addr> {
    addresses.iter().find_map(|addr| match addr {
        IpAddr::V6(v6) if !is_link_local(*v6) => Some(*v6),
        _ => None,
    })
}

/// Resolve the container's current IPv4 address.
pub async fn resolve_ipv4(
    runtime: &dyn ContainerRuntime,
    name: &ContainerName,
) -> HafenResult<Ipv4Addr> {
    let addresses = runtime.list_addresses(name).await?;
    first_ipv4(&addresses).ok_or_else(|| HafenError::NoAddress {
        name: name.to_string(),
        family: "IPv4",
    })
}

/// Resolve the container's current global IPv6 address.
pub async fn resolve_ipv6(
    runtime: &dyn ContainerRuntime,
    name: &ContainerName,
) -> HafenResult<Ipv6Addr> {
    let addresses = runtime.list_addresses(name).await?;
    first_ipv6(&addresses).ok_or_else(|| HafenError::NoAddress {
        name: name.to_string(),
        family: "IPv6",
    })
}

/// Parse the uplink device out of `ip -4 route show default` output.
#[must_use]
pub fn parse_default_route_dev(stdout: &str) -> Option<String> {
    let line = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("default"))?;
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

/// Detect the WAN interface from the IPv4 default route.
///
/// Best-effort: a host without a default route yields `None`, not an
/// error, since masquerading is simply skipped without a WAN.
pub async fn detect_wan_iface(runner: &dyn ToolRunner) -> HafenResult<Option<String>> {
    let out = runner.run("ip", &["-4", "route", "show", "default"]).await?;
    if !out.success {
        tracing::warn!(stderr = %out.stderr.trim(), "Default route lookup failed");
        return Ok(None);
    }
    Ok(parse_default_route_dev(&out.stdout))
}

/// Validate a network interface name (bridge, WAN, tunnel).
///
/// Kernel rules: 1-15 bytes, no whitespace or slashes.
pub fn validate_iface_name(name: &str) -> HafenResult<()> {
    if name.is_empty() || name.len() > 15 {
        return Err(HafenError::Validation {
            message: format!("interface name '{name}' must be 1-15 characters"),
        });
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == ':')
    {
        return Err(HafenError::Validation {
            message: format!("interface name '{name}' contains invalid characters"),
        });
    }
    Ok(())
}

/// Validate a port is usable as a NAT/ACL destination.
pub fn validate_port(port: u16) -> HafenResult<()> {
    if port == 0 {
        return Err(HafenError::Validation {
            message: "port 0 is not a valid destination".to_string(),
        });
    }
    Ok(())
}
