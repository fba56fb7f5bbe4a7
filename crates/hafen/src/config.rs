//! Declarative network state: the persisted configuration and the two
//! rule collections.
//!
//! These types are the single source of truth the renderer consumes. The
//! live firewall state is always derived from them and never edited in
//! place.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hafen_common::{ContainerName, HafenError};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// Default bridge interface name.
pub const DEFAULT_BRIDGE: &str = "br0";

/// Default private IPv4 plan for the bridge.
pub const DEFAULT_LAN4_CIDR: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 24);

/// Default gateway address on the bridge.
pub const DEFAULT_LAN4_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Transport protocol of a port mapping or ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string as the firewall tools spell it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = HafenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(HafenError::Validation {
                message: format!("unknown protocol '{other}', expected tcp or udp"),
            }),
        }
    }
}

/// Which firewall backend owns the installed ruleset.
///
/// Exactly one backend is authoritative at any time; switching requires
/// flushing the outgoing backend first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatBackendKind {
    /// Atomic full-ruleset replacement via `nft -f`.
    Nftables,
    /// Additive check-then-insert rules via `iptables`.
    Iptables,
}

impl NatBackendKind {
    /// Backend name as used in config files and CLI arguments.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NatBackendKind::Nftables => "nftables",
            NatBackendKind::Iptables => "iptables",
        }
    }
}

impl fmt::Display for NatBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NatBackendKind {
    type Err = HafenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nftables" | "nft" => Ok(NatBackendKind::Nftables),
            "iptables" => Ok(NatBackendKind::Iptables),
            other => Err(HafenError::Validation {
                message: format!("unknown backend '{other}', expected nftables or iptables"),
            }),
        }
    }
}

/// The active IPv6 uplink method, persisted so a transport switch can
/// tear the previous method down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum TransportState {
    /// Natively routed prefix, advertised on the bridge.
    Native {
        /// The routed prefix.
        prefix: Ipv6Net,
    },
    /// Static 6in4 tunnel (IPv6 in IPv4, sit device).
    #[serde(rename = "6in4")]
    SixInFour {
        /// Local IPv4 tunnel endpoint.
        local_v4: Ipv4Addr,
        /// Remote IPv4 tunnel endpoint.
        server_v4: Ipv4Addr,
        /// Client-side IPv6 address on the tunnel, with prefix length.
        client_v6: Ipv6Net,
        /// Server-side IPv6 address, the default route next hop.
        server_v6: Ipv6Addr,
        /// Prefix routed to this host through the tunnel.
        routed_prefix: Ipv6Net,
    },
    /// WireGuard tunnel managed through wg-quick.
    Wireguard {
        /// WireGuard interface name.
        iface: String,
        /// Prefix routed to this host through the tunnel.
        routed_prefix: Ipv6Net,
    },
}

impl TransportState {
    /// The prefix this transport routes to the bridge network.
    #[must_use]
    pub const fn routed_prefix(&self) -> Ipv6Net {
        match self {
            TransportState::Native { prefix } => *prefix,
            TransportState::SixInFour { routed_prefix, .. }
            | TransportState::Wireguard { routed_prefix, .. } => *routed_prefix,
        }
    }

    /// Short method name for logs and status output.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            TransportState::Native { .. } => "native",
            TransportState::SixInFour { .. } => "6in4",
            TransportState::Wireguard { .. } => "wireguard",
        }
    }
}

/// The persisted singleton network configuration.
///
/// Fields missing from an older persisted document backfill from
/// [`NetworkConfig::default`] during deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host bridge interface all containers attach to.
    pub bridge: String,
    /// Private IPv4 plan for the bridge network.
    pub lan4_cidr: Ipv4Net,
    /// Gateway address on the bridge.
    pub lan4_gateway: Ipv4Addr,
    /// Uplink interface for masquerading, lazily detected and cached.
    pub wan_iface: Option<String>,
    /// Currently advertised/routed IPv6 prefix on the bridge.
    pub ipv6_prefix: Option<Ipv6Net>,
    /// Which firewall backend is authoritative.
    pub nat_backend: NatBackendKind,
    /// Whether the neighbor-discovery proxy is active.
    pub ipv6_proxy_enabled: bool,
    /// Upstream interface the NDP proxy answers on.
    pub ipv6_proxy_upstream_iface: Option<String>,
    /// Active IPv6 uplink method, if one has been configured.
    pub ipv6_transport: Option<TransportState>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            lan4_cidr: DEFAULT_LAN4_CIDR,
            lan4_gateway: DEFAULT_LAN4_GATEWAY,
            wan_iface: None,
            ipv6_prefix: None,
            nat_backend: NatBackendKind::Nftables,
            ipv6_proxy_enabled: false,
            ipv6_proxy_upstream_iface: None,
            ipv6_transport: None,
        }
    }
}

/// An IPv4 NAT port mapping, keyed by `(protocol, host_port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapEntry {
    /// Owning container.
    pub container: ContainerName,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
    /// Container IPv4 address, snapshotted when the entry was created.
    pub container_ip: Ipv4Addr,
    /// When the entry was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PortMapEntry {
    /// The uniqueness key: at most one entry per `(protocol, host_port)`.
    #[must_use]
    pub const fn key(&self) -> (Protocol, u16) {
        (self.protocol, self.host_port)
    }
}

/// An IPv6 inbound ACL entry, keyed by
/// `(protocol, dest_port, container_ip)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6AclEntry {
    /// Owning container.
    pub container: ContainerName,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Destination port the ACL opens.
    pub dest_port: u16,
    /// Container IPv6 address the ACL opens.
    pub container_ip: Ipv6Addr,
    /// When the entry was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Ipv6AclEntry {
    /// The uniqueness key for the collection.
    #[must_use]
    pub const fn key(&self) -> (Protocol, u16, Ipv6Addr) {
        (self.protocol, self.dest_port, self.container_ip)
    }
}
