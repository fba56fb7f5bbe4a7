//! CLI command definitions and handlers.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use color_eyre::eyre::Result;
use hafen_common::{ContainerName, HafenPaths};
use ipnet::Ipv6Net;

use crate::config::{NatBackendKind, Protocol};
use crate::engine::NetworkEngine;
use crate::resolve::MachinectlRuntime;
use crate::runner::HostRunner;

/// Default state root, matching [`HafenPaths`].
const DEFAULT_ROOT: &str = "/var/lib/hafen";

/// hafen - Network and firewall policy for nspawn container hosts
#[derive(Parser)]
#[command(name = "hafen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for hafen state
    #[arg(long, global = true, env = "HAFEN_ROOT", default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Bootstrap host networking: forwarding, bridge, first apply
    Init,

    /// Show the resolved configuration and both rule collections
    Status {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Re-render the persisted state and apply it to the firewall
    Apply,

    /// Print the rendered nftables ruleset without applying it
    Ruleset,

    /// Manage the container bridge
    Bridge {
        #[command(subcommand)]
        command: BridgeCommands,
    },

    /// Manage the firewall backend
    Backend {
        #[command(subcommand)]
        command: BackendCommands,
    },

    /// Manage IPv4 NAT port mappings
    Portmap {
        #[command(subcommand)]
        command: PortmapCommands,
    },

    /// Manage IPv6 inbound ACLs
    Acl {
        #[command(subcommand)]
        command: AclCommands,
    },

    /// Synchronize firewall state with container lifecycle
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },

    /// Configure the IPv6 uplink transport
    Transport {
        #[command(subcommand)]
        command: TransportCommands,
    },

    /// Configure the IPv6 neighbor-discovery proxy
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Bridge commands.
#[derive(Subcommand)]
pub enum BridgeCommands {
    /// Set the container bridge interface and re-apply
    Set {
        /// Bridge interface name
        name: String,
    },

    /// Create the configured bridge if it is missing and bring it up
    Ensure,
}

/// Backend commands.
#[derive(Subcommand)]
pub enum BackendCommands {
    /// Switch the authoritative firewall backend (nftables, iptables)
    Set {
        /// Backend to switch to
        backend: NatBackendKind,
    },
}

/// Port-map commands.
#[derive(Subcommand)]
pub enum PortmapCommands {
    /// Map a host port to a container port
    Add {
        /// Container name
        container: ContainerName,

        /// Protocol (tcp, udp)
        protocol: Protocol,

        /// Port on the host
        host_port: u16,

        /// Port inside the container
        container_port: u16,
    },

    /// Remove the mapping for a host port
    Remove {
        /// Protocol (tcp, udp)
        protocol: Protocol,

        /// Port on the host
        host_port: u16,
    },

    /// List all port mappings
    List,
}

/// ACL commands.
#[derive(Subcommand)]
pub enum AclCommands {
    /// Allow inbound IPv6 traffic to a container port
    Add {
        /// Container name
        container: ContainerName,

        /// Protocol (tcp, udp)
        protocol: Protocol,

        /// Destination port to open
        dest_port: u16,
    },

    /// Remove an IPv6 ACL entry
    Remove {
        /// Protocol (tcp, udp)
        protocol: Protocol,

        /// Destination port
        dest_port: u16,

        /// Container IPv6 address the entry targets
        address: Ipv6Addr,
    },

    /// List all IPv6 ACL entries
    List,
}

/// Container lifecycle commands.
#[derive(Subcommand)]
pub enum ContainerCommands {
    /// Remove every port map and ACL owned by a deleted container
    Purge {
        /// Container name
        name: ContainerName,
    },

    /// Re-resolve a container's address and refresh its port maps
    Refresh {
        /// Container name
        name: ContainerName,
    },
}

/// Transport commands.
#[derive(Subcommand)]
pub enum TransportCommands {
    /// Advertise a natively routed IPv6 prefix on the bridge
    Native {
        /// Routed IPv6 prefix (CIDR)
        prefix: Ipv6Net,
    },

    /// Bring up a static 6in4 tunnel to a tunnel broker
    #[command(name = "6in4")]
    SixInFour {
        /// Local (host) IPv4 endpoint
        #[arg(long)]
        local_v4: Ipv4Addr,

        /// Tunnel server IPv4 endpoint
        #[arg(long)]
        server_v4: Ipv4Addr,

        /// Client IPv6 address on the tunnel (CIDR)
        #[arg(long)]
        client_v6: Ipv6Net,

        /// Server IPv6 address, the default route next hop
        #[arg(long)]
        server_v6: Ipv6Addr,

        /// Prefix routed to this host through the tunnel
        #[arg(long)]
        routed_prefix: Ipv6Net,
    },

    /// Bring up a WireGuard tunnel from a wg-quick configuration
    Wireguard {
        /// WireGuard interface name
        #[arg(long, default_value = "wg0")]
        iface: String,

        /// Path to the wg-quick configuration file
        #[arg(long)]
        conf: PathBuf,

        /// Prefix routed to this host through the tunnel
        #[arg(long)]
        routed_prefix: Ipv6Net,
    },

    /// Show the active transport
    Show,
}

/// NDP proxy commands.
#[derive(Subcommand)]
pub enum ProxyCommands {
    /// Enable the neighbor-discovery proxy
    Enable {
        /// Upstream interface to answer on (defaults to the WAN)
        #[arg(long)]
        upstream: Option<String>,
    },

    /// Disable the neighbor-discovery proxy
    Disable,
}

impl Cli {
    /// Resolve the path layout for this invocation.
    ///
    /// The default root keeps the system locations for networkd and
    /// WireGuard files; a custom root sandboxes everything under it.
    fn paths(&self) -> HafenPaths {
        if self.root == Path::new(DEFAULT_ROOT) {
            HafenPaths::new()
        } else {
            HafenPaths::with_root(&self.root)
        }
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let runner = Arc::new(HostRunner::new());
        let runtime = Arc::new(MachinectlRuntime::new(runner.clone()));
        let engine = NetworkEngine::new(self.paths(), runner, runtime);

        match self.command {
            Commands::Init => {
                engine.init().await?;
                println!("Host networking initialized");
                Ok(())
            }

            Commands::Status { format } => {
                let report = engine.status().await?;
                if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    return Ok(());
                }

                let bridge_state = if report.bridge_exists {
                    "present"
                } else {
                    "missing"
                };
                println!("Bridge:    {} ({})", report.config.bridge, bridge_state);
                println!(
                    "LAN IPv4:  {} gateway {}",
                    report.config.lan4_cidr, report.config.lan4_gateway
                );
                println!(
                    "WAN:       {}",
                    report.config.wan_iface.as_deref().unwrap_or("(undetected)")
                );
                println!("Backend:   {}", report.config.nat_backend);
                match &report.config.ipv6_prefix {
                    Some(prefix) => println!("IPv6:      {prefix}"),
                    None => println!("IPv6:      (no routed prefix)"),
                }
                match &report.config.ipv6_transport {
                    Some(t) => println!("Transport: {}", t.method()),
                    None => println!("Transport: (none)"),
                }
                if report.config.ipv6_proxy_enabled {
                    println!(
                        "NDP proxy: enabled on {}",
                        report
                            .config
                            .ipv6_proxy_upstream_iface
                            .as_deref()
                            .unwrap_or("(unset)")
                    );
                }

                println!();
                println!("Port maps ({}):", report.port_maps.len());
                for map in &report.port_maps {
                    println!(
                        "  {}/{} -> {}:{}\t{}",
                        map.protocol, map.host_port, map.container_ip, map.container_port,
                        map.container
                    );
                }
                println!("IPv6 ACLs ({}):", report.acls.len());
                for acl in &report.acls {
                    println!(
                        "  {}/{} -> {}\t{}",
                        acl.protocol, acl.dest_port, acl.container_ip, acl.container
                    );
                }
                Ok(())
            }

            Commands::Apply => {
                engine.apply().await?;
                println!("Ruleset applied");
                Ok(())
            }

            Commands::Ruleset => {
                print!("{}", engine.ruleset_preview().await?);
                Ok(())
            }

            Commands::Bridge { command } => match command {
                BridgeCommands::Set { name } => {
                    engine.set_bridge(&name).await?;
                    println!("Bridge set to {name}");
                    Ok(())
                }
                BridgeCommands::Ensure => {
                    engine.ensure_bridge().await?;
                    println!("Bridge ready");
                    Ok(())
                }
            },

            Commands::Backend { command } => match command {
                BackendCommands::Set { backend } => {
                    engine.set_backend(backend).await?;
                    println!("Backend set to {backend}");
                    Ok(())
                }
            },

            Commands::Portmap { command } => match command {
                PortmapCommands::Add {
                    container,
                    protocol,
                    host_port,
                    container_port,
                } => {
                    let entry = engine
                        .add_port_map(&container, protocol, host_port, container_port)
                        .await?;
                    println!(
                        "Mapped {}/{} -> {}:{} ({})",
                        entry.protocol,
                        entry.host_port,
                        entry.container_ip,
                        entry.container_port,
                        entry.container
                    );
                    Ok(())
                }
                PortmapCommands::Remove {
                    protocol,
                    host_port,
                } => {
                    let removed = engine.remove_port_map(protocol, host_port).await?;
                    println!(
                        "Removed {}/{} ({})",
                        removed.protocol, removed.host_port, removed.container
                    );
                    Ok(())
                }
                PortmapCommands::List => {
                    for map in engine.list_port_maps().await? {
                        println!(
                            "{}/{} -> {}:{}\t{}",
                            map.protocol, map.host_port, map.container_ip, map.container_port,
                            map.container
                        );
                    }
                    Ok(())
                }
            },

            Commands::Acl { command } => match command {
                AclCommands::Add {
                    container,
                    protocol,
                    dest_port,
                } => {
                    let entry = engine.add_acl(&container, protocol, dest_port).await?;
                    println!(
                        "Allowed {}/{} to {} ({})",
                        entry.protocol, entry.dest_port, entry.container_ip, entry.container
                    );
                    Ok(())
                }
                AclCommands::Remove {
                    protocol,
                    dest_port,
                    address,
                } => {
                    let removed = engine.remove_acl(protocol, dest_port, address).await?;
                    println!(
                        "Removed {}/{} to {} ({})",
                        removed.protocol, removed.dest_port, removed.container_ip,
                        removed.container
                    );
                    Ok(())
                }
                AclCommands::List => {
                    for acl in engine.list_acls().await? {
                        println!(
                            "{}/{} -> {}\t{}",
                            acl.protocol, acl.dest_port, acl.container_ip, acl.container
                        );
                    }
                    Ok(())
                }
            },

            Commands::Container { command } => match command {
                ContainerCommands::Purge { name } => {
                    let report = engine.purge_container(&name).await?;
                    println!(
                        "Purged {}: {} port maps, {} ACLs",
                        name, report.port_maps_removed, report.acls_removed
                    );
                    Ok(())
                }
                ContainerCommands::Refresh { name } => {
                    let updated = engine.refresh_container(&name).await?;
                    println!("Refreshed {name}: {updated} port maps updated");
                    Ok(())
                }
            },

            Commands::Transport { command } => match command {
                TransportCommands::Native { prefix } => {
                    engine.set_transport_native(prefix).await?;
                    println!("Native transport active, advertising {prefix}");
                    Ok(())
                }
                TransportCommands::SixInFour {
                    local_v4,
                    server_v4,
                    client_v6,
                    server_v6,
                    routed_prefix,
                } => {
                    engine
                        .set_transport_six_in_four(
                            local_v4,
                            server_v4,
                            client_v6,
                            server_v6,
                            routed_prefix,
                        )
                        .await?;
                    println!("6in4 transport active, advertising {routed_prefix}");
                    Ok(())
                }
                TransportCommands::Wireguard {
                    iface,
                    conf,
                    routed_prefix,
                } => {
                    let peer_conf = std::fs::read_to_string(&conf)?;
                    engine
                        .set_transport_wireguard(&iface, &peer_conf, routed_prefix)
                        .await?;
                    println!("WireGuard transport active on {iface}, advertising {routed_prefix}");
                    Ok(())
                }
                TransportCommands::Show => {
                    let report = engine.status().await?;
                    match report.config.ipv6_transport {
                        Some(transport) => {
                            println!(
                                "{} (routed prefix {})",
                                transport.method(),
                                transport.routed_prefix()
                            );
                        }
                        None => println!("No IPv6 transport configured"),
                    }
                    Ok(())
                }
            },

            Commands::Proxy { command } => match command {
                ProxyCommands::Enable { upstream } => {
                    engine.set_ipv6_proxy(true, upstream.as_deref()).await?;
                    println!("NDP proxy enabled");
                    Ok(())
                }
                ProxyCommands::Disable => {
                    engine.set_ipv6_proxy(false, None).await?;
                    println!("NDP proxy disabled");
                    Ok(())
                }
            },

            Commands::Completions { shell } => {
                let mut cmd = Self::command();
                clap_complete::generate(shell, &mut cmd, "hafen", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}
