//! The policy engine.
//!
//! [`NetworkEngine`] owns every mutation of the declarative network state
//! and the pipeline that turns it into installed firewall rules. Each
//! operation runs the same sequence under one process-wide lock: load the
//! persisted state, validate and mutate it in memory, render and apply
//! the resulting ruleset, and only then persist. A failed apply therefore
//! leaves the persisted state at its prior value, and recovery is a plain
//! re-run of `apply` against unchanged state.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::Utc;
use hafen_common::{ContainerName, HafenError, HafenPaths, HafenResult};
use ipnet::Ipv6Net;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::backend_for;
use crate::bridge::BridgeManager;
use crate::config::{
    Ipv6AclEntry, NatBackendKind, NetworkConfig, PortMapEntry, Protocol, TransportState,
};
use crate::render::{self, RenderInput, RuleSpec};
use crate::resolve::{self, ContainerRuntime};
use crate::runner::ToolRunner;
use crate::store::NetStore;
use crate::transport::TransportManager;

/// Fully resolved view of the declarative state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// The persisted configuration.
    pub config: NetworkConfig,
    /// All port-map entries.
    pub port_maps: Vec<PortMapEntry>,
    /// All IPv6 ACL entries.
    pub acls: Vec<Ipv6AclEntry>,
    /// Whether the configured bridge interface currently exists.
    pub bridge_exists: bool,
}

/// What a container purge removed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PurgeReport {
    /// Number of port maps removed.
    pub port_maps_removed: usize,
    /// Number of IPv6 ACLs removed.
    pub acls_removed: usize,
}

/// Serialized access to the declarative network state and the firewall.
///
/// All methods take `&self`; an internal lock serializes the
/// load-mutate-apply-persist sequence, so concurrent callers queue
/// instead of losing updates to each other.
pub struct NetworkEngine {
    store: NetStore,
    runner: Arc<dyn ToolRunner>,
    runtime: Arc<dyn ContainerRuntime>,
    bridge: BridgeManager,
    transport: TransportManager,
    paths: HafenPaths,
    lock: Mutex<()>,
}

impl NetworkEngine {
    /// Create an engine over the given paths and collaborators.
    #[must_use]
    pub fn new(
        paths: HafenPaths,
        runner: Arc<dyn ToolRunner>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            store: NetStore::new(paths.clone()),
            bridge: BridgeManager::new(runner.clone()),
            transport: TransportManager::new(runner.clone(), paths.clone()),
            runner,
            runtime,
            paths,
            lock: Mutex::new(()),
        }
    }

    /// The fully resolved current state: config, both collections, and
    /// whether the bridge exists.
    ///
    /// The WAN interface is resolved for the report even before the
    /// first apply has cached it; a read never persists anything.
    pub async fn status(&self) -> HafenResult<StatusReport> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let port_maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;
        let bridge_exists = self.bridge.exists(&config.bridge).await?;
        self.wan_iface(&mut config).await?;
        Ok(StatusReport {
            config,
            port_maps,
            acls,
            bridge_exists,
        })
    }

    /// Bootstrap host networking: state directory, packet forwarding,
    /// bridge, and a first apply.
    pub async fn init(&self) -> HafenResult<()> {
        let _guard = self.lock.lock().await;
        self.paths.create_dirs()?;

        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        self.enable_forwarding().await?;
        self.bridge
            .ensure(&config.bridge, config.lan4_gateway, config.lan4_cidr)
            .await?;
        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(bridge = %config.bridge, backend = %config.nat_backend, "Host networking initialized");
        Ok(())
    }

    /// Re-render the persisted state and apply it.
    ///
    /// Safe to repeat at any time; this is the designated recovery after
    /// a failed or interrupted apply.
    pub async fn apply(&self) -> HafenResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;
        Ok(())
    }

    /// Render the nftables document for the current state without
    /// touching the firewall.
    pub async fn ruleset_preview(&self) -> HafenResult<String> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        let wan = self.wan_iface(&mut config).await?;
        Ok(render::nft_ruleset(&RenderInput {
            config: &config,
            port_maps: &maps,
            acls: &acls,
            wan_iface: wan.as_deref(),
        }))
    }

    /// Make sure the configured bridge exists, is addressed, and is up.
    pub async fn ensure_bridge(&self) -> HafenResult<()> {
        let _guard = self.lock.lock().await;
        let config = self.store.load_config()?;
        self.bridge
            .ensure(&config.bridge, config.lan4_gateway, config.lan4_cidr)
            .await
    }

    /// Switch the container bridge and re-apply.
    pub async fn set_bridge(&self, name: &str) -> HafenResult<()> {
        resolve::validate_iface_name(name)?;

        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        config.bridge = name.to_string();
        self.bridge
            .ensure(name, config.lan4_gateway, config.lan4_cidr)
            .await?;
        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(bridge = name, "Bridge updated");
        Ok(())
    }

    /// Switch the authoritative firewall backend.
    ///
    /// The outgoing backend is flushed before the incoming one applies;
    /// without that, stale rules shadow or duplicate the new ruleset
    /// (double NAT, duplicate DNAT). A flush failure aborts the switch
    /// with [`HafenError::BackendConflict`] and the incoming backend is
    /// not applied.
    pub async fn set_backend(&self, kind: NatBackendKind) -> HafenResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        if config.nat_backend == kind {
            debug!(backend = %kind, "Backend unchanged");
            return Ok(());
        }
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        let outgoing = backend_for(config.nat_backend, self.runner.clone(), &self.paths);
        outgoing.flush().await.map_err(|e| HafenError::BackendConflict {
            message: format!(
                "could not flush {} before switching to {kind}: {e}",
                config.nat_backend
            ),
        })?;

        config.nat_backend = kind;
        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(backend = %kind, "Backend switched");
        Ok(())
    }

    /// Add a port map, replacing any entry with the same
    /// `(protocol, host_port)` key.
    ///
    /// The container's IPv4 address is resolved now and snapshotted into
    /// the entry; [`NetworkEngine::refresh_container`] re-resolves it
    /// later if the container's address changes.
    pub async fn add_port_map(
        &self,
        container: &ContainerName,
        protocol: Protocol,
        host_port: u16,
        container_port: u16,
    ) -> HafenResult<PortMapEntry> {
        resolve::validate_port(host_port)?;
        resolve::validate_port(container_port)?;

        let _guard = self.lock.lock().await;
        let container_ip = resolve::resolve_ipv4(self.runtime.as_ref(), container).await?;

        let mut config = self.store.load_config()?;
        let mut maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        let entry = PortMapEntry {
            container: container.clone(),
            protocol,
            host_port,
            container_port,
            container_ip,
            created_at: Utc::now(),
        };

        // Replace, never duplicate: a stale rule for the same host port
        // would keep stealing traffic ahead of the new one.
        let mut retract = Vec::new();
        for old in maps.iter().filter(|m| m.key() == entry.key()) {
            retract.extend(render::iptables_map_rules(old));
        }
        maps.retain(|m| m.key() != entry.key());
        maps.push(entry.clone());

        self.render_and_apply(&mut config, &maps, &acls, &retract).await?;
        self.store.save_port_maps(&maps)?;
        self.store.save_config(&config)?;

        info!(
            container = %entry.container,
            protocol = %protocol,
            host_port,
            container_port,
            ip = %container_ip,
            "Port map added"
        );
        Ok(entry)
    }

    /// Remove the port map with the given `(protocol, host_port)` key.
    pub async fn remove_port_map(
        &self,
        protocol: Protocol,
        host_port: u16,
    ) -> HafenResult<PortMapEntry> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let mut maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        let position = maps
            .iter()
            .position(|m| m.key() == (protocol, host_port))
            .ok_or_else(|| HafenError::EntryNotFound {
                kind: "port-map",
                key: format!("{protocol}/{host_port}"),
            })?;
        let removed = maps.remove(position);

        let retract = render::iptables_map_rules(&removed);
        self.render_and_apply(&mut config, &maps, &acls, &retract).await?;
        self.store.save_port_maps(&maps)?;
        self.store.save_config(&config)?;

        info!(protocol = %protocol, host_port, "Port map removed");
        Ok(removed)
    }

    /// All port-map entries, in insertion order.
    pub async fn list_port_maps(&self) -> HafenResult<Vec<PortMapEntry>> {
        let _guard = self.lock.lock().await;
        self.store.load_port_maps()
    }

    /// Add an IPv6 inbound ACL, replacing any entry with the same
    /// `(protocol, dest_port, container_ip)` key.
    ///
    /// A routed prefix is not required; the ACL simply has no external
    /// reachability until a transport delivers one.
    pub async fn add_acl(
        &self,
        container: &ContainerName,
        protocol: Protocol,
        dest_port: u16,
    ) -> HafenResult<Ipv6AclEntry> {
        resolve::validate_port(dest_port)?;

        let _guard = self.lock.lock().await;
        let container_ip = resolve::resolve_ipv6(self.runtime.as_ref(), container).await?;

        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let mut acls = self.store.load_acls()?;

        let entry = Ipv6AclEntry {
            container: container.clone(),
            protocol,
            dest_port,
            container_ip,
            created_at: Utc::now(),
        };
        acls.retain(|a| a.key() != entry.key());
        acls.push(entry.clone());

        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_acls(&acls)?;
        self.store.save_config(&config)?;

        info!(
            container = %entry.container,
            protocol = %protocol,
            dest_port,
            ip = %container_ip,
            "IPv6 ACL added"
        );
        Ok(entry)
    }

    /// Remove the ACL with the given key.
    pub async fn remove_acl(
        &self,
        protocol: Protocol,
        dest_port: u16,
        container_ip: Ipv6Addr,
    ) -> HafenResult<Ipv6AclEntry> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let mut acls = self.store.load_acls()?;

        let position = acls
            .iter()
            .position(|a| a.key() == (protocol, dest_port, container_ip))
            .ok_or_else(|| HafenError::EntryNotFound {
                kind: "IPv6 ACL",
                key: format!("{protocol}/{dest_port}/{container_ip}"),
            })?;
        let removed = acls.remove(position);

        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_acls(&acls)?;
        self.store.save_config(&config)?;

        info!(protocol = %protocol, dest_port, ip = %container_ip, "IPv6 ACL removed");
        Ok(removed)
    }

    /// All IPv6 ACL entries, in insertion order.
    pub async fn list_acls(&self) -> HafenResult<Vec<Ipv6AclEntry>> {
        let _guard = self.lock.lock().await;
        self.store.load_acls()
    }

    /// Drop every entry owned by a deleted container and re-apply.
    ///
    /// This is the lifecycle hook keeping the collections free of
    /// dangling entries; after it returns, no installed rule references
    /// the container's addresses.
    pub async fn purge_container(&self, name: &ContainerName) -> HafenResult<PurgeReport> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let mut maps = self.store.load_port_maps()?;
        let mut acls = self.store.load_acls()?;

        let mut retract = Vec::new();
        for map in maps.iter().filter(|m| m.container == *name) {
            retract.extend(render::iptables_map_rules(map));
        }
        let maps_before = maps.len();
        let acls_before = acls.len();
        maps.retain(|m| m.container != *name);
        acls.retain(|a| a.container != *name);

        self.render_and_apply(&mut config, &maps, &acls, &retract).await?;
        self.store.save_port_maps(&maps)?;
        self.store.save_acls(&acls)?;
        self.store.save_config(&config)?;

        let report = PurgeReport {
            port_maps_removed: maps_before - maps.len(),
            acls_removed: acls_before - acls.len(),
        };
        info!(
            container = %name,
            port_maps = report.port_maps_removed,
            acls = report.acls_removed,
            "Purged container entries"
        );
        Ok(report)
    }

    /// Re-resolve a container's IPv4 address and rewrite the snapshot in
    /// its port maps. Returns the number of entries updated.
    pub async fn refresh_container(&self, name: &ContainerName) -> HafenResult<usize> {
        let _guard = self.lock.lock().await;
        let current_ip = resolve::resolve_ipv4(self.runtime.as_ref(), name).await?;

        let mut config = self.store.load_config()?;
        let mut maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        let mut retract = Vec::new();
        let mut updated = 0;
        for map in maps
            .iter_mut()
            .filter(|m| m.container == *name && m.container_ip != current_ip)
        {
            retract.extend(render::iptables_map_rules(map));
            map.container_ip = current_ip;
            updated += 1;
        }
        if updated == 0 {
            debug!(container = %name, "Address snapshots already current");
            return Ok(0);
        }

        self.render_and_apply(&mut config, &maps, &acls, &retract).await?;
        self.store.save_port_maps(&maps)?;
        self.store.save_config(&config)?;

        info!(container = %name, updated, ip = %current_ip, "Refreshed address snapshots");
        Ok(updated)
    }

    /// Enable or disable the neighbor-discovery proxy.
    ///
    /// Enabling requires a routed IPv6 prefix; the upstream interface
    /// defaults to the detected WAN when not given.
    pub async fn set_ipv6_proxy(
        &self,
        enabled: bool,
        upstream_iface: Option<&str>,
    ) -> HafenResult<()> {
        if let Some(iface) = upstream_iface {
            resolve::validate_iface_name(iface)?;
        }

        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        if enabled {
            if config.ipv6_prefix.is_none() {
                return Err(HafenError::Validation {
                    message: "the NDP proxy needs a routed IPv6 prefix; configure a transport first"
                        .to_string(),
                });
            }
            let upstream = match upstream_iface {
                Some(iface) => Some(iface.to_string()),
                None => match config.ipv6_proxy_upstream_iface.clone() {
                    Some(existing) => Some(existing),
                    None => self.wan_iface(&mut config).await?,
                },
            };
            let Some(upstream) = upstream else {
                return Err(HafenError::Validation {
                    message: "no upstream interface for the NDP proxy and none detectable"
                        .to_string(),
                });
            };
            config.ipv6_proxy_upstream_iface = Some(upstream);
        }
        config.ipv6_proxy_enabled = enabled;

        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(enabled, "NDP proxy setting updated");
        Ok(())
    }

    /// Activate the native transport: advertise a routed prefix on the
    /// bridge.
    pub async fn set_transport_native(&self, prefix: Ipv6Net) -> HafenResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        self.teardown_current_transport(&config).await?;
        self.transport.advertise_prefix(&config.bridge, prefix).await?;

        config.ipv6_transport = Some(TransportState::Native { prefix });
        config.ipv6_prefix = Some(prefix);
        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(prefix = %prefix, "Native IPv6 transport active");
        Ok(())
    }

    /// Activate the 6in4 transport: static sit tunnel to a tunnel
    /// broker, then advertise the routed prefix on the bridge.
    pub async fn set_transport_six_in_four(
        &self,
        local_v4: Ipv4Addr,
        server_v4: Ipv4Addr,
        client_v6: Ipv6Net,
        server_v6: Ipv6Addr,
        routed_prefix: Ipv6Net,
    ) -> HafenResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        self.teardown_current_transport(&config).await?;
        self.transport
            .configure_six_in_four(local_v4, server_v4, client_v6, server_v6)
            .await?;
        self.transport
            .advertise_prefix(&config.bridge, routed_prefix)
            .await?;

        config.ipv6_transport = Some(TransportState::SixInFour {
            local_v4,
            server_v4,
            client_v6,
            server_v6,
            routed_prefix,
        });
        config.ipv6_prefix = Some(routed_prefix);
        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(prefix = %routed_prefix, server = %server_v4, "6in4 IPv6 transport active");
        Ok(())
    }

    /// Activate the WireGuard transport from a full wg-quick peer
    /// configuration, then advertise the routed prefix on the bridge.
    pub async fn set_transport_wireguard(
        &self,
        iface: &str,
        peer_conf: &str,
        routed_prefix: Ipv6Net,
    ) -> HafenResult<()> {
        resolve::validate_iface_name(iface)?;

        let _guard = self.lock.lock().await;
        let mut config = self.store.load_config()?;
        let maps = self.store.load_port_maps()?;
        let acls = self.store.load_acls()?;

        self.teardown_current_transport(&config).await?;
        self.transport.configure_wireguard(iface, peer_conf).await?;
        self.transport
            .advertise_prefix(&config.bridge, routed_prefix)
            .await?;

        config.ipv6_transport = Some(TransportState::Wireguard {
            iface: iface.to_string(),
            routed_prefix,
        });
        config.ipv6_prefix = Some(routed_prefix);
        self.render_and_apply(&mut config, &maps, &acls, &[]).await?;
        self.store.save_config(&config)?;

        info!(prefix = %routed_prefix, iface, "WireGuard IPv6 transport active");
        Ok(())
    }

    /// Tear down whichever transport is currently recorded, if any.
    async fn teardown_current_transport(&self, config: &NetworkConfig) -> HafenResult<()> {
        if let Some(old) = &config.ipv6_transport {
            self.transport.teardown(old, &config.bridge).await?;
        }
        Ok(())
    }

    /// Retract stale rules, then render and apply the given state.
    ///
    /// `retract` carries the directive sets of entries that were removed
    /// or replaced; the additive backend deletes them before inserting,
    /// the atomic backend ignores them since its full reload drops them
    /// anyway. Resolves and caches the WAN interface into `config` on
    /// the way.
    async fn render_and_apply(
        &self,
        config: &mut NetworkConfig,
        maps: &[PortMapEntry],
        acls: &[Ipv6AclEntry],
        retract: &[RuleSpec],
    ) -> HafenResult<()> {
        let wan = self.wan_iface(config).await?;
        let backend = backend_for(config.nat_backend, self.runner.clone(), &self.paths);

        if !retract.is_empty() {
            backend.retract(retract).await?;
        }

        if config.nat_backend == NatBackendKind::Iptables && !acls.is_empty() {
            warn!(
                acls = acls.len(),
                "IPv6 ACLs are not enforced by the iptables backend"
            );
        }

        backend
            .apply(&RenderInput {
                config,
                port_maps: maps,
                acls,
                wan_iface: wan.as_deref(),
            })
            .await?;

        if config.ipv6_proxy_enabled {
            self.sync_ndp_proxy(config, acls).await?;
        }
        Ok(())
    }

    /// The WAN interface: configured value, or detected from the default
    /// route and cached into `config` for the next persist.
    async fn wan_iface(&self, config: &mut NetworkConfig) -> HafenResult<Option<String>> {
        if config.wan_iface.is_some() {
            return Ok(config.wan_iface.clone());
        }
        let detected = resolve::detect_wan_iface(self.runner.as_ref()).await?;
        if let Some(dev) = &detected {
            info!(dev, "Detected WAN interface from default route");
            config.wan_iface = Some(dev.clone());
        }
        Ok(detected)
    }

    /// Enable IPv4 and IPv6 packet forwarding on the host.
    async fn enable_forwarding(&self) -> HafenResult<()> {
        for key in ["net.ipv4.ip_forward=1", "net.ipv6.conf.all.forwarding=1"] {
            self.runner.run_ok("sysctl", &["-w", key]).await?;
        }
        Ok(())
    }

    /// Make proxied container addresses answerable on the upstream link.
    async fn sync_ndp_proxy(
        &self,
        config: &NetworkConfig,
        acls: &[Ipv6AclEntry],
    ) -> HafenResult<()> {
        let Some(upstream) = config.ipv6_proxy_upstream_iface.as_deref() else {
            warn!("NDP proxy enabled without an upstream interface; skipping");
            return Ok(());
        };

        self.runner
            .run_ok("sysctl", &["-w", "net.ipv6.conf.all.proxy_ndp=1"])
            .await?;

        for acl in acls {
            let addr = acl.container_ip.to_string();
            let out = self
                .runner
                .run("ip", &["-6", "neigh", "add", "proxy", &addr, "dev", upstream])
                .await?;
            if !out.success && !out.stderr.contains("File exists") {
                warn!(
                    addr = %addr,
                    stderr = %out.stderr.trim(),
                    "Could not add NDP proxy entry"
                );
            }
        }
        Ok(())
    }
}
