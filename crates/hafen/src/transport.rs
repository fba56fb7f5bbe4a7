//! IPv6 transport configuration.
//!
//! Containers get globally routable IPv6 through one of three transports:
//! a natively routed prefix, a static 6in4 tunnel (sit device), or a
//! WireGuard tunnel driven by wg-quick. Exactly one transport is active at
//! a time; switching tears the previous one down first. Whichever transport
//! delivers the prefix, advertisement on the bridge is the same
//! systemd-networkd drop-in, so every transport ends in
//! [`TransportManager::advertise_prefix`].

use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use hafen_common::{HafenError, HafenPaths, HafenResult};
use ipnet::Ipv6Net;
use tracing::{debug, info};

use crate::config::TransportState;
use crate::runner::{command_line, ToolRunner};
use crate::store::write_atomic;

/// Fixed name of the sit device for the 6in4 transport.
pub const SIT_IFACE: &str = "hafen6in4";

/// Configures and tears down IPv6 transports on the host.
pub struct TransportManager {
    runner: Arc<dyn ToolRunner>,
    paths: HafenPaths,
}

impl TransportManager {
    /// Create a manager driving tools through `runner`.
    pub fn new(runner: Arc<dyn ToolRunner>, paths: HafenPaths) -> Self {
        Self { runner, paths }
    }

    /// Tear down a previously active transport.
    ///
    /// Every step tolerates the artifact already being gone, so teardown
    /// after a half-finished configure or a host reboot still converges.
    pub async fn teardown(&self, state: &TransportState, bridge: &str) -> HafenResult<()> {
        match state {
            TransportState::Native { .. } => {}
            TransportState::SixInFour { .. } => {
                let out = self.runner.run("ip", &["tunnel", "del", SIT_IFACE]).await?;
                if !out.success {
                    debug!(iface = SIT_IFACE, "Tunnel already absent");
                }
            }
            TransportState::Wireguard { iface, .. } => {
                let unit = format!("wg-quick@{iface}");
                for verb in ["stop", "disable"] {
                    let out = self.runner.run("systemctl", &[verb, &unit]).await?;
                    if !out.success {
                        debug!(unit = %unit, verb, "WireGuard unit already down");
                    }
                }
                remove_if_present(&self.paths.wireguard_conf(iface))?;
            }
        }

        // All transports advertise through the same bridge drop-in.
        if remove_if_present(&self.paths.networkd_bridge_file(bridge))? {
            self.restart_networkd().await?;
        }
        info!(method = state.method(), "Transport torn down");
        Ok(())
    }

    /// Advertise a routed prefix on the bridge.
    ///
    /// Writes the networkd drop-in enabling router advertisements with the
    /// prefix and restarts systemd-networkd to pick it up. The bridge
    /// itself takes the first address of the prefix.
    pub async fn advertise_prefix(&self, bridge: &str, prefix: Ipv6Net) -> HafenResult<()> {
        let unit = networkd_unit(bridge, prefix);
        write_atomic(&self.paths.networkd_bridge_file(bridge), &unit)?;
        self.restart_networkd().await?;
        info!(bridge, prefix = %prefix, "Advertising IPv6 prefix on bridge");
        Ok(())
    }

    /// Bring up the static 6in4 tunnel.
    ///
    /// Creates the sit device toward the tunnel server, assigns the client
    /// address, and routes IPv6 default through the tunnel. Re-running
    /// against an existing tunnel is a no-op at each step.
    pub async fn configure_six_in_four(
        &self,
        local_v4: Ipv4Addr,
        server_v4: Ipv4Addr,
        client_v6: Ipv6Net,
        server_v6: Ipv6Addr,
    ) -> HafenResult<()> {
        let remote = server_v4.to_string();
        let local = local_v4.to_string();
        self.run_tolerating(
            "ip",
            &[
                "tunnel", "add", SIT_IFACE, "mode", "sit", "remote", &remote, "local", &local,
                "ttl", "64",
            ],
            "File exists",
        )
        .await?;

        self.runner
            .run_ok("ip", &["link", "set", SIT_IFACE, "up"])
            .await?;

        let addr = client_v6.to_string();
        self.run_tolerating(
            "ip",
            &["-6", "addr", "add", &addr, "dev", SIT_IFACE],
            "File exists",
        )
        .await?;

        let via = server_v6.to_string();
        self.run_tolerating(
            "ip",
            &["-6", "route", "add", "default", "via", &via, "dev", SIT_IFACE],
            "exists",
        )
        .await?;

        info!(
            iface = SIT_IFACE,
            server = %server_v4,
            "6in4 tunnel up"
        );
        Ok(())
    }

    /// Bring up a WireGuard tunnel from a full wg-quick configuration.
    ///
    /// The configuration text carries key material, so the file is written
    /// with mode 0600 before wg-quick is enabled and started.
    pub async fn configure_wireguard(&self, iface: &str, conf: &str) -> HafenResult<()> {
        if !conf.contains("[Interface]") {
            return Err(HafenError::Validation {
                message: "WireGuard configuration must contain an [Interface] section".to_string(),
            });
        }

        let mut contents = conf.trim_end().to_string();
        contents.push('\n');

        let path = self.paths.wireguard_conf(iface);
        write_atomic(&path, &contents)?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;

        let unit = format!("wg-quick@{iface}");
        self.runner.run_ok("systemctl", &["enable", &unit]).await?;
        self.runner.run_ok("systemctl", &["start", &unit]).await?;

        info!(iface, "WireGuard tunnel up");
        Ok(())
    }

    async fn restart_networkd(&self) -> HafenResult<()> {
        self.runner
            .run_ok("systemctl", &["restart", "systemd-networkd"])
            .await?;
        Ok(())
    }

    /// Run a command, accepting failure when stderr names an already
    /// satisfied state (`File exists` from the ip family of tools).
    async fn run_tolerating(
        &self,
        program: &str,
        args: &[&str],
        needle: &str,
    ) -> HafenResult<()> {
        let out = self.runner.run(program, args).await?;
        if out.success || out.stderr.contains(needle) {
            return Ok(());
        }
        Err(HafenError::Tool {
            command: command_line(program, args),
            status: out.status,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// First usable address of a prefix, assigned to the bridge itself.
fn bridge_address(prefix: Ipv6Net) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(prefix.network()) | 1)
}

/// Render the networkd drop-in advertising `prefix` on `bridge`.
fn networkd_unit(bridge: &str, prefix: Ipv6Net) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "# Managed by hafen. Manual edits are overwritten.");
    let _ = writeln!(out, "[Match]");
    let _ = writeln!(out, "Name={bridge}");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Network]");
    let _ = writeln!(out, "DHCP=no");
    let _ = writeln!(out, "IPv6AcceptRA=no");
    let _ = writeln!(out, "IPv6SendRA=yes");
    let _ = writeln!(out, "ConfigureWithoutCarrier=yes");
    let _ = writeln!(
        out,
        "Address={}/{}",
        bridge_address(prefix),
        prefix.prefix_len()
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "[IPv6Prefix]");
    let _ = writeln!(out, "Prefix={}", prefix.trunc());
    out
}

/// Remove a file, reporting whether it was present.
fn remove_if_present(path: &std::path::Path) -> HafenResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
