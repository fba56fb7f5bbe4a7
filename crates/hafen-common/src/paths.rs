//! Standard filesystem paths for hafen state.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for hafen state.
pub static HAFEN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HAFEN_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/hafen"))
});

/// Default directory for systemd-networkd drop-in files.
pub static NETWORKD_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HAFEN_NETWORKD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/systemd/network"))
});

/// Default directory for WireGuard configuration files.
pub static WIREGUARD_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HAFEN_WIREGUARD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/wireguard"))
});

/// Standard paths used by the hafen engine.
#[derive(Debug, Clone)]
pub struct HafenPaths {
    /// Root state directory (default: /var/lib/hafen).
    pub root: PathBuf,
    /// systemd-networkd drop-in directory (default: /etc/systemd/network).
    pub networkd: PathBuf,
    /// WireGuard configuration directory (default: /etc/wireguard).
    pub wireguard: PathBuf,
}

impl HafenPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with everything under a custom root directory.
    ///
    /// Used by tests and non-system installs; networkd and WireGuard
    /// files land under the root instead of /etc.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let networkd = root.join("networkd");
        let wireguard = root.join("wireguard");
        Self {
            root,
            networkd,
            wireguard,
        }
    }

    /// Persisted network configuration document.
    #[must_use]
    pub fn network_config(&self) -> PathBuf {
        self.root.join("network.json")
    }

    /// Persisted port-map collection.
    #[must_use]
    pub fn port_maps(&self) -> PathBuf {
        self.root.join("portmaps.json")
    }

    /// Persisted IPv6 ACL collection.
    #[must_use]
    pub fn acls(&self) -> PathBuf {
        self.root.join("acls.json")
    }

    /// Rendered nftables ruleset document, the fixed load path for `nft -f`.
    #[must_use]
    pub fn ruleset(&self) -> PathBuf {
        self.root.join("ruleset.nft")
    }

    /// networkd drop-in advertising the IPv6 prefix on a bridge.
    #[must_use]
    pub fn networkd_bridge_file(&self, bridge: &str) -> PathBuf {
        self.networkd.join(format!("25-hafen-{bridge}.network"))
    }

    /// WireGuard configuration file for an interface.
    #[must_use]
    pub fn wireguard_conf(&self, iface: &str) -> PathBuf {
        self.wireguard.join(format!("{iface}.conf"))
    }

    /// Create the state root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

impl Default for HafenPaths {
    fn default() -> Self {
        Self {
            root: HAFEN_ROOT.clone(),
            networkd: NETWORKD_DIR.clone(),
            wireguard: WIREGUARD_DIR.clone(),
        }
    }
}
