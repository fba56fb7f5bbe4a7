//! Durable persistence for the declarative network state.
//!
//! Three documents live under the state root: the singleton
//! [`NetworkConfig`] and the two keyed collections. Every save writes a
//! temp file in the same directory and renames it over the target, so a
//! crash mid-write never leaves a partial document behind.

use std::io::Write;
use std::path::Path;

use hafen_common::{HafenPaths, HafenResult};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{Ipv6AclEntry, NetworkConfig, PortMapEntry};

/// Persists the network configuration and rule collections.
#[derive(Debug, Clone)]
pub struct NetStore {
    paths: HafenPaths,
}

impl NetStore {
    /// Create a store over the given path layout.
    #[must_use]
    pub const fn new(paths: HafenPaths) -> Self {
        Self { paths }
    }

    /// Load the network configuration, backfilling defaults.
    ///
    /// A missing document yields the default configuration; a document
    /// written by an older version deserializes with newer fields
    /// defaulted.
    pub fn load_config(&self) -> HafenResult<NetworkConfig> {
        self.load_or(&self.paths.network_config(), NetworkConfig::default)
    }

    /// Save the network configuration atomically.
    pub fn save_config(&self, config: &NetworkConfig) -> HafenResult<()> {
        self.save(&self.paths.network_config(), config)
    }

    /// Load the port-map collection, empty if never written.
    pub fn load_port_maps(&self) -> HafenResult<Vec<PortMapEntry>> {
        self.load_or(&self.paths.port_maps(), Vec::new)
    }

    /// Save the port-map collection atomically.
    pub fn save_port_maps(&self, maps: &[PortMapEntry]) -> HafenResult<()> {
        self.save(&self.paths.port_maps(), &maps)
    }

    /// Load the IPv6 ACL collection, empty if never written.
    pub fn load_acls(&self) -> HafenResult<Vec<Ipv6AclEntry>> {
        self.load_or(&self.paths.acls(), Vec::new)
    }

    /// Save the IPv6 ACL collection atomically.
    pub fn save_acls(&self, acls: &[Ipv6AclEntry]) -> HafenResult<()> {
        self.save(&self.paths.acls(), &acls)
    }

    fn load_or<T, F>(&self, path: &Path, default: F) -> HafenResult<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        match std::fs::read_to_string(path) {
            Ok(json) => {
                let value = serde_json::from_str(&json)?;
                tracing::debug!(path = %path.display(), "Loaded state document");
                Ok(value)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save<T: Serialize>(&self, path: &Path, value: &T) -> HafenResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        write_atomic(path, &json)?;
        tracing::debug!(path = %path.display(), "Saved state document");
        Ok(())
    }
}

/// Write `contents` to `path` via a temp file in the same directory and a
/// rename, so readers never observe a partial write.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> HafenResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NatBackendKind, Protocol};
    use chrono::Utc;
    use hafen_common::ContainerName;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> NetStore {
        NetStore::new(HafenPaths::with_root(dir))
    }

    #[test]
    fn missing_documents_yield_defaults() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        assert_eq!(store.load_config().unwrap(), NetworkConfig::default());
        assert!(store.load_port_maps().unwrap().is_empty());
        assert!(store.load_acls().unwrap().is_empty());
    }

    #[test]
    fn config_save_load_round_trip() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        let mut cfg = NetworkConfig::default();
        cfg.bridge = "br7".to_string();
        cfg.nat_backend = NatBackendKind::Iptables;
        cfg.wan_iface = Some("enp3s0".to_string());

        store.save_config(&cfg).unwrap();
        assert_eq!(store.load_config().unwrap(), cfg);
    }

    #[test]
    fn collections_round_trip() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        let map = PortMapEntry {
            container: ContainerName::new("web1").unwrap(),
            protocol: Protocol::Tcp,
            host_port: 2222,
            container_port: 22,
            container_ip: "10.0.0.10".parse().unwrap(),
            created_at: Utc::now(),
        };
        let acl = Ipv6AclEntry {
            container: ContainerName::new("web1").unwrap(),
            protocol: Protocol::Tcp,
            dest_port: 443,
            container_ip: "2001:db8:abcd:100::10".parse().unwrap(),
            created_at: Utc::now(),
        };

        store.save_port_maps(std::slice::from_ref(&map)).unwrap();
        store.save_acls(std::slice::from_ref(&acl)).unwrap();

        assert_eq!(store.load_port_maps().unwrap(), vec![map]);
        assert_eq!(store.load_acls().unwrap(), vec![acl]);
    }

    #[test]
    fn save_replaces_whole_document() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        let entry = PortMapEntry {
            container: ContainerName::new("web1").unwrap(),
            protocol: Protocol::Udp,
            host_port: 53,
            container_port: 53,
            container_ip: "10.0.0.11".parse().unwrap(),
            created_at: Utc::now(),
        };
        store.save_port_maps(std::slice::from_ref(&entry)).unwrap();
        store.save_port_maps(&[]).unwrap();

        assert!(store.load_port_maps().unwrap().is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        store.save_config(&NetworkConfig::default()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["network.json".to_string()]);
    }
}
