//! Host bridge management.
//!
//! Containers attach to one bridge interface; hafen only needs to make
//! sure it exists, carries the gateway address, and is up.

use std::net::Ipv4Addr;
use std::sync::Arc;

use hafen_common::{HafenError, HafenResult};
use ipnet::Ipv4Net;

use crate::runner::{ToolRunner, command_line};

/// Creates and inspects the host bridge.
pub struct BridgeManager {
    runner: Arc<dyn ToolRunner>,
}

impl BridgeManager {
    /// Create a bridge manager using the given tool runner.
    #[must_use]
    pub const fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }

    /// Check whether a bridge interface exists.
    pub async fn exists(&self, name: &str) -> HafenResult<bool> {
        let out = self.runner.run("ip", &["link", "show", name]).await?;
        Ok(out.success)
    }

    /// Ensure the bridge exists, carries the gateway address, and is up.
    ///
    /// Tolerates a bridge or address that is already present, so repeated
    /// calls converge instead of failing.
    pub async fn ensure(&self, name: &str, gateway: Ipv4Addr, lan4_cidr: Ipv4Net) -> HafenResult<()> {
        if !self.exists(name).await? {
            tracing::debug!(name, "Creating bridge");
            let args = ["link", "add", "name", name, "type", "bridge"];
            let create = self.runner.run("ip", &args).await?;
            // A concurrent creator is fine; anything else is not.
            if !create.success && !self.exists(name).await? {
                return Err(HafenError::Tool {
                    command: command_line("ip", &args),
                    status: create.status,
                    stderr: create.stderr.trim().to_string(),
                });
            }
        }

        let address = format!("{gateway}/{}", lan4_cidr.prefix_len());
        let assign = self
            .runner
            .run("ip", &["addr", "add", &address, "dev", name])
            .await?;
        if !assign.success && !assign.stderr.contains("File exists") {
            tracing::warn!(
                bridge = name,
                address = %address,
                stderr = %assign.stderr.trim(),
                "Failed to assign gateway address"
            );
        }

        self.runner
            .run_ok("ip", &["link", "set", name, "up"])
            .await?;

        tracing::info!(bridge = name, gateway = %address, "Bridge ready");
        Ok(())
    }
}
