//! Atomic backend: full-ruleset replacement through `nft -f`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use hafen_common::{HafenError, HafenResult};

use crate::config::NatBackendKind;
use crate::render::{self, NFT_TABLE, RenderInput, RuleSpec};
use crate::runner::{ToolRunner, command_line};
use crate::store::write_atomic;

use super::FirewallBackend;

/// Applies rulesets by writing the rendered document to a fixed path and
/// loading it as one transaction.
pub struct NftablesBackend {
    runner: Arc<dyn ToolRunner>,
    ruleset_path: PathBuf,
}

impl NftablesBackend {
    /// Create the backend; the document is written to `ruleset_path`.
    #[must_use]
    pub const fn new(runner: Arc<dyn ToolRunner>, ruleset_path: PathBuf) -> Self {
        Self {
            runner,
            ruleset_path,
        }
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn kind(&self) -> NatBackendKind {
        NatBackendKind::Nftables
    }

    async fn apply(&self, input: &RenderInput<'_>) -> HafenResult<()> {
        let document = render::nft_ruleset(input);
        write_atomic(&self.ruleset_path, &document)?;

        let path = self.ruleset_path.display().to_string();
        self.runner.run_ok("nft", &["-f", &path]).await?;

        tracing::info!(
            port_maps = input.port_maps.len(),
            acls = input.acls.len(),
            path = %path,
            "Loaded nftables ruleset"
        );
        Ok(())
    }

    async fn retract(&self, _specs: &[RuleSpec]) -> HafenResult<()> {
        // The next full-document load drops removed rules by construction.
        Ok(())
    }

    async fn flush(&self) -> HafenResult<()> {
        let args = ["delete", "table", "inet", NFT_TABLE];
        let out = self.runner.run("nft", &args).await?;
        if !out.success {
            // Deleting an absent table is a successful flush.
            if out.stderr.contains("No such file or directory") {
                tracing::debug!("nftables table already absent");
                return Ok(());
            }
            return Err(HafenError::Tool {
                command: command_line("nft", &args),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        tracing::info!(table = NFT_TABLE, "Flushed nftables table");
        Ok(())
    }
}
