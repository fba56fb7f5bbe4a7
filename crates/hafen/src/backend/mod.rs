//! Firewall backend strategy.
//!
//! Exactly one backend is authoritative at a time. Both implement the same
//! narrow interface so the engine never branches on the backend kind
//! outside of construction.

mod iptables;
mod nftables;

use std::sync::Arc;

use async_trait::async_trait;
use hafen_common::{HafenPaths, HafenResult};

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

use crate::config::NatBackendKind;
use crate::render::{RenderInput, RuleSpec};
use crate::runner::ToolRunner;

/// One of the two mutually exclusive firewall backends.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> NatBackendKind;

    /// Install the ruleset for the given resolved state.
    ///
    /// Idempotent: applying the same state twice converges to the same
    /// installed rules. The atomic backend replaces the whole ruleset;
    /// the additive backend checks each directive before inserting it.
    async fn apply(&self, input: &RenderInput<'_>) -> HafenResult<()>;

    /// Delete-if-present the rules of entries removed from the state.
    ///
    /// Only meaningful for the additive backend; the atomic backend drops
    /// removed rules on the next full apply and treats this as a no-op.
    async fn retract(&self, specs: &[RuleSpec]) -> HafenResult<()>;

    /// Remove every artifact this backend owns.
    ///
    /// Mandatory before the other backend applies; stale rules from a
    /// half-switched backend shadow or duplicate the new ruleset.
    async fn flush(&self) -> HafenResult<()>;
}

/// Construct the backend for the configured kind.
#[must_use]
pub fn backend_for(
    kind: NatBackendKind,
    runner: Arc<dyn ToolRunner>,
    paths: &HafenPaths,
) -> Box<dyn FirewallBackend> {
    match kind {
        NatBackendKind::Nftables => Box::new(NftablesBackend::new(runner, paths.ruleset())),
        NatBackendKind::Iptables => Box::new(IptablesBackend::new(runner)),
    }
}
