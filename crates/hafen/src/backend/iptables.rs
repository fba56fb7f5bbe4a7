//! Additive backend: idempotent check-then-insert iptables directives.
//!
//! iptables has no declarative reconciliation, so every directive is
//! probed with `-C` before `-A` appends it, and removal is the symmetric
//! check-then-`-D`. Ownership is discovered through the comment tag when
//! flushing.

use std::sync::Arc;

use async_trait::async_trait;
use hafen_common::HafenResult;

use crate::config::NatBackendKind;
use crate::render::{self, RULE_TAG, RenderInput, RuleSpec};
use crate::runner::ToolRunner;

use super::FirewallBackend;

/// Chains that can hold hafen-owned rules.
const FLUSH_TARGETS: &[(&str, &str)] = &[
    ("filter", "FORWARD"),
    ("nat", "PREROUTING"),
    ("nat", "POSTROUTING"),
];

/// Applies rules additively through the iptables binary.
pub struct IptablesBackend {
    runner: Arc<dyn ToolRunner>,
}

impl IptablesBackend {
    /// Create the backend.
    #[must_use]
    pub const fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }

    /// Append the rule unless an identical one is already installed.
    async fn ensure(&self, spec: &RuleSpec) -> HafenResult<()> {
        let check = spec.check_args();
        let check_refs: Vec<&str> = check.iter().map(String::as_str).collect();
        if self.runner.run("iptables", &check_refs).await?.success {
            return Ok(());
        }

        let append = spec.append_args();
        let append_refs: Vec<&str> = append.iter().map(String::as_str).collect();
        self.runner.run_ok("iptables", &append_refs).await?;
        Ok(())
    }

    /// Delete the rule if it is installed.
    async fn remove_if_present(&self, spec: &RuleSpec) -> HafenResult<()> {
        let check = spec.check_args();
        let check_refs: Vec<&str> = check.iter().map(String::as_str).collect();
        if !self.runner.run("iptables", &check_refs).await?.success {
            return Ok(());
        }

        let delete = spec.delete_args();
        let delete_refs: Vec<&str> = delete.iter().map(String::as_str).collect();
        self.runner.run_ok("iptables", &delete_refs).await?;
        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn kind(&self) -> NatBackendKind {
        NatBackendKind::Iptables
    }

    async fn apply(&self, input: &RenderInput<'_>) -> HafenResult<()> {
        let rules = render::iptables_rules(input);
        for rule in &rules {
            self.ensure(rule).await?;
        }
        tracing::info!(rules = rules.len(), "Ensured iptables directives");
        Ok(())
    }

    async fn retract(&self, specs: &[RuleSpec]) -> HafenResult<()> {
        for spec in specs {
            self.remove_if_present(spec).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> HafenResult<()> {
        for (table, chain) in FLUSH_TARGETS {
            let listing = self
                .runner
                .run_ok("iptables", &["-t", table, "-L", chain, "-n", "--line-numbers"])
                .await?;

            // Collect owned line numbers, then delete bottom-up so the
            // remaining numbers stay valid.
            let mut line_numbers: Vec<u32> = listing
                .stdout
                .lines()
                .filter(|line| line.contains(RULE_TAG))
                .filter_map(|line| line.split_whitespace().next()?.parse().ok())
                .collect();
            line_numbers.sort_unstable();

            for number in line_numbers.into_iter().rev() {
                self.runner
                    .run_ok("iptables", &["-t", table, "-D", chain, &number.to_string()])
                    .await?;
            }
        }
        tracing::info!("Flushed iptables rules");
        Ok(())
    }
}
