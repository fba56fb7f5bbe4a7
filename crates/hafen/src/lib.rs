//! # hafen
//!
//! hafen manages the network and firewall policy of a single host running
//! systemd-nspawn containers. It keeps declarative intent (bridge, IPv4
//! NAT port maps, IPv6 inbound ACLs, IPv6 transport) in durable JSON
//! documents and synthesizes the corresponding firewall ruleset through
//! one of two backends: nftables (atomic full-ruleset replacement) or
//! iptables (additive check-then-insert directives).
//!
//! ## Design
//!
//! - The persisted documents are the single source of truth; the live
//!   firewall state is always a derived, disposable artifact.
//! - Every mutation runs load, validate, mutate, apply, persist under one
//!   process-wide lock, and persists only after a successful apply.
//! - Applying is idempotent: re-running `apply` with unchanged state
//!   converges to the same installed ruleset, which makes it the
//!   designated recovery after any failed or interrupted apply.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hafen::NetworkEngine;
//! use hafen::resolve::MachinectlRuntime;
//! use hafen::runner::HostRunner;
//! use hafen_common::HafenPaths;
//!
//! # async fn example() -> hafen_common::HafenResult<()> {
//! let runner = Arc::new(HostRunner::new());
//! let runtime = Arc::new(MachinectlRuntime::new(runner.clone()));
//! let engine = NetworkEngine::new(HafenPaths::new(), runner, runtime);
//!
//! engine.init().await?;
//! let status = engine.status().await?;
//! println!("backend: {}", status.config.nat_backend);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod engine;
pub mod render;
pub mod resolve;
pub mod runner;
pub mod store;
pub mod transport;

pub use engine::NetworkEngine;
