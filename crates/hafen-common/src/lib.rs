//! # hafen-common
//!
//! Shared types for the hafen network policy engine.
//!
//! This crate provides the foundation used across the hafen crates:
//! - Container name validation
//! - Standard filesystem paths for persisted state
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;

pub use error::{HafenError, HafenResult};
pub use name::ContainerName;
pub use paths::HafenPaths;
