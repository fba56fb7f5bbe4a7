//! Common error types for the hafen engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`HafenError`].
pub type HafenResult<T> = Result<T, HafenError>;

/// Common errors across the hafen engine.
#[derive(Error, Diagnostic, Debug)]
pub enum HafenError {
    /// Malformed user input (CIDR, address, port, interface name).
    #[error("Validation failed: {message}")]
    #[diagnostic(code(hafen::validation))]
    Validation {
        /// What was malformed and why.
        message: String,
    },

    /// Invalid container name format.
    #[error("Invalid container name: {name}")]
    #[diagnostic(
        code(hafen::container::invalid_name),
        help("Container names must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerName {
        /// The invalid container name.
        name: String,
    },

    /// Container not known to the runtime.
    #[error("Container not found: {name}")]
    #[diagnostic(code(hafen::container::not_found))]
    ContainerNotFound {
        /// The container name that was not found.
        name: String,
    },

    /// Container exists but has no address of the requested family.
    #[error("Container {name} has no {family} address")]
    #[diagnostic(
        code(hafen::container::no_address),
        help("The container may be stopped, or its network may still be configuring")
    )]
    NoAddress {
        /// The container name.
        name: String,
        /// The address family that could not be resolved ("IPv4" or "IPv6").
        family: &'static str,
    },

    /// Port-map or ACL entry not present in the persisted collection.
    #[error("No {kind} entry matching {key}")]
    #[diagnostic(code(hafen::entry::not_found))]
    EntryNotFound {
        /// The collection kind ("port-map" or "IPv6 ACL").
        kind: &'static str,
        /// The lookup key that matched nothing.
        key: String,
    },

    /// External tool exited with a non-zero status.
    #[error("{command} failed with status {status}: {stderr}")]
    #[diagnostic(code(hafen::tool::failed))]
    Tool {
        /// The command line that was invoked.
        command: String,
        /// The exit status, or -1 when killed by a signal.
        status: i32,
        /// Captured standard error output.
        stderr: String,
    },

    /// External tool did not exit within the allowed time.
    #[error("{command} timed out after {seconds}s")]
    #[diagnostic(
        code(hafen::tool::timeout),
        help("The firewall tool may be waiting on a lock held by another process")
    )]
    ToolTimeout {
        /// The command line that was invoked.
        command: String,
        /// The timeout bound in seconds.
        seconds: u64,
    },

    /// Flushing the outgoing backend failed during a backend switch.
    #[error("Backend switch aborted: {message}")]
    #[diagnostic(
        code(hafen::backend::conflict),
        help("Resolve the flush failure before switching backends, or stale rules will shadow the new ruleset")
    )]
    BackendConflict {
        /// Why the outgoing backend could not be flushed.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(hafen::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(hafen::serialization))]
    Serialization(String),
}

impl From<serde_json::Error> for HafenError {
    fn from(err: serde_json::Error) -> Self {
        HafenError::Serialization(err.to_string())
    }
}
