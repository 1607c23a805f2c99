//! Error types for environment provisioning and lifecycle operations.

use thiserror::Error;

/// Errors that can occur during allocation, binding, or driver operations.
#[derive(Error, Debug)]
pub enum VirtLabError {
    /// Control plane temporarily unreachable or busy. Retryable.
    #[error("Transient control plane failure: {0}")]
    Transient(String),

    /// Malformed request or conflicting state on the control plane. Never retried.
    #[error("Permanent driver failure: {0}")]
    Permanent(String),

    /// No further non-overlapping subnet fits in the pool's base ranges.
    #[error("Address pool has no free {prefix_len} subnet left in {pool}")]
    PoolExhausted { pool: String, prefix_len: u8 },

    /// No usable host address remains in a network.
    #[error("No free address left in network {network}")]
    AddressPoolExhausted { network: String },

    /// MAC generation kept colliding past the retry bound.
    #[error("Could not generate a unique MAC address after {attempts} attempts")]
    MacExhausted { attempts: u32 },

    /// Requested snapshot type conflicts with the domain's established chain.
    #[error("Snapshot chain on node '{node}' is {existing}, refusing to create {requested} snapshot '{name}'")]
    SnapshotTypeConflict {
        node: String,
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// Deleting a snapshot with descendants requires an explicit cascade.
    #[error("Snapshot '{name}' on node '{node}' has {children} child(ren); pass cascade to delete the subtree")]
    SnapshotHasChildren {
        node: String,
        name: String,
        children: usize,
    },

    /// Snapshot was not found on the node.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Node record or domain handle was not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Record lookup in the store came up empty.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Entity is in the wrong lifecycle state for the requested operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// XML parsing or rewriting error.
    #[error("XML error: {0}")]
    Xml(String),

    /// Filesystem operation on an overlay or memory image failed.
    #[error("Snapshot file operation failed on {path}: {source}")]
    SnapshotFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Internal error (poisoned lock, broken invariant).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VirtLabError {
    /// Whether the retry wrapper should re-attempt after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, VirtLabError::Transient(_))
    }
}

/// Result type alias for environment operations.
pub type Result<T> = std::result::Result<T, VirtLabError>;
