//! Control-plane driver facade.
//!
//! The one boundary the core depends on: a narrow, synchronous-looking
//! procedure-call interface to whatever manages the actual machines
//! (libvirt daemon, baremetal power management). Backends signal transient
//! unavailability with [`VirtLabError::Transient`] so callers can wrap any
//! method in the retry combinator.
//!
//! [`VirtLabError::Transient`]: crate::error::VirtLabError::Transient

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::PowerState;

pub mod mock;
#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use mock::MockDriver;
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDriver;

/// Also delete all descendant snapshots.
pub const SNAPSHOT_DELETE_CHILDREN: u32 = 1 << 0;
/// Delete snapshot metadata only; overlay files are cleaned up by the caller.
pub const SNAPSHOT_DELETE_METADATA_ONLY: u32 = 1 << 1;

/// What to define: the slice of a node record the control plane needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub vcpu: u32,
    pub memory_mib: u64,
    /// Disks in attach order
    pub disks: Vec<DiskSpec>,
    /// Interfaces in attach order
    pub nics: Vec<NicSpec>,
}

/// One disk device of a node definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Target device name inside the guest ("vda")
    pub target: String,
    /// Image file path
    pub source_file: String,
    /// "qcow2" or "raw"
    pub format: String,
}

/// One network interface of a node definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub mac_address: String,
    /// Network/bridge name on the host side
    pub network: String,
    pub model: String,
}

/// Snapshot creation parameters handed to the backend.
#[derive(Debug, Clone)]
pub struct SnapshotCreateRequest {
    pub name: String,
    /// Descriptor markup; for external snapshots it carries the overlay paths
    pub descriptor_xml: String,
    /// Capture disks only, no memory state
    pub disk_only: bool,
    /// Deltas go to sibling overlay files instead of inside the qcow2
    pub external: bool,
    /// Reuse a pre-existing overlay file at the requested path instead of
    /// failing (makes interrupted creates re-runnable)
    pub reuse_existing: bool,
}

/// A snapshot as reported by the control plane.
#[derive(Debug, Clone)]
pub struct SnapshotRef {
    pub name: String,
    pub parent: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Direct children in the snapshot tree
    pub num_children: usize,
    /// Full descriptor markup for structural inspection
    pub xml: String,
}

/// Narrow control-plane interface the core calls through.
///
/// Every method may fail transiently (retryable) or permanently (surfaced
/// immediately); see the error taxonomy.
#[async_trait]
pub trait Driver: Send + Sync {
    // =========================================================================
    // Node lifecycle
    // =========================================================================

    /// Create the control-plane object for a node. Returns the opaque handle.
    async fn define_node(&self, spec: &NodeSpec) -> Result<String>;

    /// Power a defined node on.
    async fn start_node(&self, handle: &str) -> Result<()>;

    /// Power a node off (hard).
    async fn stop_node(&self, handle: &str) -> Result<()>;

    /// Remove the control-plane object. The node must be powered off.
    async fn destroy_node(&self, handle: &str) -> Result<()>;

    /// Power-cycle a node.
    async fn reset_node(&self, handle: &str) -> Result<()>;

    async fn node_power_state(&self, handle: &str) -> Result<PowerState>;

    // =========================================================================
    // Domain markup
    // =========================================================================

    /// Current domain definition markup.
    async fn node_xml(&self, handle: &str) -> Result<String>;

    /// Replace the domain definition. Used by external snapshot revert to
    /// point disks back at recorded overlay files.
    async fn redefine_node(&self, handle: &str, domain_xml: &str) -> Result<()>;

    /// Restore a domain from a saved memory image, overriding its definition
    /// with `domain_xml`, and leave it paused.
    async fn restore_node(&self, handle: &str, memory_file: &str, domain_xml: &str) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn create_snapshot(
        &self,
        handle: &str,
        request: &SnapshotCreateRequest,
    ) -> Result<SnapshotRef>;

    async fn list_snapshots(&self, handle: &str) -> Result<Vec<SnapshotRef>>;

    /// Look up one snapshot by name.
    async fn snapshot(&self, handle: &str, name: &str) -> Result<Option<SnapshotRef>> {
        Ok(self
            .list_snapshots(handle)
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    async fn current_snapshot(&self, handle: &str) -> Result<Option<SnapshotRef>>;

    async fn set_current_snapshot(&self, handle: &str, name: &str) -> Result<()>;

    /// Delete snapshot metadata; `flags` is a bitmask of
    /// [`SNAPSHOT_DELETE_CHILDREN`] and [`SNAPSHOT_DELETE_METADATA_ONLY`].
    async fn delete_snapshot(&self, handle: &str, name: &str, flags: u32) -> Result<()>;

    /// Revert to a snapshot the control plane can roll back by itself
    /// (internal chains).
    async fn revert_to_snapshot(&self, handle: &str, name: &str, flags: u32) -> Result<()>;
}
