//! # virtlab
//!
//! Building blocks for provisioning disposable virtual test environments:
//! subnet and address allocation, node/interface record keeping, and a
//! snapshot lifecycle that handles both internal (qcow2-embedded) and
//! external (overlay file) chains.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   NodeManager / SnapshotManager / Binder     │
//! │        (lifecycle + allocation logic)        │
//! └──────────┬─────────────────────┬─────────────┘
//!            │                     │
//!            ▼                     ▼
//! ┌───────────────────┐   ┌───────────────────┐
//! │       Store       │   │   Driver trait    │
//! │ (in-memory state) │   │ (control plane)   │
//! └───────────────────┘   └─────────┬─────────┘
//!                     ┌─────────────┴────────────┐
//!                     ▼                          ▼
//!           ┌───────────────────┐     ┌───────────────────┐
//!           │    MockDriver     │     │   LibvirtDriver   │
//!           │   (in-process)    │     │ (virt + virsh)    │
//!           └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtlab::{AddressPool, Binder, MockDriver, NodeManager, RetryPolicy, Store};
//!
//! #[tokio::main]
//! async fn main() -> virtlab::Result<()> {
//!     let mut pool = AddressPool::new("fuelweb", vec!["10.1.0.0/22".parse()?], 24)?;
//!     pool.exclude("10.1.1.0/24".parse()?);
//!
//!     let store = Arc::new(Store::new());
//!     let manager = NodeManager::new(Arc::new(MockDriver::new()), store, RetryPolicy::default());
//!     // define nodes, bind interfaces, snapshot, revert...
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod binder;
pub mod config;
pub mod driver;
pub mod error;
pub mod node;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod xml;

pub use allocator::AddressPool;
pub use binder::Binder;
pub use config::Config;
pub use driver::{Driver, MockDriver, NodeSpec, SnapshotCreateRequest, SnapshotRef};
#[cfg(feature = "libvirt")]
pub use driver::LibvirtDriver;
pub use error::{Result, VirtLabError};
pub use node::NodeManager;
pub use retry::{retry, RetryPolicy};
pub use snapshot::SnapshotManager;
pub use store::Store;
pub use types::{
    Address, Interface, Network, Node, NodeState, PowerState, StaticLease, Volume, VolumeFormat,
};
pub use xml::{ChainType, SnapshotDescriptor};
