//! Node lifecycle against the control plane.
//!
//! A node record moves created -> defined -> started/stopped -> destroyed ->
//! erased. Every driver call is wrapped in the retry policy; the store is
//! only updated after the control plane acknowledged the transition.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::driver::{DiskSpec, Driver, NicSpec, NodeSpec};
use crate::error::{Result, VirtLabError};
use crate::retry::{retry, RetryPolicy};
use crate::store::Store;
use crate::types::{Node, NodeState, PowerState};

pub struct NodeManager {
    driver: Arc<dyn Driver>,
    store: Arc<Store>,
    policy: RetryPolicy,
}

impl NodeManager {
    pub fn new(driver: Arc<dyn Driver>, store: Arc<Store>, policy: RetryPolicy) -> Self {
        Self {
            driver,
            store,
            policy,
        }
    }

    fn handle_of(node: &Node) -> Result<String> {
        node.handle.clone().ok_or_else(|| {
            VirtLabError::InvalidState(format!("node '{}' is not defined", node.name))
        })
    }

    /// Build the definition the control plane needs from the node's records.
    fn spec_for(&self, node: &Node) -> Result<NodeSpec> {
        let mut volumes = self.store.volumes_on_node(node.id)?;
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        let disks = volumes
            .iter()
            .enumerate()
            .map(|(i, v)| DiskSpec {
                // vda, vdb, ... in volume name order
                target: disk_target(i),
                source_file: v.path.clone(),
                format: v.format.as_str().to_string(),
            })
            .collect();

        let mut interfaces = self.store.interfaces_on_node(node.id)?;
        interfaces.sort_by(|a, b| a.label.cmp(&b.label));
        let mut nics = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let mac = interface.mac_address.clone().ok_or_else(|| {
                VirtLabError::InvalidState(format!(
                    "interface '{}' of node '{}' has no MAC assigned",
                    interface.label, node.name
                ))
            })?;
            let network = self.store.network(interface.network_id)?;
            nics.push(NicSpec {
                mac_address: mac,
                network: network.name,
                model: interface.model,
            });
        }

        Ok(NodeSpec {
            name: node.name.clone(),
            vcpu: node.vcpu,
            memory_mib: node.memory_mib,
            disks,
            nics,
        })
    }

    /// Create the control-plane object for the node and record its handle.
    ///
    /// Defining an already-defined node returns the record unchanged.
    #[instrument(skip(self))]
    pub async fn define(&self, node_id: Uuid) -> Result<Node> {
        let node = self.store.node(node_id)?;
        if node.handle.is_some() {
            return Ok(node);
        }
        let spec = self.spec_for(&node)?;
        let handle = retry(self.policy, || self.driver.define_node(&spec)).await?;
        let node = self.store.update_node(node_id, |n| {
            n.handle = Some(handle.clone());
            n.state = NodeState::Defined;
        })?;
        info!(node = %node.name, "Node defined");
        Ok(node)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, node_id: Uuid) -> Result<Node> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        retry(self.policy, || self.driver.start_node(&handle)).await?;
        self.store
            .update_node(node_id, |n| n.state = NodeState::Started)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, node_id: Uuid) -> Result<Node> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        retry(self.policy, || self.driver.stop_node(&handle)).await?;
        self.store
            .update_node(node_id, |n| n.state = NodeState::Stopped)
    }

    #[instrument(skip(self))]
    pub async fn reset(&self, node_id: Uuid) -> Result<()> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        retry(self.policy, || self.driver.reset_node(&handle)).await
    }

    pub async fn power_state(&self, node_id: Uuid) -> Result<PowerState> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        retry(self.policy, || self.driver.node_power_state(&handle)).await
    }

    /// Remove the control-plane object and clear the handle. A running node
    /// is powered off first.
    #[instrument(skip(self))]
    pub async fn destroy(&self, node_id: Uuid) -> Result<Node> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        let power = retry(self.policy, || self.driver.node_power_state(&handle)).await?;
        if power == PowerState::On {
            retry(self.policy, || self.driver.stop_node(&handle)).await?;
        }
        retry(self.policy, || self.driver.destroy_node(&handle)).await?;
        let node = self.store.update_node(node_id, |n| {
            n.handle = None;
            n.state = NodeState::Destroyed;
        })?;
        info!(node = %node.name, "Node destroyed");
        Ok(node)
    }

    /// Remove the persisted record (and its interfaces, addresses, volumes).
    /// The control-plane object must already be gone.
    #[instrument(skip(self))]
    pub async fn erase(&self, node_id: Uuid) -> Result<()> {
        let node = self.store.node(node_id)?;
        if node.handle.is_some() {
            return Err(VirtLabError::InvalidState(format!(
                "node '{}' is still defined; destroy it before erasing",
                node.name
            )));
        }
        self.store.erase_node(node_id)?;
        info!(node = %node.name, "Node erased");
        Ok(())
    }
}

/// Guest device name for the i-th disk: vda..vdz, then vdaa, vdab, ...
fn disk_target(index: usize) -> String {
    let mut index = index;
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    let suffix: String = letters.into_iter().rev().collect();
    format!("vd{}", suffix)
}
