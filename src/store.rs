//! In-memory record store.
//!
//! The persistence boundary of the core: insert, query by field equality,
//! update, delete. Backends with real durability can replace this as long as
//! writes are visible to the next read within the same environment (no
//! batching), which is what keeps interleaved binds from double-allocating.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::{Result, VirtLabError};
use crate::types::{check_backing_chain, Address, Interface, Network, Node, Volume};

/// Record store holding every entity of one environment.
pub struct Store {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    networks: HashMap<Uuid, Network>,
    interfaces: HashMap<Uuid, Interface>,
    addresses: HashMap<Uuid, Address>,
    nodes: HashMap<Uuid, Node>,
    volumes: HashMap<Uuid, Volume>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|_| VirtLabError::Internal("Store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|_| VirtLabError::Internal("Store lock poisoned".to_string()))
    }

    // =========================================================================
    // Networks
    // =========================================================================

    pub fn create_network(&self, network: Network) -> Result<Network> {
        let mut inner = self.write()?;
        inner.networks.insert(network.id, network.clone());
        Ok(network)
    }

    pub fn network(&self, id: Uuid) -> Result<Network> {
        self.read()?
            .networks
            .get(&id)
            .cloned()
            .ok_or_else(|| VirtLabError::RecordNotFound(format!("network {}", id)))
    }

    pub fn networks(&self) -> Result<Vec<Network>> {
        Ok(self.read()?.networks.values().cloned().collect())
    }

    // =========================================================================
    // Interfaces
    // =========================================================================

    pub fn create_interface(&self, interface: Interface) -> Result<Interface> {
        let mut inner = self.write()?;
        inner.interfaces.insert(interface.id, interface.clone());
        Ok(interface)
    }

    pub fn interface(&self, id: Uuid) -> Result<Interface> {
        self.read()?
            .interfaces
            .get(&id)
            .cloned()
            .ok_or_else(|| VirtLabError::RecordNotFound(format!("interface {}", id)))
    }

    pub fn interfaces(&self) -> Result<Vec<Interface>> {
        Ok(self.read()?.interfaces.values().cloned().collect())
    }

    pub fn interfaces_on_node(&self, node_id: Uuid) -> Result<Vec<Interface>> {
        Ok(self
            .read()?
            .interfaces
            .values()
            .filter(|i| i.node_id == node_id)
            .cloned()
            .collect())
    }

    pub fn interfaces_on_network(&self, network_id: Uuid) -> Result<Vec<Interface>> {
        Ok(self
            .read()?
            .interfaces
            .values()
            .filter(|i| i.network_id == network_id)
            .cloned()
            .collect())
    }

    pub fn set_interface_mac(&self, id: Uuid, mac: &str) -> Result<()> {
        let mut inner = self.write()?;
        let interface = inner
            .interfaces
            .get_mut(&id)
            .ok_or_else(|| VirtLabError::RecordNotFound(format!("interface {}", id)))?;
        interface.mac_address = Some(mac.to_string());
        Ok(())
    }

    /// All MACs currently assigned in the environment.
    pub fn assigned_macs(&self) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .interfaces
            .values()
            .filter_map(|i| i.mac_address.clone())
            .collect())
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    pub fn create_address(&self, address: Address) -> Result<Address> {
        let mut inner = self.write()?;
        inner.addresses.insert(address.id, address.clone());
        Ok(address)
    }

    pub fn addresses_on_network(&self, network_id: Uuid) -> Result<Vec<Address>> {
        Ok(self
            .read()?
            .addresses
            .values()
            .filter(|a| a.network_id == network_id)
            .cloned()
            .collect())
    }

    pub fn addresses_on_interface(&self, interface_id: Uuid) -> Result<Vec<Address>> {
        Ok(self
            .read()?
            .addresses
            .values()
            .filter(|a| a.interface_id == interface_id)
            .cloned()
            .collect())
    }

    /// The interface's address on one specific network, if any.
    pub fn address_of(&self, interface_id: Uuid, network_id: Uuid) -> Result<Option<Address>> {
        Ok(self
            .read()?
            .addresses
            .values()
            .find(|a| a.interface_id == interface_id && a.network_id == network_id)
            .cloned())
    }

    /// IPs already consumed inside a network.
    pub fn consumed_ips(&self, network_id: Uuid) -> Result<std::collections::BTreeSet<Ipv4Addr>> {
        Ok(self
            .read()?
            .addresses
            .values()
            .filter(|a| a.network_id == network_id)
            .map(|a| a.ip)
            .collect())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn create_node(&self, node: Node) -> Result<Node> {
        let mut inner = self.write()?;
        inner.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    pub fn node(&self, id: Uuid) -> Result<Node> {
        self.read()?
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| VirtLabError::NodeNotFound(id.to_string()))
    }

    pub fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read()?.nodes.values().cloned().collect())
    }

    pub fn update_node<F>(&self, id: Uuid, mutate: F) -> Result<Node>
    where
        F: FnOnce(&mut Node),
    {
        let mut inner = self.write()?;
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| VirtLabError::NodeNotFound(id.to_string()))?;
        mutate(node);
        Ok(node.clone())
    }

    /// Remove a node record together with its interfaces and addresses.
    pub fn erase_node(&self, id: Uuid) -> Result<()> {
        let mut inner = self.write()?;
        if inner.nodes.remove(&id).is_none() {
            return Err(VirtLabError::NodeNotFound(id.to_string()));
        }
        let interface_ids: Vec<Uuid> = inner
            .interfaces
            .values()
            .filter(|i| i.node_id == id)
            .map(|i| i.id)
            .collect();
        inner.interfaces.retain(|_, i| i.node_id != id);
        inner
            .addresses
            .retain(|_, a| !interface_ids.contains(&a.interface_id));
        inner.volumes.retain(|_, v| v.node_id != Some(id));
        Ok(())
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Register a volume, validating its backing chain stays acyclic.
    pub fn create_volume(&self, volume: Volume) -> Result<Volume> {
        let mut inner = self.write()?;
        inner.volumes.insert(volume.id, volume.clone());
        if let Err(e) = check_backing_chain(&inner.volumes, volume.id) {
            inner.volumes.remove(&volume.id);
            return Err(e);
        }
        Ok(volume)
    }

    pub fn volume(&self, id: Uuid) -> Result<Volume> {
        self.read()?
            .volumes
            .get(&id)
            .cloned()
            .ok_or_else(|| VirtLabError::RecordNotFound(format!("volume {}", id)))
    }

    pub fn volumes_on_node(&self, node_id: Uuid) -> Result<Vec<Volume>> {
        Ok(self
            .read()?
            .volumes
            .values()
            .filter(|v| v.node_id == Some(node_id))
            .cloned()
            .collect())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Network;

    #[test]
    fn erase_node_cascades_to_interfaces_and_addresses() {
        let store = Store::new();
        let network = store
            .create_network(Network::new("admin", "10.9.0.0/24".parse().unwrap()))
            .unwrap();
        let node = store.create_node(Node::new("slave-01")).unwrap();
        let iface = store
            .create_interface(Interface::new(node.id, network.id, "eth0"))
            .unwrap();
        store
            .create_address(Address {
                id: Uuid::new_v4(),
                interface_id: iface.id,
                network_id: network.id,
                ip: "10.9.0.2".parse().unwrap(),
            })
            .unwrap();

        store.erase_node(node.id).unwrap();
        assert!(store.node(node.id).is_err());
        assert!(store.interfaces_on_node(node.id).unwrap().is_empty());
        assert!(store.addresses_on_network(network.id).unwrap().is_empty());
    }

    #[test]
    fn volume_with_cyclic_backing_chain_is_rolled_back() {
        let store = Store::new();
        let base = store
            .create_volume(Volume::new("base", "/img/base.qcow2", 1 << 30))
            .unwrap();
        let mut overlay = Volume::new("overlay", "/img/overlay.qcow2", 1 << 30);
        overlay.backing_store = Some(base.id);
        let overlay = store.create_volume(overlay).unwrap();

        // A self-referencing volume never lands in the store.
        let mut bad = Volume::new("bad", "/img/bad.qcow2", 1 << 30);
        bad.backing_store = Some(bad.id);
        let bad_id = bad.id;
        assert!(store.create_volume(bad).is_err());
        assert!(store.volume(bad_id).is_err());
        assert!(store.volume(overlay.id).is_ok());
    }
}
