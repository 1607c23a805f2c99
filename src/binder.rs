//! Interface binding: IP assignment, MAC generation, DHCP static leases.

use tracing::{debug, info};
use uuid::Uuid;

use crate::allocator::first_free_address;
use crate::error::{Result, VirtLabError};
use crate::store::Store;
use crate::types::{Address, Interface, Network, StaticLease};

/// How many random MACs to try before giving up on a collision streak.
const MAC_GENERATION_ATTEMPTS: u32 = 1024;

/// Assigns addresses and MACs to interfaces against the record store.
///
/// Every allocation is written through to the store before returning, so
/// interleaved binds across a template never double-allocate.
pub struct Binder<'a> {
    store: &'a Store,
}

impl<'a> Binder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Give `interface` exactly one address on `network`.
    ///
    /// Idempotent: an interface that already holds an address on the network
    /// gets the same record back. Networks without a DHCP server or reserved
    /// IPs hand out nothing (guests self-configure there).
    pub fn bind_interface(&self, interface: &Interface, network: &Network) -> Result<Option<Address>> {
        if !network.has_dhcp_server && !network.has_reserved_ips {
            debug!(network = %network.name, "Network hands out no addresses");
            return Ok(None);
        }

        if let Some(existing) = self.store.address_of(interface.id, network.id)? {
            debug!(
                interface = %interface.label,
                ip = %existing.ip,
                "Interface already bound, reusing address"
            );
            return Ok(Some(existing));
        }

        let consumed = self.store.consumed_ips(network.id)?;
        let ip = first_free_address(
            network.ip_network,
            network.reserved_lo(),
            network.reserved_hi(),
            &consumed,
        )?;

        let address = self.store.create_address(Address {
            id: Uuid::new_v4(),
            interface_id: interface.id,
            network_id: network.id,
            ip,
        })?;
        info!(
            interface = %interface.label,
            network = %network.name,
            ip = %ip,
            "Bound interface"
        );
        Ok(Some(address))
    }

    /// Generate and persist a unique MAC for `interface`.
    ///
    /// Returns the existing MAC unchanged if one was already assigned.
    pub fn assign_mac(&self, interface: &Interface) -> Result<String> {
        if let Some(ref mac) = self.store.interface(interface.id)?.mac_address {
            return Ok(mac.clone());
        }

        let taken = self.store.assigned_macs()?;
        for _ in 0..MAC_GENERATION_ATTEMPTS {
            let candidate = generate_mac_address();
            if !taken.contains(&candidate) {
                self.store.set_interface_mac(interface.id, &candidate)?;
                debug!(interface = %interface.label, mac = %candidate, "Assigned MAC");
                return Ok(candidate);
            }
        }
        Err(VirtLabError::MacExhausted {
            attempts: MAC_GENERATION_ATTEMPTS,
        })
    }

    /// DHCP static-lease map for every fixed-address interface on `network`.
    ///
    /// Interfaces without a MAC or without an address on the network carry no
    /// lease.
    pub fn static_leases(&self, network: &Network) -> Result<Vec<StaticLease>> {
        let mut leases = Vec::new();
        for interface in self.store.interfaces_on_network(network.id)? {
            let Some(mac) = interface.mac_address.clone() else {
                continue;
            };
            let Some(address) = self.store.address_of(interface.id, network.id)? else {
                continue;
            };
            let node = self.store.node(interface.node_id)?;
            leases.push(StaticLease {
                mac_address: mac,
                ip: address.ip,
                hostname: node.name,
            });
        }
        leases.sort_by(|a, b| a.ip.cmp(&b.ip));
        Ok(leases)
    }
}

/// Random MAC in the QEMU/KVM locally-administered range.
fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0] & 0x3f, // Clear multicast bit, set local bit
        bytes[1],
        bytes[2]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;
    use std::collections::BTreeSet;

    fn env() -> (Store, Network, Node) {
        let store = Store::new();
        let network = store
            .create_network(Network::new("admin", "10.5.0.0/24".parse().unwrap()))
            .unwrap();
        let node = store.create_node(Node::new("slave-01")).unwrap();
        (store, network, node)
    }

    #[test]
    fn bound_addresses_are_unique_and_in_usable_range() {
        let (store, network, node) = env();
        let binder = Binder::new(&store);

        let mut seen = BTreeSet::new();
        for i in 0..20 {
            let iface = store
                .create_interface(Interface::new(node.id, network.id, format!("eth{}", i)))
                .unwrap();
            let address = binder.bind_interface(&iface, &network).unwrap().unwrap();
            assert!(seen.insert(address.ip), "duplicate ip {}", address.ip);
            assert!(network.ip_network.contains(&address.ip));

            let last = address.ip.octets()[3];
            assert!(last >= 2, "gateway or network address handed out: {}", address.ip);
            assert!(last <= 253, "reserved tail handed out: {}", address.ip);
        }
    }

    #[test]
    fn rebind_returns_the_same_record() {
        let (store, network, node) = env();
        let binder = Binder::new(&store);
        let iface = store
            .create_interface(Interface::new(node.id, network.id, "eth0"))
            .unwrap();

        let first = binder.bind_interface(&iface, &network).unwrap().unwrap();
        let second = binder.bind_interface(&iface, &network).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.ip, second.ip);
        assert_eq!(store.addresses_on_network(network.id).unwrap().len(), 1);
    }

    #[test]
    fn network_without_services_binds_nothing() {
        let (store, mut network, node) = env();
        network.has_dhcp_server = false;
        network.has_reserved_ips = false;
        let binder = Binder::new(&store);
        let iface = store
            .create_interface(Interface::new(node.id, network.id, "eth0"))
            .unwrap();

        assert!(binder.bind_interface(&iface, &network).unwrap().is_none());
        assert!(store.addresses_on_network(network.id).unwrap().is_empty());
    }

    #[test]
    fn macs_are_unique_and_locally_administered() {
        let (store, network, node) = env();
        let binder = Binder::new(&store);

        let mut macs = BTreeSet::new();
        for i in 0..50 {
            let iface = store
                .create_interface(Interface::new(node.id, network.id, format!("eth{}", i)))
                .unwrap();
            let mac = binder.assign_mac(&iface).unwrap();
            assert!(mac.starts_with("52:54:00:"));
            assert!(macs.insert(mac), "duplicate MAC generated");
        }
    }

    #[test]
    fn assign_mac_is_idempotent() {
        let (store, network, node) = env();
        let binder = Binder::new(&store);
        let iface = store
            .create_interface(Interface::new(node.id, network.id, "eth0"))
            .unwrap();

        let first = binder.assign_mac(&iface).unwrap();
        let second = binder.assign_mac(&iface).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn static_leases_cover_fixed_interfaces_in_ip_order() {
        let (store, network, node) = env();
        let binder = Binder::new(&store);

        for i in 0..3 {
            let iface = store
                .create_interface(Interface::new(node.id, network.id, format!("eth{}", i)))
                .unwrap();
            binder.assign_mac(&iface).unwrap();
            binder.bind_interface(&iface, &network).unwrap();
        }
        // One interface without a MAC: no lease for it.
        let bare = store
            .create_interface(Interface::new(node.id, network.id, "eth9"))
            .unwrap();
        binder.bind_interface(&bare, &network).unwrap();

        let leases = binder.static_leases(&network).unwrap();
        assert_eq!(leases.len(), 3);
        assert!(leases.windows(2).all(|w| w[0].ip < w[1].ip));
        assert!(leases.iter().all(|l| l.hostname == "slave-01"));
    }
}
