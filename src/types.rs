//! Entity records for networks, interfaces, nodes, and volumes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VirtLabError};

// =============================================================================
// NETWORK
// =============================================================================

/// A network carved out of an address pool and bound to an environment group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Record identity
    pub id: Uuid,
    /// Human-readable name (unique within the environment)
    pub name: String,
    /// Subnet drawn from an address pool
    pub ip_network: Ipv4Net,
    /// Network runs a DHCP server (interfaces get fixed leases)
    pub has_dhcp_server: bool,
    /// Network serves PXE boot
    pub has_pxe_server: bool,
    /// Gateway and broadcast-adjacent addresses are held back
    pub has_reserved_ips: bool,
}

impl Network {
    pub fn new(name: impl Into<String>, ip_network: Ipv4Net) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ip_network,
            has_dhcp_server: true,
            has_pxe_server: false,
            has_reserved_ips: true,
        }
    }

    /// Default gateway for this network: the first usable host address.
    pub fn default_gw(&self) -> Option<Ipv4Addr> {
        self.ip_network.hosts().next()
    }

    /// Host addresses held back from allocation at the bottom of the range
    /// (the gateway).
    pub fn reserved_lo(&self) -> u32 {
        if self.has_reserved_ips {
            1
        } else {
            0
        }
    }

    /// Host addresses held back at the top of the range (broadcast-adjacent).
    pub fn reserved_hi(&self) -> u32 {
        if self.has_reserved_ips {
            2
        } else {
            0
        }
    }
}

// =============================================================================
// INTERFACE / ADDRESS
// =============================================================================

/// A virtual NIC belonging to exactly one node, attached to one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: Uuid,
    /// Owning node
    pub node_id: Uuid,
    /// L2 device / network this interface is attached to
    pub network_id: Uuid,
    /// Device label inside the guest (e.g. "eth0")
    pub label: String,
    /// Globally unique MAC, assigned by the binder
    pub mac_address: Option<String>,
    /// NIC model passed through to the domain definition
    pub model: String,
}

impl Interface {
    pub fn new(node_id: Uuid, network_id: Uuid, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            network_id,
            label: label.into(),
            mac_address: None,
            model: "virtio".to_string(),
        }
    }
}

/// An IP address owned by exactly one interface on one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub id: Uuid,
    pub interface_id: Uuid,
    pub network_id: Uuid,
    pub ip: Ipv4Addr,
}

/// One entry of a network's DHCP static-lease map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLease {
    pub mac_address: String,
    pub ip: Ipv4Addr,
    /// Guest host name the lease is registered under
    pub hostname: String,
}

// =============================================================================
// NODE
// =============================================================================

/// Node lifecycle relative to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Record exists, no hypervisor object yet
    Created,
    /// Hypervisor object exists, handle set
    Defined,
    Started,
    Stopped,
    Suspended,
    /// Hypervisor object removed, handle cleared
    Destroyed,
}

/// Observed power state of a defined node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

/// A provisionable compute unit (VM or baremetal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    /// vCPU count
    pub vcpu: u32,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Opaque control-plane handle, set once defined
    pub handle: Option<String>,
    pub state: NodeState,
    /// Role/metadata bag carried through from the template
    pub params: serde_json::Value,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            vcpu: 2,
            memory_mib: 2048,
            handle: None,
            state: NodeState::Created,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_resources(mut self, vcpu: u32, memory_mib: u64) -> Self {
        self.vcpu = vcpu;
        self.memory_mib = memory_mib;
        self
    }
}

// =============================================================================
// VOLUME
// =============================================================================

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Qcow2,
    Raw,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
        }
    }
}

/// A disk image, optionally chained onto a copy-on-write parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: Uuid,
    pub name: String,
    /// Owning node, if attached
    pub node_id: Option<Uuid>,
    /// Image file path
    pub path: String,
    pub capacity_bytes: u64,
    pub format: VolumeFormat,
    /// Copy-on-write parent volume
    pub backing_store: Option<Uuid>,
}

impl Volume {
    pub fn new(name: impl Into<String>, path: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            node_id: None,
            path: path.into(),
            capacity_bytes,
            format: VolumeFormat::Qcow2,
            backing_store: None,
        }
    }
}

/// Walk a volume's backing chain and fail on a cycle.
///
/// The map must contain every volume referenced by a `backing_store` link.
pub fn check_backing_chain(volumes: &HashMap<Uuid, Volume>, start: Uuid) -> Result<Vec<Uuid>> {
    let mut chain = Vec::new();
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        if chain.contains(&id) {
            return Err(VirtLabError::InvalidState(format!(
                "backing store chain of volume {} contains a cycle",
                start
            )));
        }
        chain.push(id);
        let volume = volumes
            .get(&id)
            .ok_or_else(|| VirtLabError::RecordNotFound(format!("volume {}", id)))?;
        cursor = volume.backing_store;
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_chain_is_walked_base_last() {
        let base = Volume::new("base", "/img/base.qcow2", 1 << 30);
        let mut overlay = Volume::new("overlay", "/img/overlay.qcow2", 1 << 30);
        overlay.backing_store = Some(base.id);

        let mut volumes = HashMap::new();
        let overlay_id = overlay.id;
        let base_id = base.id;
        volumes.insert(base.id, base);
        volumes.insert(overlay.id, overlay);

        let chain = check_backing_chain(&volumes, overlay_id).unwrap();
        assert_eq!(chain, vec![overlay_id, base_id]);
    }

    #[test]
    fn backing_chain_cycle_is_rejected() {
        let mut a = Volume::new("a", "/img/a.qcow2", 1 << 30);
        let mut b = Volume::new("b", "/img/b.qcow2", 1 << 30);
        a.backing_store = Some(b.id);
        b.backing_store = Some(a.id);

        let mut volumes = HashMap::new();
        let a_id = a.id;
        volumes.insert(a.id, a);
        volumes.insert(b.id, b);

        assert!(check_backing_chain(&volumes, a_id).is_err());
    }

    #[test]
    fn reserved_ranges_follow_network_flags() {
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let mut network = Network::new("admin", net);
        assert_eq!(network.reserved_lo(), 1);
        assert_eq!(network.reserved_hi(), 2);

        network.has_reserved_ips = false;
        assert_eq!(network.reserved_lo(), 0);
        assert_eq!(network.reserved_hi(), 0);
        assert_eq!(network.default_gw(), Some("10.0.0.1".parse().unwrap()));
    }
}
