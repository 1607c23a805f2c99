//! In-memory mock driver for testing and development.
//!
//! Simulates the control plane without a hypervisor: domains live in a map,
//! domain markup is real XML (so snapshot-chain surgery is exercised for
//! real), and call counters plus transient-failure injection let tests pin
//! down exactly which calls an operation issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Driver, NodeSpec, SnapshotCreateRequest, SnapshotRef, SNAPSHOT_DELETE_CHILDREN,
};
use crate::error::{Result, VirtLabError};
use crate::types::PowerState;
use crate::xml::{parse_snapshot_descriptor, rewrite_disk_sources};

/// Mock control-plane backend.
pub struct MockDriver {
    domains: RwLock<HashMap<String, MockDomain>>,
    /// Next N calls fail with a transient error
    fail_transient: AtomicU32,
    snapshot_delete_calls: AtomicU32,
    revert_calls: AtomicU32,
    redefine_calls: AtomicU32,
    restore_calls: AtomicU32,
}

struct MockDomain {
    name: String,
    running: bool,
    xml: String,
    snapshots: Vec<MockSnapshot>,
    current: Option<String>,
}

#[derive(Clone)]
struct MockSnapshot {
    name: String,
    parent: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    xml: String,
}

impl MockDriver {
    pub fn new() -> Self {
        info!("Creating mock control-plane driver");
        Self {
            domains: RwLock::new(HashMap::new()),
            fail_transient: AtomicU32::new(0),
            snapshot_delete_calls: AtomicU32::new(0),
            revert_calls: AtomicU32::new(0),
            redefine_calls: AtomicU32::new(0),
            restore_calls: AtomicU32::new(0),
        }
    }

    /// Make the next `count` driver calls fail transiently.
    pub fn inject_transient_failures(&self, count: u32) {
        self.fail_transient.store(count, Ordering::SeqCst);
    }

    pub fn snapshot_delete_calls(&self) -> u32 {
        self.snapshot_delete_calls.load(Ordering::SeqCst)
    }

    pub fn revert_calls(&self) -> u32 {
        self.revert_calls.load(Ordering::SeqCst)
    }

    pub fn redefine_calls(&self) -> u32 {
        self.redefine_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> u32 {
        self.restore_calls.load(Ordering::SeqCst)
    }

    /// Current domain markup without going through the trait (test helper).
    pub fn domain_xml_for(&self, handle: &str) -> Option<String> {
        self.domains
            .read()
            .ok()
            .and_then(|d| d.get(handle).map(|dom| dom.xml.clone()))
    }

    fn gate(&self) -> Result<()> {
        // Atomic decrement-if-positive: concurrent callers each consume at
        // most one injected failure.
        let consumed = self
            .fail_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if consumed {
            return Err(VirtLabError::Transient(
                "mock control plane unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, MockDomain>>> {
        self.domains
            .write()
            .map_err(|_| VirtLabError::Internal("Lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, MockDomain>>> {
        self.domains
            .read()
            .map_err(|_| VirtLabError::Internal("Lock poisoned".to_string()))
    }

    fn render_domain_xml(spec: &NodeSpec) -> String {
        let mut xml = String::new();
        xml.push_str("<domain type='kvm'>\n");
        xml.push_str(&format!("  <name>{}</name>\n", spec.name));
        xml.push_str(&format!("  <vcpu>{}</vcpu>\n", spec.vcpu));
        xml.push_str(&format!("  <memory unit='MiB'>{}</memory>\n", spec.memory_mib));
        xml.push_str("  <devices>\n");
        for disk in &spec.disks {
            xml.push_str(&format!(
                "    <disk type='file' device='disk'>\n      <driver name='qemu' type='{}'/>\n      <source file='{}'/>\n      <target dev='{}' bus='virtio'/>\n    </disk>\n",
                disk.format, disk.source_file, disk.target
            ));
        }
        for nic in &spec.nics {
            xml.push_str(&format!(
                "    <interface type='network'>\n      <mac address='{}'/>\n      <source network='{}'/>\n      <model type='{}'/>\n    </interface>\n",
                nic.mac_address, nic.network, nic.model
            ));
        }
        xml.push_str("  </devices>\n</domain>\n");
        xml
    }

    /// Compose the stored descriptor the way the hypervisor would: the
    /// requested markup enriched with state and parent.
    fn render_snapshot_xml(
        request: &SnapshotCreateRequest,
        state: &str,
        parent: Option<&str>,
        domain_xml: &str,
    ) -> Result<String> {
        let requested = parse_snapshot_descriptor(&request.descriptor_xml)?;
        let mut xml = String::new();
        xml.push_str("<domainsnapshot>\n");
        xml.push_str(&format!("  <name>{}</name>\n", requested.name));
        xml.push_str(&format!("  <state>{}</state>\n", state));
        if let Some(parent) = parent {
            xml.push_str(&format!("  <parent>\n    <name>{}</name>\n  </parent>\n", parent));
        }
        match (&requested.memory_mode, &requested.memory_file) {
            (crate::xml::CaptureMode::External, Some(file)) => {
                xml.push_str(&format!("  <memory snapshot='external' file='{}'/>\n", file));
            }
            (crate::xml::CaptureMode::Internal, _) => {
                xml.push_str("  <memory snapshot='internal'/>\n");
            }
            _ => {
                if request.external || request.disk_only {
                    xml.push_str("  <memory snapshot='no'/>\n");
                } else {
                    xml.push_str("  <memory snapshot='internal'/>\n");
                }
            }
        }
        xml.push_str("  <disks>\n");
        if request.external {
            for disk in &requested.disks {
                match &disk.source_file {
                    Some(file) => xml.push_str(&format!(
                        "    <disk name='{}' snapshot='external'>\n      <source file='{}'/>\n    </disk>\n",
                        disk.name, file
                    )),
                    None => xml.push_str(&format!(
                        "    <disk name='{}' snapshot='no'/>\n",
                        disk.name
                    )),
                }
            }
        } else {
            for disk in crate::xml::parse_disk_devices(domain_xml)? {
                xml.push_str(&format!(
                    "    <disk name='{}' snapshot='internal'/>\n",
                    disk.target
                ));
            }
        }
        xml.push_str("  </disks>\n");
        xml.push_str(&format!("  {}", domain_xml));
        xml.push_str("</domainsnapshot>\n");
        Ok(xml)
    }

    fn snapshot_ref(domain: &MockDomain, snap: &MockSnapshot) -> SnapshotRef {
        let num_children = domain
            .snapshots
            .iter()
            .filter(|s| s.parent.as_deref() == Some(snap.name.as_str()))
            .count();
        SnapshotRef {
            name: snap.name.clone(),
            parent: snap.parent.clone(),
            created_at: snap.created_at,
            num_children,
            xml: snap.xml.clone(),
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn define_node(&self, spec: &NodeSpec) -> Result<String> {
        self.gate()?;
        let handle = Uuid::new_v4().to_string();
        let xml = Self::render_domain_xml(spec);
        let mut domains = self.write()?;
        domains.insert(
            handle.clone(),
            MockDomain {
                name: spec.name.clone(),
                running: false,
                xml,
                snapshots: Vec::new(),
                current: None,
            },
        );
        info!(node = %spec.name, handle = %handle, "Mock node defined");
        Ok(handle)
    }

    async fn start_node(&self, handle: &str) -> Result<()> {
        self.gate()?;
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        if domain.running {
            return Err(VirtLabError::InvalidState(format!(
                "node '{}' is already running",
                domain.name
            )));
        }
        domain.running = true;
        debug!(node = %domain.name, "Mock node started");
        Ok(())
    }

    async fn stop_node(&self, handle: &str) -> Result<()> {
        self.gate()?;
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        domain.running = false;
        debug!(node = %domain.name, "Mock node stopped");
        Ok(())
    }

    async fn destroy_node(&self, handle: &str) -> Result<()> {
        self.gate()?;
        let mut domains = self.write()?;
        let domain = domains
            .get(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        if domain.running {
            return Err(VirtLabError::InvalidState(format!(
                "node '{}' must be stopped before destroy",
                domain.name
            )));
        }
        domains.remove(handle);
        Ok(())
    }

    async fn reset_node(&self, handle: &str) -> Result<()> {
        self.gate()?;
        let domains = self.read()?;
        let domain = domains
            .get(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        if !domain.running {
            return Err(VirtLabError::InvalidState(format!(
                "node '{}' is not running",
                domain.name
            )));
        }
        Ok(())
    }

    async fn node_power_state(&self, handle: &str) -> Result<PowerState> {
        self.gate()?;
        let domains = self.read()?;
        Ok(domains
            .get(handle)
            .map(|d| if d.running { PowerState::On } else { PowerState::Off })
            .unwrap_or(PowerState::Unknown))
    }

    async fn node_xml(&self, handle: &str) -> Result<String> {
        self.gate()?;
        let domains = self.read()?;
        domains
            .get(handle)
            .map(|d| d.xml.clone())
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))
    }

    async fn redefine_node(&self, handle: &str, domain_xml: &str) -> Result<()> {
        self.gate()?;
        self.redefine_calls.fetch_add(1, Ordering::SeqCst);
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        domain.xml = domain_xml.to_string();
        debug!(node = %domain.name, "Mock node redefined");
        Ok(())
    }

    async fn restore_node(&self, handle: &str, memory_file: &str, domain_xml: &str) -> Result<()> {
        self.gate()?;
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        domain.xml = domain_xml.to_string();
        domain.running = true;
        debug!(node = %domain.name, memory_file = %memory_file, "Mock node restored paused");
        Ok(())
    }

    async fn create_snapshot(
        &self,
        handle: &str,
        request: &SnapshotCreateRequest,
    ) -> Result<SnapshotRef> {
        self.gate()?;
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;

        let state = if !domain.running {
            "shutoff"
        } else if request.disk_only {
            "disk-snapshot"
        } else {
            "running"
        };
        let parent = domain.current.clone();
        let xml = Self::render_snapshot_xml(request, state, parent.as_deref(), &domain.xml)?;

        if request.external {
            // Writes now land in the overlay files named by the descriptor.
            let sources = parse_snapshot_descriptor(&xml)?.external_disk_sources();
            if !sources.is_empty() {
                domain.xml = rewrite_disk_sources(&domain.xml, &sources)?;
            }
        }

        let snap = MockSnapshot {
            name: request.name.clone(),
            parent,
            created_at: chrono::Utc::now(),
            xml,
        };
        let reference = Self::snapshot_ref(domain, &snap);
        domain.snapshots.push(snap);
        info!(node = %domain.name, snapshot = %request.name, "Mock snapshot created");
        Ok(reference)
    }

    async fn list_snapshots(&self, handle: &str) -> Result<Vec<SnapshotRef>> {
        self.gate()?;
        let domains = self.read()?;
        let domain = domains
            .get(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        Ok(domain
            .snapshots
            .iter()
            .map(|s| Self::snapshot_ref(domain, s))
            .collect())
    }

    async fn current_snapshot(&self, handle: &str) -> Result<Option<SnapshotRef>> {
        self.gate()?;
        let domains = self.read()?;
        let domain = domains
            .get(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        Ok(domain.current.as_ref().and_then(|name| {
            domain
                .snapshots
                .iter()
                .find(|s| &s.name == name)
                .map(|s| Self::snapshot_ref(domain, s))
        }))
    }

    async fn set_current_snapshot(&self, handle: &str, name: &str) -> Result<()> {
        self.gate()?;
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        if !domain.snapshots.iter().any(|s| s.name == name) {
            return Err(VirtLabError::SnapshotNotFound(name.to_string()));
        }
        domain.current = Some(name.to_string());
        Ok(())
    }

    async fn delete_snapshot(&self, handle: &str, name: &str, flags: u32) -> Result<()> {
        self.gate()?;
        self.snapshot_delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        if !domain.snapshots.iter().any(|s| s.name == name) {
            return Err(VirtLabError::SnapshotNotFound(name.to_string()));
        }

        let cascade = flags & SNAPSHOT_DELETE_CHILDREN != 0;
        let mut doomed = vec![name.to_string()];
        if cascade {
            // Walk the subtree; children reference parents by name.
            let mut frontier = vec![name.to_string()];
            while let Some(parent) = frontier.pop() {
                for snap in &domain.snapshots {
                    if snap.parent.as_deref() == Some(parent.as_str()) {
                        doomed.push(snap.name.clone());
                        frontier.push(snap.name.clone());
                    }
                }
            }
        } else {
            // Reparent direct children onto the deleted snapshot's parent.
            let new_parent = domain
                .snapshots
                .iter()
                .find(|s| s.name == name)
                .and_then(|s| s.parent.clone());
            for snap in &mut domain.snapshots {
                if snap.parent.as_deref() == Some(name) {
                    snap.parent = new_parent.clone();
                }
            }
        }

        domain.snapshots.retain(|s| !doomed.contains(&s.name));
        if let Some(ref current) = domain.current {
            if doomed.contains(current) {
                domain.current = None;
            }
        }
        info!(node = %domain.name, snapshot = %name, cascade, "Mock snapshot deleted");
        Ok(())
    }

    async fn revert_to_snapshot(&self, handle: &str, name: &str, _flags: u32) -> Result<()> {
        self.gate()?;
        self.revert_calls.fetch_add(1, Ordering::SeqCst);
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(handle)
            .ok_or_else(|| VirtLabError::NodeNotFound(handle.to_string()))?;
        let snap = domain
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| VirtLabError::SnapshotNotFound(name.to_string()))?;
        let state = parse_snapshot_descriptor(&snap.xml)?.state;
        domain.running = state == "running";
        domain.current = Some(name.to_string());
        Ok(())
    }
}
