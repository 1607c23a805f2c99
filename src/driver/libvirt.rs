//! Libvirt backend implementation.
//!
//! Node lifecycle goes through the `virt` crate bindings. Snapshot
//! operations go through `virsh`, which exposes the full snapshot surface
//! (descriptor submission, reuse-external, metadata-only delete) that the
//! binding does not.

use std::process::{Command, Stdio};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use super::{
    Driver, NodeSpec, SnapshotCreateRequest, SnapshotRef, SNAPSHOT_DELETE_CHILDREN,
    SNAPSHOT_DELETE_METADATA_ONLY,
};
use crate::error::{Result, VirtLabError};
use crate::types::PowerState;
use crate::xml::parse_snapshot_descriptor;

/// Libvirt/QEMU control-plane backend.
pub struct LibvirtDriver {
    connection: Connect,
}

impl LibvirtDriver {
    /// Connect to the libvirt daemon at `uri` (e.g. `qemu:///system`).
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");
        let connection = Connect::open(Some(uri))
            .map_err(|e| VirtLabError::Transient(format!("libvirt connect failed: {}", e)))?;
        info!("Connected to libvirt");
        Ok(Self { connection })
    }

    fn get_domain(&self, handle: &str) -> Result<Domain> {
        Domain::lookup_by_uuid_string(&self.connection, handle)
            .map_err(|e| VirtLabError::NodeNotFound(format!("{}: {}", handle, e)))
    }

    fn domain_name(&self, handle: &str) -> Result<String> {
        self.get_domain(handle)?
            .get_name()
            .map_err(|e| VirtLabError::Permanent(e.to_string()))
    }

    fn run_virsh(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        debug!(args = ?args, "Running virsh");
        let mut command = Command::new("virsh");
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }
        let output = command
            .spawn()
            .and_then(|mut child| {
                use std::io::Write;
                if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                    pipe.write_all(input.as_bytes())?;
                }
                child.wait_with_output()
            })
            .map_err(|e| VirtLabError::Transient(format!("virsh spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VirtLabError::Permanent(format!(
                "virsh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn snapshot_dump(&self, domain: &str, name: &str) -> Result<SnapshotRef> {
        let xml = self.run_virsh(&["snapshot-dumpxml", domain, name], None)?;
        let descriptor = parse_snapshot_descriptor(&xml)?;
        let created_at = descriptor
            .creation_time
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(chrono::Utc::now);
        Ok(SnapshotRef {
            name: descriptor.name,
            parent: descriptor.parent,
            created_at,
            num_children: 0, // filled in by list_snapshots
            xml,
        })
    }

    fn render_domain_xml(spec: &NodeSpec) -> String {
        let mut xml = String::new();
        xml.push_str("<domain type='kvm'>\n");
        xml.push_str(&format!("  <name>{}</name>\n", spec.name));
        xml.push_str(&format!("  <memory unit='MiB'>{}</memory>\n", spec.memory_mib));
        xml.push_str(&format!(
            "  <vcpu placement='static'>{}</vcpu>\n",
            spec.vcpu
        ));
        xml.push_str("  <os>\n    <type arch='x86_64'>hvm</type>\n    <boot dev='hd'/>\n    <boot dev='network'/>\n  </os>\n");
        xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
        xml.push_str("  <on_poweroff>destroy</on_poweroff>\n  <on_reboot>restart</on_reboot>\n  <on_crash>destroy</on_crash>\n");
        xml.push_str("  <devices>\n");
        for disk in &spec.disks {
            xml.push_str(&format!(
                "    <disk type='file' device='disk'>\n      <driver name='qemu' type='{}' cache='none'/>\n      <source file='{}'/>\n      <target dev='{}' bus='virtio'/>\n    </disk>\n",
                disk.format, disk.source_file, disk.target
            ));
        }
        for nic in &spec.nics {
            xml.push_str(&format!(
                "    <interface type='network'>\n      <mac address='{}'/>\n      <source network='{}'/>\n      <model type='{}'/>\n    </interface>\n",
                nic.mac_address, nic.network, nic.model
            ));
        }
        xml.push_str("    <serial type='pty'><target port='0'/></serial>\n");
        xml.push_str("    <graphics type='vnc' autoport='yes' listen='127.0.0.1'/>\n");
        xml.push_str("  </devices>\n</domain>\n");
        xml
    }
}

#[async_trait]
impl Driver for LibvirtDriver {
    #[instrument(skip(self, spec), fields(node = %spec.name))]
    async fn define_node(&self, spec: &NodeSpec) -> Result<String> {
        info!("Defining domain");
        let xml = Self::render_domain_xml(spec);
        debug!(xml = %xml, "Generated domain XML");

        let domain = Domain::define_xml(&self.connection, &xml)
            .map_err(|e| VirtLabError::Permanent(format!("define failed: {}", e)))?;
        let uuid = domain
            .get_uuid_string()
            .map_err(|e| VirtLabError::Permanent(e.to_string()))?;
        info!(handle = %uuid, "Domain defined");
        Ok(uuid)
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn start_node(&self, handle: &str) -> Result<()> {
        let domain = self.get_domain(handle)?;
        domain
            .create()
            .map_err(|e| VirtLabError::Permanent(format!("start failed: {}", e)))?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn stop_node(&self, handle: &str) -> Result<()> {
        let domain = self.get_domain(handle)?;
        domain
            .destroy()
            .map_err(|e| VirtLabError::Permanent(format!("stop failed: {}", e)))?;
        info!("Domain powered off");
        Ok(())
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn destroy_node(&self, handle: &str) -> Result<()> {
        let domain = self.get_domain(handle)?;
        let (state, _) = domain
            .get_state()
            .map_err(|e| VirtLabError::Permanent(e.to_string()))?;
        if state == sys::VIR_DOMAIN_RUNNING || state == sys::VIR_DOMAIN_PAUSED {
            return Err(VirtLabError::InvalidState(
                "domain must be stopped before undefine".to_string(),
            ));
        }
        domain
            .undefine()
            .map_err(|e| VirtLabError::Permanent(format!("undefine failed: {}", e)))?;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn reset_node(&self, handle: &str) -> Result<()> {
        let domain = self.get_domain(handle)?;
        domain
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(|e| VirtLabError::Permanent(format!("reset failed: {}", e)))?;
        Ok(())
    }

    async fn node_power_state(&self, handle: &str) -> Result<PowerState> {
        let domain = match Domain::lookup_by_uuid_string(&self.connection, handle) {
            Ok(d) => d,
            Err(_) => return Ok(PowerState::Unknown),
        };
        let (state, _) = domain
            .get_state()
            .map_err(|e| VirtLabError::Permanent(e.to_string()))?;
        Ok(match state {
            sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_PAUSED => PowerState::On,
            sys::VIR_DOMAIN_SHUTOFF => PowerState::Off,
            _ => PowerState::Unknown,
        })
    }

    async fn node_xml(&self, handle: &str) -> Result<String> {
        let domain = self.get_domain(handle)?;
        domain
            .get_xml_desc(0)
            .map_err(|e| VirtLabError::Permanent(e.to_string()))
    }

    #[instrument(skip(self, domain_xml), fields(handle = %handle))]
    async fn redefine_node(&self, handle: &str, domain_xml: &str) -> Result<()> {
        Domain::define_xml(&self.connection, domain_xml)
            .map_err(|e| VirtLabError::Permanent(format!("redefine failed: {}", e)))?;
        info!("Domain redefined");
        Ok(())
    }

    #[instrument(skip(self, domain_xml), fields(handle = %handle))]
    async fn restore_node(&self, handle: &str, memory_file: &str, domain_xml: &str) -> Result<()> {
        // The binding exposes no restore-with-dxml; hand the rewritten
        // definition to virsh through a sibling file.
        let dxml_path = format!("{}.dxml", memory_file);
        std::fs::write(&dxml_path, domain_xml).map_err(|e| VirtLabError::SnapshotFile {
            path: dxml_path.clone(),
            source: e,
        })?;
        let result = self.run_virsh(
            &["restore", memory_file, "--xml", &dxml_path, "--paused"],
            None,
        );
        if let Err(e) = std::fs::remove_file(&dxml_path) {
            warn!(path = %dxml_path, error = %e, "Could not remove definition override file");
        }
        result.map(|_| ())
    }

    #[instrument(skip(self, request), fields(handle = %handle, name = %request.name))]
    async fn create_snapshot(
        &self,
        handle: &str,
        request: &SnapshotCreateRequest,
    ) -> Result<SnapshotRef> {
        let domain = self.domain_name(handle)?;
        let mut args = vec!["snapshot-create", domain.as_str(), "--xmlfile", "/dev/stdin"];
        if request.disk_only {
            args.push("--disk-only");
        }
        if request.external && request.reuse_existing {
            args.push("--reuse-external");
        }
        self.run_virsh(&args, Some(&request.descriptor_xml))?;
        info!("Snapshot created");
        self.snapshot_dump(&domain, &request.name)
    }

    async fn list_snapshots(&self, handle: &str) -> Result<Vec<SnapshotRef>> {
        let domain = self.domain_name(handle)?;
        let names = self.run_virsh(&["snapshot-list", &domain, "--name"], None)?;
        let mut snapshots = Vec::new();
        for name in names.lines().map(str::trim).filter(|l| !l.is_empty()) {
            snapshots.push(self.snapshot_dump(&domain, name)?);
        }
        // virsh reports parents, not children; derive the counts.
        let counts: Vec<usize> = snapshots
            .iter()
            .map(|s| {
                snapshots
                    .iter()
                    .filter(|c| c.parent.as_deref() == Some(s.name.as_str()))
                    .count()
            })
            .collect();
        for (snapshot, count) in snapshots.iter_mut().zip(counts) {
            snapshot.num_children = count;
        }
        Ok(snapshots)
    }

    async fn current_snapshot(&self, handle: &str) -> Result<Option<SnapshotRef>> {
        let domain = self.domain_name(handle)?;
        match self.run_virsh(&["snapshot-current", &domain, "--name"], None) {
            Ok(name) => {
                let name = name.trim();
                if name.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(self.snapshot_dump(&domain, name)?))
                }
            }
            // No current snapshot reports as an error; treat it as unset.
            Err(VirtLabError::Permanent(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_current_snapshot(&self, handle: &str, name: &str) -> Result<()> {
        let domain = self.domain_name(handle)?;
        self.run_virsh(&["snapshot-current", &domain, name], None)?;
        Ok(())
    }

    #[instrument(skip(self), fields(handle = %handle, name = %name))]
    async fn delete_snapshot(&self, handle: &str, name: &str, flags: u32) -> Result<()> {
        let domain = self.domain_name(handle)?;
        let mut args = vec!["snapshot-delete", domain.as_str(), name];
        if flags & SNAPSHOT_DELETE_CHILDREN != 0 {
            args.push("--children");
        }
        if flags & SNAPSHOT_DELETE_METADATA_ONLY != 0 {
            args.push("--metadata");
        }
        self.run_virsh(&args, None)?;
        info!("Snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(handle = %handle, name = %name))]
    async fn revert_to_snapshot(&self, handle: &str, name: &str, _flags: u32) -> Result<()> {
        let domain = self.domain_name(handle)?;
        self.run_virsh(&["snapshot-revert", &domain, name], None)?;
        info!("Reverted to snapshot");
        Ok(())
    }
}
