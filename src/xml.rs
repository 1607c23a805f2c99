//! Domain and snapshot XML handling.
//!
//! Two distinct jobs, handled differently on purpose:
//!
//! - Editing a live domain definition (rewriting disk `source file=`
//!   attributes on external revert) goes through a structured event stream:
//!   every byte the hypervisor wrote that we do not own is preserved.
//! - Building a brand-new snapshot descriptor is plain string assembly; the
//!   document is fully owned by us and has no prior state to preserve.

use std::collections::BTreeMap;
use std::io::Cursor;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Result, VirtLabError};

fn xml_err(e: impl std::fmt::Display) -> VirtLabError {
    VirtLabError::Xml(e.to_string())
}

// =============================================================================
// DOMAIN DISK DEVICES
// =============================================================================

/// One `<disk device='disk'>` element of a domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    /// Target device name inside the guest (e.g. "vda")
    pub target: String,
    /// Current source file path
    pub source_file: Option<String>,
}

/// Disk devices of a domain definition, in document order.
pub fn parse_disk_devices(domain_xml: &str) -> Result<Vec<DiskDevice>> {
    let mut reader = Reader::from_str(domain_xml);
    let mut disks = Vec::new();
    let mut in_disk = false;
    let mut target = None;
    let mut source = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"disk" && !in_disk => {
                if disk_device_kind(&e)? != "disk" {
                    // cdrom/floppy devices are not part of snapshot chains
                    reader.read_to_end(e.name()).map_err(xml_err)?;
                    continue;
                }
                in_disk = true;
                target = None;
                source = None;
            }
            Event::Start(e) | Event::Empty(e) if in_disk => match e.name().as_ref() {
                b"source" => source = attr_value(&e, b"file")?,
                b"target" => target = attr_value(&e, b"dev")?,
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"disk" && in_disk => {
                in_disk = false;
                let dev = target.take().ok_or_else(|| {
                    VirtLabError::Xml("disk device without a target dev attribute".to_string())
                })?;
                disks.push(DiskDevice {
                    target: dev,
                    source_file: source.take(),
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(disks)
}

/// Rewrite the `source file=` attribute of each disk named in `new_sources`
/// (keyed by target device), leaving every other byte of the definition as
/// the hypervisor produced it.
pub fn rewrite_disk_sources(
    domain_xml: &str,
    new_sources: &BTreeMap<String, String>,
) -> Result<String> {
    // First pass resolves target names to disk positions; targets appear
    // after sources inside a disk element, so the rewrite pass goes by
    // position instead of looking ahead.
    let order = parse_disk_devices(domain_xml)?;
    for target in new_sources.keys() {
        if !order.iter().any(|d| &d.target == target) {
            return Err(VirtLabError::Xml(format!(
                "domain has no disk with target '{}'",
                target
            )));
        }
    }
    let replacement_at: Vec<Option<&String>> = order
        .iter()
        .map(|d| new_sources.get(&d.target))
        .collect();

    let mut reader = Reader::from_str(domain_xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut disk_index = 0usize;
    let mut in_disk = false;
    let mut rewrite: Option<&String> = None;

    loop {
        let event = reader.read_event().map_err(xml_err)?;
        match event {
            Event::Start(ref e) if e.name().as_ref() == b"disk" && !in_disk => {
                if disk_device_kind(e)? == "disk" {
                    rewrite = replacement_at.get(disk_index).copied().flatten();
                    disk_index += 1;
                    in_disk = true;
                }
                writer.write_event(event.borrow()).map_err(xml_err)?;
            }
            Event::Start(ref e) | Event::Empty(ref e)
                if in_disk && e.name().as_ref() == b"source" && rewrite.is_some() =>
            {
                if let Some(path) = rewrite {
                    let rewritten = replace_attr(e, b"file", path);
                    match event {
                        Event::Empty(_) => writer.write_event(Event::Empty(rewritten)),
                        _ => writer.write_event(Event::Start(rewritten)),
                    }
                    .map_err(xml_err)?;
                }
            }
            Event::End(ref e) if in_disk && e.name().as_ref() == b"disk" => {
                in_disk = false;
                rewrite = None;
                writer.write_event(event.borrow()).map_err(xml_err)?;
            }
            Event::Eof => break,
            other => writer.write_event(other.borrow()).map_err(xml_err)?,
        }
    }

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| VirtLabError::Xml(e.to_string()))
}

fn disk_device_kind(e: &BytesStart<'_>) -> Result<String> {
    Ok(attr_value(e, b"device")?.unwrap_or_else(|| "disk".to_string()))
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn replace_attr<'a>(e: &BytesStart<'a>, key: &[u8], value: &str) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    let mut replaced = false;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            out.push_attribute((String::from_utf8_lossy(key).as_ref(), value));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        out.push_attribute((String::from_utf8_lossy(key).as_ref(), value));
    }
    out
}

// =============================================================================
// SNAPSHOT DESCRIPTORS
// =============================================================================

/// Where a capture's delta lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Not captured
    No,
    /// Stored inside the qcow2 image
    Internal,
    /// Stored in a sibling overlay file
    External,
}

impl CaptureMode {
    fn parse(s: &str) -> Self {
        match s {
            "internal" => CaptureMode::Internal,
            "external" => CaptureMode::External,
            _ => CaptureMode::No,
        }
    }
}

/// Established chain type of a domain's snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Internal,
    External,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Internal => "internal",
            ChainType::External => "external",
        }
    }
}

/// One disk entry of a snapshot descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDisk {
    /// Target device name ("vda")
    pub name: String,
    pub mode: CaptureMode,
    /// Overlay file recorded for an external disk delta
    pub source_file: Option<String>,
}

/// Parsed `<domainsnapshot>` descriptor.
#[derive(Debug, Clone)]
pub struct SnapshotDescriptor {
    pub name: String,
    /// Domain state at capture time ("running", "shutoff", "disk-snapshot")
    pub state: String,
    pub parent: Option<String>,
    /// Unix timestamp of the capture, when the hypervisor reported one
    pub creation_time: Option<i64>,
    pub memory_mode: CaptureMode,
    /// Standalone memory image for an external full snapshot
    pub memory_file: Option<String>,
    pub disks: Vec<SnapshotDisk>,
}

impl SnapshotDescriptor {
    /// A snapshot is external when its memory image or any disk delta lives
    /// outside the base images.
    pub fn chain_type(&self) -> ChainType {
        let external = self.memory_mode == CaptureMode::External
            || self.disks.iter().any(|d| d.mode == CaptureMode::External);
        if external {
            ChainType::External
        } else {
            ChainType::Internal
        }
    }

    /// Recorded overlay path per target device, external disks only.
    ///
    /// A disk absent from this map was not part of the capture and must keep
    /// its live path on revert.
    pub fn external_disk_sources(&self) -> BTreeMap<String, String> {
        self.disks
            .iter()
            .filter(|d| d.mode == CaptureMode::External)
            .filter_map(|d| d.source_file.clone().map(|f| (d.name.clone(), f)))
            .collect()
    }

    /// Whether the capture includes a resumable memory image.
    pub fn has_memory_image(&self) -> bool {
        self.memory_mode == CaptureMode::External && self.memory_file.is_some()
    }
}

/// Parse a `<domainsnapshot>` descriptor as produced by the hypervisor.
///
/// The embedded `<domain>` copy is skipped wholesale; its `<name>` and disk
/// list would otherwise shadow the snapshot's own.
pub fn parse_snapshot_descriptor(xml: &str) -> Result<SnapshotDescriptor> {
    let mut reader = Reader::from_str(xml);
    let mut name = None;
    let mut state = String::new();
    let mut parent = None;
    let mut creation_time = None;
    let mut memory_mode = CaptureMode::No;
    let mut memory_file = None;
    let mut disks = Vec::new();

    let mut in_parent = false;
    let mut in_disks = false;
    let mut current_disk: Option<SnapshotDisk> = None;
    let mut text_target: Option<&'static str> = None;
    let mut text_value = String::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"domain" => {
                    reader.read_to_end(e.name()).map_err(xml_err)?;
                }
                b"name" if !in_disks => {
                    text_target = Some(if in_parent { "parent" } else { "name" });
                    text_value.clear();
                }
                b"state" => {
                    text_target = Some("state");
                    text_value.clear();
                }
                b"creationTime" => {
                    text_target = Some("creationTime");
                    text_value.clear();
                }
                b"parent" => in_parent = true,
                b"disks" => in_disks = true,
                b"disk" if in_disks => {
                    current_disk = Some(SnapshotDisk {
                        name: attr_value(&e, b"name")?.unwrap_or_default(),
                        mode: CaptureMode::parse(
                            attr_value(&e, b"snapshot")?.as_deref().unwrap_or(""),
                        ),
                        source_file: None,
                    });
                }
                b"source" if current_disk.is_some() => {
                    if let Some(file) = attr_value(&e, b"file")? {
                        if let Some(ref mut disk) = current_disk {
                            disk.source_file = Some(file);
                        }
                    }
                }
                b"memory" => {
                    memory_mode = CaptureMode::parse(
                        attr_value(&e, b"snapshot")?.as_deref().unwrap_or(""),
                    );
                    memory_file = attr_value(&e, b"file")?;
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"memory" => {
                    memory_mode = CaptureMode::parse(
                        attr_value(&e, b"snapshot")?.as_deref().unwrap_or(""),
                    );
                    memory_file = attr_value(&e, b"file")?;
                }
                b"disk" if in_disks => {
                    disks.push(SnapshotDisk {
                        name: attr_value(&e, b"name")?.unwrap_or_default(),
                        mode: CaptureMode::parse(
                            attr_value(&e, b"snapshot")?.as_deref().unwrap_or(""),
                        ),
                        source_file: None,
                    });
                }
                b"source" if current_disk.is_some() => {
                    if let Some(file) = attr_value(&e, b"file")? {
                        if let Some(ref mut disk) = current_disk {
                            disk.source_file = Some(file);
                        }
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                if text_target.is_some() {
                    text_value.push_str(&t.unescape().map_err(xml_err)?);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"name" | b"state" | b"creationTime" => {
                    match text_target.take() {
                        Some("name") => name = Some(text_value.clone()),
                        Some("parent") => parent = Some(text_value.clone()),
                        Some("state") => state = text_value.clone(),
                        Some("creationTime") => creation_time = text_value.trim().parse().ok(),
                        _ => {}
                    }
                    text_value.clear();
                }
                b"parent" => in_parent = false,
                b"disks" => in_disks = false,
                b"disk" => {
                    if let Some(disk) = current_disk.take() {
                        disks.push(disk);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(SnapshotDescriptor {
        name: name
            .ok_or_else(|| VirtLabError::Xml("snapshot descriptor without a name".to_string()))?,
        state,
        parent,
        creation_time,
        memory_mode,
        memory_file,
        disks,
    })
}

// =============================================================================
// SNAPSHOT DESCRIPTOR BUILDER
// =============================================================================

/// Builds the descriptor submitted when creating a snapshot.
///
/// This is a fully-owned leaf document, so plain string assembly is fine
/// here; the hypervisor fills in state, timestamps, and the domain copy.
pub struct SnapshotXmlBuilder<'a> {
    name: &'a str,
    description: &'a str,
    memory_file: Option<&'a str>,
    disks: Vec<(String, String)>,
}

impl<'a> SnapshotXmlBuilder<'a> {
    pub fn new(name: &'a str, description: &'a str) -> Self {
        Self {
            name,
            description,
            memory_file: None,
            disks: Vec::new(),
        }
    }

    /// Request an external memory image at `path`.
    pub fn with_memory_file(mut self, path: &'a str) -> Self {
        self.memory_file = Some(path);
        self
    }

    /// Request an external disk delta for `target` at `overlay_path`.
    pub fn with_external_disk(mut self, target: impl Into<String>, overlay_path: impl Into<String>) -> Self {
        self.disks.push((target.into(), overlay_path.into()));
        self
    }

    /// Render the descriptor for an internal snapshot.
    pub fn build_internal(&self) -> String {
        format!(
            "<domainsnapshot>\n  <name>{}</name>\n  <description>{}</description>\n</domainsnapshot>\n",
            escape(self.name),
            escape(self.description)
        )
    }

    /// Render the descriptor for an external snapshot.
    pub fn build_external(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<domainsnapshot>\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(self.name)));
        xml.push_str(&format!(
            "  <description>{}</description>\n",
            escape(self.description)
        ));
        match self.memory_file {
            Some(path) => xml.push_str(&format!(
                "  <memory snapshot='external' file='{}'/>\n",
                escape(path)
            )),
            None => xml.push_str("  <memory snapshot='no'/>\n"),
        }
        xml.push_str("  <disks>\n");
        for (target, overlay) in &self.disks {
            xml.push_str(&format!(
                "    <disk name='{}' snapshot='external'>\n      <source file='{}'/>\n    </disk>\n",
                escape(target),
                escape(overlay)
            ));
        }
        xml.push_str("  </disks>\n");
        xml.push_str("</domainsnapshot>\n");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"<domain type='kvm'>
  <name>slave-01</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/d/vda-live'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/iso/cloudinit.iso'/>
      <target dev='hdc' bus='ide'/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/d/vdb-live'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
  </devices>
</domain>"#;

    #[test]
    fn disk_devices_are_parsed_in_order_skipping_cdroms() {
        let disks = parse_disk_devices(DOMAIN_XML).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].target, "vda");
        assert_eq!(disks[0].source_file.as_deref(), Some("/d/vda-live"));
        assert_eq!(disks[1].target, "vdb");
        assert_eq!(disks[1].source_file.as_deref(), Some("/d/vdb-live"));
    }

    #[test]
    fn rewrite_replaces_only_named_targets() {
        let mut map = BTreeMap::new();
        map.insert("vdb".to_string(), "/d/vdb-snap1".to_string());
        let out = rewrite_disk_sources(DOMAIN_XML, &map).unwrap();

        let disks = parse_disk_devices(&out).unwrap();
        assert_eq!(disks[0].source_file.as_deref(), Some("/d/vda-live"));
        assert_eq!(disks[1].source_file.as_deref(), Some("/d/vdb-snap1"));
        // cdrom untouched
        assert!(out.contains("/iso/cloudinit.iso"));
        // untouched structure survives byte-for-byte
        assert!(out.contains("<driver name=\"qemu\" type=\"qcow2\"/>") || out.contains("<driver name='qemu' type='qcow2'/>"));
    }

    #[test]
    fn rewrite_preserves_device_order() {
        let mut map = BTreeMap::new();
        map.insert("vda".to_string(), "/d/vda-snap1".to_string());
        map.insert("vdb".to_string(), "/d/vdb-snap1".to_string());
        let out = rewrite_disk_sources(DOMAIN_XML, &map).unwrap();

        let disks = parse_disk_devices(&out).unwrap();
        assert_eq!(
            disks
                .iter()
                .map(|d| d.source_file.clone().unwrap())
                .collect::<Vec<_>>(),
            vec!["/d/vda-snap1".to_string(), "/d/vdb-snap1".to_string()]
        );
    }

    #[test]
    fn rewrite_unknown_target_is_an_error() {
        let mut map = BTreeMap::new();
        map.insert("vdz".to_string(), "/d/nope".to_string());
        assert!(rewrite_disk_sources(DOMAIN_XML, &map).is_err());
    }

    const EXTERNAL_SNAPSHOT_XML: &str = r#"<domainsnapshot>
  <name>snap1</name>
  <state>running</state>
  <parent>
    <name>base</name>
  </parent>
  <memory snapshot='external' file='/d/snap1.mem'/>
  <disks>
    <disk name='vda' snapshot='external'>
      <source file='/d/vda-snap1'/>
    </disk>
    <disk name='vdb' snapshot='no'/>
  </disks>
  <domain type='kvm'>
    <name>slave-01</name>
    <devices>
      <disk type='file' device='disk'>
        <source file='/d/vda-live'/>
        <target dev='vda'/>
      </disk>
    </devices>
  </domain>
</domainsnapshot>"#;

    #[test]
    fn external_descriptor_is_parsed() {
        let snap = parse_snapshot_descriptor(EXTERNAL_SNAPSHOT_XML).unwrap();
        assert_eq!(snap.name, "snap1");
        assert_eq!(snap.state, "running");
        assert_eq!(snap.parent.as_deref(), Some("base"));
        assert_eq!(snap.chain_type(), ChainType::External);
        assert!(snap.has_memory_image());
        assert_eq!(snap.memory_file.as_deref(), Some("/d/snap1.mem"));

        // The skipped-capture disk stays out of the revert map.
        let sources = snap.external_disk_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources.get("vda").map(String::as_str), Some("/d/vda-snap1"));
        // ... and the embedded <domain> copy did not leak into the parse.
        assert_eq!(snap.disks.len(), 2);
    }

    #[test]
    fn internal_descriptor_is_parsed() {
        let xml = r#"<domainsnapshot>
  <name>base</name>
  <state>shutoff</state>
  <memory snapshot='no'/>
  <disks>
    <disk name='vda' snapshot='internal'/>
  </disks>
</domainsnapshot>"#;
        let snap = parse_snapshot_descriptor(xml).unwrap();
        assert_eq!(snap.chain_type(), ChainType::Internal);
        assert!(!snap.has_memory_image());
        assert!(snap.external_disk_sources().is_empty());
    }

    #[test]
    fn builder_renders_external_descriptor() {
        let xml = SnapshotXmlBuilder::new("snap1", "before upgrade")
            .with_memory_file("/d/snap1.mem")
            .with_external_disk("vda", "/d/vda.snap1")
            .with_external_disk("vdb", "/d/vdb.snap1")
            .build_external();

        let parsed = parse_snapshot_descriptor(&xml).unwrap();
        assert_eq!(parsed.name, "snap1");
        assert_eq!(parsed.chain_type(), ChainType::External);
        assert_eq!(parsed.external_disk_sources().len(), 2);
        assert_eq!(parsed.memory_file.as_deref(), Some("/d/snap1.mem"));
    }

    #[test]
    fn builder_escapes_markup_in_names() {
        let xml = SnapshotXmlBuilder::new("a<b", "x & y").build_internal();
        assert!(xml.contains("a&lt;b"));
        assert!(xml.contains("x &amp; y"));
        let parsed = parse_snapshot_descriptor(&xml).unwrap();
        assert_eq!(parsed.name, "a<b");
    }
}
