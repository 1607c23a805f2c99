//! Snapshot lifecycle management.
//!
//! A domain's snapshots form a single chain type: either internal (deltas
//! inside the qcow2 images, rolled back by the hypervisor itself) or
//! external (deltas in sibling overlay files, tracked through the domain's
//! live disk-source paths). The manager inspects the existing chain before
//! every mutation and refuses to mix types.
//!
//! External revert is the hard path: disk state lives in overlay files, so
//! rolling back means rewriting the domain's disk-device markup to point
//! each device at the snapshot's recorded source and either restoring the
//! captured memory image with the rewritten definition or, for a shutoff
//! capture, redefining the domain and leaving it powered off.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::driver::{
    Driver, SnapshotCreateRequest, SnapshotRef, SNAPSHOT_DELETE_CHILDREN,
    SNAPSHOT_DELETE_METADATA_ONLY,
};
use crate::error::{Result, VirtLabError};
use crate::retry::{retry, RetryPolicy};
use crate::store::Store;
use crate::types::{Node, PowerState};
use crate::xml::{
    parse_disk_devices, parse_snapshot_descriptor, rewrite_disk_sources, ChainType,
    SnapshotDescriptor, SnapshotXmlBuilder,
};

/// Orchestrates create/revert/delete on node snapshots.
pub struct SnapshotManager {
    driver: Arc<dyn Driver>,
    store: Arc<Store>,
    policy: RetryPolicy,
    /// Directory external overlay and memory files are created under
    external_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        store: Arc<Store>,
        policy: RetryPolicy,
        external_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            driver,
            store,
            policy,
            external_dir: external_dir.into(),
        }
    }

    fn handle_of(node: &Node) -> Result<&str> {
        node.handle.as_deref().ok_or_else(|| {
            VirtLabError::InvalidState(format!("node '{}' is not defined", node.name))
        })
    }

    /// Most recent snapshot on the node, if any.
    async fn latest_snapshot(&self, handle: &str) -> Result<Option<SnapshotRef>> {
        let mut snapshots = self.driver.list_snapshots(handle).await?;
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots.pop())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a snapshot of `node_id`.
    ///
    /// Idempotent: an existing snapshot with the same name is returned as-is.
    /// The whole operation is wrapped in the retry policy; the short-circuit
    /// on an existing name is what makes a mid-create retry safe.
    #[instrument(skip(self, description), fields(name = %name))]
    pub async fn create(
        &self,
        node_id: Uuid,
        name: &str,
        description: &str,
        disk_only: bool,
        external: bool,
    ) -> Result<SnapshotRef> {
        retry(self.policy, || {
            self.create_inner(node_id, name, description, disk_only, external)
        })
        .await
    }

    async fn create_inner(
        &self,
        node_id: Uuid,
        name: &str,
        description: &str,
        disk_only: bool,
        external: bool,
    ) -> Result<SnapshotRef> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;

        if let Some(existing) = self.driver.snapshot(handle, name).await? {
            info!(node = %node.name, snapshot = %name, "Snapshot already exists, no-op");
            return Ok(existing);
        }

        let requested = if external {
            ChainType::External
        } else {
            ChainType::Internal
        };
        if let Some(latest) = self.latest_snapshot(handle).await? {
            let existing = parse_snapshot_descriptor(&latest.xml)?.chain_type();
            if existing != requested {
                return Err(VirtLabError::SnapshotTypeConflict {
                    node: node.name.clone(),
                    name: name.to_string(),
                    existing: existing.as_str(),
                    requested: requested.as_str(),
                });
            }
        }

        let reference = if external {
            self.create_external(&node, handle, name, description, disk_only)
                .await?
        } else {
            let descriptor = SnapshotXmlBuilder::new(name, description).build_internal();
            self.driver
                .create_snapshot(
                    handle,
                    &SnapshotCreateRequest {
                        name: name.to_string(),
                        descriptor_xml: descriptor,
                        disk_only,
                        external: false,
                        reuse_existing: false,
                    },
                )
                .await?
        };

        self.driver.set_current_snapshot(handle, name).await?;
        info!(node = %node.name, snapshot = %name, external, "Snapshot created");
        Ok(reference)
    }

    async fn create_external(
        &self,
        node: &Node,
        handle: &str,
        name: &str,
        description: &str,
        disk_only: bool,
    ) -> Result<SnapshotRef> {
        std::fs::create_dir_all(&self.external_dir).map_err(|e| VirtLabError::SnapshotFile {
            path: self.external_dir.display().to_string(),
            source: e,
        })?;

        let running = self.driver.node_power_state(handle).await? == PowerState::On;
        // Memory state cannot be captured from a stopped domain.
        let disk_only = disk_only || !running;

        let domain_xml = self.driver.node_xml(handle).await?;
        let disks = parse_disk_devices(&domain_xml)?;

        let mut builder = SnapshotXmlBuilder::new(name, description);
        let memory_file = self.memory_file_path(&node.name, name);
        let memory_file_str = memory_file.display().to_string();
        if !disk_only {
            builder = builder.with_memory_file(&memory_file_str);
        }
        for disk in &disks {
            builder = builder.with_external_disk(
                disk.target.clone(),
                self.overlay_path(&node.name, &disk.target, name)
                    .display()
                    .to_string(),
            );
        }

        self.driver
            .create_snapshot(
                handle,
                &SnapshotCreateRequest {
                    name: name.to_string(),
                    descriptor_xml: builder.build_external(),
                    disk_only,
                    external: true,
                    // A leftover overlay from an interrupted create is reused
                    // rather than erroring.
                    reuse_existing: true,
                },
            )
            .await
    }

    fn overlay_path(&self, node_name: &str, target: &str, snapshot: &str) -> PathBuf {
        self.external_dir
            .join(format!("{}.{}.{}", node_name, target, snapshot))
    }

    fn memory_file_path(&self, node_name: &str, snapshot: &str) -> PathBuf {
        self.external_dir
            .join(format!("{}.{}.mem", node_name, snapshot))
    }

    // =========================================================================
    // Revert
    // =========================================================================

    /// Revert `node_id` to `name`, or to the current snapshot when `None`.
    #[instrument(skip(self))]
    pub async fn revert(&self, node_id: Uuid, name: Option<&str>) -> Result<()> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;

        let target = match name {
            Some(n) => retry(self.policy, || self.driver.snapshot(handle, n))
                .await?
                .ok_or_else(|| VirtLabError::SnapshotNotFound(n.to_string()))?,
            None => retry(self.policy, || self.driver.current_snapshot(handle))
                .await?
                .ok_or_else(|| {
                    VirtLabError::InvalidState(format!(
                        "node '{}' has no current snapshot to revert to",
                        node.name
                    ))
                })?,
        };
        let descriptor = parse_snapshot_descriptor(&target.xml)?;

        match descriptor.chain_type() {
            ChainType::Internal => {
                debug!(node = %node.name, snapshot = %target.name, "Internal revert");
                retry(self.policy, || {
                    self.driver.revert_to_snapshot(handle, &target.name, 0)
                })
                .await?;
            }
            ChainType::External => {
                self.revert_external(&node, handle, &descriptor).await?;
            }
        }

        retry(self.policy, || {
            self.driver.set_current_snapshot(handle, &target.name)
        })
        .await?;
        info!(node = %node.name, snapshot = %target.name, "Reverted to snapshot");
        Ok(())
    }

    async fn revert_external(
        &self,
        node: &Node,
        handle: &str,
        descriptor: &SnapshotDescriptor,
    ) -> Result<()> {
        let live_xml = retry(self.policy, || self.driver.node_xml(handle)).await?;
        let recorded = descriptor.external_disk_sources();

        // Disks absent from the capture keep their live paths. A recorded
        // path equal to the live one means nothing diverged yet; the rewrite
        // is a no-op for that device but the override still applies.
        let rewritten = rewrite_disk_sources(&live_xml, &recorded)?;

        let shutoff = descriptor.state == "shutoff";
        let running = retry(self.policy, || self.driver.node_power_state(handle)).await?
            == PowerState::On;
        if running && !shutoff {
            debug!(node = %node.name, "Destroying running domain before restore");
            retry(self.policy, || self.driver.stop_node(handle)).await?;
        }

        if !shutoff && descriptor.has_memory_image() {
            let memory_file = descriptor.memory_file.as_deref().unwrap_or_default();
            retry(self.policy, || {
                self.driver.restore_node(handle, memory_file, &rewritten)
            })
            .await?;
        } else {
            // No memory image: redefine with the rewritten disks and leave
            // the domain powered off.
            if running && shutoff {
                retry(self.policy, || self.driver.stop_node(handle)).await?;
            }
            retry(self.policy, || {
                self.driver.redefine_node(handle, &rewritten)
            })
            .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete snapshot `name` on `node_id`.
    ///
    /// Refuses when the snapshot has children unless `cascade` is set. The
    /// external path removes overlay and memory files first and is therefore
    /// not wrapped in the retry policy end-to-end; file removal tolerates
    /// already-missing files so a crashed delete can be re-run.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn delete(&self, node_id: Uuid, name: &str, cascade: bool) -> Result<()> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;

        let snapshot = retry(self.policy, || self.driver.snapshot(handle, name))
            .await?
            .ok_or_else(|| VirtLabError::SnapshotNotFound(name.to_string()))?;

        if snapshot.num_children > 0 && !cascade {
            return Err(VirtLabError::SnapshotHasChildren {
                node: node.name.clone(),
                name: name.to_string(),
                children: snapshot.num_children,
            });
        }

        let descriptor = parse_snapshot_descriptor(&snapshot.xml)?;
        let cascade_flag = if cascade { SNAPSHOT_DELETE_CHILDREN } else { 0 };

        match descriptor.chain_type() {
            ChainType::Internal => {
                self.driver
                    .delete_snapshot(handle, name, cascade_flag)
                    .await?;
            }
            ChainType::External => {
                // Cascade deletes the whole subtree's metadata in one driver
                // call, so every doomed snapshot's files go too.
                let mut doomed = vec![descriptor];
                if cascade && snapshot.num_children > 0 {
                    let all = retry(self.policy, || self.driver.list_snapshots(handle)).await?;
                    let mut frontier = vec![name.to_string()];
                    while let Some(parent) = frontier.pop() {
                        for child in all.iter().filter(|s| s.parent.as_deref() == Some(&parent)) {
                            doomed.push(parse_snapshot_descriptor(&child.xml)?);
                            frontier.push(child.name.clone());
                        }
                    }
                }

                // The domain may still be reading some of the recorded
                // files; only remove what nothing live references.
                let live_xml = self.driver.node_xml(handle).await?;
                let live: Vec<String> = parse_disk_devices(&live_xml)?
                    .into_iter()
                    .filter_map(|d| d.source_file)
                    .collect();

                for descriptor in &doomed {
                    for (target, file) in descriptor.external_disk_sources() {
                        if live.iter().any(|l| l == &file) {
                            debug!(file = %file, target = %target, "Overlay still live, keeping");
                            continue;
                        }
                        remove_file_idempotent(Path::new(&file))?;
                    }
                    if let Some(ref memory_file) = descriptor.memory_file {
                        remove_file_idempotent(Path::new(memory_file))?;
                    }
                }

                self.driver
                    .delete_snapshot(
                        handle,
                        name,
                        SNAPSHOT_DELETE_METADATA_ONLY | cascade_flag,
                    )
                    .await?;
            }
        }
        info!(node = %node.name, snapshot = %name, "Snapshot deleted");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn list(&self, node_id: Uuid) -> Result<Vec<SnapshotRef>> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        retry(self.policy, || self.driver.list_snapshots(handle)).await
    }

    pub async fn current(&self, node_id: Uuid) -> Result<Option<SnapshotRef>> {
        let node = self.store.node(node_id)?;
        let handle = Self::handle_of(&node)?;
        retry(self.policy, || self.driver.current_snapshot(handle)).await
    }
}

/// Remove a file, treating "already gone" as success.
fn remove_file_idempotent(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed snapshot file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Snapshot file already gone, continuing");
            Ok(())
        }
        Err(e) => Err(VirtLabError::SnapshotFile {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DiskSpec, MockDriver, NodeSpec};

    struct Fixture {
        driver: Arc<MockDriver>,
        store: Arc<Store>,
        manager: SnapshotManager,
        node_id: Uuid,
        dir: tempfile::TempDir,
    }

    async fn fixture_with_disks(disks: &[(&str, &str)]) -> Fixture {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(Store::new());
        let dir = tempfile::tempdir().unwrap();

        let node = store.create_node(Node::new("slave-01")).unwrap();
        let spec = NodeSpec {
            name: node.name.clone(),
            vcpu: 2,
            memory_mib: 2048,
            disks: disks
                .iter()
                .map(|(target, source)| DiskSpec {
                    target: target.to_string(),
                    source_file: source.to_string(),
                    format: "qcow2".to_string(),
                })
                .collect(),
            nics: Vec::new(),
        };
        let handle = driver.define_node(&spec).await.unwrap();
        let node = store
            .update_node(node.id, |n| {
                n.handle = Some(handle);
                n.state = crate::types::NodeState::Defined;
            })
            .unwrap();

        let manager = SnapshotManager::new(
            driver.clone(),
            store.clone(),
            RetryPolicy::new(3, std::time::Duration::ZERO),
            dir.path(),
        );
        Fixture {
            driver,
            store,
            manager,
            node_id: node.id,
            dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_disks(&[("vda", "/d/vda-live")]).await
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let f = fixture().await;
        let first = f
            .manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();
        let second = f
            .manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();
        assert_eq!(first.name, second.name);
        assert_eq!(f.manager.list(f.node_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mixed_chain_types_are_refused() {
        let f = fixture().await;
        f.manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();

        let err = f
            .manager
            .create(f.node_id, "snap1", "", true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, VirtLabError::SnapshotTypeConflict { .. }));

        // The first snapshot of either type on a clean node always works.
        let clean = fixture().await;
        clean
            .manager
            .create(clean.node_id, "snap1", "", true, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_survives_transient_failures() {
        let f = fixture().await;
        f.driver.inject_transient_failures(2);
        let snap = f
            .manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();
        assert_eq!(snap.name, "base");
    }

    #[tokio::test]
    async fn stopped_domain_gets_disk_only_external_snapshot() {
        let f = fixture().await;
        // Domain is defined but not started.
        let snap = f
            .manager
            .create(f.node_id, "cold", "", false, true)
            .await
            .unwrap();
        let descriptor = parse_snapshot_descriptor(&snap.xml).unwrap();
        assert_eq!(descriptor.state, "shutoff");
        assert!(!descriptor.has_memory_image());
    }

    #[tokio::test]
    async fn internal_revert_goes_through_the_driver() {
        let f = fixture().await;
        f.manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();
        f.manager.revert(f.node_id, Some("base")).await.unwrap();
        assert_eq!(f.driver.revert_calls(), 1);
        assert_eq!(f.driver.redefine_calls(), 0);

        let current = f.manager.current(f.node_id).await.unwrap().unwrap();
        assert_eq!(current.name, "base");
    }

    #[tokio::test]
    async fn revert_with_no_name_targets_current() {
        let f = fixture().await;
        f.manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();
        f.manager
            .create(f.node_id, "snap1", "", false, false)
            .await
            .unwrap();

        f.manager.revert(f.node_id, None).await.unwrap();
        let current = f.manager.current(f.node_id).await.unwrap().unwrap();
        assert_eq!(current.name, "snap1");

        let clean = fixture().await;
        assert!(matches!(
            clean.manager.revert(clean.node_id, None).await,
            Err(VirtLabError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn external_revert_rewrites_disk_paths_in_device_order() {
        let f = fixture_with_disks(&[("vda", "/d/vda-live"), ("vdb", "/d/vdb-live")]).await;
        f.manager
            .create(f.node_id, "snap1", "", true, true)
            .await
            .unwrap();

        // Simulate divergence: the control plane moved the live disks on.
        let node = f.store.node(f.node_id).unwrap();
        let handle = node.handle.clone().unwrap();
        let live = f.driver.node_xml(&handle).await.unwrap();
        let mut ahead = std::collections::BTreeMap::new();
        ahead.insert("vda".to_string(), "/d/vda-newer".to_string());
        ahead.insert("vdb".to_string(), "/d/vdb-newer".to_string());
        let moved = rewrite_disk_sources(&live, &ahead).unwrap();
        f.driver.redefine_node(&handle, &moved).await.unwrap();

        f.manager.revert(f.node_id, Some("snap1")).await.unwrap();

        let reverted = f.driver.node_xml(&handle).await.unwrap();
        let sources: Vec<String> = parse_disk_devices(&reverted)
            .unwrap()
            .into_iter()
            .map(|d| d.source_file.unwrap())
            .collect();
        let expect_vda = f.dir.path().join("slave-01.vda.snap1");
        let expect_vdb = f.dir.path().join("slave-01.vdb.snap1");
        assert_eq!(
            sources,
            vec![
                expect_vda.display().to_string(),
                expect_vdb.display().to_string()
            ]
        );
        // Shutoff capture: redefined, never restored from memory.
        assert!(f.driver.restore_calls() == 0);
        assert!(f.driver.redefine_calls() >= 1);
    }

    #[tokio::test]
    async fn external_revert_of_running_capture_restores_memory() {
        let f = fixture().await;
        let node = f.store.node(f.node_id).unwrap();
        let handle = node.handle.clone().unwrap();
        f.driver.start_node(&handle).await.unwrap();

        f.manager
            .create(f.node_id, "hot", "", false, true)
            .await
            .unwrap();
        f.manager.revert(f.node_id, Some("hot")).await.unwrap();

        assert_eq!(f.driver.restore_calls(), 1);
        assert_eq!(f.driver.revert_calls(), 0);
    }

    #[tokio::test]
    async fn delete_with_children_is_refused_before_any_side_effect() {
        let f = fixture().await;
        f.manager
            .create(f.node_id, "base", "", false, false)
            .await
            .unwrap();
        f.manager
            .create(f.node_id, "child", "", false, false)
            .await
            .unwrap();

        let err = f.manager.delete(f.node_id, "base", false).await.unwrap_err();
        assert!(matches!(
            err,
            VirtLabError::SnapshotHasChildren { children: 1, .. }
        ));
        assert_eq!(f.driver.snapshot_delete_calls(), 0);
        assert_eq!(f.manager.list(f.node_id).await.unwrap().len(), 2);

        // Cascade takes the subtree out.
        f.manager.delete(f.node_id, "base", true).await.unwrap();
        assert!(f.manager.list(f.node_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_delete_removes_only_non_live_files() {
        let f = fixture().await;
        f.manager
            .create(f.node_id, "snap1", "", true, true)
            .await
            .unwrap();
        f.manager
            .create(f.node_id, "snap2", "", true, true)
            .await
            .unwrap();

        // snap2's create moved the live path onto snap2's overlay, so snap1's
        // overlay is stale. Put files on disk for both.
        let snap1_overlay = f.dir.path().join("slave-01.vda.snap1");
        let snap2_overlay = f.dir.path().join("slave-01.vda.snap2");
        std::fs::write(&snap1_overlay, b"ovl1").unwrap();
        std::fs::write(&snap2_overlay, b"ovl2").unwrap();

        // snap2 descends from snap1, so the subtree goes with cascade.
        f.manager.delete(f.node_id, "snap1", true).await.unwrap();
        assert!(!snap1_overlay.exists(), "stale overlay should be removed");
        assert!(snap2_overlay.exists(), "live overlay must survive");
        assert!(f.manager.list(f.node_id).await.unwrap().is_empty());

        // Re-running after a partial failure does not trip over the missing
        // file; the snapshot is simply gone now.
        assert!(matches!(
            f.manager.delete(f.node_id, "snap1", false).await,
            Err(VirtLabError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cascade_delete_cleans_descendant_files_too() {
        let f = fixture().await;
        for name in ["snap1", "snap2", "snap3"] {
            f.manager
                .create(f.node_id, name, "", true, true)
                .await
                .unwrap();
        }

        // Each create moved the live path forward, so only snap3's overlay
        // is still in use by the domain.
        let overlays: Vec<_> = ["snap1", "snap2", "snap3"]
            .iter()
            .map(|name| f.dir.path().join(format!("slave-01.vda.{}", name)))
            .collect();
        for overlay in &overlays {
            std::fs::write(overlay, b"ovl").unwrap();
        }

        f.manager.delete(f.node_id, "snap1", true).await.unwrap();
        assert!(!overlays[0].exists(), "root overlay should be removed");
        assert!(
            !overlays[1].exists(),
            "descendant overlay should be removed with the subtree"
        );
        assert!(overlays[2].exists(), "live overlay must survive");
        assert!(f.manager.list(f.node_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_live_overlay_snapshot_keeps_the_file() {
        let f = fixture().await;
        f.manager
            .create(f.node_id, "snap1", "", true, true)
            .await
            .unwrap();
        let overlay = f.dir.path().join("slave-01.vda.snap1");
        std::fs::write(&overlay, b"ovl").unwrap();

        // snap1's overlay is exactly the live path: no divergence happened.
        f.manager.delete(f.node_id, "snap1", false).await.unwrap();
        assert!(overlay.exists());
    }
}
