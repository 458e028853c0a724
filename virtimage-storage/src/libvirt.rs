//! Libvirt domain adapter.
//!
//! Bridges a `virt::domain::Domain` to the narrow [`Domain`] capability this
//! crate consumes. Snapshot create/delete go through `virsh`, since the virt
//! crate v0.4 does not expose the domain snapshot API.

use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{DiskSource, Domain, SnapshotHandle};
use crate::error::{Result, StorageError};
use crate::exec::{Executor, SystemExecutor};
use crate::xml;

/// Adapter exposing a libvirt domain as a [`Domain`].
///
/// The underlying domain stays owned by the caller's libvirt connection;
/// this type only borrows its identity for lookups and snapshot calls.
pub struct LibvirtDomain {
    inner: virt::domain::Domain,
    executor: Arc<dyn Executor>,
}

impl LibvirtDomain {
    /// Wrap a libvirt domain, running `virsh` through a [`SystemExecutor`].
    pub fn new(inner: virt::domain::Domain) -> Self {
        Self {
            inner,
            executor: Arc::new(SystemExecutor::new()),
        }
    }

    /// Replace the executor used for `virsh` calls.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    fn name(&self) -> Result<String> {
        self.inner
            .get_name()
            .map_err(|e| StorageError::Hypervisor(e.to_string()))
    }
}

impl Domain for LibvirtDomain {
    fn disk_sources(&self) -> Result<Vec<DiskSource>> {
        let desc = self
            .inner
            .get_xml_desc(0)
            .map_err(|e| StorageError::Hypervisor(e.to_string()))?;
        xml::parse_disk_sources(&desc)
    }

    fn is_active(&self) -> Result<bool> {
        self.inner
            .is_active()
            .map_err(|e| StorageError::Hypervisor(e.to_string()))
    }

    fn snapshot_create(&self, xml_fragment: &str) -> Result<Box<dyn SnapshotHandle>> {
        let domain_name = self.name()?;
        let snapshot_name = xml::snapshot_name(xml_fragment)?;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(xml_fragment.as_bytes())?;
        file.flush()?;
        let file_path = file.path().to_string_lossy().into_owned();

        info!(
            domain = %domain_name,
            snapshot = %snapshot_name,
            "Creating domain snapshot via virsh"
        );
        self.executor.execute(
            &["virsh", "snapshot-create", &domain_name, &file_path],
            true,
        )?;

        Ok(Box::new(VirshSnapshotHandle {
            domain_name,
            snapshot_name,
            executor: Arc::clone(&self.executor),
        }))
    }
}

/// Snapshot handle addressed by (domain name, snapshot name) through virsh.
struct VirshSnapshotHandle {
    domain_name: String,
    snapshot_name: String,
    executor: Arc<dyn Executor>,
}

impl SnapshotHandle for VirshSnapshotHandle {
    fn delete(&self) -> Result<()> {
        debug!(
            domain = %self.domain_name,
            snapshot = %self.snapshot_name,
            "Deleting domain snapshot via virsh"
        );
        self.executor.execute(
            &[
                "virsh",
                "snapshot-delete",
                &self.domain_name,
                &self.snapshot_name,
            ],
            true,
        )?;
        Ok(())
    }
}
