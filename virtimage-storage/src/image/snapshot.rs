//! Snapshot state machines and the scoped snapshot lifecycle.
//!
//! A snapshot object is constructed by [`super::Image::make_snapshot`] and
//! does nothing until `create()` allocates backing storage or registers it
//! with the hypervisor. [`SnapshotGuard`] pairs create with delete so the
//! snapshot is released on every exit path of the enclosing scope.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::domain::{Domain, SnapshotHandle};
use crate::error::{Result, StorageError};
use crate::exec::Executor;
use crate::image::lvm::LvmSnapshot;
use crate::image::qcow::QcowSnapshot;
use crate::image::raw::RawSnapshot;
use crate::image::types::DiskFormat;
use crate::xml;

/// Point-in-time copy of an instance image, in the image's format.
pub enum Snapshot<'d> {
    /// Snapshot of a flat raw file, held by the hypervisor.
    Raw(RawSnapshot<'d>),
    /// Snapshot of a qcow2 file, held by the hypervisor.
    Qcow(QcowSnapshot<'d>),
    /// Copy-on-write logical volume snapshot.
    Lvm(LvmSnapshot<'d>),
}

impl<'d> Snapshot<'d> {
    /// Snapshot name.
    pub fn name(&self) -> &str {
        match self {
            Snapshot::Raw(s) => s.name(),
            Snapshot::Qcow(s) => s.name(),
            Snapshot::Lvm(s) => s.name(),
        }
    }

    /// Allocate backing storage / register the snapshot with the hypervisor.
    pub fn create(&mut self) -> Result<()> {
        match self {
            Snapshot::Raw(s) => s.create(),
            Snapshot::Qcow(s) => s.create(),
            Snapshot::Lvm(s) => s.create(),
        }
    }

    /// Produce a portable raw image of the snapshot at `destination`.
    pub fn convert_to_raw(&self, destination: &Path) -> Result<()> {
        match self {
            Snapshot::Raw(s) => s.convert_to_raw(destination),
            Snapshot::Qcow(s) => s.convert_to_raw(destination),
            Snapshot::Lvm(s) => s.convert_to_raw(destination),
        }
    }

    /// Delete the snapshot.
    pub fn delete(&mut self) -> Result<()> {
        match self {
            Snapshot::Raw(s) => s.delete(),
            Snapshot::Qcow(s) => s.delete(),
            Snapshot::Lvm(s) => s.delete(),
        }
    }

    /// Create the snapshot and pair it with automatic deletion on scope
    /// exit, covering both normal return and error propagation.
    pub fn scoped(mut self) -> Result<SnapshotGuard<'d>> {
        self.create()?;
        Ok(SnapshotGuard {
            snapshot: Some(self),
        })
    }
}

/// Created snapshot that deletes itself when dropped.
///
/// Deletion failure during drop is logged rather than panicking; call
/// [`SnapshotGuard::finish`] to observe it instead.
pub struct SnapshotGuard<'d> {
    snapshot: Option<Snapshot<'d>>,
}

impl SnapshotGuard<'_> {
    /// Snapshot name.
    pub fn name(&self) -> Option<&str> {
        self.snapshot.as_ref().map(|s| s.name())
    }

    /// Produce a portable raw image of the snapshot at `destination`.
    pub fn convert_to_raw(&self, destination: &Path) -> Result<()> {
        match &self.snapshot {
            Some(snapshot) => snapshot.convert_to_raw(destination),
            None => Err(StorageError::Precondition(
                "snapshot has already been deleted".into(),
            )),
        }
    }

    /// Delete the snapshot now, surfacing any failure.
    pub fn finish(mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(mut snapshot) => snapshot.delete(),
            None => Ok(()),
        }
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut snapshot) = self.snapshot.take() {
            if let Err(err) = snapshot.delete() {
                error!(
                    snapshot = %snapshot.name(),
                    error = %err,
                    "Failed to delete snapshot on scope exit"
                );
            }
        }
    }
}

/// Shared state machine for snapshots held by the hypervisor.
///
/// Both file-backed formats create their snapshots through the domain and
/// convert them with qemu-img; only the format tag differs.
pub(crate) struct LibvirtSnapshot<'d> {
    domain: &'d dyn Domain,
    name: String,
    source_path: PathBuf,
    format: DiskFormat,
    executor: Arc<dyn Executor>,
    handle: Option<Box<dyn SnapshotHandle>>,
}

impl<'d> LibvirtSnapshot<'d> {
    pub(crate) fn new(
        domain: &'d dyn Domain,
        name: impl Into<String>,
        source_path: PathBuf,
        format: DiskFormat,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            domain,
            name: name.into(),
            source_path,
            format,
            executor,
            handle: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn create(&mut self) -> Result<()> {
        let request = xml::snapshot_xml(&self.name);
        debug!(snapshot = %self.name, "Requesting domain snapshot");
        self.handle = Some(self.domain.snapshot_create(&request)?);
        info!(snapshot = %self.name, "Domain snapshot created");
        Ok(())
    }

    pub(crate) fn convert_to_raw(&self, destination: &Path) -> Result<()> {
        let size_hint = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = self.source_path.to_string_lossy();
        let dest = destination.to_string_lossy();

        info!(
            snapshot = %self.name,
            destination = %destination.display(),
            format = %self.format,
            "Converting snapshot to raw"
        );
        self.executor.execute(
            &[
                "qemu-img",
                "convert",
                "-f",
                self.format.as_str(),
                "-O",
                "raw",
                "-s",
                &size_hint,
                source.as_ref(),
                dest.as_ref(),
            ],
            true,
        )?;
        Ok(())
    }

    pub(crate) fn delete(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                debug!(snapshot = %self.name, "Deleting domain snapshot");
                handle.delete()
            }
            None => Err(StorageError::Precondition(
                "snapshot has not been created".into(),
            )),
        }
    }
}
