//! Narrow hypervisor-domain capability consumed by the image backend.
//!
//! The backend never owns a domain: it only needs to read the domain's disk
//! layout, check whether it is running, and create/delete named snapshots.
//! Everything else the hypervisor control library can do stays out of scope.

use crate::error::Result;

/// One disk device of a domain, as described by the hypervisor.
///
/// `source` is the backing location of the device: a file path for
/// file-backed disks, a device path for block-backed disks, or `None` for
/// devices with no media attached (an empty CD-ROM tray, for example).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSource {
    /// Backing file or device path, if any.
    pub source: Option<String>,
}

impl DiskSource {
    /// A disk backed by the given file or device path.
    pub fn backed_by(path: impl Into<String>) -> Self {
        Self {
            source: Some(path.into()),
        }
    }

    /// A disk device with no backing source.
    pub fn empty() -> Self {
        Self { source: None }
    }
}

/// Non-owning handle to a running (or defined) virtual machine.
///
/// Implementations wrap the hypervisor control library; the mock in
/// [`crate::mock`] stands in for it in tests.
pub trait Domain: Send + Sync {
    /// The domain's disk devices, in device order, not deduplicated.
    fn disk_sources(&self) -> Result<Vec<DiskSource>>;

    /// Whether the domain is currently running.
    fn is_active(&self) -> Result<bool>;

    /// Create a named snapshot from a `<domainsnapshot>` XML fragment and
    /// return the handle needed to delete it later.
    fn snapshot_create(&self, xml: &str) -> Result<Box<dyn SnapshotHandle>>;
}

/// Opaque hypervisor-held reference to a created snapshot.
///
/// Obtained from [`Domain::snapshot_create`]; this layer uses it only to
/// issue the matching delete call.
pub trait SnapshotHandle: Send + Sync {
    /// Delete the snapshot this handle refers to.
    fn delete(&self) -> Result<()>;
}
