//! QCOW2 copy-on-write file images.
//!
//! Instance disks are thin qcow2 files whose unmodified blocks defer to the
//! shared base image registered as their backing file.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::domain::Domain;
use crate::error::Result;
use crate::exec::Executor;
use crate::image::snapshot::LibvirtSnapshot;
use crate::image::types::{DeviceType, DiskFormat, ImageInfo, SourceType};
use crate::image::{delete_file_image, file_disk_paths, file_image_path};

/// Cluster size used for new qcow2 images.
const QCOW_CLUSTER_SIZE: &str = "2M";

/// Factory and metadata provider for qcow2 images.
pub struct QcowImageDriver {
    instances_path: PathBuf,
    executor: Arc<dyn Executor>,
}

impl QcowImageDriver {
    /// Create a driver rooted at the given instances directory.
    pub fn new(instances_path: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            instances_path: instances_path.into(),
            executor,
        }
    }

    /// Construct a qcow2 image following the file naming convention.
    /// Touches no storage.
    pub fn create_image(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> QcowImage {
        let path = file_image_path(&self.instances_path, instance_id, image_name, suffix);
        QcowImage::new(path, Arc::clone(&self.executor))
    }

    /// Wrap every file-backed disk of the domain in a [`QcowImage`].
    pub fn list_images(&self, domain: &dyn Domain) -> Result<Vec<QcowImage>> {
        Ok(file_disk_paths(domain)?
            .into_iter()
            .map(|path| QcowImage::new(path, Arc::clone(&self.executor)))
            .collect())
    }

    /// Attachment metadata for an image of this format.
    pub fn image_info(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> ImageInfo {
        ImageInfo {
            device_type: DeviceType::File,
            source_type: SourceType::File,
            driver_type: DiskFormat::Qcow2,
            disk: file_image_path(&self.instances_path, instance_id, image_name, suffix),
        }
    }
}

/// One qcow2 image.
pub struct QcowImage {
    path: PathBuf,
    executor: Arc<dyn Executor>,
}

impl QcowImage {
    /// Wrap an existing or to-be-created image at `path`.
    pub fn new(path: PathBuf, executor: Arc<dyn Executor>) -> Self {
        Self { path, executor }
    }

    /// Location of the backing file; stable for the lifetime of the object.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Whether the backing file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Materialize the image as a copy-on-write overlay of `base`.
    ///
    /// The base stays registered as the backing file; no bytes are
    /// duplicated.
    #[instrument(skip(self, base), fields(path = %self.path.display(), base = %base.display()))]
    pub fn create_from_raw(&self, base: &std::path::Path) -> Result<()> {
        let options = format!(
            "cluster_size={},backing_file={}",
            QCOW_CLUSTER_SIZE,
            base.display()
        );
        let path_s = self.path.to_string_lossy();
        info!("Creating qcow2 overlay");
        self.executor.execute(
            &["qemu-img", "create", "-f", "qcow2", "-o", &options, path_s.as_ref()],
            false,
        )?;
        Ok(())
    }

    /// Best-effort delete: a failure (including an already-missing file) is
    /// logged and swallowed.
    pub fn delete(&self) -> Result<()> {
        delete_file_image(&self.path);
        Ok(())
    }

    /// Build a (not yet created) hypervisor snapshot of this image.
    pub fn make_snapshot<'d>(
        &self,
        domain: &'d dyn Domain,
        snapshot_name: &str,
    ) -> QcowSnapshot<'d> {
        QcowSnapshot {
            inner: LibvirtSnapshot::new(
                domain,
                snapshot_name,
                self.path.clone(),
                DiskFormat::Qcow2,
                Arc::clone(&self.executor),
            ),
        }
    }
}

/// Hypervisor-held snapshot of a qcow2 image.
pub struct QcowSnapshot<'d> {
    inner: LibvirtSnapshot<'d>,
}

impl QcowSnapshot<'_> {
    /// Snapshot name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Register the named snapshot with the hypervisor.
    pub fn create(&mut self) -> Result<()> {
        self.inner.create()
    }

    /// Convert the snapshot into a raw file at `destination`.
    pub fn convert_to_raw(&self, destination: &std::path::Path) -> Result<()> {
        self.inner.convert_to_raw(destination)
    }

    /// Delete the snapshot via the hypervisor-held handle.
    pub fn delete(&mut self) -> Result<()> {
        self.inner.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDomain, MockExecutor};
    use std::path::Path;

    fn driver() -> (QcowImageDriver, Arc<MockExecutor>) {
        let executor = Arc::new(MockExecutor::new());
        let driver = QcowImageDriver::new(
            "/var/lib/virtimage/instances",
            Arc::clone(&executor) as Arc<dyn Executor>,
        );
        (driver, executor)
    }

    #[test]
    fn test_create_image_matches_image_info() {
        let (driver, _) = driver();
        let image = driver.create_image("instance-0002", Some("disk"), None);
        let info = driver.image_info("instance-0002", Some("disk"), None);
        assert_eq!(image.path(), info.disk.as_path());
        assert_eq!(info.device_type, DeviceType::File);
        assert_eq!(info.source_type, SourceType::File);
        assert_eq!(info.driver_type, DiskFormat::Qcow2);
    }

    #[test]
    fn test_create_from_raw_registers_backing_file() {
        let (driver, executor) = driver();
        let image = driver.create_image("instance-0002", Some("disk"), None);
        image.create_from_raw(Path::new("/base/ubuntu.raw")).unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].argv,
            vec![
                "qemu-img",
                "create",
                "-f",
                "qcow2",
                "-o",
                "cluster_size=2M,backing_file=/base/ubuntu.raw",
                "/var/lib/virtimage/instances/instance-0002/disk",
            ]
        );
        assert!(!calls[0].run_as_root);
    }

    #[test]
    fn test_qcow_snapshot_converts_with_qcow2_format() {
        let (driver, executor) = driver();
        let domain = MockDomain::new();
        let image = driver.create_image("instance-0002", Some("disk"), None);

        let mut snapshot = image.make_snapshot(&domain, "backup");
        snapshot.create().unwrap();
        snapshot.convert_to_raw(Path::new("/tmp/backup.img")).unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].argv[2..4], ["-f".to_string(), "qcow2".to_string()]);
    }
}
