//! Flat raw file images.
//!
//! The simplest backend: instance disks are whole-file copies of their base
//! image, stored under the per-instance directory.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::domain::Domain;
use crate::error::Result;
use crate::exec::Executor;
use crate::image::snapshot::LibvirtSnapshot;
use crate::image::types::{DeviceType, DiskFormat, ImageInfo, SourceType};
use crate::image::{delete_file_image, file_disk_paths, file_image_path};

/// Factory and metadata provider for raw file images.
pub struct RawImageDriver {
    instances_path: PathBuf,
    executor: Arc<dyn Executor>,
}

impl RawImageDriver {
    /// Create a driver rooted at the given instances directory.
    pub fn new(instances_path: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            instances_path: instances_path.into(),
            executor,
        }
    }

    /// Construct a raw image following the file naming convention. Touches
    /// no storage.
    pub fn create_image(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> RawImage {
        let path = file_image_path(&self.instances_path, instance_id, image_name, suffix);
        RawImage::new(path, Arc::clone(&self.executor))
    }

    /// Wrap every file-backed disk of the domain in a [`RawImage`].
    pub fn list_images(&self, domain: &dyn Domain) -> Result<Vec<RawImage>> {
        Ok(file_disk_paths(domain)?
            .into_iter()
            .map(|path| RawImage::new(path, Arc::clone(&self.executor)))
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
            driver_type: DiskFormat::Raw,
            disk: file_image_path(&self.instances_path, instance_id, image_name, suffix),
        }
    }
}

/// One raw file image.
pub struct RawImage {
    path: PathBuf,
    executor: Arc<dyn Executor>,
}

impl RawImage {
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

    /// Materialize the image as a byte copy of `base`.
    #[instrument(skip(self, base), fields(path = %self.path.display(), base = %base.display()))]
    pub fn create_from_raw(&self, base: &std::path::Path) -> Result<()> {
        let base_s = base.to_string_lossy();
        let path_s = self.path.to_string_lossy();
        info!("Copying base image");
        self.executor
            .execute(&["cp", base_s.as_ref(), path_s.as_ref()], false)?;
        Ok(())
    }

    /// Best-effort delete: a failure (including an already-missing file) is
    /// logged and swallowed.
    pub fn delete(&self) -> Result<()> {
        delete_file_image(&self.path);
        Ok(())
    }

    /// Build a (not yet created) hypervisor snapshot of this image.
    pub fn make_snapshot<'d>(&self, domain: &'d dyn Domain, snapshot_name: &str) -> RawSnapshot<'d> {
        RawSnapshot {
            inner: LibvirtSnapshot::new(
                domain,
                snapshot_name,
                self.path.clone(),
                DiskFormat::Raw,
                Arc::clone(&self.executor),
            ),
        }
    }
}

/// Hypervisor-held snapshot of a raw image.
pub struct RawSnapshot<'d> {
    inner: LibvirtSnapshot<'d>,
}

impl RawSnapshot<'_> {
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
