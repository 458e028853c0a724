//! Image backends for instance disk storage.
//!
//! This module provides the per-format image, snapshot, and driver variants:
//! - **Raw**: flat files, byte-copied from the base image
//! - **Qcow**: qcow2 copy-on-write overlays of the base image
//! - **Lvm**: logical volumes under a configured volume group
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      select_driver(config)                      │
//! │   maps local_images_type to exactly one driver variant          │
//! └─────────────────────────┬───────────────────────────────────────┘
//!                           │
//!       ┌───────────────────┼───────────────────┐
//!       ▼                   ▼                   ▼
//! ┌───────────┐      ┌───────────┐       ┌───────────┐
//! │    Raw    │      │   Qcow    │       │    Lvm    │
//! │  Driver   │      │  Driver   │       │  Driver   │
//! └─────┬─────┘      └─────┬─────┘       └─────┬─────┘
//!       │ creates/lists    │                   │
//!       ▼                  ▼                   ▼
//!     Image  ──make_snapshot──▶  Snapshot ──scoped──▶ SnapshotGuard
//! ```
//!
//! The driver is selected once at configuration time; images and snapshots
//! are closed variant sets dispatched statically per format.

mod lvm;
mod qcow;
mod raw;
mod snapshot;
mod types;

pub use lvm::{LvmImage, LvmImageDriver, LvmSnapshot};
pub use qcow::{QcowImage, QcowImageDriver, QcowSnapshot};
pub use raw::{RawImage, RawImageDriver, RawSnapshot};
pub use snapshot::{Snapshot, SnapshotGuard};
pub use types::{DeviceType, DiskFormat, ImageInfo, SourceType};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::error;

use crate::config::ImagesConfig;
use crate::domain::Domain;
use crate::error::{Result, StorageError};
use crate::exec::{Executor, SystemExecutor};

/// Select the image driver for the configured storage backend.
///
/// Pure and deterministic: `raw`, `qcow`, and `lvm` map to their driver
/// variants; `legacy` defers to `use_cow_images`; anything else is a
/// configuration error naming the value. Commands run through a
/// [`SystemExecutor`].
pub fn select_driver(config: &ImagesConfig) -> Result<ImageDriver> {
    select_driver_with(config, Arc::new(SystemExecutor::new()))
}

/// [`select_driver`] with an injected executor.
pub fn select_driver_with(
    config: &ImagesConfig,
    executor: Arc<dyn Executor>,
) -> Result<ImageDriver> {
    let driver = match config.local_images_type.as_str() {
        "raw" => ImageDriver::Raw(RawImageDriver::new(&config.instances_path, executor)),
        "qcow" => ImageDriver::Qcow(QcowImageDriver::new(&config.instances_path, executor)),
        "lvm" => ImageDriver::Lvm(LvmImageDriver::new(&config.lvm_volume_group, executor)),
        "legacy" => {
            if config.use_cow_images {
                ImageDriver::Qcow(QcowImageDriver::new(&config.instances_path, executor))
            } else {
                ImageDriver::Raw(RawImageDriver::new(&config.instances_path, executor))
            }
        }
        other => return Err(StorageError::Configuration(other.to_string())),
    };
    Ok(driver)
}

/// Image driver variant, selected once per process.
///
/// Stateless beyond its naming configuration: it builds [`Image`] values
/// with the format's naming convention, enumerates a domain's images, and
/// reports attachment metadata.
pub enum ImageDriver {
    /// Flat raw files under the instances directory.
    Raw(RawImageDriver),
    /// Qcow2 overlays under the instances directory.
    Qcow(QcowImageDriver),
    /// Logical volumes under the configured volume group.
    Lvm(LvmImageDriver),
}

impl ImageDriver {
    /// Construct an image for the instance following this format's naming
    /// convention. Touches no storage.
    pub fn create_image(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> Image {
        match self {
            ImageDriver::Raw(driver) => {
                Image::Raw(driver.create_image(instance_id, image_name, suffix))
            }
            ImageDriver::Qcow(driver) => {
                Image::Qcow(driver.create_image(instance_id, image_name, suffix))
            }
            ImageDriver::Lvm(driver) => {
                Image::Lvm(driver.create_image(instance_id, image_name, suffix))
            }
        }
    }

    /// Wrap each disk of the domain that has a source in this format's
    /// image variant, in device order, without deduplication.
    pub fn list_images(&self, domain: &dyn Domain) -> Result<Vec<Image>> {
        match self {
            ImageDriver::Raw(driver) => Ok(driver
                .list_images(domain)?
                .into_iter()
                .map(Image::Raw)
                .collect()),
            ImageDriver::Qcow(driver) => Ok(driver
                .list_images(domain)?
                .into_iter()
                .map(Image::Qcow)
                .collect()),
            ImageDriver::Lvm(driver) => Ok(driver
                .list_images(domain)?
                .into_iter()
                .map(Image::Lvm)
                .collect()),
        }
    }

    /// Attachment metadata for the named image; pure data, no I/O.
    pub fn image_info(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> ImageInfo {
        match self {
            ImageDriver::Raw(driver) => driver.image_info(instance_id, image_name, suffix),
            ImageDriver::Qcow(driver) => driver.image_info(instance_id, image_name, suffix),
            ImageDriver::Lvm(driver) => driver.image_info(instance_id, image_name, suffix),
        }
    }
}

/// One on-disk image artifact in its format variant.
pub enum Image {
    /// Flat raw file.
    Raw(RawImage),
    /// Qcow2 copy-on-write file.
    Qcow(QcowImage),
    /// Logical volume.
    Lvm(LvmImage),
}

impl Image {
    /// Location of the backing storage; stable and unique per image.
    pub fn path(&self) -> &Path {
        match self {
            Image::Raw(image) => image.path(),
            Image::Qcow(image) => image.path(),
            Image::Lvm(image) => image.path(),
        }
    }

    /// Whether the backing storage exists.
    pub fn exists(&self) -> bool {
        match self {
            Image::Raw(image) => image.exists(),
            Image::Qcow(image) => image.exists(),
            Image::Lvm(image) => image.exists(),
        }
    }

    /// Materialize the image from a raw base image.
    pub fn create_from_raw(&self, base: &Path) -> Result<()> {
        match self {
            Image::Raw(image) => image.create_from_raw(base),
            Image::Qcow(image) => image.create_from_raw(base),
            Image::Lvm(image) => image.create_from_raw(base),
        }
    }

    /// Delete the backing storage.
    pub fn delete(&self) -> Result<()> {
        match self {
            Image::Raw(image) => image.delete(),
            Image::Qcow(image) => image.delete(),
            Image::Lvm(image) => image.delete(),
        }
    }

    /// Build a (not yet created) snapshot of this image.
    ///
    /// `force_live` permits snapshotting a running domain where the format
    /// would otherwise refuse; file-backed formats ignore it.
    pub fn make_snapshot<'d>(
        &self,
        domain: &'d dyn Domain,
        snapshot_name: &str,
        force_live: bool,
    ) -> Result<Snapshot<'d>> {
        match self {
            Image::Raw(image) => Ok(Snapshot::Raw(image.make_snapshot(domain, snapshot_name))),
            Image::Qcow(image) => Ok(Snapshot::Qcow(image.make_snapshot(domain, snapshot_name))),
            Image::Lvm(image) => Ok(Snapshot::Lvm(image.make_snapshot(
                domain,
                snapshot_name,
                force_live,
            )?)),
        }
    }
}

/// Path of a file-backed image: `<root>/<instance>/<image_name><suffix>`.
fn file_image_path(
    root: &Path,
    instance_id: &str,
    image_name: Option<&str>,
    suffix: Option<&str>,
) -> PathBuf {
    let mut path = root.join(instance_id);
    if let Some(image_name) = image_name {
        path.push(image_name);
    }
    if let Some(suffix) = suffix {
        let mut raw = path.into_os_string();
        raw.push(suffix);
        path = PathBuf::from(raw);
    }
    path
}

/// Sources of the domain's disks, skipping devices without one.
fn file_disk_paths(domain: &dyn Domain) -> Result<Vec<PathBuf>> {
    Ok(domain
        .disk_sources()?
        .into_iter()
        .filter_map(|disk| disk.source.map(PathBuf::from))
        .collect())
}

/// Best-effort removal of a file-backed image.
fn delete_file_image(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        error!(path = %path.display(), error = %err, "Error during image delete");
    }
}
