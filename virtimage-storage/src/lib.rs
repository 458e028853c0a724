//! # virtimage Storage
//!
//! Disk-image backend layer for libvirt instance storage.
//!
//! This crate selects and drives one of three physical representations for
//! instance disk images — flat raw files, qcow2 copy-on-write files, or LVM
//! logical volumes — and produces point-in-time snapshots of those images
//! for backup or migration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          select_driver(config)          │
//! └─────────────────────┬───────────────────┘
//!                       │ once per process
//!                       ▼
//! ┌─────────────────────────────────────────┐
//! │  ImageDriver (Raw | Qcow | Lvm)         │
//! │  create_image / list_images / image_info│
//! └─────────────────────┬───────────────────┘
//!                       ▼
//!              Image ──▶ Snapshot ──▶ raw artifact
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use virtimage_storage::{select_driver, ImagesConfig};
//!
//! let config = ImagesConfig::default();
//! let driver = select_driver(&config)?;
//!
//! let image = driver.create_image("instance-0001", Some("disk"), None);
//! image.create_from_raw("/var/lib/virtimage/base/ubuntu.raw".as_ref())?;
//!
//! // Snapshot the image, export it, and release the snapshot on scope exit.
//! let guard = image.make_snapshot(&domain, "backup", false)?.scoped()?;
//! guard.convert_to_raw("/exports/backup.img".as_ref())?;
//! ```
//!
//! All operations are synchronous and blocking; concurrency is the caller's
//! responsibility, and at most one mutating operation per image identity may
//! be in flight at a time.

pub mod config;
pub mod domain;
pub mod error;
pub mod exec;
pub mod image;
pub mod mock;
pub mod xml;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use config::ImagesConfig;
pub use domain::{DiskSource, Domain, SnapshotHandle};
pub use error::{Result, StorageError};
pub use exec::{CmdOutput, ExecError, Executor, Retry, SystemExecutor};
pub use image::{
    select_driver, select_driver_with, DeviceType, DiskFormat, Image, ImageDriver, ImageInfo,
    LvmImage, LvmImageDriver, LvmSnapshot, QcowImage, QcowImageDriver, QcowSnapshot, RawImage,
    RawImageDriver, RawSnapshot, Snapshot, SnapshotGuard, SourceType,
};
pub use mock::{MockDomain, MockExecutor};

// Re-export libvirt adapter when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDomain;
