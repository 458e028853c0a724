//! Type definitions for image attachment metadata.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// On-disk format tag of an image artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Flat raw bytes.
    Raw,
    /// QCOW2 copy-on-write file.
    Qcow2,
}

impl DiskFormat {
    /// The tag as qemu-img and libvirt spell it.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device class the hypervisor should use when attaching an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// File-backed disk device.
    File,
    /// Block device.
    Block,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::File => "file",
            DeviceType::Block => "block",
        }
    }
}

/// Source class of the disk in domain XML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// `<source file='...'/>`
    File,
    /// `<source dev='...'/>`
    Dev,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Dev => "dev",
        }
    }
}

/// How the hypervisor should attach one image.
///
/// Pure data derived from the format's naming convention; producing it does
/// no I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Device class: file or block.
    pub device_type: DeviceType,
    /// Source class in domain XML.
    pub source_type: SourceType,
    /// On-disk format tag.
    pub driver_type: DiskFormat,
    /// Resolved path of the image.
    pub disk: PathBuf,
}
