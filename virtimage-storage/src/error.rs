//! Error types for the image backend layer.

use thiserror::Error;

use crate::exec::ExecError;

/// Errors that can occur during image and snapshot operations.
///
/// Collaborator failures are passed through, not rewritten: `Exec` exposes
/// the structured tool failure as-is so callers can inspect the root cause.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The configured storage backend name is not recognized.
    #[error("no image driver found for local_images_type: {0}")]
    Configuration(String),

    /// An operation was refused because its precondition does not hold.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An external tool exited with a nonzero status or failed to spawn.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// An inspector tool produced output this layer cannot interpret.
    #[error("unexpected {tool} output: {detail}")]
    Parse {
        /// Tool whose output failed to parse.
        tool: &'static str,
        /// What was wrong with the output.
        detail: String,
    },

    /// A hypervisor control library call failed.
    #[error("hypervisor operation failed: {0}")]
    Hypervisor(String),

    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for image backend operations.
pub type Result<T> = std::result::Result<T, StorageError>;
