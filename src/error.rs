//! Error handling module for the installer
//!
//! Every failure a pipeline step can hit is one of these variants. Steps
//! return them unchanged to the pipeline driver, which reports exactly one
//! error event and stops.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Main error type for the installer library
#[derive(Error, Debug)]
pub enum InstallError {
    /// Disk enumeration failed or a tool produced malformed structured output
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// An external tool could not be started
    #[error("{program}: failed to start: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external tool ran and exited unsuccessfully
    #[error("{label}: {program} failed ({status}){}", format_output(.output))]
    Command {
        /// Label of the invocation, as echoed on the progress bus
        label: String,
        program: String,
        status: ExitStatus,
        /// Combined output, or the trailing stderr lines for streamed commands
        output: String,
    },

    /// Writing or reading a file the pipeline owns failed
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The target disk cannot hold the fixed partitions
    #[error(
        "Disk too small: {blocks} blocks available, at least {required} blocks required"
    )]
    DiskTooSmall { blocks: u64, required: u64 },

    /// No `vmlinuz-<version>` image was found in the boot tree
    #[error("could not determine current kernel (no vmlinuz-* in {})", .0.display())]
    KernelNotFound(PathBuf),

    /// The installation request is incomplete or malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// The pipeline tried to enter a stage out of order or unconfirmed
    #[error(transparent)]
    Transition(#[from] crate::install_state::InstallTransitionError),
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl InstallError {
    /// Create an inventory error
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Wrap an I/O error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when a tool failed because the target device ran out of space.
    ///
    /// Zero-filling a volume ends this way when it succeeds.
    pub fn is_device_full(&self) -> bool {
        match self {
            Self::Command { output, .. } => output.contains("No space left on device"),
            _ => false,
        }
    }
}
