//! twlinst library
//!
//! Installs the running live system onto a target disk: partitions it,
//! creates a LUKS2 root volume, copies the live tree across and configures
//! the bootloader, initramfs and accounts inside the new root. Progress is
//! reported on a bounded event channel that any front end can observe.

pub mod catalog;
pub mod chroot;
pub mod cli;
pub mod disks;
pub mod error;
pub mod install_state;
pub mod paths;
pub mod pipeline;
pub mod process_guard;
pub mod progress;
pub mod request;
pub mod runner;
pub mod steps;

#[cfg(test)]
mod test_support;

// Re-export main types for convenience
pub use catalog::{OptionalPackage, PackageCatalog};
pub use disks::{Disk, DiskInventory, Partition, byte_count_decimal};
pub use error::InstallError;
pub use install_state::{InstallStage, InstallTransitionError, InstallerContext};
pub use paths::InstallPaths;
pub use pipeline::{InstallHandle, InstallOutcome, start_install};
pub use process_guard::{ChildRegistry, CommandProcessGroup, InterruptPolicy, ProcessGuard};
pub use progress::{ProgressEvent, ProgressObserver, ProgressReceiver, ProgressSender, Transcript};
pub use request::{InstallationRequest, Passphrase, RequestConfig};
pub use runner::{CommandRunner, Invocation, StreamMode, SystemRunner};
#[cfg(feature = "test-support")]
pub use runner::RecordingRunner;
pub use steps::InstallStep;
