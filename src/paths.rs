//! Fixed filesystem locations used by the installation pipeline.
//!
//! The defaults match the live image layout. Everything is overridable so
//! the pipeline can be pointed at a scratch directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Device-mapper name of the unlocked root volume.
pub const MAPPER_NAME: &str = "cryptroot";

/// Account shipped in the live image; renamed to the requested username.
pub const DEFAULT_ACCOUNT: &str = "twl";

/// Locations and timings the pipeline steps share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    /// Parent of the `root` and `boot` mount points
    pub mount_base: PathBuf,
    /// Root of the live tree that gets copied
    pub source_root: PathBuf,
    /// Where the device map for grub-install is written
    pub device_map: PathBuf,
    /// Optional package cache (`<cache>/<name>/*.deb`, `<cache>/<name>/meta.json`)
    pub package_cache: PathBuf,
    /// Timezone database on the live system
    pub zoneinfo: PathBuf,
    /// Autologin unit template, as seen from inside the new root
    pub autologin_template: PathBuf,
    /// Pause after operations that change the kernel's view of the disk
    pub settle: Duration,
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self {
            mount_base: PathBuf::from("/tmp/install_mounts"),
            source_root: PathBuf::from("/"),
            device_map: PathBuf::from("/tmp/device.map"),
            package_cache: PathBuf::from("/deb-pkgs"),
            zoneinfo: PathBuf::from("/usr/share/zoneinfo"),
            autologin_template: PathBuf::from("/usr/share/twlinst/autologin-template"),
            settle: Duration::from_secs(1),
        }
    }
}

impl InstallPaths {
    /// Layout rooted at `base` with no settle pauses, for scratch runs.
    pub fn scratch(base: &Path) -> Self {
        Self {
            mount_base: base.join("mounts"),
            source_root: base.join("live"),
            device_map: base.join("device.map"),
            package_cache: base.join("deb-pkgs"),
            zoneinfo: base.join("zoneinfo"),
            settle: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Mount point of the opened encrypted root.
    pub fn root_mount(&self) -> PathBuf {
        self.mount_base.join("root")
    }

    /// Mount point of the boot partition.
    pub fn boot_mount(&self) -> PathBuf {
        self.mount_base.join("boot")
    }

    /// Path of `rel` inside the mounted root. Leading slashes are ignored.
    pub fn in_root(&self, rel: &str) -> PathBuf {
        self.root_mount().join(rel.trim_start_matches('/'))
    }

    /// Path of `rel` inside the live source tree.
    pub fn in_source(&self, rel: &str) -> PathBuf {
        self.source_root.join(rel.trim_start_matches('/'))
    }

    /// Device node of the unlocked root volume.
    pub fn mapper_device(&self) -> PathBuf {
        Path::new("/dev/mapper").join(MAPPER_NAME)
    }

    /// Sleep for `factor` settle periods.
    pub fn settle(&self, factor: u32) {
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle * factor);
        }
    }
}
