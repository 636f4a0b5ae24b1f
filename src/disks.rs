//! Disk inventory
//!
//! Enumerates whole-disk block devices with `lsblk`, fills in per-device and
//! per-partition metadata from `udevadm`, and reads block counts from sysfs.
//! The result is an immutable [`DiskInventory`] that is scanned once at
//! startup and then only read.
//!
//! # Failure Policy
//!
//! - `lsblk` not runnable or emitting malformed JSON: the scan fails
//! - `udevadm` failing for a whole disk: the scan fails
//! - `udevadm` failing for partition N: end of the partition list

use crate::error::{InstallError, Result};
use crate::process_guard::CommandProcessGroup;
use serde::{Deserialize, Serialize};
use std::fs;
use std::process::Command;

/// Size of one block as counted by `/sys/class/block/<dev>/size`.
pub const BLOCK_SIZE: u64 = 512;

/// Highest partition number probed on each disk.
pub const MAX_PARTITIONS: u32 = 11;

/// One physical block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Disk {
    /// Kernel name (e.g. `sda`)
    pub name: String,
    /// Device node (e.g. `/dev/sda`)
    pub path: String,
    pub model: String,
    pub serial: String,
    pub bus: String,
    pub revision: String,
    pub symlinks: Vec<String>,
    /// `dos`, `gpt`, or empty when unpartitioned
    pub part_table_type: String,
    pub part_table_uuid: String,
    /// Filesystem carried by the whole device, if any
    pub fs_type: String,
    pub fs_label: String,
    pub fs_uuid: String,
    pub major: u32,
    pub minor: u32,
    /// Capacity in [`BLOCK_SIZE`] units
    pub num_blocks: u64,
    /// Partitions in number order, only for whole disks
    pub partitions: Vec<Partition>,
}

/// One partition of a [`Disk`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// 1-based partition number
    pub number: u32,
    pub name: String,
    pub path: String,
    pub fs_type: String,
    pub fs_label: String,
    pub fs_uuid: String,
    pub major: u32,
    pub minor: u32,
    /// Capacity in [`BLOCK_SIZE`] units, when sysfs could be read
    pub num_blocks: Option<u64>,
}

impl Disk {
    /// True for the zero value returned by failed lookups.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.num_blocks.saturating_mul(BLOCK_SIZE)
    }

    /// Device path of partition `number` on this disk.
    pub fn partition_path(&self, number: u32) -> String {
        partition_path(&self.path, number)
    }

    /// One-line description used in disk choice lists.
    pub fn summary(&self) -> String {
        format!(
            "{} ({}) - {} bus, {} partition table",
            self.path, self.model, self.bus, self.part_table_type
        )
    }
}

/// Build the device path of partition `number` of the disk at `disk_path`.
///
/// `/dev/sda` becomes `/dev/sda1`. Disks whose name ends in a digit
/// (`/dev/nvme0n1`, `/dev/loop0`, `/dev/mmcblk0`) get a `p` separator.
pub fn partition_path(disk_path: &str, number: u32) -> String {
    if disk_path.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk_path, number)
    } else {
        format!("{}{}", disk_path, number)
    }
}

/// Format a byte count with SI prefixes and one decimal place.
///
/// `999` → `"999 B"`, `1000` → `"1.0 kB"`, `1500000` → `"1.5 MB"`.
pub fn byte_count_decimal(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['k', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, prefix)
}

// ============================================================================
// Inventory
// ============================================================================

/// Disks found by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskInventory {
    disks: Vec<Disk>,
}

impl DiskInventory {
    /// Build an inventory from already-known descriptors.
    pub fn from_disks(disks: Vec<Disk>) -> Self {
        Self { disks }
    }

    /// All disks in enumeration order.
    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    /// Look up a disk by device path.
    ///
    /// Anything after the first space is ignored, so a choice-list label
    /// (see [`Disk::summary`]) can be passed directly. Returns the zero value
    /// when nothing matches; check [`Disk::is_empty`].
    pub fn get(&self, path: &str) -> Disk {
        let path = path.split(' ').next().unwrap_or_default();
        self.disks
            .iter()
            .find(|d| d.path == path)
            .cloned()
            .unwrap_or_default()
    }
}

/// Source of raw device information, so scans can run against canned output.
pub trait DeviceProbe {
    /// Output of `lsblk -Jadp`.
    fn list_block_devices(&self) -> Result<String>;

    /// Output of `udevadm info -q all --name <path>`, or `None` when the
    /// tool ran but reported no such device.
    fn udev_info(&self, path: &str) -> Result<Option<String>>;

    /// Block count of the kernel device `name`.
    fn block_count(&self, name: &str) -> Result<u64>;
}

/// Probe backed by the live system's tools and sysfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn list_block_devices(&self) -> Result<String> {
        let output = Command::new("lsblk")
            .arg("-Jadp")
            .env("LC_ALL", "C")
            .in_new_process_group()
            .output()
            .map_err(|e| InstallError::inventory(format!("failed to run lsblk: {}", e)))?;
        if !output.status.success() {
            return Err(InstallError::inventory(format!(
                "lsblk failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn udev_info(&self, path: &str) -> Result<Option<String>> {
        let output = Command::new("udevadm")
            .args(["info", "-q", "all", "--name", path])
            .env("LC_ALL", "C")
            .in_new_process_group()
            .output()
            .map_err(|e| InstallError::inventory(format!("failed to run udevadm: {}", e)))?;
        if !output.status.success() {
            log::debug!("udevadm has no record for {}", path);
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn block_count(&self, name: &str) -> Result<u64> {
        let size_path = format!("/sys/class/block/{}/size", name);
        let raw = fs::read_to_string(&size_path).map_err(|e| InstallError::io(&size_path, e))?;
        raw.trim()
            .parse()
            .map_err(|e| InstallError::inventory(format!("{}: {}", size_path, e)))
    }
}

/// Scan the live system.
pub fn scan() -> Result<DiskInventory> {
    scan_with(&SystemProbe)
}

/// Scan using the given probe.
pub fn scan_with<P: DeviceProbe>(probe: &P) -> Result<DiskInventory> {
    let devices = parse_lsblk(&probe.list_block_devices()?)?;
    let mut disks = Vec::new();

    for dev in devices.into_iter().filter(|d| d.kind == "disk") {
        let info = probe.udev_info(&dev.name)?.ok_or_else(|| {
            InstallError::inventory(format!("udevadm has no record for {}", dev.name))
        })?;
        let mut disk = parse_udev_info(&dev.name, &info)?.into_disk();

        if disk.major != 0 {
            disk.partitions = probe_partitions(probe, &disk.path)?;
        }
        disk.num_blocks = probe.block_count(&disk.name)?;

        log::info!(
            "Found disk {} ({}), {} partition(s), {}",
            disk.path,
            disk.model,
            disk.partitions.len(),
            byte_count_decimal(disk.capacity_bytes())
        );
        disks.push(disk);
    }

    Ok(DiskInventory::from_disks(disks))
}

fn probe_partitions<P: DeviceProbe>(probe: &P, disk_path: &str) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    for number in 1..=MAX_PARTITIONS {
        let path = partition_path(disk_path, number);
        let Some(info) = probe.udev_info(&path)? else {
            break;
        };
        let record = parse_udev_info(&path, &info)?;
        if record.partn == 0 {
            continue;
        }
        let mut part = record.into_partition();
        part.num_blocks = probe.block_count(&part.name).ok();
        partitions.push(part);
    }
    Ok(partitions)
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

/// One entry of `lsblk -Jadp`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Parse `lsblk -Jadp` output.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let out: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| InstallError::inventory(format!("malformed lsblk output: {}", e)))?;
    Ok(out.blockdevices)
}

/// Fields of one `udevadm info -q all` record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdevRecord {
    pub path: String,
    pub name: String,
    pub symlinks: Vec<String>,
    pub model: String,
    pub serial: String,
    pub revision: String,
    pub bus: String,
    pub part_table_type: String,
    pub part_table_uuid: String,
    pub fs_type: String,
    pub fs_label: String,
    pub fs_uuid: String,
    pub major: u32,
    pub minor: u32,
    pub partn: u32,
}

impl UdevRecord {
    fn into_disk(self) -> Disk {
        Disk {
            name: self.name,
            path: self.path,
            model: self.model,
            serial: self.serial,
            bus: self.bus,
            revision: self.revision,
            symlinks: self.symlinks,
            part_table_type: self.part_table_type,
            part_table_uuid: self.part_table_uuid,
            fs_type: self.fs_type,
            fs_label: self.fs_label,
            fs_uuid: self.fs_uuid,
            major: self.major,
            minor: self.minor,
            num_blocks: 0,
            partitions: Vec::new(),
        }
    }

    fn into_partition(self) -> Partition {
        Partition {
            number: self.partn,
            name: self.name,
            path: self.path,
            fs_type: self.fs_type,
            fs_label: self.fs_label,
            fs_uuid: self.fs_uuid,
            major: self.major,
            minor: self.minor,
            num_blocks: None,
        }
    }
}

/// Parse the output of `udevadm info -q all --name <path>`.
pub fn parse_udev_info(path: &str, text: &str) -> Result<UdevRecord> {
    let mut rec = UdevRecord {
        path: path.to_string(),
        ..UdevRecord::default()
    };

    for line in text.lines() {
        if line.len() < 4 {
            continue;
        }
        if let Some(name) = line.strip_prefix("N: ") {
            rec.name = name.to_string();
        } else if let Some(link) = line.strip_prefix("S: ") {
            rec.symlinks.push(link.to_string());
        } else if let Some(prop) = line.strip_prefix("E: ") {
            let Some((key, value)) = prop.split_once('=') else {
                continue;
            };
            match key {
                "ID_MODEL" => rec.model = value.to_string(),
                "ID_SERIAL" => rec.serial = value.to_string(),
                "ID_REVISION" => rec.revision = value.to_string(),
                "ID_BUS" => rec.bus = value.to_string(),
                "ID_PART_TABLE_TYPE" => rec.part_table_type = value.to_string(),
                "ID_PART_TABLE_UUID" => rec.part_table_uuid = value.to_string(),
                "ID_FS_TYPE" => rec.fs_type = value.to_string(),
                "ID_FS_LABEL" => rec.fs_label = value.to_string(),
                "ID_FS_UUID" => rec.fs_uuid = value.to_string(),
                "MAJOR" => rec.major = parse_number(path, "major", value)?,
                "MINOR" => rec.minor = parse_number(path, "minor", value)?,
                "PARTN" => rec.partn = parse_number(path, "partN", value)?,
                _ => {}
            }
        }
    }

    Ok(rec)
}

fn parse_number(path: &str, what: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|e| InstallError::inventory(format!("{}: decoding {}: {}", path, what, e)))
}
