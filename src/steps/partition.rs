//! Format disk: partition table, LUKS root volume and filesystems

use super::StepContext;
use crate::disks::{BLOCK_SIZE, byte_count_decimal};
use crate::error::{InstallError, Result};
use crate::progress::ProgressSender;
use crate::runner::{CommandRunner, Invocation, StreamMode};

pub const BOOT_MIB: u64 = 256;
pub const METADATA_MIB: u64 = 64;

const MIB: u64 = 1024 * 1024;

pub const BOOT_BLOCKS: u64 = BOOT_MIB * MIB / BLOCK_SIZE;
pub const METADATA_BLOCKS: u64 = METADATA_MIB * MIB / BLOCK_SIZE;
/// Left unallocated at the end of the disk.
pub const RESERVED_BLOCKS: u64 = 128;
/// Smallest root partition accepted (1 MiB).
pub const MIN_ROOT_BLOCKS: u64 = MIB / BLOCK_SIZE;

const FIXED_BLOCKS: u64 = BOOT_BLOCKS + METADATA_BLOCKS + RESERVED_BLOCKS;

/// Partition boundaries for one disk, in parted's MiB units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub total_blocks: u64,
    pub root_blocks: u64,
    pub root_mib: u64,
}

impl PartitionLayout {
    pub fn compute(total_blocks: u64) -> Result<Self> {
        let required = FIXED_BLOCKS + MIN_ROOT_BLOCKS;
        if total_blocks < required {
            return Err(InstallError::DiskTooSmall {
                blocks: total_blocks,
                required,
            });
        }
        let root_blocks = total_blocks - FIXED_BLOCKS;
        Ok(Self {
            total_blocks,
            root_blocks,
            root_mib: root_blocks * BLOCK_SIZE / MIB,
        })
    }

    /// `(start, end)` of the boot partition.
    pub fn boot(&self) -> (u64, u64) {
        (1, BOOT_MIB)
    }

    /// `(start, end)` of the encrypted root partition.
    pub fn root(&self) -> (u64, u64) {
        let start = 1 + BOOT_MIB;
        (start, start + self.root_mib)
    }

    /// `(start, end)` of the metadata partition.
    pub fn metadata(&self) -> (u64, u64) {
        let (_, start) = self.root();
        (start, start + METADATA_MIB)
    }

    pub fn root_bytes(&self) -> u64 {
        self.root_blocks * BLOCK_SIZE
    }

    /// Arguments for `parted` after the disk path.
    pub fn parted_args(&self) -> Vec<String> {
        let (boot_start, boot_end) = self.boot();
        let (root_start, root_end) = self.root();
        let (meta_start, meta_end) = self.metadata();
        let mut args: Vec<String> = ["mklabel", "msdos", "mkpart", "p", "ext4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend([boot_start.to_string(), boot_end.to_string()]);
        args.extend(["mkpart".into(), "p".into(), root_start.to_string(), root_end.to_string()]);
        args.extend(["mkpart".into(), "p".into(), meta_start.to_string(), meta_end.to_string()]);
        args.extend(["set", "1", "boot", "on"].iter().map(|s| s.to_string()));
        args
    }
}

fn mkfs(label: &str, device: &str) -> Invocation {
    Invocation::new(label, "mkfs.ext4").args(["-qF", device])
}

pub(super) fn run(ctx: &StepContext<'_>) -> Result<()> {
    let disk = ctx.request.disk();
    let layout = PartitionLayout::compute(disk.num_blocks)?;
    let boot = disk.partition_path(1);
    let luks = disk.partition_path(2);
    let metadata = disk.partition_path(3);
    let mapper = ctx.paths.mapper_device().display().to_string();
    let passphrase = ctx.request.passphrase().expose().as_bytes();

    ctx.bus.info(format!("Partitioning {:?}", disk.path));
    ctx.bus.info(format!(
        "Device has a capacity of {}",
        byte_count_decimal(disk.capacity_bytes())
    ));
    ctx.bus.info("");
    ctx.bus.info("  New partition table:");
    ctx.bus.info(format!(
        "    [EXT4]  Boot partition ({})",
        byte_count_decimal(BOOT_MIB * 1000 * 1000)
    ));
    ctx.bus.info(format!(
        "    [LUKS]  Encrypted root partition ({})",
        byte_count_decimal(layout.root_bytes())
    ));
    ctx.bus.info(format!(
        "    [EXT4]  Encrypted metadata partition ({})",
        byte_count_decimal(METADATA_MIB * 1000 * 1000)
    ));
    log::info!("partitioning {} with root {} MiB", disk.path, layout.root_mib);

    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Parted", "parted")
            .args(["--script", disk.path.as_str()])
            .args(layout.parted_args()),
    )?;
    ctx.paths.settle(1);

    ctx.runner
        .run(ctx.bus, &Invocation::new("Probing", "partprobe").arg(&disk.path))?;
    ctx.paths.settle(3);

    ctx.runner.run(ctx.bus, &mkfs("Boot filesystem", &boot))?;

    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Encrypting", "cryptsetup")
            .args(["luksFormat", "--type", "luks2", luks.as_str(), "--key-file", "-"])
            .args(["--hash", "sha256", "--cipher", "aes-xts-plain64", "--key-size", "512"])
            .args(["--iter-time", "2600", "--use-random"])
            .stdin(passphrase),
    )?;
    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Unlocking", "cryptsetup")
            .args(["luksOpen", "--key-file", "-", luks.as_str(), crate::paths::MAPPER_NAME])
            .stdin(passphrase),
    )?;

    if ctx.request.scrub() {
        scrub(ctx, &mapper)?;
    }

    ctx.runner.run(ctx.bus, &mkfs("Root filesystem", &mapper))?;
    ctx.runner.run(ctx.bus, &mkfs("Metadata filesystem", &metadata))?;
    Ok(())
}

/// Fill the unlocked volume with zeroes through the cipher.
fn scrub(ctx: &StepContext<'_>, mapper: &str) -> Result<()> {
    ctx.bus.info("");
    ctx.bus.info("  Scrubbing encrypted partition:");
    scrub_with(ctx.runner, ctx.bus, &scrub_invocation(mapper))
}

/// `dd if=/dev/zero of=<target> bs=1M status=progress`, with untranslated
/// messages so the end of the device can be recognised.
pub fn scrub_invocation(target: &str) -> Invocation {
    Invocation::new("Scrub", "dd")
        .args([
            "if=/dev/zero".to_string(),
            format!("of={}", target),
            "bs=1M".to_string(),
            "status=progress".to_string(),
        ])
        .c_locale()
}

/// Stream `dd` onto the bus. `dd` only stops when the device is full, so
/// that failure is the expected way for it to finish.
pub fn scrub_with(runner: &dyn CommandRunner, bus: &ProgressSender, dd: &Invocation) -> Result<()> {
    match runner.run_interactive(bus, dd, StreamMode::Progress) {
        Err(e) if e.is_device_full() => {
            log::info!("scrub finished at end of device: {}", dd.command_line());
            Ok(())
        }
        other => other,
    }
}
