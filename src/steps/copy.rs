//! Copy files: mount the new filesystems and copy the live tree onto them

use super::StepContext;
use crate::error::{InstallError, Result};
use crate::runner::Invocation;
use std::fs;
use std::path::Path;

/// Mount options for both ext4 filesystems while copying.
pub const EXT4_MOUNT_OPTIONS: &str =
    "noatime,nosuid,dirsync,journal_checksum,journal_ioprio=0,data=writeback,barrier=0,errors=remount-ro";

/// Top-level trees copied from the live system into the new root.
pub const ROOT_TREES: [&str; 14] = [
    "/bin", "/etc", "/home", "/lib", "/lib32", "/lib64", "/libx32", "/opt", "/root", "/sbin",
    "/srv", "/usr", "/var", "/deb-pkgs",
];

/// Empty mount points and scratch directories the new root needs.
const SYSTEM_DIRS: [&str; 8] = ["dev", "proc", "sys", "run", "media", "mnt", "tmp", "boot"];

/// `(path, major, minor)` of the device nodes needed before udev runs.
const DEVICE_NODES: [(&str, &str, &str); 2] = [("dev/console", "5", "1"), ("dev/null", "1", "3")];

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| InstallError::io(path, e))
}

fn mount_ext4(ctx: &StepContext<'_>, device: &str, target: &Path) -> Result<()> {
    ctx.bus.info(format!("Mounting {} -> {}", device, target.display()));
    ctx.bus.info(format!("    Opts: {:?}", EXT4_MOUNT_OPTIONS));
    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Mount", "mount")
            .args(["-t", "ext4", "-o", EXT4_MOUNT_OPTIONS, device])
            .arg(target.display().to_string()),
    )
}

pub(super) fn run(ctx: &StepContext<'_>) -> Result<()> {
    let paths = ctx.paths;
    let root = paths.root_mount();
    let boot = paths.boot_mount();
    for dir in [&paths.mount_base, &root, &boot] {
        create_dir(dir)?;
    }

    mount_ext4(ctx, &ctx.request.disk().partition_path(1), &boot)?;
    ctx.bus.info("Mounted boot fs.");
    paths.settle(3);

    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Boot files", "cp")
            .args(["-a", "--no-target-directory"])
            .arg(paths.in_source("/boot/boot").display().to_string())
            .arg(boot.display().to_string()),
    )?;

    mount_ext4(ctx, &paths.mapper_device().display().to_string(), &root)?;
    ctx.bus.info("Mounted root fs.");
    paths.settle(2);

    create_system_paths(ctx)?;

    for tree in ROOT_TREES {
        ctx.runner.run(
            ctx.bus,
            &Invocation::new("Root files", "cp")
                .arg("-a")
                .arg(paths.in_source(tree).display().to_string())
                .arg(paths.in_root(tree).display().to_string()),
        )?;
    }
    log::info!("copied {} trees into {}", ROOT_TREES.len(), root.display());
    Ok(())
}

fn create_system_paths(ctx: &StepContext<'_>) -> Result<()> {
    let dirs = SYSTEM_DIRS
        .iter()
        .map(|d| ctx.paths.in_root(d).display().to_string());
    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Create", "mkdir").arg("-p").args(dirs),
    )?;

    for (node, major, minor) in DEVICE_NODES {
        ctx.runner.run(
            ctx.bus,
            &Invocation::new("Mknod", "mknod")
                .args(["-m", "600"])
                .arg(ctx.paths.in_root(node).display().to_string())
                .args(["c", major, minor]),
        )?;
    }
    Ok(())
}
