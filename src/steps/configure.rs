//! Configure system: boot configuration, accounts and packages in the new root

use super::{StepContext, render, write_config_file};
use crate::chroot::ChrootSession;
use crate::error::{InstallError, Result};
use crate::paths::{DEFAULT_ACCOUNT, MAPPER_NAME};
use crate::runner::Invocation;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

const FSTAB_TEMPLATE: &str = include_str!("templates/fstab");
const GRUB_TEMPLATE: &str = include_str!("templates/grub.cfg");

/// Package cache as seen from inside the new root.
pub const CHROOT_PACKAGE_CACHE: &str = "/deb-pkgs";

const AUTOLOGIN_UNIT: &str = "/lib/systemd/system/autologin@.service";
const AUTOLOGIN_TTY1: &str = "/lib/systemd/system/getty.target.wants/autologin@tty1.service";

/// The installed kernel image in the boot partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub filename: String,
    pub version: String,
}

/// Find the first `vmlinuz-<version>` regular file in `boot`, by name.
pub fn find_kernel(boot: &Path) -> Result<KernelImage> {
    let entries = fs::read_dir(boot).map_err(|e| InstallError::io(boot, e))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    names
        .into_iter()
        .find_map(|name| {
            let version = name.strip_prefix("vmlinuz-")?.to_string();
            (!version.is_empty()).then_some(KernelImage {
                filename: name,
                version,
            })
        })
        .ok_or_else(|| InstallError::KernelNotFound(boot.to_path_buf()))
}

fn filesystem_uuid(ctx: &StepContext<'_>, device: &str) -> Result<String> {
    let out = ctx.runner.output(
        ctx.bus,
        &Invocation::new("UUID", "lsblk")
            .args(["--nodeps", "-nr", "-o", "UUID", device])
            .c_locale(),
    )?;
    let uuid = out.trim_matches(|c: char| c == ' ' || c == '\t' || c == '\r' || c == '\n');
    if uuid.is_empty() {
        return Err(InstallError::inventory(format!("{} has no filesystem UUID", device)));
    }
    Ok(uuid.to_string())
}

pub(super) fn run(ctx: &StepContext<'_>) -> Result<()> {
    let paths = ctx.paths;
    let disk = ctx.request.disk();
    let boot = paths.boot_mount();

    let boot_uuid = filesystem_uuid(ctx, &disk.partition_path(1))?;
    ctx.bus.info(format!("Boot UUID: {:?}", boot_uuid));
    let luks_uuid = filesystem_uuid(ctx, &disk.partition_path(2))?;
    ctx.bus.info(format!("LUKS UUID: {:?}", luks_uuid));

    let fstab = render(
        FSTAB_TEMPLATE,
        &[("FSTAB_DEV", luks_uuid.as_str()), ("BOOT_DEV", boot_uuid.as_str())],
    );
    write_config_file(ctx.bus, &paths.in_root("etc/fstab"), &fstab)?;
    write_config_file(
        ctx.bus,
        &paths.in_root("etc/crypttab"),
        &format!("{} UUID={} none luks,discard\n", MAPPER_NAME, luks_uuid),
    )?;

    let kernel = find_kernel(&boot)?;
    ctx.bus.info(format!(
        "Will boot kernel image at {:?} ({})",
        kernel.filename, kernel.version
    ));
    let grub = render(
        GRUB_TEMPLATE,
        &[
            ("KERN_IMG_FILENAME", kernel.filename.as_str()),
            ("K_VERS", kernel.version.as_str()),
            ("MAIN_PART_UUID", luks_uuid.as_str()),
            ("BOOT_PART_UUID", boot_uuid.as_str()),
        ],
    );
    write_config_file(ctx.bus, &boot.join("grub/grub.cfg"), &grub)?;

    write_config_file(ctx.bus, &paths.device_map, &format!("(hd0) {}", disk.path))?;
    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Bootloader", "grub-install")
            .arg("--no-floppy")
            .arg(format!("--grub-mkdevicemap={}", paths.device_map.display()))
            .arg(format!("--boot-directory={}", boot.display()))
            .arg(format!("--root-directory={}", paths.root_mount().display()))
            .arg(&disk.path),
    )?;
    ctx.bus.info("Finished installing bootloader (grub2).");

    write_config_file(
        ctx.bus,
        &paths.in_root("etc/hostname"),
        &format!("{}\n", ctx.request.hostname()),
    )?;

    configure_in_chroot(ctx)?;

    let timezone = ctx.request.timezone();
    write_config_file(ctx.bus, &paths.in_root("etc/timezone"), &format!("{}\n", timezone))?;
    ctx.runner.run(
        ctx.bus,
        &Invocation::new("Timezone", "cp")
            .arg(paths.zoneinfo.join(timezone).display().to_string())
            .arg(paths.in_root("etc/localtime").display().to_string()),
    )?;
    log::info!("configured {} for {}", ctx.request.hostname(), ctx.request.username());
    Ok(())
}

/// Everything that has to run inside the new root. The chroot mounts are
/// released when this returns, whatever the outcome.
fn configure_in_chroot(ctx: &StepContext<'_>) -> Result<()> {
    let session = ChrootSession::enter(
        ctx.runner,
        ctx.bus,
        &ctx.paths.root_mount(),
        &ctx.paths.boot_mount(),
    )?;
    let username = ctx.request.username();

    session.run_streaming(
        &session
            .command("Initramfs", "dpkg-reconfigure")
            .args(["--frontend=noninteractive", "cryptsetup-initramfs"]),
    )?;
    session.run_streaming(&session.command("Initramfs", "update-initramfs").args(["-u", "-v"]))?;

    ctx.bus.info("");
    ctx.bus.info("  Updating user account setup.");
    let passphrase = ctx.request.passphrase().expose();
    for account in [DEFAULT_ACCOUNT, "root"] {
        let entry = Zeroizing::new(format!("{}:{}\n", account, passphrase));
        session.run(
            &session
                .command("Password", "chpasswd")
                .args(["-c", "SHA512"])
                .stdin(entry.as_bytes()),
        )?;
    }

    if username != DEFAULT_ACCOUNT {
        ctx.bus
            .info(format!("Renaming {:?} -> {:?}.", DEFAULT_ACCOUNT, username));
        session.run_streaming(
            &session
                .command("Setup user", "usermod")
                .args(["--login", username, "--move-home", "--home"])
                .arg(format!("/home/{}", username))
                .arg(DEFAULT_ACCOUNT),
        )?;
        session.run_streaming(
            &session
                .command("Setup user group", "groupmod")
                .args(["--new-name", username, DEFAULT_ACCOUNT]),
        )?;
    }

    if ctx.request.autologin() {
        ctx.bus.info("");
        ctx.bus
            .info("  Switching getty@.service with autologin@.service.");
        session.run_streaming(
            &session
                .command("Setup autologin", "cp")
                .arg(ctx.paths.autologin_template.display().to_string())
                .arg(AUTOLOGIN_UNIT),
        )?;
        session.run_streaming(
            &session
                .command("Setup autologin", "ln")
                .args(["-s", "../autologin@.service", AUTOLOGIN_TTY1]),
        )?;
        session.run_streaming(
            &session
                .command("Setup autologin", "sed")
                .arg("-i")
                .arg(format!("s/USERNAME/{}/g", username))
                .arg(AUTOLOGIN_UNIT),
        )?;
    }

    for package in ctx.request.packages() {
        ctx.bus.info("");
        session.run_streaming(
            &session
                .command("Install", "bash")
                .arg("-c")
                .arg(format!("dpkg -i {}/{}/*.deb", CHROOT_PACKAGE_CACHE, package)),
        )?;
    }
    Ok(())
}
