//! End-to-end pipeline runs against a scratch directory
//!
//! Every external tool goes through a `RecordingRunner`, so these tests
//! exercise the real steps, the background thread and the progress bus
//! without touching a disk.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;
use twlinst::disks::{Disk, DiskInventory};
use twlinst::pipeline::{COMPLETION_MESSAGE, InstallOutcome, start_install};
use twlinst::progress::{LineKind, ProgressEvent, ProgressObserver, Transcript};
use twlinst::{InstallPaths, InstallStage, InstallationRequest, Passphrase, RecordingRunner, RequestConfig};

const BLOCKS: u64 = 20_000_000;

fn target_disk() -> Disk {
    Disk {
        name: "vda".into(),
        path: "/dev/vda".into(),
        model: "Virtio_Block_Device".into(),
        bus: "virtio".into(),
        part_table_type: "gpt".into(),
        major: 252,
        num_blocks: BLOCKS,
        ..Disk::default()
    }
}

fn request(scrub: bool) -> InstallationRequest {
    let config = RequestConfig {
        disk: "/dev/vda".into(),
        passphrase: Passphrase::new("hunter2hunter2"),
        passphrase_confirm: Some(Passphrase::new("hunter2hunter2")),
        username: "twl".into(),
        hostname: "lab-07".into(),
        timezone: "America/New_York".into(),
        scrub,
        autologin: false,
        packages: vec![],
    };
    config
        .resolve(&DiskInventory::from_disks(vec![target_disk()]), None)
        .expect("request resolves")
}

/// Scratch layout as it looks once the copy step has filled the mounts.
fn scratch() -> (TempDir, InstallPaths) {
    let tmp = TempDir::new().expect("tempdir");
    let paths = InstallPaths::scratch(tmp.path());
    fs::create_dir_all(paths.in_root("etc")).expect("root etc");
    fs::create_dir_all(paths.boot_mount().join("grub")).expect("boot grub");
    fs::write(paths.boot_mount().join("vmlinuz-6.1.0-18-amd64"), "kernel").expect("kernel");
    (tmp, paths)
}

fn uuids(runner: RecordingRunner) -> RecordingRunner {
    runner
        .respond("UUID /dev/vda1", "b007-0001\n")
        .respond("UUID /dev/vda2", "c0ffee00-luks\n")
}

struct Collector {
    events: Vec<ProgressEvent>,
    transcript: Transcript,
}

impl ProgressObserver for Collector {
    fn apply(&mut self, event: &ProgressEvent) {
        self.transcript.apply(event);
        self.events.push(event.clone());
    }
}

fn install(runner: Arc<RecordingRunner>, paths: InstallPaths, scrub: bool) -> (InstallOutcome, Collector) {
    let handle = start_install(request(scrub), runner, paths).expect("pipeline thread starts");
    let mut collector = Collector {
        events: Vec::new(),
        transcript: Transcript::new(),
    };
    let outcome = handle.wait_with(&mut collector);
    (outcome, collector)
}

fn count_kind(events: &[ProgressEvent], kind: LineKind) -> usize {
    events
        .iter()
        .filter(|e| e.line.as_ref().map(|l| l.kind) == Some(kind))
        .count()
}

#[test]
fn test_full_install_completes() {
    let (_tmp, paths) = scratch();
    let runner = Arc::new(uuids(RecordingRunner::new()));
    let (outcome, seen) = install(runner.clone(), paths.clone(), false);

    assert!(outcome.is_completed(), "{:?}", outcome);
    let steps: Vec<usize> = seen.events.iter().filter_map(|e| e.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
    assert_eq!(count_kind(&seen.events, LineKind::Error), 0);
    assert_eq!(
        seen.events.last().and_then(|e| e.text()),
        Some(COMPLETION_MESSAGE)
    );
    assert_eq!(seen.transcript.active_step(), Some(4));
    assert!(!seen.transcript.saw_error());

    let lines = runner.command_lines();
    assert!(lines[0].starts_with("parted --script /dev/vda mklabel msdos"));
    assert_eq!(
        lines[lines.len() - 2..],
        [
            format!("umount {}", paths.boot_mount().display()),
            format!("umount {}", paths.root_mount().display()),
        ]
    );
    assert!(!lines.iter().any(|l| l.starts_with("dd ")));

    let grub = fs::read_to_string(paths.boot_mount().join("grub/grub.cfg")).expect("grub.cfg");
    assert!(grub.contains("initrd  /initrd.img-6.1.0-18-amd64"));
    assert_eq!(
        fs::read_to_string(paths.in_root("etc/hostname")).expect("hostname"),
        "lab-07\n"
    );
}

#[test]
fn test_planned_table_for_twenty_million_blocks() {
    let (_tmp, paths) = scratch();
    let runner = Arc::new(uuids(RecordingRunner::new()));
    let (outcome, seen) = install(runner.clone(), paths, false);
    assert!(outcome.is_completed());

    assert!(runner.command_lines()[0].ends_with(
        "mkpart p ext4 1 256 mkpart p 257 9702 mkpart p 9702 9766 set 1 boot on"
    ));
    let text = seen.transcript.text();
    assert!(text.contains("Device has a capacity of 10.2 GB"));
    assert!(text.contains("[LUKS]  Encrypted root partition (9.9 GB)"));
    assert!(text.contains("[EXT4]  Boot partition (256.0 MB)"));
}

#[test]
fn test_first_failure_halts_with_one_error() {
    let (_tmp, paths) = scratch();
    let runner = Arc::new(uuids(
        RecordingRunner::new().fail_when("luksFormat", "Cannot format device /dev/vda2"),
    ));
    let (outcome, seen) = install(runner.clone(), paths.clone(), false);

    assert!(matches!(
        outcome,
        InstallOutcome::Failed {
            stage: InstallStage::Partitioning,
            ..
        }
    ));
    assert_eq!(count_kind(&seen.events, LineKind::Error), 1);
    assert!(seen.events.last().is_some_and(|e| e.is_error()));
    assert!(
        seen.events
            .last()
            .and_then(|e| e.text())
            .is_some_and(|t| t.starts_with("Error!: Encrypting: cryptsetup failed"))
    );
    let steps: Vec<usize> = seen.events.iter().filter_map(|e| e.step).collect();
    assert_eq!(steps, vec![1]);

    let lines = runner.command_lines();
    assert!(lines.last().is_some_and(|l| l.contains("luksFormat")));
    assert!(!lines.iter().any(|l| l.starts_with("mount ")));
}

#[test]
fn test_configure_failure_releases_chroot_mounts() {
    let (_tmp, paths) = scratch();
    let runner = Arc::new(uuids(
        RecordingRunner::new().fail_when("dpkg-reconfigure", "cryptsetup-initramfs not installed"),
    ));
    let (outcome, seen) = install(runner.clone(), paths.clone(), false);

    assert!(matches!(
        outcome,
        InstallOutcome::Failed {
            stage: InstallStage::Configuring,
            ..
        }
    ));
    assert_eq!(count_kind(&seen.events, LineKind::Error), 1);

    let root = paths.root_mount().display().to_string();
    let lines = runner.command_lines();
    let chroot_umounts: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with("umount ") && l.contains(&root))
        .collect();
    assert_eq!(chroot_umounts.len(), 6);
    assert_eq!(*chroot_umounts[0], format!("umount {}/boot", root));
    assert_eq!(*chroot_umounts[5], format!("umount {}/dev", root));
    // the cleanup step never ran
    assert!(!lines.contains(&format!("umount {}", paths.boot_mount().display())));
}

#[test]
fn test_scrub_until_device_full_is_success() {
    let (_tmp, paths) = scratch();
    let runner = Arc::new(uuids(RecordingRunner::new().fail_when(
        "of=/dev/mapper/cryptroot",
        "dd: error writing '/dev/mapper/cryptroot': No space left on device",
    )));
    let (outcome, _) = install(runner.clone(), paths, true);

    assert!(outcome.is_completed(), "{:?}", outcome);
    let lines = runner.command_lines();
    let dd = lines
        .iter()
        .position(|l| l.starts_with("dd "))
        .expect("dd ran");
    assert_eq!(lines[dd + 1], "mkfs.ext4 -qF /dev/mapper/cryptroot");
}

#[test]
fn test_passphrase_never_reaches_the_bus() {
    let (_tmp, paths) = scratch();
    let runner = Arc::new(uuids(RecordingRunner::new()));
    let (_, seen) = install(runner, paths, false);
    assert!(!seen.transcript.text().contains("hunter2"));
}
