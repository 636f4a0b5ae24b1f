//! Shared fixtures for unit tests.

use crate::disks::{Disk, DiskInventory};
use crate::progress::{ProgressEvent, ProgressSender, bus};
use crate::request::{InstallationRequest, Passphrase, RequestConfig};

/// Run `f` on a worker thread with a live bus, collecting every event.
pub fn with_bus<T: Send>(f: impl FnOnce(&ProgressSender) -> T + Send) -> (T, Vec<ProgressEvent>) {
    let (tx, rx) = bus();
    std::thread::scope(|s| {
        let handle = s.spawn(move || f(&tx));
        let events: Vec<ProgressEvent> = rx.collect();
        (handle.join().expect("worker thread"), events)
    })
}

pub fn sample_disk(num_blocks: u64) -> Disk {
    Disk {
        name: "sda".into(),
        path: "/dev/sda".into(),
        model: "QEMU_HARDDISK".into(),
        serial: "QM00001".into(),
        bus: "ata".into(),
        part_table_type: "dos".into(),
        major: 8,
        num_blocks,
        ..Disk::default()
    }
}

pub fn sample_config() -> RequestConfig {
    RequestConfig {
        disk: "/dev/sda".into(),
        passphrase: Passphrase::new("correct horse battery"),
        passphrase_confirm: None,
        username: "alice".into(),
        hostname: "twitchy-box".into(),
        timezone: "Europe/Berlin".into(),
        scrub: false,
        autologin: false,
        packages: vec![],
    }
}

pub fn request_from(config: RequestConfig, num_blocks: u64) -> InstallationRequest {
    config
        .resolve(&DiskInventory::from_disks(vec![sample_disk(num_blocks)]), None)
        .expect("sample request is valid")
}

pub fn sample_request() -> InstallationRequest {
    request_from(sample_config(), 20_000_000)
}

pub fn texts(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.text().map(str::to_string))
        .collect()
}
