//! Scoped mounts and chroot sessions
//!
//! [`MountStack`] remembers every mount that succeeded and unmounts them in
//! reverse order when it goes out of scope, whether the scope ended normally,
//! through `?`, or by unwinding. Unmount failures are reported as warnings on
//! the progress bus and never replace the error that ended the scope.

use crate::error::Result;
use crate::progress::ProgressSender;
use crate::runner::{CommandRunner, Invocation, StreamMode};
use std::path::{Path, PathBuf};

/// Mounts made so far, released in reverse on drop.
pub struct MountStack<'a> {
    runner: &'a dyn CommandRunner,
    bus: &'a ProgressSender,
    mounted: Vec<PathBuf>,
}

impl<'a> MountStack<'a> {
    pub fn new(runner: &'a dyn CommandRunner, bus: &'a ProgressSender) -> Self {
        Self {
            runner,
            bus,
            mounted: Vec::new(),
        }
    }

    /// Run a mount invocation; on success `target` is unmounted later.
    pub fn mount(&mut self, invocation: Invocation, target: &Path) -> Result<()> {
        self.runner.run(self.bus, &invocation)?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    /// `mount -v --bind <source> <target>`
    pub fn bind(&mut self, source: &Path, target: &Path) -> Result<()> {
        let inv = Invocation::new("Chroot setup", "mount")
            .args(["-v", "--bind"])
            .arg(source.display().to_string())
            .arg(target.display().to_string());
        self.mount(inv, target)
    }

    /// `mount -vt <fstype> <fstype> <target> [-o <options>]`
    pub fn mount_virtual(&mut self, fstype: &str, target: &Path, options: Option<&str>) -> Result<()> {
        let mut inv = Invocation::new("Chroot setup", "mount")
            .args(["-vt", fstype, fstype])
            .arg(target.display().to_string());
        if let Some(options) = options {
            inv = inv.args(["-o", options]);
        }
        self.mount(inv, target)
    }
}

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        while let Some(target) = self.mounted.pop() {
            let inv = Invocation::new("Chroot teardown", "umount").arg(target.display().to_string());
            if let Err(e) = self.runner.run(self.bus, &inv) {
                log::warn!("failed to unmount {}: {}", target.display(), e);
                self.bus
                    .warn(format!("  Could not unmount {}: {}", target.display(), e));
            }
        }
    }
}

/// A prepared chroot: kernel filesystems and `/boot` mounted inside `root`.
///
/// Commands run through [`ChrootSession::command`] execute inside the new
/// root. Everything is unmounted when the session is dropped.
pub struct ChrootSession<'a> {
    root: PathBuf,
    runner: &'a dyn CommandRunner,
    bus: &'a ProgressSender,
    /// Released when the session is dropped.
    _mounts: MountStack<'a>,
}

impl<'a> ChrootSession<'a> {
    /// Mount `/dev`, `devpts`, `proc`, `sysfs`, a `tmpfs` on `/run` and bind
    /// `boot` onto `<root>/boot`.
    ///
    /// If any mount fails the ones already made are released before the
    /// error is returned.
    pub fn enter(
        runner: &'a dyn CommandRunner,
        bus: &'a ProgressSender,
        root: &Path,
        boot: &Path,
    ) -> Result<Self> {
        let mut mounts = MountStack::new(runner, bus);
        mounts.bind(Path::new("/dev"), &root.join("dev"))?;
        mounts.mount_virtual("devpts", &root.join("dev/pts"), Some("gid=5,mode=620"))?;
        mounts.mount_virtual("proc", &root.join("proc"), None)?;
        mounts.mount_virtual("sysfs", &root.join("sys"), None)?;
        mounts.mount_virtual("tmpfs", &root.join("run"), None)?;
        mounts.bind(boot, &root.join("boot"))?;

        Ok(Self {
            root: root.to_path_buf(),
            runner,
            bus,
            _mounts: mounts,
        })
    }

    /// `chroot <root> <program>`; add arguments with [`Invocation::args`].
    pub fn command(&self, label: &str, program: &str) -> Invocation {
        Invocation::new(label, "chroot")
            .arg(self.root.display().to_string())
            .arg(program)
    }

    pub fn run(&self, invocation: &Invocation) -> Result<()> {
        self.runner.run(self.bus, invocation)
    }

    pub fn run_streaming(&self, invocation: &Invocation) -> Result<()> {
        self.runner.run_interactive(self.bus, invocation, StreamMode::Lines)
    }
}
