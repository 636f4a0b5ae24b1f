//! Child process lifecycle
//!
//! Every tool the installer spawns (parted, cryptsetup, dd, cp, chroot) runs
//! in its own process group with a parent-death signal, and is tracked in a
//! global registry while it runs. If the installer is told to go away, the
//! whole group of each tracked child is sent SIGTERM, then SIGKILL after a
//! grace period.
//!
//! While an install is under way, SIGINT is logged and ignored.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on signal-driven shutdown.
const SIGNAL_GRACE: Duration = Duration::from_secs(3);

/// Tracks the PIDs (and therefore process groups) of running children.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// The process-wide registry.
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        log::debug!("Tracking child process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        log::debug!("Child process group {} finished", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Send SIGTERM to every tracked group, wait up to `grace_period`, then
    /// SIGKILL whatever is left. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            log::debug!("No child processes to terminate");
            return;
        }

        log::warn!("Terminating {} running tool(s)", self.pids.len());

        let targets: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &targets {
            if let Err(e) = signal_group(pid, Signal::SIGTERM) {
                log::warn!("SIGTERM to process group {} failed: {}", pid, e);
                if let Err(e) = signal_pid(pid, Signal::SIGTERM) {
                    log::warn!("SIGTERM to PID {} failed: {}", pid, e);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if targets.iter().all(|&pid| !is_process_alive(pid)) {
                log::info!("All tools exited after SIGTERM");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &targets {
            if is_process_alive(pid) {
                log::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
                if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                    log::error!("SIGKILL to process group {} failed: {}", pid, e);
                    let _ = signal_pid(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
    }
}

fn signal_pid(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID addresses the whole group led by `pgid`.
fn signal_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Zombies count as dead.
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The state field follows the parenthesised command name.
        if let Some(state) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
        {
            return !matches!(state, "Z" | "X");
        }
    }
    true
}

/// Registers a spawned child for as long as it lives.
///
/// Created right after `spawn()`, dropped after `wait()`; unregistering in
/// `Drop` covers the early-return paths too.
pub struct ChildTracker {
    registry: Arc<Mutex<ChildRegistry>>,
    pid: u32,
}

impl ChildTracker {
    pub fn track(pid: u32) -> Self {
        let registry = ChildRegistry::global();
        if let Ok(mut reg) = registry.lock() {
            reg.register(pid);
        }
        Self { registry, pid }
    }
}

impl Drop for ChildTracker {
    fn drop(&mut self) {
        if let Ok(mut reg) = self.registry.lock() {
            reg.unregister(self.pid);
        }
    }
}

/// Terminates every tracked child when dropped.
///
/// Held by `main` for the lifetime of the process.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Whether SIGINT should currently be ignored.
#[derive(Debug, Clone, Default)]
pub struct InterruptPolicy {
    installing: Arc<AtomicBool>,
}

impl InterruptPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start or end of the destructive phase.
    pub fn set_installing(&self, installing: bool) {
        self.installing.store(installing, Ordering::SeqCst);
    }

    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::SeqCst)
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling on a background thread.
///
/// SIGTERM and SIGHUP always terminate tracked children and exit with
/// `128 + signal`. SIGINT does the same unless `policy` says an install is
/// running, in which case it is logged and ignored.
pub fn init_signal_handlers(policy: InterruptPolicy) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            let name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "signal",
            };

            if sig == SIGINT && policy.is_installing() {
                log::warn!("Ignoring {}: installation in progress cannot be interrupted", name);
                continue;
            }

            log::info!("Received {}, stopping running tools", name);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(SIGNAL_GRACE);
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Spawn a `Command` as the leader of a new process group that receives
/// SIGTERM if the installer dies.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between
        // fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn wait_for_exit(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
        registry.unregister(5678);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_tracker_unregisters_on_drop() {
        {
            let _tracker = ChildTracker::track(4_000_001);
            let reg = ChildRegistry::global();
            let reg = reg.lock().expect("registry lock");
            assert!(reg.pids.contains(&4_000_001));
        }
        let reg = ChildRegistry::global();
        let reg = reg.lock().expect("registry lock");
        assert!(!reg.pids.contains(&4_000_001));
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sleep");

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        assert!(is_process_alive(child.id()));

        registry.terminate_all(Duration::from_millis(500));

        assert!(wait_for_exit(&mut child, Duration::from_secs(3)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999);

        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.register(999_998);
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_handles_reaped_process() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn sh");
        let pid = child.id();
        let _ = child.wait();

        let mut registry = ChildRegistry::default();
        registry.register(pid);
        registry.terminate_all(Duration::from_millis(100));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
        assert!(signal_pid(999_999, Signal::SIGTERM).is_err());
    }

    #[test]
    fn test_interrupt_policy_toggles() {
        let policy = InterruptPolicy::new();
        let shared = policy.clone();
        assert!(!policy.is_installing());
        shared.set_installing(true);
        assert!(policy.is_installing());
        shared.set_installing(false);
        assert!(!policy.is_installing());
    }
}
