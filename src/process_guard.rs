//! Process lifecycle management for tool invocations
//!
//! A destructive tool (`wipefs`, `parted`, `mkfs.*`, `cryptsetup`) must never
//! outlive the installer. If the installer is interrupted mid-step, the tool
//! is terminated and the mount tree acquired so far is released before exit.
//!
//! # Mechanism
//! - Tools run in their own process group with `PR_SET_PDEATHSIG`
//! - Running tool PIDs are tracked in a global registry
//! - On SIGINT/SIGTERM/SIGHUP ([`handle_signal`]): SIGTERM every group,
//!   SIGKILL after a grace period, unwind the live mount tree, then exit
//!   with `128 + signo`

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::engine::unwind::{unwind, MountTree, UnwindReport};
use crate::tool_runner::{DiskHost, SystemHost};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL when interrupted.
const SIGNAL_GRACE: Duration = Duration::from_secs(3);

/// Registry tracking running tool processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Prevents double termination when both a signal and a drop fire
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        log::debug!("Registered tool process PID {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        log::debug!("Unregistered tool process PID {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked process groups.
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            log::debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            log::debug!("No tool processes to terminate");
            return;
        }

        log::info!("Terminating {} tool process(es)...", self.pids.len());

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                log::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    log::warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if !pids_to_kill.iter().any(|&pid| is_process_alive(pid)) {
                log::info!("All tool processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                log::warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    log::error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        log::info!("Tool process cleanup complete");
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals the whole group.
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Alive means neither gone nor a zombie.
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Field 3 is the state; comm (field 2) may contain spaces, so split after ')'
        if let Some(state) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
        {
            return !matches!(state, "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates running tools on drop
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
        log::debug!("ProcessGuard dropped, initiating cleanup");
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminate_all(Duration::from_secs(5));
    }
}

/// Install SIGINT, SIGTERM and SIGHUP handlers.
///
/// On delivery the handler thread runs [`handle_signal`] against the global
/// registry and a fresh [`SystemHost`], then exits with `128 + signo`.
/// Call once at program start; pass the executor's live tree.
pub fn init_signal_handlers(live: Arc<Mutex<MountTree>>) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let registry = ChildRegistry::global();
            handle_signal(sig, &registry, &live, &mut SystemHost::new());
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Interrupt response: terminate every tool in `registry`, then unwind
/// `live` in reverse order through `host`.
///
/// Tools are stopped first so nothing is still writing to a filesystem
/// that is about to be unmounted.
pub fn handle_signal<H: DiskHost + ?Sized>(
    sig: i32,
    registry: &Mutex<ChildRegistry>,
    live: &Mutex<MountTree>,
    host: &mut H,
) -> UnwindReport {
    log::warn!("Received {}, releasing disk resources...", signal_name(sig));

    registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .terminate_all(SIGNAL_GRACE);

    let mut tree = live.lock().unwrap_or_else(PoisonError::into_inner);
    let report = unwind(&mut tree, host);
    if !report.is_clean() {
        log::warn!("Interrupted unwind left resources held: {:?}", report.failed);
    }
    report
}

fn signal_name(sig: i32) -> &'static str {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    match sig {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        _ => "UNKNOWN",
    }
}

/// Extension trait for `Command` to isolate children in their own process group
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe setpgid and prctl
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies if the installer dies
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
