//! Child process lifecycle.
//!
//! Managed children run in their own process group so that cancelling a step
//! takes down the whole tree (`brew` forks `curl`, `npm` forks `node`, ...).
//! Every managed child is tracked in a registry; on SIGINT/SIGTERM/SIGHUP or
//! when a [`ProcessGuard`] drops, the registry signals each group with SIGTERM,
//! waits for a grace period, then sends SIGKILL.
//!
//! Detached runs are the exception: they get a fresh session and are never
//! registered, because they must outlive us.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry of process-group leaders we spawned and have not yet reaped.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    shutting_down: bool,
}

impl ChildRegistry {
    /// Process-wide registry.
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "registered child process group");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "unregistered child process group");
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked group. Only the first call does anything.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.shutting_down {
            debug!("child cleanup already initiated");
            return;
        }
        self.shutting_down = true;

        if self.pids.is_empty() {
            return;
        }

        info!(count = self.pids.len(), "terminating child processes");
        let pids: Vec<u32> = self.pids.drain().collect();
        for pid in pids {
            terminate_group(pid, grace_period);
        }
    }
}

/// SIGTERM a process group, wait up to `grace_period`, then SIGKILL it.
///
/// Returns `true` if the group leader is gone afterwards.
pub fn terminate_group(pgid: u32, grace_period: Duration) -> bool {
    if !is_process_alive(pgid) {
        return true;
    }

    if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
        warn!(pgid, error = %e, "SIGTERM to process group failed, signalling leader only");
        let _ = signal::kill(to_pid(pgid), Signal::SIGTERM);
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        if !is_process_alive(pgid) {
            debug!(pgid, "process group exited after SIGTERM");
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
    if signal_group(pgid, Signal::SIGKILL).is_err() {
        let _ = signal::kill(to_pid(pgid), Signal::SIGKILL);
    }
    !is_process_alive(pgid)
}

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

/// Negative PID addresses the whole group.
fn signal_group(pgid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), sig)
}

/// Whether a PID refers to a live, non-zombie process.
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(to_pid(pid), None).is_err() {
        return false;
    }

    // Zombies still accept signal 0. /proc is Linux-only; elsewhere assume alive.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The command name may contain spaces, so read the state after the last ')'.
        if let Some(state) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
        {
            return !matches!(state, "Z" | "X");
        }
    }
    true
}

/// RAII guard that terminates all registered children when dropped.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
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
            registry.terminate_all(DEFAULT_GRACE_PERIOD);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that clean up children and exit.
///
/// Call once at program start.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "received termination signal, cleaning up");
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(Duration::from_secs(3));
                }
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Process-group configuration for [`std::process::Command`].
pub trait CommandProcessGroup {
    /// Run the child as leader of a new process group.
    ///
    /// On Linux the child also receives SIGTERM if we die.
    fn in_new_process_group(&mut self) -> &mut Self;

    /// Run the child in a new session, fully detached from our lifetime.
    fn in_new_session(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                #[cfg(target_os = "linux")]
                if nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }

    fn in_new_session(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }
        self
    }
}
