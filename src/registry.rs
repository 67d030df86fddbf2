use anyhow::{Context, Result, bail};
use log::{info, warn};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use once_cell::sync::OnceCell;
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI32, Ordering},
    },
    thread,
};

/// Signals that trigger teardown.
pub const TEARDOWN_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

static LISTENER: OnceCell<Arc<CleanupRegistry>> = OnceCell::new();

#[derive(Debug, Default)]
struct Targets {
    netstack: Option<Pid>,
    namespace: Option<Pid>,
}

/// Processes the interrupt listener must kill, shared with the orchestrator.
///
/// A pid is registered only once its process is known to be running and is
/// unregistered before that process is reaped, so the listener never
/// signals a recycled pid.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    targets: Mutex<Targets>,
    interrupted: AtomicI32,
}

impl CleanupRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_netstack(&self, pid: Pid) {
        self.targets().netstack = Some(pid);
    }

    pub fn unregister_netstack(&self) -> Option<Pid> {
        self.targets().netstack.take()
    }

    pub fn register_namespace(&self, pid: Pid) {
        self.targets().namespace = Some(pid);
    }

    pub fn unregister_namespace(&self) -> Option<Pid> {
        self.targets().namespace.take()
    }

    /// The signal that interrupted this invocation, if any.
    pub fn interrupted(&self) -> Option<i32> {
        match self.interrupted.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Kills the network stack, then the namespace launcher so the
    /// orchestrator's final wait returns. Only the first signal acts.
    pub fn interrupt(&self, signal: i32) {
        if self
            .interrupted
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Signal {signal} received, teardown already in progress");
            return;
        }

        info!("Signal {signal} received, tearing down");
        let targets = self.targets();

        if let Some(pid) = targets.netstack {
            info!("Killing network stack {pid}");
            if let Err(error) = kill(pid, Signal::SIGKILL) {
                warn!("Failed to kill network stack {pid}: {error}");
            }
        }

        if let Some(pid) = targets.namespace {
            info!("Killing namespace launcher {pid}");
            if let Err(error) = kill(pid, Signal::SIGKILL) {
                warn!("Failed to kill namespace launcher {pid}: {error}");
            }
        }
    }

    fn targets(&self) -> MutexGuard<'_, Targets> {
        // A poisoned lock still holds valid pids.
        self.targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Routes teardown signals to `registry` from a dedicated thread.
///
/// Must run before anything is spawned, and at most once per process.
pub fn install(registry: Arc<CleanupRegistry>) -> Result<()> {
    if LISTENER.set(Arc::clone(&registry)).is_err() {
        bail!("Interrupt listener already installed");
    }

    let mut signals =
        Signals::new(TEARDOWN_SIGNALS).context("Failed to install signal handlers")?;

    thread::Builder::new()
        .name("portwrap-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                registry.interrupt(signal);
            }
        })
        .context("Failed to spawn signal listener thread")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{os::unix::process::ExitStatusExt, process::Command};

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn test_interrupt_kills_registered() {
        let registry = CleanupRegistry::new();
        let mut netstack = spawn_sleeper();
        let mut namespace = spawn_sleeper();

        registry.register_netstack(Pid::from_raw(netstack.id() as i32));
        registry.register_namespace(Pid::from_raw(namespace.id() as i32));
        assert_eq!(registry.interrupted(), None);

        registry.interrupt(SIGINT);

        assert_eq!(registry.interrupted(), Some(SIGINT));
        assert_eq!(netstack.wait().unwrap().signal(), Some(Signal::SIGKILL as i32));
        assert_eq!(namespace.wait().unwrap().signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn test_unregistered_survives() {
        let registry = CleanupRegistry::new();
        let mut netstack = spawn_sleeper();

        registry.register_netstack(Pid::from_raw(netstack.id() as i32));
        assert!(registry.unregister_netstack().is_some());
        registry.interrupt(SIGTERM);

        assert!(netstack.try_wait().unwrap().is_none());
        netstack.kill().unwrap();
        netstack.wait().unwrap();
    }

    #[test]
    fn test_first_signal_wins() {
        let registry = CleanupRegistry::new();
        registry.interrupt(SIGTERM);
        registry.interrupt(SIGINT);
        assert_eq!(registry.interrupted(), Some(SIGTERM));
    }
}
