//! User-mode network stack (slirp4netns) bound to the namespace.
//!
//! The stack is started against the wrapped command's pid, configures a tap
//! device inside that pid's network namespace and then creates its API
//! socket. The socket file appearing is the only readiness signal it gives.

use crate::{error::PortwrapError, utils::display_argv};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::{
    sys::wait::{Id, WaitPidFlag, WaitStatus, waitid},
    unistd::Pid,
};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

pub const SOCKET_NAME: &str = "slirp4netns.sock";
pub const MTU: u32 = 65520;
pub const TAP_DEVICE: &str = "tap0";

/// Interval between checks for the API socket.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct NetStackOptions {
    pub program: PathBuf,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl NetStackOptions {
    pub fn new(program: impl Into<PathBuf>, startup_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            startup_timeout,
            poll_interval: POLL_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct NetStackLauncher {
    options: NetStackOptions,
}

impl NetStackLauncher {
    pub fn new(options: NetStackOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NetStackOptions {
        &self.options
    }

    pub fn command_line(&self, target: Pid, socket: &Path) -> Vec<OsString> {
        vec![
            self.options.program.clone().into(),
            "--configure".into(),
            format!("--mtu={MTU}").into(),
            "--disable-host-loopback".into(),
            "--api-socket".into(),
            socket.into(),
            target.to_string().into(),
            TAP_DEVICE.into(),
        ]
    }

    /// Spawns the stack without waiting for it to become ready.
    pub fn spawn(&self, target: Pid) -> Result<NetStackHandle> {
        let socket = fresh_socket_path()?;
        let argv = self.command_line(target, &socket);
        info!("Running: {}", display_argv(&argv));

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn network stack {}",
                    self.options.program.display()
                )
            })?;

        Ok(NetStackHandle {
            child,
            socket,
            ready: false,
            status: None,
        })
    }
}

/// Each invocation gets its own directory; it is left behind on exit.
fn fresh_socket_path() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("portwrap-")
        .tempdir()
        .context("Failed to create directory for the control socket")?
        .keep();

    Ok(dir.join(SOCKET_NAME))
}

#[derive(Debug)]
pub struct NetStackHandle {
    child: Child,
    socket: PathBuf,
    ready: bool,
    status: Option<ExitStatus>,
}

impl NetStackHandle {
    #[inline]
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    #[inline]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Polls for the API socket until it exists or the deadline passes.
    pub fn wait_ready<F>(&mut self, options: &NetStackOptions, interrupted: F) -> Result<()>
    where
        F: Fn() -> Option<i32>,
    {
        let started = Instant::now();
        let timeout = options.startup_timeout;

        loop {
            if self.socket.exists() {
                debug!(
                    "Control socket {} appeared after {:?}",
                    self.socket.display(),
                    started.elapsed()
                );
                self.ready = true;
                return Ok(());
            }

            if let Some(signal) = interrupted() {
                return Err(PortwrapError::Interrupted { signal }.into());
            }

            if let Some(status) = self.peek_exit()? {
                return Err(PortwrapError::StartupTimeout {
                    socket: self.socket.clone(),
                    waited: started.elapsed(),
                })
                .with_context(|| format!("Network stack exited early: {status:?}"));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(PortwrapError::StartupTimeout {
                    socket: self.socket.clone(),
                    waited: elapsed,
                }
                .into());
            }

            thread::sleep(options.poll_interval.min(timeout - elapsed));
        }
    }

    /// Exit status of a stack that has already died, leaving it unreaped
    /// until [`NetStackHandle::terminate`].
    fn peek_exit(&self) -> Result<Option<WaitStatus>> {
        if self.status.is_some() {
            return Ok(None);
        }

        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(self.pid()), flags)
            .with_context(|| format!("Failed to check network stack {}", self.pid()))?
        {
            WaitStatus::StillAlive => Ok(None),
            status => Ok(Some(status)),
        }
    }

    /// Kills and reaps the stack. Forwarding rules vanish with it.
    pub fn terminate(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }

        if let Some(status) = self
            .child
            .try_wait()
            .context("Failed to check network stack status")?
        {
            self.status = Some(status);
            return Ok(());
        }

        debug!("Killing network stack {}", self.child.id());
        self.child
            .kill()
            .with_context(|| format!("Failed to kill network stack {}", self.child.id()))?;

        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to reap network stack {}", self.child.id()))?;
        self.status = Some(status);

        Ok(())
    }
}

impl Drop for NetStackHandle {
    fn drop(&mut self) {
        if let Err(error) = self.terminate() {
            warn!("Failed to stop network stack {}: {error:#}", self.child.id());
        }
    }
}
