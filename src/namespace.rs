//! Namespace launcher: forks a child that becomes the namespace tool
//! (bubblewrap) and learns the wrapped command's pid from the tool's
//! metadata report rather than from its output.

use crate::{
    gate::GateEnd,
    report::{NamespaceInfo, ReportChannel, ReportReader, ReportWriter},
    utils::{display_argv, set_inheritable, to_argv},
};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use nix::{
    errno::Errno,
    libc,
    sys::{
        signal::{Signal, kill},
        wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid},
    },
    unistd::{ForkResult, Pid, execvp, fork, write},
};
use std::{
    cell::Cell,
    ffi::{CString, OsString},
    os::fd::{AsFd, BorrowedFd, RawFd},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct IsolationOptions {
    pub program: PathBuf,
    pub unshare_user: bool,
    pub info_timeout: Duration,
}

#[derive(Debug)]
pub struct NamespaceLauncher {
    options: IsolationOptions,
}

impl NamespaceLauncher {
    pub fn new(options: IsolationOptions) -> Self {
        Self { options }
    }

    pub fn command_line(
        &self,
        command: &[String],
        info_fd: RawFd,
        block_fd: Option<RawFd>,
    ) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec![
            self.options.program.clone().into(),
            "--dev-bind".into(),
            "/".into(),
            "/".into(),
            "--unshare-net".into(),
        ];

        if self.options.unshare_user {
            argv.push("--unshare-user".into());
        }

        argv.push("--die-with-parent".into());
        argv.push("--info-fd".into());
        argv.push(info_fd.to_string().into());

        if let Some(fd) = block_fd {
            argv.push("--block-fd".into());
            argv.push(fd.to_string().into());
        }

        argv.extend(command.iter().map(OsString::from));
        argv
    }

    /// Forks and execs the namespace tool around `command`.
    ///
    /// With a gate the tool holds the command until the gate is released.
    /// The pid of the wrapped command is not known until
    /// [`NamespaceHandle::await_report`] returns.
    pub fn spawn(&self, command: &[String], gate: Option<GateEnd>) -> Result<NamespaceHandle> {
        let (reader, writer) = ReportChannel::new()?.split();

        let argv = self.command_line(
            command,
            writer.raw_fd(),
            gate.as_ref().map(GateEnd::raw_fd),
        );
        info!("Running: {}", display_argv(&argv));
        let argv = to_argv(&argv)?;

        match unsafe { fork() }.context("Failed to fork namespace launcher")? {
            ForkResult::Parent { child } => {
                // Our copies must go so the report channel sees EOF if the
                // tool dies.
                drop(writer);
                drop(gate);

                debug!("Namespace launcher forked as {child}");
                Ok(NamespaceHandle::new(child, reader))
            }
            ForkResult::Child => {
                drop(reader);
                exec_namespace_tool(&argv, &writer, gate.as_ref())
            }
        }
    }

    pub fn info_timeout(&self) -> Duration {
        self.options.info_timeout
    }
}

/// Runs in the forked child; only async-signal-safe calls from here on.
fn exec_namespace_tool(argv: &[CString], report: &ReportWriter, gate: Option<&GateEnd>) -> ! {
    let inherited: [Option<BorrowedFd<'_>>; 2] =
        [Some(report.as_fd()), gate.map(|end| end.as_fd())];

    for fd in inherited.into_iter().flatten() {
        if set_inheritable(fd).is_err() {
            child_abort(b"portwrap: failed to pass descriptor to namespace tool\n");
        }
    }

    let _ = execvp(argv[0].as_c_str(), argv);
    child_abort(b"portwrap: failed to exec namespace tool\n")
}

fn child_abort(message: &[u8]) -> ! {
    let _ = write(std::io::stderr(), message);
    unsafe { libc::_exit(127) }
}

/// How the namespace launcher ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signaled(Signal),
}

impl Exit {
    /// Shell-style exit code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signaled(signal) => 128 + *signal as i32,
        }
    }
}

#[derive(Debug)]
pub struct NamespaceHandle {
    /// PID of the namespace tool
    pid: Pid,

    /// PID of the wrapped command, once reported
    child_pid: Option<Pid>,

    report: Option<ReportReader>,

    // Track if the process has been waited on
    waited: Cell<bool>,
}

impl NamespaceHandle {
    #[inline]
    fn new(pid: Pid, report: ReportReader) -> Self {
        Self {
            pid,
            child_pid: None,
            report: Some(report),
            waited: Cell::new(false),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    /// Blocks on the metadata channel. The channel is consumed either way.
    pub fn await_report<F>(&mut self, timeout: Duration, interrupted: F) -> Result<NamespaceInfo>
    where
        F: Fn() -> Option<i32>,
    {
        let report = self
            .report
            .take()
            .ok_or_else(|| anyhow!("Namespace metadata already consumed"))?;

        let info = match report.receive(timeout, interrupted) {
            Ok(info) => info,
            Err(error) => {
                return match self.peek_exit() {
                    Some(exit) => Err(error.context(format!(
                        "Namespace tool {} exited with code {}",
                        self.pid,
                        exit.code()
                    ))),
                    None => Err(error),
                };
            }
        };

        let child = Pid::from_raw(info.child_pid);
        info!("Namespaced command running as pid {child}");
        self.child_pid = Some(child);
        Ok(info)
    }

    /// How the tool exited, if it has, leaving it unreaped.
    fn peek_exit(&self) -> Option<Exit> {
        if self.has_waited() {
            return None;
        }

        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(self.pid), flags) {
            Ok(WaitStatus::StillAlive) | Err(_) => None,
            Ok(status) => exit_from(status).ok(),
        }
    }

    /// Blocks until the tool has exited, without reaping it.
    pub fn wait_exited(&self) -> Result<()> {
        if self.has_waited() {
            return Ok(());
        }

        loop {
            match waitid(Id::Pid(self.pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("Failed to wait for process {}", self.pid));
                }
            }
        }
    }

    pub fn wait(&self) -> Result<Exit> {
        let status = loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                result => {
                    break result
                        .with_context(|| format!("Failed to wait for process {}", self.pid))?;
                }
            }
        };

        self.waited.set(true);
        exit_from(status)
    }

    /// Kills the tool (and with it the namespace) and reaps it.
    pub fn terminate(&self) -> Result<()> {
        if self.has_waited() {
            return Ok(());
        }

        if self.try_wait()?.is_some() {
            return Ok(());
        }

        let signal = Signal::SIGKILL;

        kill(self.pid, signal).with_context(|| {
            format!(
                "Failed to terminate process {} with signal {}",
                self.pid, signal
            )
        })?;

        self.wait()?;
        Ok(())
    }

    pub fn try_wait(&self) -> Result<Option<Exit>> {
        if self.has_waited() {
            return Ok(None);
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
            .with_context(|| format!("Failed to check status of process {}", self.pid))?
        {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.waited.set(true);
                exit_from(status).map(Some)
            }
        }
    }

    #[inline]
    fn has_waited(&self) -> bool {
        self.waited.get()
    }
}

fn exit_from(status: WaitStatus) -> Result<Exit> {
    match status {
        WaitStatus::Exited(_, code) => Ok(Exit::Code(code)),
        WaitStatus::Signaled(_, signal, _) => Ok(Exit::Signaled(signal)),
        _ => Err(anyhow!("Unexpected wait status: {:?}", status)),
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        if !self.waited.get() {
            warn!(
                "Namespace launcher {} dropped while running, killing it",
                self.pid
            );
            if let Err(error) = self.terminate() {
                warn!("Failed to kill namespace launcher {}: {error:#}", self.pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{PortwrapError, classify},
        gate::StartGate,
    };
    use std::{fs, os::unix::fs::PermissionsExt, path::Path, thread, time::Instant};
    use tempfile::TempDir;

    /// Stand-in for bwrap: reports its own pid, honours the gate, then execs.
    const FAKE_BWRAP: &str = r#"#!/bin/sh
info=
block=
while [ $# -gt 0 ]; do
    case "$1" in
        --dev-bind) shift 3 ;;
        --info-fd) info="$2"; shift 2 ;;
        --block-fd) block="$2"; shift 2 ;;
        --*) shift ;;
        *) break ;;
    esac
done
eval "printf '{\"child-pid\": %d}\n' $$ >&$info"
eval "exec $info>&-"
if [ -n "$block" ]; then
    eval "dd bs=1 count=1 <&$block" >/dev/null 2>&1
fi
exec "$@"
"#;

    fn install_tool(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("bwrap");
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launcher(program: PathBuf) -> NamespaceLauncher {
        NamespaceLauncher::new(IsolationOptions {
            program,
            unshare_user: true,
            info_timeout: Duration::from_secs(10),
        })
    }

    fn start(
        launcher: &NamespaceLauncher,
        command: &[String],
        gate: Option<GateEnd>,
    ) -> Result<NamespaceHandle> {
        let mut handle = launcher.spawn(command, gate)?;
        handle.await_report(launcher.info_timeout(), || None)?;
        Ok(handle)
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn wait_for(path: &Path, timeout: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if path.exists() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_command_line() {
        let launcher = launcher("bwrap".into());
        let command = vec!["sleep".to_string(), "80".to_string()];

        assert_eq!(
            display_argv(launcher.command_line(&command, 5, Some(7))),
            "bwrap --dev-bind / / --unshare-net --unshare-user --die-with-parent \
             --info-fd 5 --block-fd 7 sleep 80"
        );

        let launcher = NamespaceLauncher::new(IsolationOptions {
            program: "bwrap".into(),
            unshare_user: false,
            info_timeout: Duration::from_secs(1),
        });
        assert_eq!(
            display_argv(launcher.command_line(&command, 5, None)),
            "bwrap --dev-bind / / --unshare-net --die-with-parent --info-fd 5 sleep 80"
        );
    }

    #[test]
    fn test_reports_pid_and_exit_code() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let launcher = launcher(install_tool(&dir, FAKE_BWRAP));

        let handle = start(&launcher, &shell("exit 7"), None)?;
        assert_eq!(handle.child_pid(), Some(handle.pid()));
        assert_eq!(handle.wait()?, Exit::Code(7));
        Ok(())
    }

    #[test]
    fn test_gate_holds_command() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("started");
        let launcher = launcher(install_tool(&dir, FAKE_BWRAP));
        let (mut gate, end) = StartGate::new()?;

        let command = shell(&format!("echo started > {}", marker.display()));
        let handle = start(&launcher, &command, Some(end))?;

        assert!(!wait_for(&marker, Duration::from_millis(300)));
        assert!(handle.try_wait()?.is_none());

        gate.release()?;
        handle.wait_exited()?;
        assert_eq!(handle.wait()?, Exit::Code(0));
        assert!(marker.exists());
        Ok(())
    }

    #[test]
    fn test_terminate_blocked_namespace() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("started");
        let launcher = launcher(install_tool(&dir, FAKE_BWRAP));
        let (gate, end) = StartGate::new()?;

        let command = shell(&format!("echo started > {}", marker.display()));
        let handle = start(&launcher, &command, Some(end))?;

        handle.terminate()?;
        drop(gate);

        assert!(!wait_for(&marker, Duration::from_millis(200)));
        assert_eq!(kill(handle.pid(), None), Err(Errno::ESRCH));
        Ok(())
    }

    #[test]
    fn test_tool_exits_before_report() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let launcher = launcher(install_tool(&dir, "#!/bin/sh\nexit 1\n"));

        let error = start(&launcher, &shell("true"), None).unwrap_err();
        assert!(matches!(
            classify(&error),
            Some(PortwrapError::NamespaceCreation { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_failed_report_leaves_tool_unreaped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let launcher = launcher(install_tool(&dir, "#!/bin/sh\nexit 3\n"));

        let mut handle = launcher.spawn(&shell("true"), None)?;
        let error = handle
            .await_report(launcher.info_timeout(), || None)
            .unwrap_err();
        assert!(matches!(
            classify(&error),
            Some(PortwrapError::NamespaceCreation { .. })
        ));

        // Still a zombie, so its pid cannot have been recycled yet.
        assert_eq!(kill(handle.pid(), None), Ok(()));
        assert_eq!(handle.wait()?, Exit::Code(3));
        Ok(())
    }

    #[test]
    fn test_missing_tool() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let launcher = launcher(dir.path().join("no-such-bwrap"));

        let error = start(&launcher, &shell("true"), None).unwrap_err();
        assert!(matches!(
            classify(&error),
            Some(PortwrapError::NamespaceCreation { .. })
        ));
        Ok(())
    }
}
