use anyhow::{Context, Result};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use std::{
    ffi::{CString, OsStr},
    os::{
        fd::AsFd,
        unix::ffi::OsStrExt,
    },
};

/// Clears `FD_CLOEXEC` so the descriptor survives `execve()`.
///
/// Called in a freshly forked child right before exec, so it must not
/// allocate.
pub fn set_inheritable<Fd: AsFd>(fd: Fd) -> nix::Result<()> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Builds a NUL-terminated argv, done before `fork()` so the child
/// does not allocate.
pub fn to_argv<I, S>(args: I) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|arg| {
            let bytes = arg.as_ref().as_bytes();
            CString::new(bytes).with_context(|| {
                format!(
                    "Argument contains a NUL byte: {:?}",
                    String::from_utf8_lossy(bytes)
                )
            })
        })
        .collect()
}

/// Renders an argv for logging.
pub fn display_argv<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|arg| arg.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
