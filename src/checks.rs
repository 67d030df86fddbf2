use crate::error::PortwrapError;
use anyhow::Result;
use nix::sched::CloneFlags;
use std::{
    env,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

pub fn is_namespace_supported(flag: CloneFlags) -> bool {
    fn exists(ns: &str) -> bool {
        Path::new(&format!("/proc/self/ns/{}", ns)).exists()
    }

    match flag {
        CloneFlags::CLONE_NEWNET => exists("net"),
        CloneFlags::CLONE_NEWUSER => exists("user"),
        CloneFlags::CLONE_NEWNS => exists("mnt"),
        CloneFlags::CLONE_NEWPID => exists("pid"),
        _ => false,
    }
}

/// Fails early if the kernel lacks a namespace we are about to request.
pub fn require_namespaces(unshare_user: bool) -> Result<()> {
    let mut required = vec![CloneFlags::CLONE_NEWNET];
    if unshare_user {
        required.push(CloneFlags::CLONE_NEWUSER);
    }

    for flag in required {
        if !is_namespace_supported(flag) {
            return Err(
                PortwrapError::namespace(format!("kernel doesn't support {:?}", flag)).into(),
            );
        }
    }

    Ok(())
}

/// Resolves an external tool the way `execvp` would.
///
/// Names containing a `/` are used as given; bare names are looked up on
/// `PATH`.
pub fn resolve_tool(tool: &Path) -> Option<PathBuf> {
    if tool.components().count() > 1 || tool.is_absolute() {
        return is_executable(tool).then(|| tool.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
